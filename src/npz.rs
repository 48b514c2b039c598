//! Voice style matrices from `voices-v1.0.bin`.
//!
//! The file is a numpy `.npz` (a ZIP of `.npy` members), one member per
//! voice.  Each member is a float32 array of shape `[510, 1, 256]`: one
//! 256-wide style vector per possible token count.  Only what that file
//! uses is supported: NPY v1/v2 headers, `f4` dtype, C order.

use std::{collections::HashMap, io::Read, path::Path};

use anyhow::{bail, Context, Result};
use zip::ZipArchive;

/// A float32 array flattened in row-major order.
#[derive(Debug, Clone)]
pub struct NpyArray {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NpyArray {
    /// Size of the leading axis.
    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per leading-axis entry (product of trailing dims).
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Entry `i` of the leading axis, clamped to the last one.
    pub fn row_clamped(&self, i: usize) -> &[f32] {
        let i = i.min(self.rows().saturating_sub(1));
        let width = self.row_len();
        &self.data[i * width..(i + 1) * width]
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// NPY
// ─────────────────────────────────────────────────────────────────────────────

const MAGIC: &[u8] = b"\x93NUMPY";

/// Parse one `.npy` buffer.
pub fn parse_npy(bytes: &[u8]) -> Result<NpyArray> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        bail!("Not a valid NPY file (bad magic)");
    }

    let (header_len, header_start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                bail!("NPY header length truncated");
            }
            (u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize, 12)
        }
        v => bail!("Unsupported NPY version {}.{}", v, bytes[7]),
    };

    let header_end = header_start + header_len;
    let header = bytes
        .get(header_start..header_end)
        .context("NPY file truncated in header")?;
    let header = std::str::from_utf8(header).context("NPY header is not valid UTF-8")?;

    let descr = header_value(header, "descr").context("NPY header missing 'descr'")?;
    let big_endian = match descr.trim_matches(|c| c == '\'' || c == '"') {
        "<f4" | "=f4" | "|f4" => false,
        ">f4" => true,
        other => bail!("Unsupported dtype '{}', only float32 is supported", other),
    };

    if header_value(header, "fortran_order").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        bail!("Fortran-order arrays are not supported");
    }

    let shape = parse_shape(header_value(header, "shape").context("NPY header missing 'shape'")?)?;
    let count: usize = shape.iter().product();

    let payload = &bytes[header_end..];
    if payload.len() < count * 4 {
        bail!("NPY data section too short: expected {} bytes, got {}", count * 4, payload.len());
    }

    let data = payload[..count * 4]
        .chunks_exact(4)
        .map(|b| {
            let raw = [b[0], b[1], b[2], b[3]];
            if big_endian { f32::from_be_bytes(raw) } else { f32::from_le_bytes(raw) }
        })
        .collect();

    Ok(NpyArray { shape, data })
}

/// Value of `key` in the Python dict literal header, without quotes for
/// strings and with parentheses for tuples.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = [format!("'{key}':"), format!("\"{key}\":")]
        .iter()
        .find_map(|k| header.find(k.as_str()).map(|p| p + k.len()))?;
    let rest = header[start..].trim_start();

    match rest.chars().next()? {
        '(' => rest.find(')').map(|end| &rest[..=end]),
        q @ ('\'' | '"') => {
            let inner = &rest[1..];
            inner.find(q).map(|end| &inner[..end])
        }
        _ => {
            let end = rest.find([',', '}']).unwrap_or(rest.len());
            Some(rest[..end].trim())
        }
    }
}

/// `(510, 1, 256)` → `[510, 1, 256]`; `()` → `[]`.
fn parse_shape(tuple: &str) -> Result<Vec<usize>> {
    tuple
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| t.parse::<usize>().with_context(|| format!("Bad shape dim: '{t}'")))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// NPZ
// ─────────────────────────────────────────────────────────────────────────────

/// Load every member of an `.npz`, keyed by member name minus `.npy`.
pub fn load_npz(path: &Path) -> Result<HashMap<String, NpyArray>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Cannot open NPZ file: {}", path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Cannot open ZIP archive: {}", path.display()))?;

    let mut arrays = HashMap::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Failed to read ZIP entry")?;
        let name = entry.name().trim_end_matches(".npy").to_string();

        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).context("Failed to read NPY entry")?;

        let array = parse_npy(&buf).with_context(|| format!("Failed to parse NPY entry '{name}'"))?;
        arrays.insert(name, array);
    }
    Ok(arrays)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
