//! PCM buffers, WAV packaging and base64 transport encoding.

use std::io::Cursor;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Silence inserted after every contributing batch segment.
pub const SEGMENT_GAP_MS: u32 = 300;

/// Mono f32 samples in `[-1.0, 1.0]` at a fixed rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `samples / sample_rate`, in seconds.
    pub fn duration_seconds(&self) -> f64 {
        duration_seconds(self.samples.len(), self.sample_rate)
    }
}

pub fn duration_seconds(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}

/// Number of samples in `ms` milliseconds at `sample_rate`.
pub fn samples_for_ms(sample_rate: u32, ms: u32) -> usize {
    (sample_rate as u64 * ms as u64 / 1000) as usize
}

/// A zeroed pad of `ms` milliseconds.
pub fn silence(sample_rate: u32, ms: u32) -> Vec<f32> {
    vec![0.0; samples_for_ms(sample_rate, ms)]
}

/// Package `samples` as a 16-bit PCM mono WAV file in memory.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut bytes = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .context("Cannot start WAV stream")?;
        for &s in samples {
            // f32 [-1.0, 1.0] → i16 [-32768, 32767]
            let s16 = (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer.write_sample(s16).context("WAV write error")?;
        }
        writer.finalize().context("WAV finalise error")?;
    }
    Ok(bytes)
}

/// WAV-encode and base64 the result, ready for a JSON body.
pub fn encode_wav_base64(samples: &[f32], sample_rate: u32) -> Result<String> {
    let wav = encode_wav(samples, sample_rate)?;
    Ok(STANDARD.encode(wav))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        let buf = AudioBuffer::new(vec![0.0; 48_000], 24_000);
        assert_eq!(buf.duration_seconds(), 2.0);
        assert_eq!(duration_seconds(10, 0), 0.0);
    }

    #[test]
    fn test_gap_length() {
        assert_eq!(samples_for_ms(24_000, SEGMENT_GAP_MS), 7_200);
        assert_eq!(samples_for_ms(22_050, SEGMENT_GAP_MS), 6_615);
        assert!(silence(16_000, SEGMENT_GAP_MS).iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_wav_readable() {
        let samples = vec![0.0, 0.5, -0.5, 1.0, -1.0];
        let wav = encode_wav(&samples, 24_000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 24_000);
        assert_eq!(reader.spec().channels, 1);
        assert_eq!(reader.len(), 5);
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded[0], 0);
        assert_eq!(decoded[3], i16::MAX);
        assert_eq!(decoded[4], -i16::MAX);
    }

    #[test]
    fn test_clipping() {
        let wav = encode_wav(&[4.0, -4.0], 8_000).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let decoded: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_base64_starts_with_riff() {
        let b64 = encode_wav_base64(&[0.1; 16], 24_000).unwrap();
        let raw = STANDARD.decode(b64).unwrap();
        assert_eq!(&raw[..4], b"RIFF");
        assert_eq!(&raw[8..12], b"WAVE");
    }
}
