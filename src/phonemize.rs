//! Text to IPA phonemes.
//!
//! [`Phonemizer`] is the seam the Kokoro engine depends on.  The production
//! implementation, [`EspeakPhonemizer`], calls the `libespeak-ng` C API
//! directly and is only compiled with the `espeak` feature; build.rs links the
//! library via pkg-config or `ESPEAK_LIB_DIR`.
//!
//! espeak-ng drops punctuation from its IPA output.  Text is cut into clauses
//! first and each clause's trailing punctuation is re-attached to its
//! phonemes.

use anyhow::Result;
use once_cell::sync::Lazy;
use regex::Regex;

/// Converts text to an IPA phoneme string the tokenizer can consume.
pub trait Phonemizer: Send + Sync {
    fn phonemize(&self, text: &str) -> Result<String>;
}

static RE_CLAUSE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([^.,!?;:—…"()“”]*)([.,!?;:—…"()“”]*\s*)"#).unwrap());

/// Split `text` into `(words, punctuation)` pairs.
///
/// Trailing whitespace stays with the punctuation; pairs with neither part
/// are omitted.
pub fn split_clauses(text: &str) -> Vec<(&str, &str)> {
    RE_CLAUSE
        .captures_iter(text)
        .filter_map(|c| {
            let words = c.get(1).map_or("", |m| m.as_str());
            let punct = c.get(2).map_or("", |m| m.as_str());
            (!words.trim().is_empty() || !punct.trim().is_empty()).then_some((words, punct))
        })
        .collect()
}

/// Join per-clause phonemes back together with their punctuation.
fn join_clauses<F>(text: &str, mut phonemize_clause: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let mut out = String::new();
    for (words, punct) in split_clauses(text) {
        if !words.trim().is_empty() {
            out.push_str(phonemize_clause(words.trim())?.trim());
            if words.ends_with(char::is_whitespace) {
                out.push(' ');
            }
        }
        out.push_str(punct.trim());
        if punct.ends_with(char::is_whitespace) {
            out.push(' ');
        }
    }
    Ok(out.trim().to_string())
}

#[cfg(feature = "espeak")]
pub use espeak::{set_data_path, EspeakPhonemizer};

#[cfg(feature = "espeak")]
mod espeak {
    use std::{
        ffi::{CStr, CString},
        os::raw::{c_char, c_int, c_void},
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use anyhow::{anyhow, Result};
    use once_cell::sync::OnceCell;
    use tracing::debug;

    use super::{join_clauses, Phonemizer};

    extern "C" {
        /// Pass `NULL` to use the library's compiled-in data directory.
        fn espeak_ng_InitializePath(path: *const c_char);

        /// Returns ENS_OK (0) on success.
        fn espeak_ng_Initialize(context: *mut c_void) -> c_int;

        /// Returns EE_OK (0) on success.
        fn espeak_ng_SetVoiceByName(name: *const c_char) -> c_int;

        /// `textptr` advances one clause per call and becomes `NULL` once the
        /// input is consumed.  The returned buffer is reused by the next call.
        fn espeak_TextToPhonemes(
            textptr: *mut *const c_void,
            textmode: c_int,
            phonememode: c_int,
        ) -> *const c_char;
    }

    const CHARS_UTF8: c_int = 1;
    const PHONEMES_IPA: c_int = 0x02;

    /// espeak-ng is global and not thread-safe.  The guarded value is the
    /// voice currently selected in the library.
    static LOCK: Mutex<Option<String>> = Mutex::new(None);

    static INIT: OnceCell<std::result::Result<(), String>> = OnceCell::new();

    static DATA_PATH: OnceCell<PathBuf> = OnceCell::new();

    /// Point espeak-ng at an `espeak-ng-data` directory.
    ///
    /// Only effective before the first phonemisation; later calls are ignored.
    pub fn set_data_path(path: &Path) {
        let _ = DATA_PATH.set(path.to_path_buf());
    }

    fn do_init() -> std::result::Result<(), String> {
        let path_cstr = match DATA_PATH.get() {
            Some(p) => Some(
                CString::new(p.to_string_lossy().as_bytes())
                    .map_err(|_| "espeak data path contains a null byte".to_string())?,
            ),
            None => None,
        };
        let path_ptr = path_cstr.as_ref().map_or(std::ptr::null(), |c| c.as_ptr());

        unsafe {
            espeak_ng_InitializePath(path_ptr);
            let status = espeak_ng_Initialize(std::ptr::null_mut());
            if status != 0 {
                return Err(format!("espeak_ng_Initialize failed (status {status:#010x})"));
            }
        }
        Ok(())
    }

    /// espeak-ng backed phonemizer for one language (`en-us`, `en-gb`, ...).
    pub struct EspeakPhonemizer {
        language: CString,
    }

    impl EspeakPhonemizer {
        pub fn new(language: &str) -> Result<Self> {
            let language = CString::new(language)
                .map_err(|_| anyhow!("language code contains a null byte"))?;
            let phonemizer = Self { language };
            // Surface init and unknown-voice failures at startup.
            phonemizer.phonemize("")?;
            Ok(phonemizer)
        }

        fn clause_to_ipa(&self, clause: &str) -> Result<String> {
            let text_c =
                CString::new(clause).map_err(|_| anyhow!("text contains a null byte"))?;
            let mut current: *const c_void = text_c.as_ptr() as *const c_void;
            let mut parts: Vec<String> = Vec::new();

            unsafe {
                while !current.is_null() {
                    let ptr = espeak_TextToPhonemes(&mut current, CHARS_UTF8, PHONEMES_IPA);
                    if ptr.is_null() {
                        continue;
                    }
                    let chunk = CStr::from_ptr(ptr)
                        .to_str()
                        .map_err(|_| anyhow!("espeak-ng returned non-UTF-8 phonemes"))?
                        .trim();
                    if !chunk.is_empty() {
                        parts.push(chunk.to_owned());
                    }
                }
            }
            Ok(parts.join(" "))
        }
    }

    impl Phonemizer for EspeakPhonemizer {
        fn phonemize(&self, text: &str) -> Result<String> {
            let mut voice = LOCK.lock().unwrap_or_else(|p| p.into_inner());

            INIT.get_or_init(do_init)
                .as_ref()
                .map_err(|e| anyhow!("espeak-ng: {e}"))?;

            let wanted = self.language.to_string_lossy();
            if voice.as_deref() != Some(&*wanted) {
                let rc = unsafe { espeak_ng_SetVoiceByName(self.language.as_ptr()) };
                if rc != 0 {
                    return Err(anyhow!("espeak-ng has no voice \"{wanted}\" (rc {rc})"));
                }
                debug!(language = %wanted, "espeak-ng voice selected");
                *voice = Some(wanted.into_owned());
            }

            join_clauses(text, |clause| self.clause_to_ipa(clause))
        }
    }

}
