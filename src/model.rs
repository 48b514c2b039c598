//! Kokoro v1.0 ONNX engine.
//!
//! Text is phonemised, split into batches the graph accepts, and each batch
//! is run through the model.  The three model inputs are positional:
//!
//! | Input    | Shape          | dtype   |
//! |----------|----------------|---------|
//! | `tokens` | `[1, n + 2]`   | int64   |
//! | `style`  | `[1, 256]`     | float32 |
//! | `speed`  | `[1]`          | float32 |
//!
//! Output 0 is the waveform at [`SAMPLE_RATE`].

use std::{collections::HashMap, path::Path, sync::Mutex};

use anyhow::{anyhow, bail, Context, Result};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use crate::{
    audio::AudioBuffer,
    engine::SpeechEngine,
    npz::{load_npz, NpyArray},
    phonemize::Phonemizer,
    tokenize::{pad, phonemes_to_ids, split_phonemes, MAX_PHONEME_LENGTH},
};

/// Audio sample rate produced by the model.
pub const SAMPLE_RATE: u32 = 24_000;

// ─────────────────────────────────────────────────────────────────────────────
// Graph runner
// ─────────────────────────────────────────────────────────────────────────────

/// One forward pass of the acoustic model.
pub trait GraphRunner: Send + Sync {
    /// `tokens` is already padded; `style` is one row of the voice matrix.
    fn run(&self, tokens: Vec<i64>, style: &[f32], speed: f32) -> Result<Vec<f32>>;
}

/// `Session::run` needs `&mut`, so concurrent callers queue on the lock.
impl GraphRunner for Mutex<Session> {
    fn run(&self, tokens: Vec<i64>, style: &[f32], speed: f32) -> Result<Vec<f32>> {
        let t_tokens = Tensor::<i64>::from_array(([1usize, tokens.len()], tokens))
            .context("Failed to build tokens tensor")?;
        let t_style = Tensor::<f32>::from_array(([1usize, style.len()], style.to_vec()))
            .context("Failed to build style tensor")?;
        let t_speed = Tensor::<f32>::from_array(([1usize], vec![speed]))
            .context("Failed to build speed tensor")?;

        let mut session = self.lock().map_err(|_| anyhow!("ORT session mutex poisoned"))?;
        let outputs = session
            .run(ort::inputs![t_tokens, t_style, t_speed])
            .context("ONNX inference failed")?;

        let (_shape, audio) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to extract audio tensor")?;
        Ok(audio.to_vec())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Voices
// ─────────────────────────────────────────────────────────────────────────────

/// Style matrices keyed by voice name.
pub struct VoiceBank {
    voices: HashMap<String, NpyArray>,
}

impl VoiceBank {
    pub fn load(path: &Path) -> Result<Self> {
        let voices = load_npz(path)
            .with_context(|| format!("Cannot load voices: {}", path.display()))?;
        Self::from_arrays(voices)
    }

    pub fn from_arrays(voices: HashMap<String, NpyArray>) -> Result<Self> {
        if voices.is_empty() {
            bail!("voices file contains no voices");
        }
        for (name, arr) in &voices {
            if arr.rows() == 0 || arr.row_len() == 0 {
                bail!("voice '{name}' has an empty style matrix {:?}", arr.shape);
            }
        }
        Ok(Self { voices })
    }

    /// Sorted voice names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.voices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Style vector for `voice` given an unpadded token count.
    pub fn style(&self, voice: &str, token_count: usize) -> Result<&[f32]> {
        let arr = self
            .voices
            .get(voice)
            .with_context(|| format!("Voice '{voice}' not found. Available: {:?}", self.names()))?;
        Ok(arr.row_clamped(token_count))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// KokoroOnnx
// ─────────────────────────────────────────────────────────────────────────────

pub struct KokoroOnnx {
    runner: Box<dyn GraphRunner>,
    voices: VoiceBank,
    phonemizer: Box<dyn Phonemizer>,
}

impl KokoroOnnx {
    /// Wrap a ready session and load the voices next to it.
    pub fn load(
        session: Session,
        voices_path: &Path,
        phonemizer: Box<dyn Phonemizer>,
    ) -> Result<Self> {
        let voices = VoiceBank::load(voices_path)?;
        info!(voices = voices.len(), path = %voices_path.display(), "voices loaded");
        Ok(Self::new(Box::new(Mutex::new(session)), voices, phonemizer))
    }

    pub fn new(
        runner: Box<dyn GraphRunner>,
        voices: VoiceBank,
        phonemizer: Box<dyn Phonemizer>,
    ) -> Self {
        Self { runner, voices, phonemizer }
    }

    /// Run inference on an IPA string directly.
    pub fn synthesize_phonemes(&self, phonemes: &str, voice: &str, speed: f32) -> Result<Vec<f32>> {
        // Fail on an unknown voice even for input that yields no batches.
        self.voices.style(voice, 0)?;

        let mut audio = Vec::new();
        for batch in split_phonemes(phonemes, MAX_PHONEME_LENGTH) {
            let ids = phonemes_to_ids(&batch);
            if ids.is_empty() {
                continue;
            }
            let style = self.voices.style(voice, ids.len())?;
            debug!(tokens = ids.len(), "running phoneme batch");
            audio.extend(self.runner.run(pad(&ids), style, speed)?);
        }
        Ok(audio)
    }
}

impl SpeechEngine for KokoroOnnx {
    fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<AudioBuffer> {
        let phonemes = self
            .phonemizer
            .phonemize(text)
            .with_context(|| format!("Phonemisation failed for {text:?}"))?;
        let samples = self.synthesize_phonemes(&phonemes, voice, speed)?;
        Ok(AudioBuffer::new(samples, SAMPLE_RATE))
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
