//! Error types shared by the startup sequence and the request pipelines.

use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort the process before any request is served.
#[derive(Debug, Error)]
pub enum StartupError {
    /// One or more model artifacts are missing on disk.
    #[error(
        "model files not found: {}. Download them from:\n  model:  {}\n  voices: {}",
        .missing.iter().map(|p| p.display().to_string()).collect::<Vec<_>>().join(", "),
        MODEL_URL,
        VOICES_URL
    )]
    MissingArtifacts { missing: Vec<PathBuf> },

    /// Even the generic CPU provider could not build a session.
    #[error("no inference session could be created, CPU fallback failed: {message}")]
    SessionUnavailable { message: String },

    /// The engine could not be assembled around a working session.
    #[error("failed to load engine: {message}")]
    EngineLoad { message: String },
}

/// Download location of `kokoro-v1.0.onnx`.
pub const MODEL_URL: &str =
    "https://github.com/nazdridoy/kokoro-tts/releases/download/v1.0.0/kokoro-v1.0.onnx";

/// Download location of `voices-v1.0.bin`.
pub const VOICES_URL: &str =
    "https://github.com/nazdridoy/kokoro-tts/releases/download/v1.0.0/voices-v1.0.bin";

/// Per-request failures raised by the synthesis pipelines.
///
/// A client disconnect is *not* an error; the pipelines return the empty
/// sentinel result instead.
#[derive(Debug, Error)]
pub enum SynthesisError {
    /// The engine produced zero samples for a single text.
    #[error("No audio generated")]
    EmptySynthesis,

    /// A batch request carried no sentences.
    #[error("No sentences provided")]
    EmptyBatch,

    /// Every sentence in a batch was blank or produced no audio.
    #[error("No audio generated from sentences")]
    EmptyBatchOutput,

    /// A batch segment came back at a different rate than the first one.
    #[error("segment {index} was synthesized at {found} Hz, expected {expected} Hz")]
    SampleRateMismatch { index: usize, expected: u32, found: u32 },

    /// Anything else from the engine, the worker pool or the encoder.
    #[error("{0}")]
    Internal(String),
}

impl SynthesisError {
    /// `true` for failures caused by the request content rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::EmptySynthesis | Self::EmptyBatch | Self::EmptyBatchOutput
        )
    }
}

impl From<anyhow::Error> for SynthesisError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}
