//! # kokoro-serve
//!
//! HTTP text-to-speech service for the
//! [Kokoro](https://huggingface.co/hexgrad/Kokoro-82M) v1.0 ONNX model.
//!
//! ## Startup
//! 1. **Provider detection**: ask ONNX Runtime which accelerated providers
//!    are compiled in ([`provider::detect_providers`]).
//! 2. **Selection**: order them into a preference chain that always ends in
//!    generic CPU ([`provider::select_providers`]).
//! 3. **Session**: bind the model to the first provider that works, falling
//!    back to CPU ([`session::build_session`]).
//! 4. **Engine**: wrap the session with the voice matrices and a phonemizer
//!    ([`model::KokoroOnnx`]).
//!
//! ## Per request
//! Handlers in [`server`] hand the request to [`pipeline`], which checks the
//! client connection between steps, dispatches inference to the blocking
//! pool through [`engine::Synthesizer`] and packages the result as a
//! base64 WAV ([`audio`]).
//!
//! ```no_run
//! # async fn demo(engine: std::sync::Arc<dyn kokoro_serve::SpeechEngine>) -> anyhow::Result<()> {
//! use kokoro_serve::{server, AppState, Synthesizer};
//!
//! let state = AppState {
//!     synth: Synthesizer::new(engine, 1),
//!     default_voice: "bf_alice".into(),
//!     provider: "cpu".into(),
//! };
//! let app = server::router(state, server::cors_layer(&[])?);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8000").await?;
//! axum::serve(listener, app).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Build requirements
//! The library builds without native dependencies besides ONNX Runtime.  The
//! server binary needs the `espeak` feature and `libespeak-ng`:
//!
//! | Platform           | Requirement                                          |
//! |--------------------|------------------------------------------------------|
//! | Alpine / Linux     | `apk add espeak-ng-dev` / `apt install libespeak-ng-dev` |
//! | macOS (Homebrew)   | `brew install espeak-ng`                             |

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod npz;
pub mod phonemize;
pub mod pipeline;
pub mod provider;
pub mod server;
pub mod session;
pub mod tokenize;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use audio::AudioBuffer;
pub use config::ServerConfig;
pub use engine::{SpeechEngine, Synthesizer};
pub use error::{StartupError, SynthesisError};
pub use model::{KokoroOnnx, SAMPLE_RATE};
pub use phonemize::Phonemizer;
pub use pipeline::{BatchRequest, BatchResult, ClientLiveness, SynthesisRequest, SynthesisResult};
pub use provider::{ExecutionProvider, ProviderPreference};
pub use server::AppState;
