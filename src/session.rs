//! Inference session construction with provider fallback.
//!
//! [`build_session`] walks the preference chain from
//! [`crate::provider::select_providers`], binding a session to exactly one
//! provider per attempt.  A failed attempt is logged and skipped; if the
//! whole chain fails a final generic-CPU attempt is made, and only its
//! failure is fatal.

use std::path::Path;

use anyhow::{Context, Result};
use ort::{
    ep,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{info, warn};

use crate::{error::StartupError, provider::ExecutionProvider};

/// Creates a session bound to a single provider.
pub trait SessionFactory {
    type Session;

    fn create(&self, model_path: &Path, provider: &ExecutionProvider) -> Result<Self::Session>;
}

/// A session together with the provider that actually serves it.
pub struct BoundSession<S> {
    pub session: S,
    pub provider: ExecutionProvider,
}

/// Try each candidate in order; first success wins.
pub fn build_session<F: SessionFactory>(
    factory: &F,
    model_path: &Path,
    chain: &[ExecutionProvider],
) -> Result<BoundSession<F::Session>, StartupError> {
    for provider in chain {
        match factory.create(model_path, provider) {
            Ok(session) => return Ok(bound(session, provider.clone())),
            Err(e) => {
                warn!(provider = %provider, error = %format!("{e:#}"), "execution provider unavailable, trying next");
            }
        }
    }

    warn!("every execution provider candidate failed, forcing generic CPU");
    let provider = ExecutionProvider::Cpu;
    match factory.create(model_path, &provider) {
        Ok(session) => Ok(bound(session, provider)),
        Err(e) => Err(StartupError::SessionUnavailable { message: format!("{e:#}") }),
    }
}

fn bound<S>(session: S, provider: ExecutionProvider) -> BoundSession<S> {
    info!(provider = %provider, name = provider.name(), "inference session ready");
    BoundSession { session, provider }
}

// ─────────────────────────────────────────────────────────────────────────────
// ONNX Runtime factory
// ─────────────────────────────────────────────────────────────────────────────

/// Builds real ONNX Runtime sessions.
///
/// Providers are registered with `error_on_failure()`, so a missing driver
/// or an unsupported device surfaces here as an error instead of ONNX
/// Runtime silently running the graph on CPU.
#[derive(Debug, Clone, Default)]
pub struct OrtSessionFactory {
    /// Intra-op threads for the generic CPU provider; `None` lets ORT decide.
    pub cpu_threads: Option<usize>,
}

impl SessionFactory for OrtSessionFactory {
    type Session = Session;

    fn create(&self, model_path: &Path, provider: &ExecutionProvider) -> Result<Session> {
        let builder = Session::builder()
            .context("Failed to create ORT session builder")?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .context("Failed to set optimization level")?;

        let mut builder = match provider {
            ExecutionProvider::Cuda { device_id } => builder.with_execution_providers([
                ep::CUDA::default().with_device_id(*device_id).build().error_on_failure(),
            ]),
            ExecutionProvider::OpenVino(cfg) => {
                let mut openvino = ep::OpenVINO::default().with_device_type(cfg.device_type());
                if let Some(dir) = &cfg.cache_dir {
                    std::fs::create_dir_all(dir).with_context(|| {
                        format!("Cannot create OpenVINO cache dir: {}", dir.display())
                    })?;
                    openvino = openvino.with_cache_dir(dir.display().to_string());
                }
                builder.with_execution_providers([openvino.build().error_on_failure()])
            }
            ExecutionProvider::Cpu => {
                builder.with_execution_providers([ep::CPU::default().build().error_on_failure()])
            }
        }
        .with_context(|| format!("Failed to register {}", provider.name()))?;

        let threads = provider.num_threads().or(match provider {
            ExecutionProvider::Cpu => self.cpu_threads,
            _ => None,
        });
        if let Some(n) = threads {
            builder = builder
                .with_intra_threads(n)
                .context("Failed to set intra-op thread count")?;
        }

        builder
            .commit_from_file(model_path)
            .with_context(|| format!("Cannot load ONNX model: {}", model_path.display()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
