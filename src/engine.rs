//! The synthesis facade and its worker-thread dispatcher.
//!
//! [`SpeechEngine::synthesize`] is blocking and CPU/accelerator bound.  It
//! must never run on an async worker: [`Synthesizer`] moves every call onto
//! tokio's blocking pool so the request task can keep observing the client
//! connection while inference runs.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{audio::AudioBuffer, error::SynthesisError, pipeline::ClientLiveness};

/// A loaded text-to-speech model.
///
/// Implementations are shared across all requests.  If the underlying
/// runtime cannot serve concurrent calls the implementation serialises them
/// itself (the Kokoro engine holds its session in a `Mutex`).
pub trait SpeechEngine: Send + Sync + 'static {
    /// Synthesize `text` with `voice` at `speed` (1.0 = normal).
    ///
    /// Empty text is not rejected here; it yields whatever the model
    /// produces, usually zero samples.
    fn synthesize(&self, text: &str, voice: &str, speed: f32) -> Result<AudioBuffer>;

    /// Output rate of the model, for health reporting.
    fn sample_rate(&self) -> u32;
}

/// Dispatches facade calls to the blocking pool behind a semaphore.
#[derive(Clone)]
pub struct Synthesizer {
    engine: Arc<dyn SpeechEngine>,
    permits: Arc<Semaphore>,
}

impl Synthesizer {
    /// `max_in_flight` bounds how many inference calls may occupy blocking
    /// threads at once; further requests wait for a permit.
    pub fn new(engine: Arc<dyn SpeechEngine>, max_in_flight: usize) -> Self {
        Self {
            engine,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn engine(&self) -> &Arc<dyn SpeechEngine> {
        &self.engine
    }

    /// Run one synthesis on a worker thread and wait for it.
    ///
    /// Returns `None` without dispatching when `client` is gone by the time a
    /// permit is granted.  Once dispatched the call runs to completion even if
    /// the awaiting future is dropped.
    pub async fn synthesize<C: ClientLiveness + ?Sized>(
        &self,
        client: &C,
        text: &str,
        voice: &str,
        speed: f32,
    ) -> Result<Option<AudioBuffer>, SynthesisError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SynthesisError::Internal("inference pool is shut down".into()))?;

        if client.is_disconnected() {
            debug!("client gone while queued for inference");
            return Ok(None);
        }

        let engine = Arc::clone(&self.engine);
        let text = text.to_owned();
        let voice = voice.to_owned();

        debug!(chars = text.len(), voice = %voice, speed, "dispatching synthesis");
        let audio = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            engine.synthesize(&text, &voice, speed)
        })
        .await
        .map_err(|e| SynthesisError::Internal(format!("inference worker failed: {e}")))??;

        Ok(Some(audio))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::Duration,
    };

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::pipeline::AlwaysConnected;

    struct Slow {
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl SpeechEngine for Slow {
        fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<AudioBuffer> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(AudioBuffer::new(vec![0.1; text.len()], 24_000))
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    struct Failing;

    impl SpeechEngine for Failing {
        fn synthesize(&self, _: &str, voice: &str, _: f32) -> Result<AudioBuffer> {
            anyhow::bail!("Voice '{voice}' not found")
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    struct Panicking;

    impl SpeechEngine for Panicking {
        fn synthesize(&self, _: &str, _: &str, _: f32) -> Result<AudioBuffer> {
            panic!("kernel crashed")
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    #[tokio::test]
    async fn test_runs_off_the_async_worker() {
        let engine = Arc::new(Slow { running: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let synth = Synthesizer::new(engine, 1);
        let audio = synth.synthesize(&AlwaysConnected, "hello", "bf_alice", 1.0).await.unwrap();
        assert_eq!(audio.map(|a| a.len()), Some(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_permit_serialises_calls() {
        let engine = Arc::new(Slow { running: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let synth = Synthesizer::new(engine.clone(), 1);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let s = synth.clone();
                tokio::spawn(async move { s.synthesize(&AlwaysConnected, "abc", "v", 1.0).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(engine.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gone_client_is_not_dispatched() {
        let engine = Arc::new(Slow { running: AtomicUsize::new(0), peak: AtomicUsize::new(0) });
        let synth = Synthesizer::new(engine.clone(), 1);
        let token = CancellationToken::new();
        token.cancel();

        let out = synth.synthesize(&token, "hello", "v", 1.0).await.unwrap();
        assert!(out.is_none());
        assert_eq!(engine.peak.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_engine_error_is_internal() {
        let synth = Synthesizer::new(Arc::new(Failing), 1);
        match synth.synthesize(&AlwaysConnected, "x", "nobody", 1.0).await {
            Err(SynthesisError::Internal(msg)) => assert!(msg.contains("nobody")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_worker_panic_is_internal() {
        let synth = Synthesizer::new(Arc::new(Panicking), 1);
        let err = synth.synthesize(&AlwaysConnected, "x", "v", 1.0).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Internal(_)));
        // permit released by the unwinding worker
        let err = synth.synthesize(&AlwaysConnected, "x", "v", 1.0).await.unwrap_err();
        assert!(matches!(err, SynthesisError::Internal(_)));
    }
}
