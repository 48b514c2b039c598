//! Request pipelines: single text and ordered batches.
//!
//! Both pipelines check the client connection at fixed checkpoints and
//! return an *empty* result, not an error, once the client is gone:
//!
//! ```text
//! single: check ─► permit ─► check ─► dispatch ─► check ─► encode
//! batch:  [check ─► skip blank | permit ─► check ─► dispatch ─► append + gap]* ─► check ─► encode
//! ```
//!
//! The check after the permit is taken by [`Synthesizer::synthesize`]; a
//! request that waited in the queue while its client left never reaches the
//! engine.
//!
//! The check after a dispatch cannot recover the inference time already
//! spent; it only saves the encode and transfer.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    audio::{self, SEGMENT_GAP_MS},
    engine::Synthesizer,
    error::SynthesisError,
};

/// Whether the client that issued a request is still there.
pub trait ClientLiveness: Send + Sync {
    fn is_disconnected(&self) -> bool;
}

impl ClientLiveness for CancellationToken {
    fn is_disconnected(&self) -> bool {
        self.is_cancelled()
    }
}

/// For callers without a transport to watch.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

impl ClientLiveness for AlwaysConnected {
    fn is_disconnected(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Requests and results
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SynthesisRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
}

#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub sentences: Vec<String>,
    pub voice: String,
    pub speed: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisResult {
    pub audio_base64: String,
    pub duration_seconds: f64,
}

impl SynthesisResult {
    /// Sentinel for a request whose client went away.
    pub fn empty() -> Self {
        Self { audio_base64: String::new(), duration_seconds: 0.0 }
    }

    pub fn is_empty(&self) -> bool {
        self.audio_base64.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult {
    pub audio_base64: String,
    pub duration_seconds: f64,
    /// Number of input sentences, blank ones included.
    pub sentence_count: usize,
}

impl BatchResult {
    /// Sentinel for a batch whose client went away.
    pub fn empty() -> Self {
        Self { audio_base64: String::new(), duration_seconds: 0.0, sentence_count: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.audio_base64.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Single text
// ─────────────────────────────────────────────────────────────────────────────

pub async fn synthesize<C: ClientLiveness + ?Sized>(
    synth: &Synthesizer,
    client: &C,
    request: &SynthesisRequest,
) -> Result<SynthesisResult, SynthesisError> {
    if client.is_disconnected() {
        info!("client disconnected before synthesis");
        return Ok(SynthesisResult::empty());
    }

    let Some(audio) = synth
        .synthesize(client, &request.text, &request.voice, request.speed)
        .await?
    else {
        info!("client disconnected while queued for synthesis");
        return Ok(SynthesisResult::empty());
    };

    if client.is_disconnected() {
        info!(samples = audio.len(), "client disconnected during synthesis, discarding audio");
        return Ok(SynthesisResult::empty());
    }

    if audio.is_empty() {
        return Err(SynthesisError::EmptySynthesis);
    }

    let audio_base64 = audio::encode_wav_base64(&audio.samples, audio.sample_rate)?;
    Ok(SynthesisResult { audio_base64, duration_seconds: audio.duration_seconds() })
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch
// ─────────────────────────────────────────────────────────────────────────────

pub async fn batch_synthesize<C: ClientLiveness + ?Sized>(
    synth: &Synthesizer,
    client: &C,
    request: &BatchRequest,
) -> Result<BatchResult, SynthesisError> {
    if request.sentences.is_empty() {
        return Err(SynthesisError::EmptyBatch);
    }

    let mut merged: Vec<f32> = Vec::new();
    let mut sample_rate: Option<u32> = None;

    for (index, sentence) in request.sentences.iter().enumerate() {
        if client.is_disconnected() {
            info!(index, "client disconnected mid-batch, discarding partial audio");
            return Ok(BatchResult::empty());
        }

        if sentence.trim().is_empty() {
            debug!(index, "skipping blank sentence");
            continue;
        }

        let Some(segment) = synth.synthesize(client, sentence, &request.voice, request.speed).await?
        else {
            info!(index, "client disconnected while queued, discarding partial audio");
            return Ok(BatchResult::empty());
        };

        let rate = *sample_rate.get_or_insert(segment.sample_rate);
        if segment.sample_rate != rate {
            return Err(SynthesisError::SampleRateMismatch {
                index,
                expected: rate,
                found: segment.sample_rate,
            });
        }

        if segment.is_empty() {
            debug!(index, "sentence produced no audio");
            continue;
        }

        merged.extend_from_slice(&segment.samples);
        merged.extend(audio::silence(rate, SEGMENT_GAP_MS));
    }

    let Some(rate) = sample_rate.filter(|_| !merged.is_empty()) else {
        return Err(SynthesisError::EmptyBatchOutput);
    };

    if client.is_disconnected() {
        info!("client disconnected before batch encode");
        return Ok(BatchResult::empty());
    }

    let audio_base64 = audio::encode_wav_base64(&merged, rate)?;
    Ok(BatchResult {
        audio_base64,
        duration_seconds: audio::duration_seconds(merged.len(), rate),
        sentence_count: request.sentences.len(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use anyhow::Result;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::*;
    use crate::{audio::AudioBuffer, engine::SpeechEngine};

    /// One sample of value 0.5 per input character, counts calls.
    struct Echo {
        calls: AtomicUsize,
        rates: Mutex<Vec<u32>>,
    }

    impl Echo {
        fn new() -> Arc<Self> {
            Self::with_rates(vec![])
        }

        /// Rates returned per call, in order; 24 kHz once exhausted.
        fn with_rates(rates: Vec<u32>) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), rates: Mutex::new(rates) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl SpeechEngine for Echo {
        fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<AudioBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut rates = self.rates.lock().unwrap();
            let rate = if rates.is_empty() { 24_000 } else { rates.remove(0) };
            let n = text.trim_end_matches('~').len();
            Ok(AudioBuffer::new(vec![0.5; n], rate))
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    /// Reports "connected" for the first `alive_checks` checks.
    struct DropsAfter {
        alive_checks: usize,
        seen: AtomicUsize,
    }

    impl DropsAfter {
        fn new(alive_checks: usize) -> Self {
            Self { alive_checks, seen: AtomicUsize::new(0) }
        }
    }

    impl ClientLiveness for DropsAfter {
        fn is_disconnected(&self) -> bool {
            self.seen.fetch_add(1, Ordering::SeqCst) >= self.alive_checks
        }
    }

    fn single(text: &str) -> SynthesisRequest {
        SynthesisRequest { text: text.into(), voice: "bf_alice".into(), speed: 1.0 }
    }

    fn batch(sentences: &[&str]) -> BatchRequest {
        BatchRequest {
            sentences: sentences.iter().map(|s| s.to_string()).collect(),
            voice: "bf_alice".into(),
            speed: 1.0,
        }
    }

    fn decoded_samples(b64: &str) -> (u32, Vec<i16>) {
        let wav = STANDARD.decode(b64).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        let rate = reader.spec().sample_rate;
        (rate, reader.into_samples::<i16>().map(|s| s.unwrap()).collect())
    }

    #[tokio::test]
    async fn test_single_success() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let out = synthesize(&synth, &AlwaysConnected, &single("Hello world")).await.unwrap();
        assert!(!out.is_empty());
        assert_eq!(out.duration_seconds, 11.0 / 24_000.0);
        let (rate, samples) = decoded_samples(&out.audio_base64);
        assert_eq!(rate, 24_000);
        assert_eq!(samples.len(), 11);
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_disconnect_before_dispatch_skips_inference() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let out = synthesize(&synth, &DropsAfter::new(0), &single("Hello")).await.unwrap();
        assert_eq!(out, SynthesisResult::empty());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_disconnect_after_dispatch_discards() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        // alive before and after taking the permit
        let out = synthesize(&synth, &DropsAfter::new(2), &single("Hello")).await.unwrap();
        assert_eq!(out, SynthesisResult::empty());
        assert_eq!(engine.calls(), 1);
    }

    #[tokio::test]
    async fn test_single_disconnect_while_waiting_for_permit() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let out = synthesize(&synth, &DropsAfter::new(1), &single("Hello")).await.unwrap();
        assert_eq!(out, SynthesisResult::empty());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_single_zero_samples_is_client_error() {
        let synth = Synthesizer::new(Echo::new(), 1);
        let err = synthesize(&synth, &AlwaysConnected, &single("")).await.unwrap_err();
        assert!(matches!(err, SynthesisError::EmptySynthesis));
    }

    #[tokio::test]
    async fn test_cancellation_token_liveness() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let token = CancellationToken::new();
        token.cancel();
        let out = synthesize(&synth, &token, &single("Hello")).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_empty_list_rejected_before_work() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let err = batch_synthesize(&synth, &DropsAfter::new(0), &batch(&[])).await.unwrap_err();
        assert!(matches!(err, SynthesisError::EmptyBatch));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_blank_entries_count_but_add_no_gap() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let out = batch_synthesize(&synth, &AlwaysConnected, &batch(&["A.", "", "B."]))
            .await
            .unwrap();

        assert_eq!(out.sentence_count, 3);
        assert_eq!(engine.calls(), 2);

        // "A." + gap + "B." + gap
        let gap = 7_200;
        let (_, samples) = decoded_samples(&out.audio_base64);
        assert_eq!(samples.len(), 2 + gap + 2 + gap);
        assert!(samples[..2].iter().all(|&s| s != 0));
        assert!(samples[2..2 + gap].iter().all(|&s| s == 0));
        assert!(samples[2 + gap..4 + gap].iter().all(|&s| s != 0));
        assert!(samples[4 + gap..].iter().all(|&s| s == 0));
        assert_eq!(out.duration_seconds, (4 + 2 * gap) as f64 / 24_000.0);
    }

    #[tokio::test]
    async fn test_batch_whitespace_only_is_empty_output() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        let err = batch_synthesize(&synth, &AlwaysConnected, &batch(&["  ", "\n\t", ""]))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::EmptyBatchOutput));
        assert_eq!(engine.calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_silent_segments_are_empty_output() {
        // '~' is stripped by the Echo engine, so these produce zero samples.
        let synth = Synthesizer::new(Echo::new(), 1);
        let err = batch_synthesize(&synth, &AlwaysConnected, &batch(&["~", "~~"]))
            .await
            .unwrap_err();
        assert!(matches!(err, SynthesisError::EmptyBatchOutput));
    }

    #[tokio::test]
    async fn test_batch_disconnect_between_segments() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        // two checks per segment; alive for segments 0 and 1, gone before 2
        let client = DropsAfter::new(4);
        let out = batch_synthesize(&synth, &client, &batch(&["one", "two", "three"]))
            .await
            .unwrap();
        assert_eq!(out, BatchResult::empty());
        assert_eq!(engine.calls(), 2);
    }

    #[tokio::test]
    async fn test_batch_disconnect_before_encode() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        // six per-segment checks pass, the final one fails
        let client = DropsAfter::new(6);
        let out = batch_synthesize(&synth, &client, &batch(&["one", "two", "three"]))
            .await
            .unwrap();
        assert_eq!(out, BatchResult::empty());
        assert_eq!(engine.calls(), 3);
    }

    #[tokio::test]
    async fn test_batch_disconnect_while_waiting_for_permit() {
        let engine = Echo::new();
        let synth = Synthesizer::new(engine.clone(), 1);
        // segment 0 runs; the post-permit check of segment 1 fails
        let client = DropsAfter::new(3);
        let out = batch_synthesize(&synth, &client, &batch(&["one", "two", "three"]))
            .await
            .unwrap();
        assert_eq!(out, BatchResult::empty());
        assert_eq!(engine.calls(), 1);
    }

    /// Blocks inside every call until released.
    struct Gate {
        calls: AtomicUsize,
        started: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SpeechEngine for Gate {
        fn synthesize(&self, text: &str, _voice: &str, _speed: f32) -> Result<AudioBuffer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.lock().unwrap().send(());
            let _ = self.release.lock().unwrap().recv_timeout(Duration::from_secs(5));
            Ok(AudioBuffer::new(vec![0.5; text.len()], 24_000))
        }

        fn sample_rate(&self) -> u32 {
            24_000
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_request_cancelled_before_permit_never_infers() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let engine = Arc::new(Gate {
            calls: AtomicUsize::new(0),
            started: Mutex::new(started_tx),
            release: Mutex::new(release_rx),
        });
        let synth = Synthesizer::new(engine.clone(), 1);

        // first request takes the only permit and blocks in the engine
        let first = {
            let synth = synth.clone();
            tokio::spawn(async move { synthesize(&synth, &AlwaysConnected, &single("first")).await })
        };
        tokio::task::spawn_blocking(move || started_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        // second request queues behind it with a live client
        let token = CancellationToken::new();
        let second = {
            let synth = synth.clone();
            let token = token.clone();
            tokio::spawn(async move { synthesize(&synth, &token, &single("second")).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        release_tx.send(()).unwrap();

        let first = first.await.unwrap().unwrap();
        assert!(!first.is_empty());
        let second = second.await.unwrap().unwrap();
        assert_eq!(second, SynthesisResult::empty());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_rejects_mixed_sample_rates() {
        let synth = Synthesizer::new(Echo::with_rates(vec![24_000, 22_050]), 1);
        let err = batch_synthesize(&synth, &AlwaysConnected, &batch(&["a", "b"]))
            .await
            .unwrap_err();
        match err {
            SynthesisError::SampleRateMismatch { index, expected, found } => {
                assert_eq!((index, expected, found), (1, 24_000, 22_050));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_batch_uses_first_rate() {
        let synth = Synthesizer::new(Echo::with_rates(vec![16_000, 16_000]), 1);
        let out = batch_synthesize(&synth, &AlwaysConnected, &batch(&["ab", "cd"]))
            .await
            .unwrap();
        let (rate, samples) = decoded_samples(&out.audio_base64);
        assert_eq!(rate, 16_000);
        assert_eq!(samples.len(), 2 * (2 + 4_800));
    }
}
