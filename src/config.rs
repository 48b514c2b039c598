//! Command-line and environment configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::{
    error::StartupError,
    provider::{ProviderOptions, ProviderPreference},
};

#[derive(Parser, Debug, Clone)]
#[command(name = "kokoro-serve")]
#[command(about = "Kokoro text-to-speech over HTTP with ONNX Runtime provider fallback")]
pub struct ServerConfig {
    /// Host to bind to
    #[arg(short = 'H', long, default_value = "0.0.0.0", env = "KOKORO_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value = "8000", env = "KOKORO_PORT")]
    pub port: u16,

    /// Path to the Kokoro ONNX graph
    #[arg(long, default_value = "kokoro-v1.0.onnx", env = "KOKORO_MODEL")]
    pub model: PathBuf,

    /// Path to the voice style archive
    #[arg(long, default_value = "voices-v1.0.bin", env = "KOKORO_VOICES")]
    pub voices: PathBuf,

    /// Voice used when a request does not name one
    #[arg(long, default_value = "bf_alice", env = "KOKORO_DEFAULT_VOICE")]
    pub default_voice: String,

    /// espeak-ng language for phonemisation
    #[arg(long, default_value = "en-us", env = "KOKORO_LANGUAGE")]
    pub language: String,

    /// Directory containing espeak-ng-data (system default if unset)
    #[arg(long, env = "KOKORO_ESPEAK_DATA")]
    pub espeak_data: Option<PathBuf>,

    /// Execution provider preference
    #[arg(long, value_enum, default_value = "auto", env = "KOKORO_PROVIDER")]
    pub provider: ProviderPreference,

    /// Also try the OpenVINO NPU device
    #[arg(long, env = "KOKORO_ENABLE_NPU")]
    pub enable_npu: bool,

    /// OpenVINO compiled-model cache
    #[arg(long, default_value = "openvino_cache", env = "KOKORO_OPENVINO_CACHE_DIR")]
    pub openvino_cache_dir: PathBuf,

    /// CUDA device ordinal
    #[arg(long, default_value = "0", env = "KOKORO_CUDA_DEVICE")]
    pub cuda_device: i32,

    /// CPU inference threads (auto-detected if unset)
    #[arg(short, long, env = "KOKORO_THREADS")]
    pub threads: Option<usize>,

    /// Inference calls allowed in flight at once
    #[arg(long, default_value = "1", env = "KOKORO_MAX_CONCURRENT_INFERENCES")]
    pub max_concurrent_inferences: usize,

    /// Allowed CORS origin, repeatable (any origin if none given)
    #[arg(long = "cors-origin", env = "KOKORO_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    /// `host:port`, resolved by the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Both model artifacts must exist before anything is loaded.
    pub fn check_artifacts(&self) -> Result<(), StartupError> {
        let missing: Vec<PathBuf> = [&self.model, &self.voices]
            .into_iter()
            .filter(|p| !p.is_file())
            .cloned()
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StartupError::MissingArtifacts { missing })
        }
    }

    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            preference: self.provider,
            enable_npu: self.enable_npu,
            openvino_cache_dir: self.openvino_cache_dir.clone(),
            cpu_threads: self.threads,
            cuda_device_id: self.cuda_device,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ServerConfig {
        let mut argv = vec!["kokoro-serve"];
        argv.extend_from_slice(args);
        ServerConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&[]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.default_voice, "bf_alice");
        assert_eq!(cfg.language, "en-us");
        assert_eq!(cfg.model, PathBuf::from("kokoro-v1.0.onnx"));
        assert_eq!(cfg.voices, PathBuf::from("voices-v1.0.bin"));
        assert_eq!(cfg.provider, ProviderPreference::Auto);
        assert_eq!(cfg.max_concurrent_inferences, 1);
        assert!(!cfg.enable_npu);
        assert!(cfg.cors_origins.is_empty());
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8000");
    }

    #[test]
    fn test_provider_flags() {
        let cfg = parse(&["--provider", "openvino-gpu", "--enable-npu", "--threads", "6"]);
        let opts = cfg.provider_options();
        assert_eq!(opts.preference, ProviderPreference::OpenVinoGpu);
        assert!(opts.enable_npu);
        assert_eq!(opts.cpu_threads, Some(6));
        assert!(ServerConfig::try_parse_from(["kokoro-serve", "--provider", "tpu"]).is_err());
    }

    #[test]
    fn test_cors_origins_repeatable() {
        let cfg = parse(&["--cors-origin", "http://a.test", "--cors-origin", "http://b.test"]);
        assert_eq!(cfg.cors_origins, vec!["http://a.test", "http://b.test"]);
    }

    #[test]
    fn test_missing_artifacts_reported() {
        let cfg = parse(&["--model", "/nonexistent/kokoro.onnx", "--voices", "/nonexistent/v.bin"]);
        match cfg.check_artifacts() {
            Err(StartupError::MissingArtifacts { missing }) => assert_eq!(missing.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_present_artifacts_pass() {
        let dir = std::env::temp_dir().join(format!("kokoro-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let model = dir.join("m.onnx");
        let voices = dir.join("v.bin");
        std::fs::write(&model, b"x").unwrap();
        std::fs::write(&voices, b"x").unwrap();

        let cfg = parse(&["--model", model.to_str().unwrap(), "--voices", voices.to_str().unwrap()]);
        assert!(cfg.check_artifacts().is_ok());
        std::fs::remove_dir_all(&dir).ok();
    }
}
