//! Execution-provider detection and preference ordering.
//!
//! ONNX Runtime can run the Kokoro graph on several backends.  This module
//! decides *which ones to try and in what order*; [`crate::session`] does
//! the trying.
//!
//! | Priority | Candidate                    | When                                  |
//! |----------|------------------------------|---------------------------------------|
//! | 1        | CUDA                         | CUDA reported available               |
//! | 2        | OpenVINO `GPU_FP16` + cache  | OpenVINO available, no CUDA           |
//! | 3        | OpenVINO `NPU`               | OpenVINO available and NPU opted in   |
//! | 4        | OpenVINO `CPU_FP32`, N threads | OpenVINO available                  |
//! | 5        | generic CPU                  | always                                |

use std::{fmt, path::PathBuf};

use tracing::{debug, info, warn};

/// Registered ONNX Runtime provider names.
pub const CUDA_PROVIDER: &str = "CUDAExecutionProvider";
pub const OPENVINO_PROVIDER: &str = "OpenVINOExecutionProvider";
pub const CPU_PROVIDER: &str = "CPUExecutionProvider";

// ─────────────────────────────────────────────────────────────────────────────
// Provider variants
// ─────────────────────────────────────────────────────────────────────────────

/// Arithmetic precision requested from the OpenVINO backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp16,
    Fp32,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fp16 => write!(f, "FP16"),
            Self::Fp32 => write!(f, "FP32"),
        }
    }
}

/// Device targeted by the OpenVINO backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenVinoDevice {
    Gpu,
    Npu,
    Cpu,
}

impl fmt::Display for OpenVinoDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::Npu => write!(f, "NPU"),
            Self::Cpu => write!(f, "CPU"),
        }
    }
}

/// OpenVINO provider configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenVinoConfig {
    pub device: OpenVinoDevice,
    /// `None` leaves the precision to the device plugin.
    pub precision: Option<Precision>,
    /// Compiled-kernel cache; reused across restarts.
    pub cache_dir: Option<PathBuf>,
    pub num_threads: Option<usize>,
}

impl OpenVinoConfig {
    /// The `device_type` option string, e.g. `GPU_FP16` or `NPU`.
    pub fn device_type(&self) -> String {
        match self.precision {
            Some(p) => format!("{}_{}", self.device, p),
            None => self.device.to_string(),
        }
    }
}

/// One candidate backend in the preference chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionProvider {
    Cuda { device_id: i32 },
    OpenVino(OpenVinoConfig),
    /// The default ONNX Runtime CPU kernels.  Always last in a chain.
    Cpu,
}

impl ExecutionProvider {
    /// The ONNX Runtime registration name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Cuda { .. } => CUDA_PROVIDER,
            Self::OpenVino(_) => OPENVINO_PROVIDER,
            Self::Cpu => CPU_PROVIDER,
        }
    }

    /// Key/value configuration passed along with the provider.
    pub fn options(&self) -> Vec<(&'static str, String)> {
        match self {
            Self::Cuda { device_id } => vec![("device_id", device_id.to_string())],
            Self::OpenVino(cfg) => {
                let mut opts = vec![("device_type", cfg.device_type())];
                if let Some(p) = cfg.precision {
                    opts.push(("precision", p.to_string()));
                }
                if let Some(dir) = &cfg.cache_dir {
                    opts.push(("cache_dir", dir.display().to_string()));
                }
                if let Some(n) = cfg.num_threads {
                    opts.push(("num_threads", n.to_string()));
                }
                opts
            }
            Self::Cpu => Vec::new(),
        }
    }

    /// Intra-op thread count requested by this candidate, if any.
    pub fn num_threads(&self) -> Option<usize> {
        match self {
            Self::OpenVino(cfg) => cfg.num_threads,
            _ => None,
        }
    }

    pub fn is_generic_cpu(&self) -> bool {
        matches!(self, Self::Cpu)
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cuda { device_id } => write!(f, "cuda:{device_id}"),
            Self::OpenVino(cfg) => write!(f, "openvino[{}]", cfg.device_type()),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Detection
// ─────────────────────────────────────────────────────────────────────────────

/// Backends the linked ONNX Runtime reports as usable on this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AvailableProviders {
    pub cuda: bool,
    pub openvino: bool,
}

impl AvailableProviders {
    pub fn is_empty(&self) -> bool {
        !self.cuda && !self.openvino
    }
}

/// Ask ONNX Runtime which accelerated providers it can register.
///
/// A failed query counts as "not available".
pub fn detect_providers() -> AvailableProviders {
    use ort::ep::{self, ExecutionProvider as _};

    fn probe(name: &str, result: ort::Result<bool>) -> bool {
        match result {
            Ok(available) => available,
            Err(e) => {
                warn!(provider = name, error = %e, "provider detection failed");
                false
            }
        }
    }

    let available = AvailableProviders {
        cuda: probe(CUDA_PROVIDER, ep::CUDA::default().is_available()),
        openvino: probe(OPENVINO_PROVIDER, ep::OpenVINO::default().is_available()),
    };
    debug!(?available, "detected execution providers");
    available
}

// ─────────────────────────────────────────────────────────────────────────────
// Selection
// ─────────────────────────────────────────────────────────────────────────────

/// Operator override for the preference chain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderPreference {
    /// Detect and order automatically.
    #[default]
    Auto,
    Cuda,
    #[value(name = "openvino-gpu")]
    OpenVinoGpu,
    #[value(name = "openvino-npu")]
    OpenVinoNpu,
    #[value(name = "openvino-cpu")]
    OpenVinoCpu,
    Cpu,
}

/// Knobs that shape the chain beyond what detection reports.
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    pub preference: ProviderPreference,
    /// Enqueue the OpenVINO NPU candidate when OpenVINO is present.
    pub enable_npu: bool,
    pub openvino_cache_dir: PathBuf,
    /// Threads for the OpenVINO CPU candidate; `None` auto-detects.
    pub cpu_threads: Option<usize>,
    pub cuda_device_id: i32,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            preference: ProviderPreference::Auto,
            enable_npu: false,
            openvino_cache_dir: PathBuf::from("openvino_cache"),
            cpu_threads: None,
            cuda_device_id: 0,
        }
    }
}

impl ProviderOptions {
    fn openvino_gpu(&self) -> ExecutionProvider {
        ExecutionProvider::OpenVino(OpenVinoConfig {
            device: OpenVinoDevice::Gpu,
            precision: Some(Precision::Fp16),
            cache_dir: Some(self.openvino_cache_dir.clone()),
            num_threads: None,
        })
    }

    fn openvino_npu(&self) -> ExecutionProvider {
        ExecutionProvider::OpenVino(OpenVinoConfig {
            device: OpenVinoDevice::Npu,
            precision: None,
            cache_dir: Some(self.openvino_cache_dir.clone()),
            num_threads: None,
        })
    }

    fn openvino_cpu(&self) -> ExecutionProvider {
        let threads = self.cpu_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        });
        ExecutionProvider::OpenVino(OpenVinoConfig {
            device: OpenVinoDevice::Cpu,
            precision: Some(Precision::Fp32),
            cache_dir: None,
            num_threads: Some(threads),
        })
    }

    fn cuda(&self) -> ExecutionProvider {
        ExecutionProvider::Cuda { device_id: self.cuda_device_id }
    }
}

/// Produce the ordered preference chain.
///
/// Pure apart from logging.  The result always ends with
/// [`ExecutionProvider::Cpu`] and is therefore never empty.
pub fn select_providers(
    available: &AvailableProviders,
    options: &ProviderOptions,
) -> Vec<ExecutionProvider> {
    let mut chain = match options.preference {
        ProviderPreference::Auto => auto_chain(available, options),
        ProviderPreference::Cuda => vec![options.cuda()],
        ProviderPreference::OpenVinoGpu => vec![options.openvino_gpu()],
        ProviderPreference::OpenVinoNpu => vec![options.openvino_npu()],
        ProviderPreference::OpenVinoCpu => vec![options.openvino_cpu()],
        ProviderPreference::Cpu => Vec::new(),
    };
    chain.push(ExecutionProvider::Cpu);

    info!(
        chain = %chain.iter().map(ToString::to_string).collect::<Vec<_>>().join(" -> "),
        "execution provider preference"
    );
    chain
}

fn auto_chain(available: &AvailableProviders, options: &ProviderOptions) -> Vec<ExecutionProvider> {
    if available.is_empty() {
        info!("no accelerated execution providers detected");
        return Vec::new();
    }

    let mut chain = Vec::new();

    // Only one GPU-class candidate: CUDA wins over OpenVINO GPU.
    if available.cuda {
        chain.push(options.cuda());
    } else if available.openvino {
        chain.push(options.openvino_gpu());
    }

    if available.openvino {
        if options.enable_npu {
            chain.push(options.openvino_npu());
        } else {
            debug!("OpenVINO NPU candidate skipped (not enabled)");
        }
        chain.push(options.openvino_cpu());
    }

    chain
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
