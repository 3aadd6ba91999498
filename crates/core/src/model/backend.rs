//! Execution-provider selection for ONNX Runtime sessions.

use std::path::Path;
use std::str::FromStr;
use std::time::Instant;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider, TensorRTExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Inference backend selection.
///
/// `Tensorrt` needs the TensorRT runtime libraries; when they are missing the
/// session falls back to the CUDA provider. `Cpu` registers no provider at all.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cuda,
    Tensorrt,
    Cpu,
}

impl FromStr for InferenceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cuda" => Ok(Self::Cuda),
            "tensorrt" | "trt" => Ok(Self::Tensorrt),
            "cpu" => Ok(Self::Cpu),
            other => Err(format!(
                "unknown backend '{other}' (expected cuda, tensorrt or cpu)"
            )),
        }
    }
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cuda => write!(f, "cuda"),
            Self::Tensorrt => write!(f, "tensorrt"),
            Self::Cpu => write!(f, "cpu"),
        }
    }
}

pub struct SessionConfig<'a> {
    pub model_path: &'a Path,
    pub backend: InferenceBackend,
    pub device_id: u32,
    /// Lets TensorRT build FP16 engines.
    pub fp16_engines: bool,
    pub trt_cache_dir: &'a Path,
}

pub fn build_session(config: &SessionConfig<'_>) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;
    let device_id = i32::try_from(config.device_id)
        .with_context(|| format!("device index {} out of range", config.device_id))?;

    let session = match config.backend {
        InferenceBackend::Tensorrt => {
            if let Err(e) = std::fs::create_dir_all(config.trt_cache_dir) {
                warn!(
                    dir = %config.trt_cache_dir.display(),
                    error = %e,
                    "Failed to create TRT cache directory"
                );
            }

            info!(
                cache_dir = %config.trt_cache_dir.display(),
                device_id,
                fp16 = config.fp16_engines,
                "Initializing TensorRT session (first run may take several minutes)"
            );
            let started = Instant::now();

            let result = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_engine_cache(true)
                        .with_engine_cache_path(config.trt_cache_dir.to_string_lossy().to_string())
                        .with_fp16(config.fp16_engines)
                        .with_device_id(device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device_id)
                        .build(),
                ])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                });

            let elapsed_secs = started.elapsed().as_secs_f64();
            match result {
                Ok(session) => {
                    info!(elapsed_secs, "TensorRT session ready");
                    session
                }
                Err(error_value) => {
                    error!(elapsed_secs, error = %error_value, "TensorRT session initialization failed");
                    return Err(error_value);
                }
            }
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available, inference will fall back to CPU");
            }

            debug!(backend = "cuda", device_id, "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build()
                    .error_on_failure()])?
                .commit_from_file(config.model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", config.model_path.display())
                })?
        }
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session without execution providers");
            builder.commit_from_file(config.model_path).with_context(|| {
                format!("Failed to load ONNX model: {}", config.model_path.display())
            })?
        }
    };

    Ok(session)
}
