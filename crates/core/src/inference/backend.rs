//! Execution provider selection and `ort::Session` construction.

use std::path::Path;

use anyhow::{Context, Result};
use ort::{
    execution_providers::{CUDAExecutionProvider, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Inference backend selection.
///
/// Default is `Cpu` so a fresh install works without GPU drivers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceBackend {
    #[default]
    Cpu,
    Cuda,
}

impl std::fmt::Display for InferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda => write!(f, "cuda"),
        }
    }
}

/// Build an `ort::Session` for `model_path` on the requested backend.
///
/// `Cuda` registers the CUDA EP with `error_on_failure`, so a broken CUDA
/// install surfaces as a load error instead of a silent CPU fallback.
pub fn build_session(model_path: &Path, backend: InferenceBackend) -> Result<Session> {
    let builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    let session = match backend {
        InferenceBackend::Cpu => {
            debug!(backend = "cpu", "Building session with default CPU EP");
            builder.commit_from_file(model_path).with_context(|| {
                format!("Failed to load ONNX model: {}", model_path.display())
            })?
        }
        InferenceBackend::Cuda => {
            let cuda = CUDAExecutionProvider::default();
            if !cuda.is_available().unwrap_or(false) {
                warn!("CUDA EP is not available in this ONNX Runtime build");
            }

            debug!(backend = "cuda", "Building session with CUDA EP");

            builder
                .with_execution_providers([CUDAExecutionProvider::default()
                    .build()
                    .error_on_failure()])?
                .commit_from_file(model_path)
                .with_context(|| {
                    format!("Failed to load ONNX model: {}", model_path.display())
                })?
        }
    };

    Ok(session)
}
