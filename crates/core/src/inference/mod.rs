//! Boundary to the externally trained motion-transfer model.
//!
//! The pipeline only talks to [`ModelLoader`] and [`AnimationModel`]. The
//! shipped implementation runs an exported ONNX graph through ONNX Runtime
//! ([`onnx::OnnxModelLoader`]); tests substitute in-process fakes.

pub mod backend;
pub mod onnx;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::types::{AnimationOptions, FrameSize};

pub use backend::{build_session, InferenceBackend};
pub use onnx::OnnxModelLoader;

/// Tensor interface of an exported animation graph.
///
/// All image tensors are `[1, 3, H, W]` f32 in `[0, 1]`. Flag inputs are
/// `[1]` f32 tensors holding `0.0` or `1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub source_input: String,
    pub driving_input: String,
    /// First frame of the driving video; the reference for relative motion.
    pub driving_initial_input: String,
    pub prediction_output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relative_input: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapt_scale_input: Option<String>,
    pub frame_size: FrameSize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            source_input: "source".to_string(),
            driving_input: "driving".to_string(),
            driving_initial_input: "driving_initial".to_string(),
            prediction_output: "prediction".to_string(),
            relative_input: Some("relative".to_string()),
            adapt_scale_input: Some("adapt_scale".to_string()),
            frame_size: FrameSize::default(),
        }
    }
}

impl ModelConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read model config: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse model config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create model config directory: {}", parent.display())
            })?;
        }
        let encoded =
            toml::to_string_pretty(self).context("failed to serialize model config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write model config: {}", path.display()))
    }

    /// The graph is exported for one fixed resolution; frames of any other
    /// size would be rejected by the runtime with a much less useful error.
    pub fn ensure_frame_size(&self, target: FrameSize) -> Result<()> {
        if self.frame_size != target {
            bail!(
                "model expects {} frames but the pipeline produces {}; \
                 adjust [animation] frame size or the model config",
                self.frame_size,
                target
            );
        }
        Ok(())
    }
}

/// Per-frame progress callback: `(generated, total)`.
pub type FrameProgress<'a> = &'a mut dyn FnMut(usize, usize);

/// A loaded, ready-to-run animation model.
pub trait AnimationModel: Send {
    /// Produces one output frame per driving frame, in order. Every input
    /// buffer is already letterboxed to the model's frame size.
    fn animate(
        &mut self,
        source: &RgbImage,
        driving: &[RgbImage],
        options: AnimationOptions,
        progress: FrameProgress<'_>,
    ) -> Result<Vec<RgbImage>>;
}

/// Opens a checkpoint and hands back a runnable model.
pub trait ModelLoader: Send + Sync {
    fn load(&self, config: &ModelConfig, checkpoint: &Path) -> Result<Box<dyn AnimationModel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_model_config_roundtrips_through_toml() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("nested/vox-256.toml");

        ModelConfig::default().save_to_path(&path).unwrap();
        let loaded = ModelConfig::load_from_path(&path).unwrap();

        assert_eq!(loaded, ModelConfig::default());
    }

    #[test]
    fn partial_model_config_keeps_defaults() {
        let cfg: ModelConfig = toml::from_str(
            "prediction_output = \"out\"\n\n[frame_size]\nwidth = 512\nheight = 512\n",
        )
        .unwrap();

        assert_eq!(cfg.prediction_output, "out");
        assert_eq!(cfg.source_input, "source");
        assert_eq!(cfg.frame_size, FrameSize::square(512));
    }

    #[test]
    fn flag_inputs_can_be_omitted() {
        let cfg = ModelConfig {
            relative_input: None,
            adapt_scale_input: None,
            ..ModelConfig::default()
        };
        let encoded = toml::to_string_pretty(&cfg).unwrap();
        assert!(!encoded.contains("relative_input"));
    }

    #[test]
    fn missing_model_config_reports_path() {
        let err = ModelConfig::load_from_path(Path::new("/nonexistent/model.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/model.toml"));
    }

    #[test]
    fn frame_size_mismatch_is_rejected() {
        let cfg = ModelConfig::default();
        assert!(cfg.ensure_frame_size(FrameSize::square(256)).is_ok());

        let err = cfg.ensure_frame_size(FrameSize::square(512)).unwrap_err();
        assert!(err.to_string().contains("model expects 256x256"));
    }
}
