use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::inference::{InferenceBackend, ModelConfig};
use crate::types::{AnimationOptions, FrameSize};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "PUPPETEER_DATA_DIR";
const DEFAULT_MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub server: ServerConfig,
    pub checkpoint: CheckpointConfig,
    pub animation: AnimationConfig,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Exported model graph. Downloaded on demand when missing.
    pub checkpoint: PathBuf,
    /// Describes the tensor interface of `checkpoint`.
    pub model_config: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Pre-filled download URL; empty means the user must supply one.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnimationConfig {
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: u32,
    pub relative: bool,
    pub adapt_scale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct InferenceConfig {
    pub backend: InferenceBackend,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            server: ServerConfig::default(),
            checkpoint: CheckpointConfig::default(),
            animation: AnimationConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            checkpoint: PathBuf::from("checkpoints/fomm-vox-256.onnx"),
            model_config: PathBuf::from("config/vox-256.toml"),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8501,
            host: "0.0.0.0".to_string(),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for AnimationConfig {
    fn default() -> Self {
        let size = FrameSize::default();
        let options = AnimationOptions::default();
        Self {
            frame_width: size.width,
            frame_height: size.height,
            fps: 25,
            relative: options.relative,
            adapt_scale: options.adapt_scale,
        }
    }
}

impl AnimationConfig {
    pub fn frame_size(&self) -> FrameSize {
        FrameSize::new(self.frame_width, self.frame_height)
    }

    pub fn options(&self) -> AnimationOptions {
        AnimationOptions {
            relative: self.relative,
            adapt_scale: self.adapt_scale,
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Checks values that would otherwise fail deep inside the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.animation.frame_size().is_empty() {
            anyhow::bail!(
                "animation frame size must be positive, got {}",
                self.animation.frame_size()
            );
        }
        if self.animation.fps == 0 {
            anyhow::bail!("animation fps must be positive");
        }
        Ok(())
    }

    pub fn checkpoint_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.checkpoint)
    }

    pub fn model_config_path(&self, data_dir: &Path) -> PathBuf {
        resolve_relative_to(data_dir, &self.paths.model_config)
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. PUPPETEER_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Initialize the data directory on first run. Existing files are never
/// overwritten:
/// - creates data_dir if missing
/// - writes a default config.toml
/// - writes a default model config at the configured location
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    let config = AppConfig::load_from_path(&cfg_path)?;
    let model_cfg_path = config.model_config_path(data_dir);
    if !model_cfg_path.exists() {
        let model_config = ModelConfig {
            frame_size: config.animation.frame_size(),
            ..ModelConfig::default()
        };
        model_config.save_to_path(&model_cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
