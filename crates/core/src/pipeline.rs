//! Straight-line animation request: normalize the source image, decode and
//! normalize the driving video, run the model, encode the predictions.
//!
//! Everything here is blocking. The web server calls [`Animator::run`] from
//! `spawn_blocking`; the CLI calls it directly.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use serde::Serialize;
use tracing::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::config::AppConfig;
use crate::inference::{AnimationModel, ModelConfig, ModelLoader};
use crate::media::{
    has_mp4_signature, validate_extension, DrivingVideo, EncoderConfig, FrameSink, UploadKind,
    VideoEncoder,
};
use crate::normalize::{decode_image, encode_png, normalize};
use crate::types::{AnimationOptions, FrameSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Decoding,
    Animating,
    Encoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineProgress {
    pub stage: Stage,
    pub done: usize,
    pub total: Option<usize>,
}

/// Uploaded inputs for one animation request.
#[derive(Debug, Clone, Copy)]
pub struct AnimationInputs<'a> {
    pub source_name: &'a str,
    pub source_bytes: &'a [u8],
    pub driving_name: &'a str,
    pub driving_bytes: &'a [u8],
    pub options: AnimationOptions,
}

#[derive(Debug, Clone)]
pub struct AnimationOutput {
    /// Letterboxed source image, PNG encoded.
    pub source_png: Vec<u8>,
    /// `None` when no checkpoint is available yet.
    pub video_mp4: Option<Vec<u8>>,
    pub frame_count: usize,
    pub notice: Option<String>,
}

/// Validates, decodes and letterboxes an uploaded still image.
pub fn prepare_source(name: &str, bytes: &[u8], target: FrameSize) -> Result<RgbImage> {
    validate_extension(name, UploadKind::Image)?;
    let image = decode_image(bytes)?;
    debug!(
        name,
        width = image.width(),
        height = image.height(),
        "source image decoded"
    );
    normalize(&image, target)
}

/// Validates an uploaded driving video and starts decoding it.
pub fn prepare_driving(name: &str, bytes: &[u8], target: FrameSize) -> Result<DrivingVideo> {
    let extension = validate_extension(name, UploadKind::Video)?;
    DrivingVideo::from_bytes(bytes, &extension, target)
}

/// Core of a request once inputs are normalized: collect driving frames,
/// animate, and stream predictions into `sink`. Returns the frame count.
pub fn animate_frames<I>(
    source: &RgbImage,
    driving: I,
    frame_hint: Option<usize>,
    model: &mut dyn AnimationModel,
    options: AnimationOptions,
    sink: &mut dyn FrameSink,
    progress: &mut dyn FnMut(PipelineProgress),
) -> Result<usize>
where
    I: Iterator<Item = Result<RgbImage>>,
{
    let mut frames = Vec::with_capacity(frame_hint.unwrap_or(0));
    for frame in driving {
        frames.push(frame.context("failed to decode driving video")?);
        progress(PipelineProgress {
            stage: Stage::Decoding,
            done: frames.len(),
            total: frame_hint,
        });
    }
    if frames.is_empty() {
        bail!("driving video contains no frames");
    }
    debug!(frames = frames.len(), "driving video decoded");

    let total = frames.len();
    let predictions = model.animate(source, &frames, options, &mut |done, total| {
        progress(PipelineProgress {
            stage: Stage::Animating,
            done,
            total: Some(total),
        })
    })?;
    if predictions.len() != total {
        bail!(
            "model returned {} frames for {} driving frames",
            predictions.len(),
            total
        );
    }

    for (index, frame) in predictions.iter().enumerate() {
        sink.write_frame(frame)?;
        progress(PipelineProgress {
            stage: Stage::Encoding,
            done: index + 1,
            total: Some(total),
        });
    }
    sink.finish()?;

    Ok(total)
}

/// Owns the request-independent state: where the checkpoint lives, how to
/// load it, and the loaded model once it has been used.
pub struct Animator {
    loader: Arc<dyn ModelLoader>,
    checkpoint: Arc<CheckpointStore>,
    model_config_path: PathBuf,
    frame_size: FrameSize,
    fps: u32,
    model: Mutex<Option<Box<dyn AnimationModel>>>,
}

impl Animator {
    pub fn new(
        config: &AppConfig,
        data_dir: &std::path::Path,
        loader: Arc<dyn ModelLoader>,
        checkpoint: Arc<CheckpointStore>,
    ) -> Self {
        Self {
            loader,
            checkpoint,
            model_config_path: config.model_config_path(data_dir),
            frame_size: config.animation.frame_size(),
            fps: config.animation.fps,
            model: Mutex::new(None),
        }
    }

    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    pub fn checkpoint(&self) -> &CheckpointStore {
        &self.checkpoint
    }

    pub fn model_loaded(&self) -> bool {
        self.model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn run(
        &self,
        inputs: AnimationInputs<'_>,
        progress: &mut dyn FnMut(PipelineProgress),
    ) -> Result<AnimationOutput> {
        let started = Instant::now();
        let source = prepare_source(inputs.source_name, inputs.source_bytes, self.frame_size)?;
        let source_png = encode_png(&source)?;

        if !self.checkpoint.is_present() {
            info!(
                checkpoint = %self.checkpoint.path().display(),
                "checkpoint missing; returning source preview only"
            );
            return Ok(AnimationOutput {
                source_png,
                video_mp4: None,
                frame_count: 0,
                notice: Some(format!(
                    "Model checkpoint not found at {}. Download it first to animate.",
                    self.checkpoint.path().display()
                )),
            });
        }

        let driving = prepare_driving(inputs.driving_name, inputs.driving_bytes, self.frame_size)?;
        let frame_hint = driving.info().frame_count.map(|n| n as usize);

        let mut guard = self.model.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            *guard = Some(self.load_model()?);
        }
        let model = guard
            .as_mut()
            .context("animation model unavailable after load")?;

        let output = tempfile::Builder::new()
            .prefix("puppeteer-result-")
            .suffix(".mp4")
            .tempfile()
            .context("failed to create temporary output video")?;
        let mut encoder =
            VideoEncoder::new(&EncoderConfig::mp4(output.path(), self.frame_size, self.fps))?;

        let frame_count = animate_frames(
            &source,
            driving,
            frame_hint,
            &mut **model,
            inputs.options,
            &mut encoder,
            progress,
        )?;
        drop(guard);
        drop(encoder);

        let video = fs::read(output.path()).with_context(|| {
            format!("failed to read encoded video: {}", output.path().display())
        })?;
        if !has_mp4_signature(&video) {
            bail!("encoder produced a file without an MP4 header");
        }

        info!(
            frames = frame_count,
            bytes = video.len(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "animation rendered"
        );

        Ok(AnimationOutput {
            source_png,
            video_mp4: Some(video),
            frame_count,
            notice: None,
        })
    }

    fn load_model(&self) -> Result<Box<dyn AnimationModel>> {
        let model_config = ModelConfig::load_from_path(&self.model_config_path)?;
        model_config.ensure_frame_size(self.frame_size)?;
        self.loader
            .load(&model_config, self.checkpoint.path())
            .context("failed to load animation model")
    }
}
