//! ONNX Runtime implementation of the animation boundary.
//!
//! Expects a single fused graph (keypoint detector + dense motion + generator)
//! that maps `(source, driving, driving_initial[, flags])` to one predicted
//! frame. The graph runs once per driving frame.

use std::borrow::Cow;
use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use image::RgbImage;
use ndarray::Array1;
use ort::session::{Session, SessionInputValue};
use ort::value::Tensor;
use tracing::{debug, info, warn};

use super::{AnimationModel, FrameProgress, InferenceBackend, ModelConfig, ModelLoader};
use crate::normalize::{from_nchw_tensor, to_nchw_tensor};
use crate::types::{AnimationOptions, FrameSize};

#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    backend: InferenceBackend,
}

impl OnnxModelLoader {
    pub fn new(backend: InferenceBackend) -> Self {
        Self { backend }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, config: &ModelConfig, checkpoint: &Path) -> Result<Box<dyn AnimationModel>> {
        if !checkpoint.is_file() {
            bail!("checkpoint not found: {}", checkpoint.display());
        }

        let started = Instant::now();
        let session = super::build_session(checkpoint, self.backend)?;

        let inputs: Vec<String> = session
            .inputs()
            .iter()
            .map(|input| input.name().to_string())
            .collect();
        let outputs: Vec<String> = session
            .outputs()
            .iter()
            .map(|output| output.name().to_string())
            .collect();
        let bindings = TensorBindings::resolve(config, &inputs, &outputs)
            .with_context(|| format!("incompatible model graph: {}", checkpoint.display()))?;

        info!(
            checkpoint = %checkpoint.display(),
            backend = %self.backend,
            frame_size = %config.frame_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Animation model loaded"
        );

        Ok(Box::new(OnnxAnimationModel {
            session,
            bindings,
            frame_size: config.frame_size,
        }))
    }
}

/// Graph tensor names after checking them against what the graph declares.
#[derive(Debug, Clone, PartialEq, Eq)]
struct TensorBindings {
    source: String,
    driving: String,
    driving_initial: String,
    prediction: String,
    relative: Option<String>,
    adapt_scale: Option<String>,
}

impl TensorBindings {
    fn resolve(config: &ModelConfig, inputs: &[String], outputs: &[String]) -> Result<Self> {
        let require = |name: &str, available: &[String], kind: &str| -> Result<String> {
            if available.iter().any(|candidate| candidate == name) {
                Ok(name.to_string())
            } else {
                bail!(
                    "graph has no {kind} named '{name}' (available: {})",
                    available.join(", ")
                )
            }
        };
        let optional = |name: &Option<String>| -> Option<String> {
            let name = name.as_ref()?;
            if inputs.iter().any(|candidate| candidate == name) {
                Some(name.clone())
            } else {
                warn!(input = %name, "Model config names a flag input the graph does not declare; ignoring");
                None
            }
        };

        Ok(Self {
            source: require(&config.source_input, inputs, "input")?,
            driving: require(&config.driving_input, inputs, "input")?,
            driving_initial: require(&config.driving_initial_input, inputs, "input")?,
            prediction: require(&config.prediction_output, outputs, "output")?,
            relative: optional(&config.relative_input),
            adapt_scale: optional(&config.adapt_scale_input),
        })
    }
}

struct OnnxAnimationModel {
    session: Session,
    bindings: TensorBindings,
    frame_size: FrameSize,
}

impl OnnxAnimationModel {
    fn check_frame(&self, frame: &RgbImage, what: &str) -> Result<()> {
        let actual = FrameSize::new(frame.width(), frame.height());
        if actual != self.frame_size {
            bail!(
                "{what} is {actual}, model expects {}",
                self.frame_size
            );
        }
        Ok(())
    }
}

fn flag_tensor(enabled: bool) -> Result<Tensor<f32>> {
    let value = if enabled { 1.0 } else { 0.0 };
    Ok(Tensor::from_array(Array1::from_elem(1, value))?)
}

impl AnimationModel for OnnxAnimationModel {
    fn animate(
        &mut self,
        source: &RgbImage,
        driving: &[RgbImage],
        options: AnimationOptions,
        progress: FrameProgress<'_>,
    ) -> Result<Vec<RgbImage>> {
        let Some(initial) = driving.first() else {
            bail!("driving video contains no frames");
        };
        self.check_frame(source, "source image")?;
        self.check_frame(initial, "driving frame")?;

        let source_tensor = Tensor::from_array(to_nchw_tensor(source))?;
        let initial_tensor = Tensor::from_array(to_nchw_tensor(initial))?;
        let relative_tensor = flag_tensor(options.relative)?;
        let adapt_scale_tensor = flag_tensor(options.adapt_scale)?;

        if self.bindings.relative.is_none() && !options.relative {
            debug!("Graph has no relative flag input; absolute motion request ignored");
        }

        let total = driving.len();
        let mut predictions = Vec::with_capacity(total);
        let started = Instant::now();

        for (index, frame) in driving.iter().enumerate() {
            self.check_frame(frame, "driving frame")?;
            let driving_tensor = Tensor::from_array(to_nchw_tensor(frame))?;

            let mut inputs = ort::inputs![
                self.bindings.source.as_str() => &source_tensor,
                self.bindings.driving.as_str() => &driving_tensor,
                self.bindings.driving_initial.as_str() => &initial_tensor
            ];
            if let Some(name) = &self.bindings.relative {
                inputs.push((
                    Cow::Borrowed(name.as_str()),
                    SessionInputValue::from(&relative_tensor),
                ));
            }
            if let Some(name) = &self.bindings.adapt_scale {
                inputs.push((
                    Cow::Borrowed(name.as_str()),
                    SessionInputValue::from(&adapt_scale_tensor),
                ));
            }

            let outputs = self
                .session
                .run(inputs)
                .with_context(|| format!("inference failed on driving frame {index}"))?;
            let output_view = outputs[self.bindings.prediction.as_str()]
                .try_extract_array::<f32>()
                .context("prediction output is not an f32 tensor")?;
            predictions.push(from_nchw_tensor(output_view)?);

            progress(index + 1, total);
        }

        info!(
            frames = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Animation inference complete"
        );

        Ok(predictions)
    }
}
