//! ONNX Runtime implementation of [`SuperResModel`].

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use ndarray::{s, Array4, Ix4};
use ort::{session::Session, value::Tensor};
use tracing::{debug, info};

use super::backend::{build_session, SessionConfig};
use super::{ModelId, ModelLoader, ModelSettings, Precision, SuperResModel};

/// Spatial alignment the exported graphs expect; inputs are mirror-padded up
/// to it and the output cropped back.
const PAD_ALIGN: usize = 4;

pub struct OnnxModel {
    model: ModelId,
    session: Session,
    input_name: String,
    output_name: String,
    /// Graph takes f16 input (exported at half precision).
    fp16_input: bool,
}

impl OnnxModel {
    fn run_f32(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        let tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let output = outputs[self.output_name.as_str()].try_extract_array::<f32>()?;
        Ok(output.to_owned().into_dimensionality::<Ix4>()?)
    }

    fn run_f16(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        let shape = input.dim();
        let contiguous = input.as_standard_layout();
        let samples = contiguous
            .as_slice()
            .context("input tensor is not contiguous")?;
        let mut halves = vec![f16::ZERO; samples.len()];
        halves.convert_from_f32_slice(samples);

        let tensor = Tensor::from_array(Array4::from_shape_vec(shape, halves)?)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => &tensor])?;
        let output = outputs[self.output_name.as_str()].try_extract_array::<f16>()?;
        Ok(output.mapv(f32::from).into_dimensionality::<Ix4>()?)
    }
}

impl SuperResModel for OnnxModel {
    fn scale(&self) -> u32 {
        self.model.scale()
    }

    fn upscale(&mut self, input: Array4<f32>) -> Result<Array4<f32>> {
        let (_, channels, height, width) = input.dim();
        if channels != 3 {
            bail!("model input must have 3 channels, got {channels}");
        }

        let padded = pad_to_alignment(input);
        let output = if self.fp16_input {
            self.run_f16(padded)?
        } else {
            self.run_f32(padded)?
        };

        let (_, out_channels, out_h, out_w) = output.dim();
        if out_channels != 3 {
            bail!("model produced {out_channels} channels, expected 3");
        }

        let scale = self.scale() as usize;
        let crop_h = (height * scale).min(out_h);
        let crop_w = (width * scale).min(out_w);
        if crop_h == out_h && crop_w == out_w {
            return Ok(output);
        }
        Ok(output.slice(s![.., .., ..crop_h, ..crop_w]).to_owned())
    }
}

/// Loads exported ONNX weights from a models directory.
#[derive(Debug, Clone)]
pub struct OnnxModelLoader {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
}

impl OnnxModelLoader {
    pub fn new(models_dir: impl Into<PathBuf>, trt_cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
            trt_cache_dir: trt_cache_dir.into(),
        }
    }
}

impl ModelLoader for OnnxModelLoader {
    fn load(&self, settings: &ModelSettings) -> Result<Box<dyn SuperResModel>> {
        let weights = settings.model.resolve_weights(&self.models_dir)?;

        debug!(
            model = %settings.model,
            architecture = settings.model.architecture(),
            weights = %weights.path.display(),
            weight_set = %weights.weight_set,
            backend = %settings.backend,
            device = settings.device,
            precision = %settings.precision,
            "Loading super-resolution model"
        );

        let session = build_session(&SessionConfig {
            model_path: &weights.path,
            backend: settings.backend,
            device_id: settings.device,
            fp16_engines: settings.precision == Precision::Half,
            trt_cache_dir: &self.trt_cache_dir,
        })
        .with_context(|| format!("failed to load model {}", settings.model))?;

        let input = session
            .inputs()
            .first()
            .context("model graph has no inputs")?;
        let input_name = input.name().to_string();
        let fp16_input = match input.dtype() {
            ort::value::ValueType::Tensor { ty, .. } => {
                *ty == ort::tensor::TensorElementType::Float16
            }
            _ => false,
        };
        let output_name = session
            .outputs()
            .first()
            .context("model graph has no outputs")?
            .name()
            .to_string();

        if fp16_input && settings.precision == Precision::Full {
            info!(
                model = %settings.model,
                "Weights were exported at half precision; running in half precision"
            );
        } else if !fp16_input && settings.precision == Precision::Half {
            debug!(
                model = %settings.model,
                "Weights take f32 input; half precision applies to engine building only"
            );
        }

        info!(
            model = %settings.model,
            weight_set = %weights.weight_set,
            %input_name,
            %output_name,
            fp16_input,
            "Model ready"
        );

        Ok(Box::new(OnnxModel {
            model: settings.model,
            session,
            input_name,
            output_name,
            fp16_input,
        }))
    }
}

fn pad_amount(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

/// Mirror index past the trailing edge: `len + k` reads `len - 1 - k`.
fn mirror_index(index: usize, len: usize) -> usize {
    if index < len {
        index
    } else {
        (len - 1).saturating_sub(index - len)
    }
}

fn pad_to_alignment(input: Array4<f32>) -> Array4<f32> {
    let (batch, channels, height, width) = input.dim();
    let pad_h = pad_amount(height);
    let pad_w = pad_amount(width);
    if pad_h == 0 && pad_w == 0 {
        return input;
    }

    Array4::from_shape_fn(
        (batch, channels, height + pad_h, width + pad_w),
        |(n, c, y, x)| input[[n, c, mirror_index(y, height), mirror_index(x, width)]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_input_is_not_padded() {
        let input = Array4::<f32>::zeros((1, 3, 8, 12));
        let padded = pad_to_alignment(input);
        assert_eq!(padded.dim(), (1, 3, 8, 12));
    }

    #[test]
    fn padding_mirrors_trailing_rows_and_columns() {
        let input =
            Array4::from_shape_fn((1, 3, 3, 2), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32);
        let padded = pad_to_alignment(input.clone());

        assert_eq!(padded.dim(), (1, 3, 4, 4));
        assert_eq!(padded.slice(s![.., .., ..3, ..2]), input.view());
        // row 3 mirrors row 2, columns 2..4 mirror columns 1 and 0
        assert_eq!(padded[[0, 1, 3, 0]], input[[0, 1, 2, 0]]);
        assert_eq!(padded[[0, 2, 0, 2]], input[[0, 2, 0, 1]]);
        assert_eq!(padded[[0, 2, 0, 3]], input[[0, 2, 0, 0]]);
    }

    #[test]
    fn mirror_index_saturates_on_tiny_inputs() {
        assert_eq!(mirror_index(1, 1), 0);
        assert_eq!(mirror_index(3, 1), 0);
        assert_eq!(mirror_index(2, 2), 1);
        assert_eq!(mirror_index(3, 2), 0);
    }

    #[test]
    #[ignore = "requires GPU runtime and exported weights under ./models"]
    fn loads_and_runs_exported_weights() {
        let loader = OnnxModelLoader::new("models", "trt_cache");
        let mut model = loader
            .load(&ModelSettings {
                model: ModelId::RealEsrGeneralX4,
                precision: Precision::Half,
                backend: super::super::InferenceBackend::Cuda,
                device: 0,
            })
            .expect("load model");

        let output = model
            .upscale(Array4::from_elem((1, 3, 30, 18), 0.5))
            .expect("run model");
        assert_eq!(output.dim(), (1, 3, 120, 72));
    }
}
