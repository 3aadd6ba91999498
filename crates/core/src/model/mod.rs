//! Super-resolution model identifiers, weights resolution and the inference seam.
//!
//! Network internals stay behind [`SuperResModel`]: given an NCHW tile in
//! `[0, 1]` it returns the tile magnified by a fixed integer factor. Everything
//! around that call (normalization, channels, alpha) lives in [`enhance`].

pub mod backend;
pub mod enhance;
pub mod onnx;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Result};
use ndarray::Array4;
use serde::{Deserialize, Serialize};

pub use backend::InferenceBackend;
pub use enhance::enhance;
pub use onnx::{OnnxModel, OnnxModelLoader};

/// Every supported network upscales by this factor.
pub const MODEL_SCALE: u32 = 4;

const WEIGHTS_EXTENSION: &str = "onnx";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelId {
    /// RRDB network, highest quality and highest memory use.
    #[serde(rename = "RealESRGANx4")]
    RealEsrganX4,
    /// Compact VGG-style network.
    #[serde(rename = "RealESR_Gx4")]
    RealEsrGeneralX4,
}

impl ModelId {
    pub const ALL: [ModelId; 2] = [ModelId::RealEsrganX4, ModelId::RealEsrGeneralX4];

    pub fn name(self) -> &'static str {
        match self {
            Self::RealEsrganX4 => "RealESRGANx4",
            Self::RealEsrGeneralX4 => "RealESR_Gx4",
        }
    }

    pub fn architecture(self) -> &'static str {
        match self {
            Self::RealEsrganX4 => "RRDBNet",
            Self::RealEsrGeneralX4 => "SRVGGNetCompact",
        }
    }

    pub fn scale(self) -> u32 {
        MODEL_SCALE
    }

    /// Lightweight networks get twice the tile budget.
    pub fn is_lightweight(self) -> bool {
        matches!(self, Self::RealEsrGeneralX4)
    }

    /// Weights files in lookup order: the EMA parameter set first, then the
    /// plain set under its explicit and its bare name.
    pub fn weights_candidates(self, models_dir: &Path) -> Vec<(WeightSet, PathBuf)> {
        let name = self.name();
        vec![
            (
                WeightSet::Ema,
                models_dir.join(format!("{name}.params_ema.{WEIGHTS_EXTENSION}")),
            ),
            (
                WeightSet::Plain,
                models_dir.join(format!("{name}.params.{WEIGHTS_EXTENSION}")),
            ),
            (
                WeightSet::Plain,
                models_dir.join(format!("{name}.{WEIGHTS_EXTENSION}")),
            ),
        ]
    }

    pub fn resolve_weights(self, models_dir: &Path) -> Result<ResolvedWeights> {
        let candidates = self.weights_candidates(models_dir);
        if let Some((weight_set, path)) = candidates.iter().find(|(_, path)| path.is_file()) {
            return Ok(ResolvedWeights {
                path: path.clone(),
                weight_set: *weight_set,
            });
        }

        let tried = candidates
            .iter()
            .map(|(_, path)| path.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        bail!(
            "weights file for model {} not found (tried: {tried})",
            self.name()
        );
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                let known = Self::ALL.map(ModelId::name).join(", ");
                format!("unknown model '{wanted}' (expected one of: {known})")
            })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// f16 activations where the exported graph accepts them.
    #[default]
    Half,
    Full,
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Half => write!(f, "half"),
            Self::Full => write!(f, "full"),
        }
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "half" | "fp16" => Ok(Self::Half),
            "full" | "fp32" => Ok(Self::Full),
            other => Err(format!("unknown precision '{other}' (expected half or full)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightSet {
    Ema,
    Plain,
}

impl fmt::Display for WeightSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ema => write!(f, "params_ema"),
            Self::Plain => write!(f, "params"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedWeights {
    pub path: PathBuf,
    pub weight_set: WeightSet,
}

/// Everything needed to bring one model up on one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    pub model: ModelId,
    pub precision: Precision,
    pub backend: InferenceBackend,
    pub device: u32,
}

pub trait SuperResModel: Send {
    fn scale(&self) -> u32;

    /// `input` is `[1, 3, H, W]` with samples in `[0, 1]`. The result is
    /// `[1, 3, H * scale, W * scale]`; values are not clamped.
    fn upscale(&mut self, input: Array4<f32>) -> Result<Array4<f32>>;
}

pub trait ModelLoader: Send + Sync {
    /// Failures here are fatal for the whole batch.
    fn load(&self, settings: &ModelSettings) -> Result<Box<dyn SuperResModel>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn model_names_round_trip_through_from_str() {
        for id in ModelId::ALL {
            assert_eq!(id.name().parse::<ModelId>().unwrap(), id);
        }
        assert_eq!(
            "realesrganx4".parse::<ModelId>().unwrap(),
            ModelId::RealEsrganX4
        );
        assert!("RealESRGANx2".parse::<ModelId>().is_err());
    }

    #[test]
    fn only_the_compact_network_is_lightweight() {
        assert!(!ModelId::RealEsrganX4.is_lightweight());
        assert!(ModelId::RealEsrGeneralX4.is_lightweight());
        assert!(ModelId::ALL.iter().all(|id| id.scale() == 4));
    }

    #[test]
    fn resolve_weights_prefers_ema_set() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("RealESRGANx4.onnx"), b"plain").unwrap();
        std::fs::write(dir.path().join("RealESRGANx4.params_ema.onnx"), b"ema").unwrap();

        let resolved = ModelId::RealEsrganX4.resolve_weights(dir.path()).unwrap();
        assert_eq!(resolved.weight_set, WeightSet::Ema);
        assert_eq!(
            resolved.path,
            dir.path().join("RealESRGANx4.params_ema.onnx")
        );
    }

    #[test]
    fn resolve_weights_falls_back_to_plain_set() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("RealESR_Gx4.onnx"), b"plain").unwrap();

        let resolved = ModelId::RealEsrGeneralX4.resolve_weights(dir.path()).unwrap();
        assert_eq!(resolved.weight_set, WeightSet::Plain);
        assert_eq!(resolved.path, dir.path().join("RealESR_Gx4.onnx"));
    }

    #[test]
    fn resolve_weights_reports_every_candidate_when_missing() {
        let dir = tempdir().expect("tempdir");
        let error = ModelId::RealEsrganX4
            .resolve_weights(dir.path())
            .expect_err("no weights present");
        let message = error.to_string();

        assert!(message.contains("RealESRGANx4"));
        assert!(message.contains("RealESRGANx4.params_ema.onnx"));
        assert!(message.contains("RealESRGANx4.params.onnx"));
    }

    #[test]
    fn precision_parses_aliases() {
        assert_eq!("FP16".parse::<Precision>().unwrap(), Precision::Half);
        assert_eq!("full".parse::<Precision>().unwrap(), Precision::Full);
        assert!("int8".parse::<Precision>().is_err());
        assert_eq!(Precision::default(), Precision::Half);
    }
}
