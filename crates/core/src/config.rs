//! Application config (`config.toml` in the data directory) and the
//! validated per-batch [`RunConfig`] handed to the worker.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::codec::{media_kind, ImageExtension, MediaKind};
use crate::geometry;
use crate::model::{InferenceBackend, ModelId, ModelSettings, Precision};
use crate::naming::{partial_path, prepare_output_filename};
use crate::video::VideoContainer;
use crate::{SCRATCH_DIR_NAME, STATUS_FILE_NAME};

const CONFIG_FILE_NAME: &str = "config.toml";
const RUN_CONFIG_FILE_NAME: &str = "run.toml";
const ENV_DATA_DIR: &str = "REALSCALER_DATA_DIR";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub paths: PathsConfig,
    pub defaults: DefaultsConfig,
    pub tuning: TuningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    /// Parent of the scratch directory and the status file.
    pub work_dir: PathBuf,
}

/// Values used when the caller leaves an input unset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DefaultsConfig {
    pub model: ModelId,
    pub precision: Precision,
    pub backend: InferenceBackend,
    pub device: u32,
    pub image_extension: ImageExtension,
    pub video_container: VideoContainer,
    pub resize_percent: u32,
    pub vram_gb: u32,
    pub cpu_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    /// Scales the VRAM-derived tile edge.
    pub vram_multiplier: f64,
    pub progress_every_frames: usize,
    pub poll_grace_ms: u64,
    pub poll_interval_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            trt_cache_dir: PathBuf::from("trt_cache"),
            work_dir: PathBuf::from("."),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: ModelId::RealEsrganX4,
            precision: Precision::Half,
            backend: InferenceBackend::Cuda,
            device: 0,
            image_extension: ImageExtension::Png,
            video_container: VideoContainer::Mp4,
            resize_percent: 100,
            vram_gb: 8,
            cpu_workers: 4,
        }
    }
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            vram_multiplier: 1.0,
            progress_every_frames: 8,
            poll_grace_ms: 3000,
            poll_interval_ms: 2000,
            stop_timeout_ms: 5000,
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
        write_toml(self, path, "config")
    }
}

fn write_toml<T: Serialize>(value: &T, path: &Path, what: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("{what} path does not have a parent directory"))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {what} directory: {}", parent.display()))?;

    let encoded =
        toml::to_string_pretty(value).with_context(|| format!("failed to serialize {what} TOML"))?;
    fs::write(path, encoded)
        .with_context(|| format!("failed to write {what} file: {}", path.display()))?;

    Ok(())
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. REALSCALER_DATA_DIR environment variable
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

pub fn run_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(RUN_CONFIG_FILE_NAME)
}

/// Creates the data directory and a default config.toml on first run.
/// An existing config file is left untouched.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns `path` unchanged when absolute, otherwise joined onto `base`.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Input problems detected before a run is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    ResizeNotNumeric,
    ResizeNotPositive,
    VramNotNumeric,
    VramNotPositive,
    CpuNotNumeric,
    CpuNotPositive,
    NoFileSelected,
    UnsupportedFile(PathBuf),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResizeNotNumeric => write!(f, "Resize % must be a numeric value"),
            Self::ResizeNotPositive => write!(f, "Resize % must be a value > 0"),
            Self::VramNotNumeric => write!(f, "VRAM/RAM value must be a numeric value"),
            Self::VramNotPositive => write!(f, "VRAM/RAM value must be > 0"),
            Self::CpuNotNumeric => write!(f, "Cpu number must be a numeric value"),
            Self::CpuNotPositive => write!(f, "Cpu number value must be > 0"),
            Self::NoFileSelected => write!(f, "No file selected"),
            Self::UnsupportedFile(path) => write!(f, "Unsupported file: {}", path.display()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Raw user selections. Numeric fields stay textual until validated.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub files: Vec<PathBuf>,
    pub model: Option<ModelId>,
    pub precision: Option<Precision>,
    pub backend: Option<InferenceBackend>,
    pub device: Option<u32>,
    pub image_extension: Option<ImageExtension>,
    pub video_container: Option<VideoContainer>,
    pub resize_percent: Option<String>,
    pub vram_gb: Option<String>,
    pub cpu_workers: Option<String>,
}

/// Everything one batch needs, fixed before the batch starts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    pub files: Vec<PathBuf>,
    pub model: ModelId,
    pub precision: Precision,
    pub backend: InferenceBackend,
    pub device: u32,
    pub image_extension: ImageExtension,
    pub video_container: VideoContainer,
    pub resize_percent: u32,
    pub vram_gb: u32,
    pub vram_multiplier: f64,
    pub cpu_workers: usize,
    pub progress_every_frames: usize,
    pub models_dir: PathBuf,
    pub trt_cache_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl RunConfig {
    pub fn from_inputs(
        inputs: RunInputs,
        app: &AppConfig,
        data_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let defaults = &app.defaults;

        let resize_percent = parse_positive(
            inputs.resize_percent.as_deref(),
            u64::from(defaults.resize_percent),
            ConfigError::ResizeNotNumeric,
            ConfigError::ResizeNotPositive,
        )?;
        let vram_gb = parse_positive(
            inputs.vram_gb.as_deref(),
            u64::from(defaults.vram_gb),
            ConfigError::VramNotNumeric,
            ConfigError::VramNotPositive,
        )?;
        let cpu_workers = parse_positive(
            inputs.cpu_workers.as_deref(),
            defaults.cpu_workers as u64,
            ConfigError::CpuNotNumeric,
            ConfigError::CpuNotPositive,
        )?;

        if inputs.files.is_empty() {
            return Err(ConfigError::NoFileSelected);
        }
        if let Some(unsupported) = inputs.files.iter().find(|f| media_kind(f).is_none()) {
            return Err(ConfigError::UnsupportedFile(unsupported.clone()));
        }

        Ok(Self {
            files: inputs.files,
            model: inputs.model.unwrap_or(defaults.model),
            precision: inputs.precision.unwrap_or(defaults.precision),
            backend: inputs.backend.unwrap_or(defaults.backend),
            device: inputs.device.unwrap_or(defaults.device),
            image_extension: inputs.image_extension.unwrap_or(defaults.image_extension),
            video_container: inputs.video_container.unwrap_or(defaults.video_container),
            resize_percent: saturate_u32(resize_percent),
            vram_gb: saturate_u32(vram_gb),
            vram_multiplier: app.tuning.vram_multiplier,
            cpu_workers: usize::try_from(cpu_workers).unwrap_or(usize::MAX),
            progress_every_frames: app.tuning.progress_every_frames.max(1),
            models_dir: resolve_relative_to(data_dir, &app.paths.models_dir),
            trt_cache_dir: resolve_relative_to(data_dir, &app.paths.trt_cache_dir),
            work_dir: resolve_relative_to(data_dir, &app.paths.work_dir),
        })
    }

    pub fn resize_factor(&self) -> f64 {
        f64::from(self.resize_percent) / 100.0
    }

    pub fn tile_budget(&self) -> u32 {
        geometry::tile_budget(
            f64::from(self.vram_gb),
            self.vram_multiplier,
            self.model,
            self.precision,
        )
    }

    pub fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            model: self.model,
            precision: self.precision,
            backend: self.backend,
            device: self.device,
        }
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join(SCRATCH_DIR_NAME)
    }

    pub fn status_path(&self) -> PathBuf {
        self.work_dir.join(STATUS_FILE_NAME)
    }

    /// Where the output of `file` lands. `None` for unsupported files.
    pub fn output_path(&self, file: &Path) -> Option<PathBuf> {
        let extension = match media_kind(file)? {
            MediaKind::Image => self.image_extension.as_str(),
            MediaKind::Video => self.video_container.extension(),
        };
        Some(prepare_output_filename(
            file,
            self.model,
            self.resize_percent,
            extension,
        ))
    }

    /// Partial files a killed worker may leave next to its outputs.
    pub fn partial_outputs(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|file| self.output_path(file))
            .map(|output| partial_path(&output))
            .collect()
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read run config: {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse run config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        write_toml(self, path, "run config")
    }
}

/// Parses a float, truncates toward zero and requires the result to be > 0.
fn parse_positive(
    raw: Option<&str>,
    default: u64,
    not_numeric: ConfigError,
    not_positive: ConfigError,
) -> Result<u64, ConfigError> {
    let Some(raw) = raw else {
        return if default > 0 {
            Ok(default)
        } else {
            Err(not_positive)
        };
    };

    let value: f64 = raw.trim().parse().map_err(|_| not_numeric.clone())?;
    if !value.is_finite() {
        return Err(not_numeric);
    }
    let truncated = value.trunc();
    if truncated <= 0.0 {
        return Err(not_positive);
    }
    Ok(truncated as u64)
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn inputs_for(files: &[&str]) -> RunInputs {
        RunInputs {
            files: files.iter().map(PathBuf::from).collect(),
            ..RunInputs::default()
        }
    }

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.paths.models_dir, PathBuf::from("models"));
        assert_eq!(cfg.paths.trt_cache_dir, PathBuf::from("trt_cache"));
        assert_eq!(cfg.paths.work_dir, PathBuf::from("."));
        assert_eq!(cfg.defaults.model, ModelId::RealEsrganX4);
        assert_eq!(cfg.defaults.resize_percent, 100);
        assert_eq!(cfg.defaults.vram_gb, 8);
        assert_eq!(cfg.tuning.progress_every_frames, 8);
        assert_eq!(cfg.tuning.poll_grace_ms, 3000);
        assert_eq!(cfg.tuning.poll_interval_ms, 2000);
    }

    #[test]
    fn toml_roundtrip_preserves_values() {
        let original = AppConfig::default();
        let encoded = toml::to_string_pretty(&original).expect("serialize config");
        let decoded: AppConfig = toml::from_str(&encoded).expect("deserialize config");
        assert_eq!(decoded, original);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let decoded: AppConfig =
            toml::from_str("[defaults]\nmodel = \"RealESR_Gx4\"\n").expect("deserialize config");
        assert_eq!(decoded.defaults.model, ModelId::RealEsrGeneralX4);
        assert_eq!(decoded.defaults.vram_gb, 8);
        assert_eq!(decoded.tuning, TuningConfig::default());
    }

    #[test]
    fn load_from_nonexistent_file_returns_defaults() {
        let dir = tempdir().expect("tempdir");
        let loaded =
            AppConfig::load_from_path(&dir.path().join("missing.toml")).expect("load config");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn data_dir_uses_cli_override() {
        let result = data_dir(Some(Path::new("/custom")));
        assert_eq!(result, PathBuf::from("/custom"));
    }

    #[test]
    fn config_path_is_data_dir_join_config_toml() {
        assert_eq!(
            config_path(Path::new("/data")),
            PathBuf::from("/data/config.toml")
        );
        assert_eq!(
            run_config_path(Path::new("/data")),
            PathBuf::from("/data/run.toml")
        );
    }

    #[test]
    fn initialize_preserves_existing_config() {
        let dir = tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        let custom_content = "[defaults]\nvram_gb = 12\n";
        fs::write(&cfg_path, custom_content).expect("write custom config");

        initialize_data_dir(dir.path()).expect("initialize data dir");

        assert_eq!(fs::read_to_string(&cfg_path).unwrap(), custom_content);
    }

    #[test]
    fn initialize_creates_data_dir_and_config() {
        let dir = tempdir().expect("tempdir");
        let data = dir.path().join("nested/data");

        initialize_data_dir(&data).expect("initialize data dir");

        assert!(data.join("config.toml").exists());
    }

    #[test]
    fn resolve_relative_to_keeps_absolute_paths() {
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("/abs/path")),
            PathBuf::from("/abs/path")
        );
        assert_eq!(
            resolve_relative_to(Path::new("/base"), Path::new("sub")),
            PathBuf::from("/base/sub")
        );
    }

    #[test]
    fn from_inputs_applies_defaults_and_resolves_paths() {
        let app = AppConfig::default();
        let config =
            RunConfig::from_inputs(inputs_for(&["a.png", "clip.MP4"]), &app, Path::new("/d"))
                .expect("valid inputs");

        assert_eq!(config.model, ModelId::RealEsrganX4);
        assert_eq!(config.resize_percent, 100);
        assert_eq!(config.cpu_workers, 4);
        assert_eq!(config.models_dir, PathBuf::from("/d/models"));
        assert_eq!(config.scratch_dir(), PathBuf::from("/d/./RealScaler_temp"));
        assert_eq!(config.status_path(), PathBuf::from("/d/./RealScaler.log"));
        assert_eq!(config.tile_budget(), 800);
    }

    #[test]
    fn from_inputs_truncates_fractional_numbers() {
        let mut inputs = inputs_for(&["a.png"]);
        inputs.resize_percent = Some("70.9".to_string());
        inputs.vram_gb = Some(" 6 ".to_string());

        let config = RunConfig::from_inputs(inputs, &AppConfig::default(), Path::new("."))
            .expect("valid inputs");

        assert_eq!(config.resize_percent, 70);
        assert!((config.resize_factor() - 0.7).abs() < 1e-9);
        assert_eq!(config.vram_gb, 6);
    }

    #[test]
    fn from_inputs_rejects_non_numeric_resize() {
        let mut inputs = inputs_for(&["a.png"]);
        inputs.resize_percent = Some("abc".to_string());

        let error = RunConfig::from_inputs(inputs, &AppConfig::default(), Path::new("."))
            .expect_err("non numeric resize");
        assert_eq!(error, ConfigError::ResizeNotNumeric);
        assert_eq!(error.to_string(), "Resize % must be a numeric value");
    }

    #[test]
    fn from_inputs_rejects_values_that_truncate_to_zero() {
        let mut inputs = inputs_for(&["a.png"]);
        inputs.vram_gb = Some("0.5".to_string());
        assert_eq!(
            RunConfig::from_inputs(inputs, &AppConfig::default(), Path::new(".")),
            Err(ConfigError::VramNotPositive)
        );

        let mut inputs = inputs_for(&["a.png"]);
        inputs.cpu_workers = Some("-2".to_string());
        assert_eq!(
            RunConfig::from_inputs(inputs, &AppConfig::default(), Path::new(".")),
            Err(ConfigError::CpuNotPositive)
        );

        let mut inputs = inputs_for(&["a.png"]);
        inputs.cpu_workers = Some("NaN".to_string());
        assert_eq!(
            RunConfig::from_inputs(inputs, &AppConfig::default(), Path::new(".")),
            Err(ConfigError::CpuNotNumeric)
        );
    }

    #[test]
    fn from_inputs_requires_supported_files() {
        let app = AppConfig::default();
        assert_eq!(
            RunConfig::from_inputs(inputs_for(&[]), &app, Path::new(".")),
            Err(ConfigError::NoFileSelected)
        );

        let error = RunConfig::from_inputs(inputs_for(&["a.png", "notes.txt"]), &app, Path::new("."))
            .expect_err("unsupported file");
        assert_eq!(error.to_string(), "Unsupported file: notes.txt");
    }

    #[test]
    fn partial_outputs_follow_each_file_kind() {
        let mut inputs = inputs_for(&["in/a.png", "in/clip.mov"]);
        inputs.video_container = Some(VideoContainer::Mkv);
        let config = RunConfig::from_inputs(inputs, &AppConfig::default(), Path::new("."))
            .expect("valid inputs");

        assert_eq!(
            config.output_path(Path::new("in/clip.mov")),
            Some(PathBuf::from("in/clip_RealESRGANx4_100%.mkv"))
        );
        assert_eq!(config.output_path(Path::new("notes.txt")), None);
        assert_eq!(
            config.partial_outputs(),
            vec![
                PathBuf::from("in/.a_RealESRGANx4_100%.partial.png"),
                PathBuf::from("in/.clip_RealESRGANx4_100%.partial.mkv"),
            ]
        );
    }

    #[test]
    fn run_config_round_trips_through_toml_file() {
        let dir = tempdir().expect("tempdir");
        let mut inputs = inputs_for(&["in/a.png"]);
        inputs.model = Some(ModelId::RealEsrGeneralX4);
        inputs.video_container = Some(VideoContainer::Mkv);
        let config = RunConfig::from_inputs(inputs, &AppConfig::default(), dir.path())
            .expect("valid inputs");

        let path = run_config_path(dir.path());
        config.save_to_path(&path).expect("save run config");
        let loaded = RunConfig::load_from_path(&path).expect("load run config");

        assert_eq!(loaded, config);
    }
}
