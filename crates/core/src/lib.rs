//! Core crate for the realscaler upscaler: tiling, inference adaptation,
//! batch orchestration and the supervised worker protocol.

pub mod codec;
pub mod config;
pub mod geometry;
pub mod logging;
pub mod model;
pub mod naming;
pub mod orchestrator;
pub mod progress;
pub mod runtime;
pub mod scratch;
pub mod supervisor;
pub mod tiler;
pub mod video;

pub const APP_NAME: &str = "RealScaler";
/// Status record polled by the supervisor, `<app_name>.log`.
pub const STATUS_FILE_NAME: &str = "RealScaler.log";
/// Per-run scratch directory for video intermediates, `<app_name>_temp`.
pub const SCRATCH_DIR_NAME: &str = "RealScaler_temp";
