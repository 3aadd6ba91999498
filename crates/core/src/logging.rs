//! Log filter selection, the rolling file sink and the crash-artifact panic hook.
//!
//! Subscriber assembly happens in the binary; this module only decides what
//! the filters are and where files go, so both processes (supervising CLI and
//! worker) share the same policy.

use std::{
    any::Any,
    backtrace::{Backtrace, BacktraceStatus},
    fs,
    io::Write,
    panic::{self, PanicHookInfo},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Mutex, OnceLock,
    },
    thread,
};

use tracing_appender::rolling::{RollingFileAppender, Rotation};

pub const DEFAULT_LOG_FILTER: &str = "info";
/// Prepended when the user did not pick a filter explicitly.
pub const NOISE_FILTER: &str = "ort=error,ffmpeg_stderr=error";
pub const DEFAULT_LOG_RETENTION_FILES: usize = 14;
pub const LOG_DIR_NAME: &str = "logs";
pub const CRASH_DIR_NAME: &str = "crash";
const LOG_FILE_SUFFIX: &str = "log";

/// Targets that stay at debug in the file sink even under the noise filter.
const FFMPEG_TARGETS: [&str; 1] = ["ffmpeg_stderr"];

static PANIC_HOOK_LOCK: Mutex<()> = Mutex::new(());
static PANIC_CRASH_DIR: OnceLock<PathBuf> = OnceLock::new();
static PANIC_WRITE_IN_PROGRESS: AtomicBool = AtomicBool::new(false);
static PANIC_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Which process is logging; each gets its own file prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeLogMode {
    Cli,
    Worker,
}

impl RuntimeLogMode {
    pub fn file_prefix(self) -> &'static str {
        match self {
            Self::Cli => "realscaler",
            Self::Worker => "realscaler-worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub mode: RuntimeLogMode,
    pub data_dir: Option<PathBuf>,
    pub verbose: u8,
    pub cli_log_filter: Option<String>,
    pub rust_log_env: Option<String>,
    pub retention_files: usize,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            mode: RuntimeLogMode::Cli,
            data_dir: None,
            verbose: 0,
            cli_log_filter: None,
            rust_log_env: None,
            retention_files: DEFAULT_LOG_RETENTION_FILES,
        }
    }
}

impl LoggingOptions {
    fn is_implicit(&self) -> bool {
        self.cli_log_filter.is_none() && self.verbose == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPlan {
    pub user_filter: String,
    pub console_filter: String,
    pub file_filter: String,
}

/// Precedence: `--log-filter`, then `-vv`/`-v`, then `RUST_LOG`, then `info`.
pub fn compose_filters(options: &LoggingOptions) -> FilterPlan {
    let user_filter = if let Some(filter) = options.cli_log_filter.as_deref() {
        filter.to_string()
    } else if options.verbose >= 2 {
        "trace".to_string()
    } else if options.verbose == 1 {
        "debug".to_string()
    } else if let Some(filter) = options.rust_log_env.as_deref() {
        filter.to_string()
    } else {
        DEFAULT_LOG_FILTER.to_string()
    };

    if !options.is_implicit() {
        return FilterPlan {
            console_filter: user_filter.clone(),
            file_filter: user_filter.clone(),
            user_filter,
        };
    }

    FilterPlan {
        console_filter: format!("{NOISE_FILTER},{user_filter}"),
        file_filter: format!("{},{user_filter}", file_noise_filter(NOISE_FILTER)),
        user_filter,
    }
}

/// Same directives with every ffmpeg target lifted to debug.
fn file_noise_filter(noise_filter: &str) -> String {
    let mut directives: Vec<String> = noise_filter
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .filter(|d| {
            let target = d.split_once('=').map_or(*d, |(t, _)| t.trim());
            !FFMPEG_TARGETS.contains(&target)
        })
        .map(ToString::to_string)
        .collect();
    directives.extend(FFMPEG_TARGETS.iter().map(|t| format!("{t}=debug")));
    directives.join(",")
}

#[derive(Debug)]
pub enum FileSink {
    Ready {
        log_dir: PathBuf,
        appender: RollingFileAppender,
    },
    Disabled {
        attempted_log_dir: Option<PathBuf>,
        reason: String,
    },
}

impl FileSink {
    pub fn log_dir(&self) -> Option<&Path> {
        match self {
            Self::Ready { log_dir, .. } => Some(log_dir),
            Self::Disabled {
                attempted_log_dir, ..
            } => attempted_log_dir.as_deref(),
        }
    }
}

/// Daily rolling file under `<data_dir>/logs/`. Never fails; a sink that
/// cannot be opened comes back as [`FileSink::Disabled`] with the reason.
pub fn open_file_sink(options: &LoggingOptions) -> FileSink {
    let Some(data_dir) = options.data_dir.as_deref() else {
        return FileSink::Disabled {
            attempted_log_dir: None,
            reason: "file sink disabled: data_dir is not configured".to_string(),
        };
    };

    let log_dir = data_dir.join(LOG_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&log_dir) {
        return FileSink::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to create log directory: {error}"),
        };
    }

    let retention = if options.retention_files == 0 {
        DEFAULT_LOG_RETENTION_FILES
    } else {
        options.retention_files
    };

    match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(options.mode.file_prefix())
        .filename_suffix(LOG_FILE_SUFFIX)
        .max_log_files(retention)
        .build(&log_dir)
    {
        Ok(appender) => FileSink::Ready { log_dir, appender },
        Err(error) => FileSink::Disabled {
            attempted_log_dir: Some(log_dir),
            reason: format!("failed to initialize rolling file sink: {error}"),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanicHookStatus {
    Installed(PathBuf),
    AlreadyInstalled(PathBuf),
    Unavailable(String),
}

/// Chains a hook that writes `<data_dir>/logs/crash/panic-*.log` before the
/// previous hook runs. Installing twice is a no-op.
pub fn install_panic_hook(data_dir: Option<&Path>) -> PanicHookStatus {
    if let Some(existing) = PANIC_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled(existing.clone());
    }

    let Some(data_dir) = data_dir else {
        return PanicHookStatus::Unavailable(
            "panic hook disabled: data_dir is not configured".to_string(),
        );
    };

    let crash_dir = data_dir.join(LOG_DIR_NAME).join(CRASH_DIR_NAME);
    if let Err(error) = fs::create_dir_all(&crash_dir) {
        return PanicHookStatus::Unavailable(format!(
            "failed to create crash directory {}: {error}",
            crash_dir.display()
        ));
    }

    let _guard = PANIC_HOOK_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = PANIC_CRASH_DIR.get() {
        return PanicHookStatus::AlreadyInstalled(existing.clone());
    }

    let previous = panic::take_hook();
    let hook_dir = crash_dir.clone();
    panic::set_hook(Box::new(move |info| {
        record_panic(&hook_dir, info);
        previous(info);
    }));

    let _ = PANIC_CRASH_DIR.set(crash_dir.clone());
    PanicHookStatus::Installed(crash_dir)
}

#[derive(Debug)]
struct CrashReport {
    timestamp: chrono::DateTime<chrono::Utc>,
    thread_name: String,
    location: String,
    payload: String,
    backtrace_policy: &'static str,
    backtrace: String,
}

impl CrashReport {
    fn capture(info: &PanicHookInfo<'_>) -> Self {
        let backtrace = Backtrace::capture();
        let (backtrace_policy, backtrace) = match backtrace.status() {
            BacktraceStatus::Captured => ("captured", backtrace.to_string()),
            BacktraceStatus::Disabled => (
                "disabled (set RUST_BACKTRACE=1 to enable)",
                String::from("<disabled>"),
            ),
            _ => ("unsupported", String::from("<unavailable>")),
        };

        Self {
            timestamp: chrono::Utc::now(),
            thread_name: thread::current().name().unwrap_or("<unnamed>").to_string(),
            location: info
                .location()
                .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
                .unwrap_or_else(|| "<unknown>".to_string()),
            payload: payload_text(info.payload()),
            backtrace_policy,
            backtrace,
        }
    }

    fn write_to(&self, crash_dir: &Path) -> std::io::Result<PathBuf> {
        fs::create_dir_all(crash_dir)?;

        let sequence = PANIC_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = crash_dir.join(format!(
            "panic-{}-{sequence:06}.log",
            self.timestamp.format("%Y%m%d-%H%M%S-%f")
        ));

        let mut file = fs::File::create(&path)?;
        writeln!(file, "timestamp_utc={}", self.timestamp.to_rfc3339())?;
        writeln!(file, "thread={}", self.thread_name)?;
        writeln!(file, "location={}", self.location)?;
        writeln!(file, "payload={}", self.payload)?;
        writeln!(file, "backtrace_policy={}", self.backtrace_policy)?;
        writeln!(file, "backtrace:")?;
        writeln!(file, "{}", self.backtrace)?;
        file.flush()?;

        Ok(path)
    }
}

fn record_panic(crash_dir: &Path, info: &PanicHookInfo<'_>) {
    // A panic while writing the artifact must not recurse into this hook.
    if PANIC_WRITE_IN_PROGRESS
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let outcome = panic::catch_unwind(panic::AssertUnwindSafe(|| {
        CrashReport::capture(info).write_to(crash_dir)
    }));
    match outcome {
        Ok(Ok(_)) => {}
        Ok(Err(error)) => eprintln!(
            "Warning: failed to write crash artifact under '{}': {error}",
            crash_dir.display()
        ),
        Err(_) => eprintln!(
            "Warning: panic hook failed while writing crash artifact under '{}'.",
            crash_dir.display()
        ),
    }

    PANIC_WRITE_IN_PROGRESS.store(false, Ordering::Release);
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn cli_log_filter_overrides_everything() {
        let options = LoggingOptions {
            verbose: 2,
            cli_log_filter: Some("realscaler_core=trace".to_string()),
            rust_log_env: Some("error".to_string()),
            ..Default::default()
        };

        let filters = compose_filters(&options);
        assert_eq!(filters.user_filter, "realscaler_core=trace");
        assert_eq!(filters.console_filter, "realscaler_core=trace");
        assert_eq!(filters.file_filter, "realscaler_core=trace");
    }

    #[test]
    fn verbosity_maps_to_debug_and_trace() {
        let one = LoggingOptions {
            verbose: 1,
            rust_log_env: Some("warn".to_string()),
            ..Default::default()
        };
        let two = LoggingOptions {
            verbose: 2,
            ..Default::default()
        };

        assert_eq!(compose_filters(&one).console_filter, "debug");
        assert_eq!(compose_filters(&two).file_filter, "trace");
    }

    #[test]
    fn implicit_selection_adds_noise_filter_and_keeps_ffmpeg_in_file() {
        let options = LoggingOptions {
            rust_log_env: Some("warn,realscaler_core=debug".to_string()),
            ..Default::default()
        };

        let filters = compose_filters(&options);
        assert_eq!(filters.user_filter, "warn,realscaler_core=debug");
        assert_eq!(
            filters.console_filter,
            "ort=error,ffmpeg_stderr=error,warn,realscaler_core=debug"
        );
        assert_eq!(
            filters.file_filter,
            "ort=error,ffmpeg_stderr=debug,warn,realscaler_core=debug"
        );
    }

    #[test]
    fn file_noise_filter_appends_missing_ffmpeg_targets() {
        assert_eq!(file_noise_filter("ort=error"), "ort=error,ffmpeg_stderr=debug");
        assert_eq!(
            file_noise_filter(" ffmpeg_stderr=warn , ort=error "),
            "ort=error,ffmpeg_stderr=debug"
        );
    }

    #[test]
    fn modes_use_distinct_file_prefixes() {
        assert_ne!(
            RuntimeLogMode::Cli.file_prefix(),
            RuntimeLogMode::Worker.file_prefix()
        );
    }

    #[test]
    fn file_sink_lives_under_data_dir_logs() {
        let data_dir = tempdir().expect("tempdir");
        let options = LoggingOptions {
            mode: RuntimeLogMode::Worker,
            data_dir: Some(data_dir.path().to_path_buf()),
            ..Default::default()
        };

        match open_file_sink(&options) {
            FileSink::Ready { log_dir, .. } => {
                assert_eq!(log_dir, data_dir.path().join(LOG_DIR_NAME));
                assert!(log_dir.is_dir());
            }
            FileSink::Disabled { reason, .. } => panic!("expected ready sink, got: {reason}"),
        }
    }

    #[test]
    fn file_sink_is_disabled_without_data_dir_or_when_dir_fails() {
        assert!(matches!(
            open_file_sink(&LoggingOptions::default()),
            FileSink::Disabled {
                attempted_log_dir: None,
                ..
            }
        ));

        let not_a_dir = NamedTempFile::new().expect("named temp file");
        let options = LoggingOptions {
            data_dir: Some(not_a_dir.path().to_path_buf()),
            ..Default::default()
        };
        let sink = open_file_sink(&options);
        assert_eq!(sink.log_dir(), Some(not_a_dir.path().join(LOG_DIR_NAME).as_path()));
        match sink {
            FileSink::Disabled { reason, .. } => {
                assert!(reason.contains("failed to create log directory"), "{reason}");
            }
            FileSink::Ready { .. } => panic!("expected disabled sink"),
        }
    }

    #[test]
    fn crash_report_file_has_every_section() {
        let crash_dir = tempdir().expect("tempdir");
        let report = CrashReport {
            timestamp: chrono::Utc::now(),
            thread_name: "worker".to_string(),
            location: "src/tiler.rs:12:7".to_string(),
            payload: "boom".to_string(),
            backtrace_policy: "captured",
            backtrace: "fake backtrace".to_string(),
        };

        let path = report.write_to(crash_dir.path()).expect("write crash report");
        let contents = fs::read_to_string(&path).expect("read crash report");

        assert!(path.starts_with(crash_dir.path()));
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("log"));
        for needle in [
            "timestamp_utc=",
            "thread=worker",
            "location=src/tiler.rs:12:7",
            "payload=boom",
            "backtrace_policy=captured",
            "fake backtrace",
        ] {
            assert!(contents.contains(needle), "missing {needle}");
        }
    }

    #[test]
    fn payload_text_handles_common_payload_types() {
        let str_payload: &(dyn Any + Send) = &"boom";
        let string_payload: &(dyn Any + Send) = &"kaboom".to_string();
        let int_payload: &(dyn Any + Send) = &123_u32;

        assert_eq!(payload_text(str_payload), "boom");
        assert_eq!(payload_text(string_payload), "kaboom");
        assert_eq!(payload_text(int_payload), "<non-string panic payload>");
    }
}
