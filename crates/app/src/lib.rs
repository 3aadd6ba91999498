use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;

use realscaler_core::codec::ImageExtension;
use realscaler_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, run_config_path, AppConfig,
    RunConfig, RunInputs,
};
use realscaler_core::logging::{
    self, FileSink, LoggingOptions, PanicHookStatus, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use realscaler_core::model::{InferenceBackend, ModelId, OnnxModelLoader, Precision};
use realscaler_core::orchestrator::{RunOutcome, UpscaleOrchestrator};
use realscaler_core::progress::{
    ProgressChannel, StatusCell, StatusFile, StatusKind, STATUS_LOADING,
};
use realscaler_core::runtime::{log_runtime_lib_status, setup_runtime_libs};
use realscaler_core::supervisor::{
    run_worker, ChildWorker, ProcessSupervisor, SupervisorOptions, TerminalStatus, ThreadWorker,
};
use realscaler_core::video::VideoContainer;
use realscaler_core::APP_NAME;

const STOP_FILE_NAME: &str = "stop.flag";
const STOP_FILE_POLL: Duration = Duration::from_millis(200);
const REPORT_HINT: &str = "Please report the error on Github.com or Itch.io.";

#[derive(Parser)]
#[command(name = "realscaler", about = "AI super-resolution for images and videos", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale images and videos, one after another.
    Upscale(UpscaleArgs),
    /// List the supported models and whether their weights are present.
    Models,
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct UpscaleArgs {
    #[arg(help = "Images and videos to upscale")]
    files: Vec<PathBuf>,
    #[arg(short, long, help = "RealESRGANx4 or RealESR_Gx4")]
    model: Option<ModelId>,
    #[arg(long, help = "half or full")]
    precision: Option<Precision>,
    #[arg(long, help = "cuda, tensorrt or cpu")]
    backend: Option<InferenceBackend>,
    #[arg(long, help = "GPU index")]
    device: Option<u32>,
    #[arg(long = "image-format", value_name = "EXT")]
    image_extension: Option<ImageExtension>,
    #[arg(long = "video-format", value_name = "EXT")]
    video_container: Option<VideoContainer>,
    #[arg(short, long = "resize", value_name = "PERCENT", help = "Input resize % applied before upscaling")]
    resize_percent: Option<String>,
    #[arg(long = "vram", value_name = "GB", help = "VRAM/RAM available to the model")]
    vram_gb: Option<String>,
    #[arg(long = "cpu", value_name = "N", help = "Threads used to resize video frames")]
    cpu_workers: Option<String>,
    #[arg(long, help = "Run on a thread of this process instead of a worker process")]
    in_process: bool,
}

impl UpscaleArgs {
    fn into_inputs(self) -> RunInputs {
        RunInputs {
            files: self.files,
            model: self.model,
            precision: self.precision,
            backend: self.backend,
            device: self.device,
            image_extension: self.image_extension,
            video_container: self.video_container,
            resize_percent: self.resize_percent,
            vram_gb: self.vram_gb,
            cpu_workers: self.cpu_workers,
        }
    }
}

#[derive(Args)]
struct WorkerArgs {
    #[arg(long)]
    run_config: PathBuf,
    #[arg(long)]
    status_file: PathBuf,
    #[arg(long)]
    stop_file: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = match cli.command {
        Commands::Worker(_) => RuntimeLogMode::Worker,
        _ => RuntimeLogMode::Cli,
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    let runtime_report = setup_runtime_libs();
    let _log_guard = init_logging(
        mode,
        &resolved_data_dir,
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_runtime_lib_status(&runtime_report);
    info!(
        mode = ?mode,
        pid = std::process::id(),
        data_dir = %resolved_data_dir.display(),
        config_path = %config_path(&resolved_data_dir).display(),
        "{APP_NAME} starting"
    );

    match cli.command {
        Commands::Upscale(args) => {
            let forward = LogForwarding {
                verbose: cli.verbose,
                log_filter: cli.log_filter,
            };
            upscale(args, &resolved_data_dir, forward).await
        }
        Commands::Models => list_models(&resolved_data_dir),
        Commands::Worker(args) => worker(args).await,
    }
}

fn init_logging(
    mode: RuntimeLogMode,
    data_dir: &Path,
    verbose: u8,
    cli_log_filter: Option<&str>,
) -> Option<WorkerGuard> {
    let panic_hook = logging::install_panic_hook(Some(data_dir));

    let options = LoggingOptions {
        mode,
        data_dir: Some(data_dir.to_path_buf()),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console_filter, "console"));

    let mut guard = None;
    let init_result = match logging::open_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let (writer, file_guard) = tracing_appender::non_blocking(appender);
            guard = Some(file_guard);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(parse_env_filter_with_fallback(&filters.file_filter, "file"));
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console_layer).with(file_layer),
            )
        }
        FileSink::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let result = tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(console_layer),
            );
            let attempted = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted,
                reason = %reason,
                "File logging unavailable; continuing with console-only logging"
            );
            result
        }
    };
    if let Err(error) = init_result {
        eprintln!("Failed to initialize tracing subscriber: {error}. Continuing without structured tracing.");
    }

    match panic_hook {
        PanicHookStatus::Installed(dir) | PanicHookStatus::AlreadyInstalled(dir) => {
            info!(crash_dir = %dir.display(), "Panic crash reports enabled");
        }
        PanicHookStatus::Unavailable(reason) => {
            warn!(reason = %reason, "Panic crash reports unavailable");
        }
    }

    guard
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn load_app_config(data_dir: &Path) -> AppConfig {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %format!("{e:#}"), "Failed to initialize data directory");
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %format!("{e:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

/// Logging flags the worker process inherits from its parent.
#[derive(Debug, Clone, Default)]
struct LogForwarding {
    verbose: u8,
    log_filter: Option<String>,
}

struct WorkerPaths<'a> {
    data_dir: &'a Path,
    run_config: &'a Path,
    status_file: &'a Path,
    stop_file: &'a Path,
}

fn worker_command(exe: &Path, paths: &WorkerPaths<'_>, forward: &LogForwarding) -> Command {
    let mut command = Command::new(exe);
    command.arg("--data-dir").arg(paths.data_dir);
    for _ in 0..forward.verbose {
        command.arg("-v");
    }
    if let Some(filter) = &forward.log_filter {
        command.arg("--log-filter").arg(filter);
    }
    command
        .arg("worker")
        .arg("--run-config")
        .arg(paths.run_config)
        .arg("--status-file")
        .arg(paths.status_file)
        .arg("--stop-file")
        .arg(paths.stop_file);
    command
}

async fn upscale(args: UpscaleArgs, data_dir: &Path, forward: LogForwarding) -> Result<()> {
    let app_config = load_app_config(data_dir);
    let in_process = args.in_process;
    let run_config = match RunConfig::from_inputs(args.into_inputs(), &app_config, data_dir) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid upscale settings");
            bail!("{e}");
        }
    };

    let stop = CancellationToken::new();
    let ctrl_c = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping upscale");
            ctrl_c.cancel();
        }
    });

    let options = SupervisorOptions::from(&app_config.tuning);
    let terminal = if in_process {
        supervise_thread(run_config, options, stop).await
    } else {
        supervise_process(run_config, data_dir, &forward, options, stop).await?
    };

    match terminal.kind {
        StatusKind::Error => {
            eprintln!("{REPORT_HINT}");
            bail!("{}", terminal.message);
        }
        _ => Ok(()),
    }
}

fn print_status(status: &str) {
    println!("{status}");
}

async fn supervise_process(
    run_config: RunConfig,
    data_dir: &Path,
    forward: &LogForwarding,
    options: SupervisorOptions,
    stop: CancellationToken,
) -> Result<TerminalStatus> {
    let run_path = run_config_path(data_dir);
    run_config.save_to_path(&run_path)?;

    let status = StatusFile::new(run_config.status_path());
    status.clear()?;
    status.write(STATUS_LOADING)?;
    let stop_file = data_dir.join(STOP_FILE_NAME);

    let exe = std::env::current_exe().context("failed to locate the current executable")?;
    let command = worker_command(
        &exe,
        &WorkerPaths {
            data_dir,
            run_config: &run_path,
            status_file: status.path(),
            stop_file: &stop_file,
        },
        forward,
    );
    let worker = ChildWorker::spawn(command, &stop_file)?;
    info!(pid = worker.id(), run_config = %run_path.display(), "Supervising worker process");

    let terminal = ProcessSupervisor::new(
        worker,
        Arc::new(status),
        run_config.scratch_dir(),
        options,
        stop,
    )
    .with_partials(run_config.partial_outputs())
    .run(print_status)
    .await;
    Ok(terminal)
}

async fn supervise_thread(
    run_config: RunConfig,
    options: SupervisorOptions,
    stop: CancellationToken,
) -> TerminalStatus {
    let scratch_dir = run_config.scratch_dir();
    let status = Arc::new(StatusCell::new());
    if let Err(e) = status.write(STATUS_LOADING) {
        warn!(error = %format!("{e:#}"), "Failed to write status");
    }
    let worker_status = Arc::clone(&status);
    let loader = OnnxModelLoader::new(&run_config.models_dir, &run_config.trt_cache_dir);

    let worker = ThreadWorker::spawn(CancellationToken::new(), move |cancel| {
        UpscaleOrchestrator::new(&run_config, &loader, worker_status.as_ref(), cancel).run()
    });
    ProcessSupervisor::new(worker, status, scratch_dir, options, stop)
        .run(print_status)
        .await
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let config = RunConfig::load_from_path(&args.run_config)?;
    info!(
        files = config.files.len(),
        status_file = %args.status_file.display(),
        "Worker starting"
    );

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, worker stopping");
            interrupt.cancel();
        }
    });

    let outcome = tokio::task::spawn_blocking(move || {
        let status = StatusFile::new(args.status_file);
        let loader = OnnxModelLoader::new(&config.models_dir, &config.trt_cache_dir);
        run_worker(
            &config,
            &loader,
            &status,
            args.stop_file.as_deref(),
            STOP_FILE_POLL,
            cancel,
        )
    })
    .await
    .context("worker task failed")?;

    match outcome {
        RunOutcome::Failed(detail) => bail!("{detail}"),
        RunOutcome::Completed { .. } | RunOutcome::Stopped => Ok(()),
    }
}

fn list_models(data_dir: &Path) -> Result<()> {
    let app_config = load_app_config(data_dir);
    let models_dir = resolve_relative_to(data_dir, &app_config.paths.models_dir);

    println!("Models directory: {}", models_dir.display());
    for model in ModelId::ALL {
        let weights = match model.resolve_weights(&models_dir) {
            Ok(found) => format!("{} ({})", found.path.display(), found.weight_set),
            Err(_) => "missing".to_string(),
        };
        println!(
            "{:<14} {:<8} x{}{}  weights: {weights}",
            model.name(),
            model.architecture(),
            model.scale(),
            if model.is_lightweight() { " light" } else { "" },
        );
    }
    Ok(())
}
