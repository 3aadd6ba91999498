//! Supervision of one upscale run.
//!
//! The worker (a child process or an in-process thread) writes status lines
//! into a [`ProgressChannel`]; the supervisor polls it, relays changes and
//! reacts to terminal phrases. A stop request first asks the worker to stop
//! cooperatively and kills it once `stop_timeout` has elapsed. Child workers
//! run in their own process group so a terminal Ctrl-C reaches only the
//! supervisor, which turns it into a stop request.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::discard_partial;
use crate::config::{RunConfig, TuningConfig};
use crate::model::ModelLoader;
use crate::orchestrator::{RunOutcome, UpscaleOrchestrator};
use crate::progress::{error_status, ProgressChannel, StatusKind, STATUS_STOPPED};
use crate::scratch::remove_scratch_dir;

const REAP_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// `None` when the process was terminated by a signal.
    Code(Option<i32>),
    Panicked,
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Code(Some(code)) => write!(f, "exit code {code}"),
            Self::Code(None) => write!(f, "terminated by signal"),
            Self::Panicked => write!(f, "worker thread panicked"),
        }
    }
}

pub trait Worker: Send {
    /// `Some` once the worker has finished. Never blocks.
    fn try_wait(&mut self) -> Result<Option<WorkerExit>>;
    /// Cooperative stop; the worker finishes its current unit first.
    fn request_stop(&mut self);
    /// Forced stop after `request_stop` was ignored.
    fn kill(&mut self);
}

/// Worker running in a child process. Stop requests are delivered by
/// creating `stop_file`, which the child polls.
pub struct ChildWorker {
    child: Child,
    stop_file: PathBuf,
    exited: bool,
}

impl ChildWorker {
    pub fn spawn(mut command: Command, stop_file: impl Into<PathBuf>) -> Result<Self> {
        let stop_file = stop_file.into();
        remove_stop_file(&stop_file);
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let child = command
            .spawn()
            .with_context(|| format!("failed to start worker process: {command:?}"))?;
        info!(pid = child.id(), "Started worker process");
        Ok(Self {
            child,
            stop_file,
            exited: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }
}

impl Worker for ChildWorker {
    fn try_wait(&mut self) -> Result<Option<WorkerExit>> {
        let status = self
            .child
            .try_wait()
            .context("failed to poll worker process")?;
        Ok(status.map(|status| {
            self.exited = true;
            WorkerExit::Code(status.code())
        }))
    }

    fn request_stop(&mut self) {
        if let Err(e) = fs::write(&self.stop_file, b"stop") {
            warn!(path = %self.stop_file.display(), error = %e, "Failed to write stop marker");
        }
    }

    fn kill(&mut self) {
        if self.exited {
            return;
        }
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "Worker process kill failed");
        }
        match self.child.wait() {
            Ok(status) => {
                self.exited = true;
                info!(status = %status, "Worker process terminated");
            }
            Err(e) => warn!(error = %e, "Failed to reap worker process"),
        }
    }
}

impl Drop for ChildWorker {
    fn drop(&mut self) {
        self.kill();
        remove_stop_file(&self.stop_file);
    }
}

fn remove_stop_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stop marker"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove stop marker"),
    }
}

/// Worker running on a thread of this process. A thread cannot be killed,
/// so [`Worker::kill`] only cancels and detaches it.
pub struct ThreadWorker {
    handle: Option<JoinHandle<RunOutcome>>,
    cancel: CancellationToken,
}

impl ThreadWorker {
    pub fn spawn<F>(cancel: CancellationToken, run: F) -> Self
    where
        F: FnOnce(CancellationToken) -> RunOutcome + Send + 'static,
    {
        let token = cancel.clone();
        let handle = thread::spawn(move || run(token));
        Self {
            handle: Some(handle),
            cancel,
        }
    }
}

impl Worker for ThreadWorker {
    fn try_wait(&mut self) -> Result<Option<WorkerExit>> {
        match &self.handle {
            Some(handle) if handle.is_finished() => {}
            Some(_) => return Ok(None),
            None => return Ok(Some(WorkerExit::Code(None))),
        }
        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        Ok(Some(match handle.join() {
            Ok(outcome) => {
                debug!(?outcome, "Worker thread finished");
                WorkerExit::Code(Some(0))
            }
            Err(_) => WorkerExit::Panicked,
        }))
    }

    fn request_stop(&mut self) {
        self.cancel.cancel();
    }

    fn kill(&mut self) {
        self.cancel.cancel();
        if self.handle.take().is_some() {
            warn!("Detached worker thread that did not stop in time");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorOptions {
    /// Delay before the first poll; covers model loading.
    pub grace: Duration,
    pub interval: Duration,
    pub stop_timeout: Duration,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self::from(&TuningConfig::default())
    }
}

impl From<&TuningConfig> for SupervisorOptions {
    fn from(tuning: &TuningConfig) -> Self {
        Self {
            grace: Duration::from_millis(tuning.poll_grace_ms),
            interval: Duration::from_millis(tuning.poll_interval_ms),
            stop_timeout: Duration::from_millis(tuning.stop_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalStatus {
    pub kind: StatusKind,
    pub message: String,
}

pub struct ProcessSupervisor<W: Worker> {
    worker: W,
    status: Arc<dyn ProgressChannel>,
    scratch_dir: PathBuf,
    partials: Vec<PathBuf>,
    options: SupervisorOptions,
    stop: CancellationToken,
    last_relayed: Option<String>,
}

impl<W: Worker> ProcessSupervisor<W> {
    pub fn new(
        worker: W,
        status: Arc<dyn ProgressChannel>,
        scratch_dir: impl Into<PathBuf>,
        options: SupervisorOptions,
        stop: CancellationToken,
    ) -> Self {
        Self {
            worker,
            status,
            scratch_dir: scratch_dir.into(),
            partials: Vec::new(),
            options,
            stop,
            last_relayed: None,
        }
    }

    /// Partial output files to remove once the worker is gone, for when it
    /// was killed mid-write.
    pub fn with_partials(mut self, partials: Vec<PathBuf>) -> Self {
        self.partials = partials;
        self
    }

    /// Polls until the run reaches a terminal status. `relay` receives every
    /// distinct status line, the terminal one included.
    pub async fn run(mut self, mut relay: impl FnMut(&str)) -> TerminalStatus {
        if self.wait_or_stop(self.options.grace).await {
            return self.stop_worker(&mut relay).await;
        }

        loop {
            if let Some(terminal) = self.poll_status(&mut relay) {
                self.finish();
                return terminal;
            }

            match self.worker.try_wait() {
                Ok(Some(exit)) => {
                    // The final status may land between the poll and the exit.
                    if let Some(terminal) = self.poll_status(&mut relay) {
                        self.finish();
                        return terminal;
                    }
                    return self.unexpected_exit(exit.to_string(), &mut relay);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Lost track of worker");
                    self.worker.kill();
                    return self.unexpected_exit(format!("{e:#}"), &mut relay);
                }
            }

            if self.wait_or_stop(self.options.interval).await {
                return self.stop_worker(&mut relay).await;
            }
        }
    }

    /// `true` when a stop was requested before `delay` elapsed.
    async fn wait_or_stop(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.stop.cancelled() => true,
        }
    }

    fn poll_status(&mut self, relay: &mut impl FnMut(&str)) -> Option<TerminalStatus> {
        let current = match self.status.read() {
            Ok(current) => current?,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to read worker status");
                return None;
            }
        };

        if self.last_relayed.as_deref() != Some(current.as_str()) {
            relay(&current);
            self.last_relayed = Some(current.clone());
        }

        let kind = StatusKind::classify(&current);
        kind.is_terminal().then(|| {
            info!(kind = %kind, status = %current, "Worker reached terminal status");
            TerminalStatus {
                kind,
                message: current,
            }
        })
    }

    fn unexpected_exit(&mut self, detail: String, relay: &mut impl FnMut(&str)) -> TerminalStatus {
        let message = error_status(&format!("worker exited unexpectedly ({detail})"));
        warn!(status = %message, "Worker exited without a final status");
        self.publish(&message, relay);
        self.finish();
        TerminalStatus {
            kind: StatusKind::Error,
            message,
        }
    }

    async fn stop_worker(&mut self, relay: &mut impl FnMut(&str)) -> TerminalStatus {
        info!("Stopping worker");
        self.worker.request_stop();

        let deadline = Instant::now() + self.options.stop_timeout;
        loop {
            match self.worker.try_wait() {
                Ok(Some(exit)) => {
                    info!(exit = %exit, "Worker stopped");
                    break;
                }
                Ok(None) if Instant::now() < deadline => tokio::time::sleep(REAP_POLL).await,
                Ok(None) => {
                    warn!(
                        timeout_ms = self.options.stop_timeout.as_millis() as u64,
                        "Worker ignored stop request, killing it"
                    );
                    self.worker.kill();
                    break;
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Failed to poll worker while stopping");
                    self.worker.kill();
                    break;
                }
            }
        }

        self.publish(STATUS_STOPPED, relay);
        self.finish();
        TerminalStatus {
            kind: StatusKind::Stopped,
            message: STATUS_STOPPED.to_string(),
        }
    }

    fn publish(&mut self, status: &str, relay: &mut impl FnMut(&str)) {
        if let Err(e) = self.status.write(status) {
            warn!(error = %format!("{e:#}"), "Failed to write status");
        }
        if self.last_relayed.as_deref() != Some(status) {
            relay(status);
            self.last_relayed = Some(status.to_string());
        }
    }

    /// Reaps the worker, then removes leftover partials and the scratch
    /// directory.
    fn finish(&mut self) {
        match self.worker.try_wait() {
            Ok(Some(_)) => {}
            _ => self.worker.kill(),
        }
        for partial in &self.partials {
            discard_partial(partial);
        }
        if let Err(e) = remove_scratch_dir(&self.scratch_dir) {
            warn!(error = %format!("{e:#}"), "Failed to clean up scratch directory");
        }
    }
}

/// Cancels `token` once `path` exists. Ends when `token` is cancelled.
pub fn watch_stop_file(path: PathBuf, token: CancellationToken, interval: Duration) -> JoinHandle<()> {
    thread::spawn(move || {
        while !token.is_cancelled() {
            if path.exists() {
                info!(path = %path.display(), "Stop requested");
                token.cancel();
                break;
            }
            thread::sleep(interval);
        }
    })
}

/// Worker-side entry: runs the batch until it ends or `cancel` fires.
/// `stop_file`, when given, cancels the run once it appears.
pub fn run_worker(
    config: &RunConfig,
    loader: &dyn ModelLoader,
    status: &dyn ProgressChannel,
    stop_file: Option<&Path>,
    interval: Duration,
    cancel: CancellationToken,
) -> RunOutcome {
    let run_token = cancel.child_token();
    let watcher =
        stop_file.map(|path| watch_stop_file(path.to_path_buf(), run_token.clone(), interval));

    let outcome = UpscaleOrchestrator::new(config, loader, status, run_token.clone()).run();

    run_token.cancel();
    if let Some(watcher) = watcher {
        if watcher.join().is_err() {
            warn!("Stop file watcher panicked");
        }
    }
    outcome
}
