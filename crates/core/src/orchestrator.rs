//! Batch driver: per-file dispatch, tiling, progress and terminal status.
//!
//! Files are processed strictly in order, one tile and one frame at a time.
//! Any error aborts the whole batch. A [`CancellationToken`] is checked at
//! every file, tile and frame boundary and before each output is committed.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, GenericImageView};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{discard_partial, media_kind, read_image, write_image, write_image_atomic, MediaKind};
use crate::config::RunConfig;
use crate::geometry::{need_tiling, TilingDecision};
use crate::model::{enhance, ModelLoader, SuperResModel};
use crate::naming::{
    partial_path, resized_frame_path, upscaled_frame_path, upscaled_frame_pattern,
};
use crate::progress::{completed_status, error_status, single_line, ProgressChannel, STATUS_STOPPED};
use crate::scratch::{remove_scratch_dir, ScratchDir};
use crate::tiler::{reconstruct, resize_by_factor, split};
use crate::video::{self, EncodeJob};

/// Error marker for a cooperative stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("upscaling was stopped")
    }
}

impl std::error::Error for Cancelled {}

fn is_cancelled(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| cause.is::<Cancelled>())
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        elapsed_secs: u64,
        outputs: Vec<PathBuf>,
    },
    /// One-line error detail.
    Failed(String),
    Stopped,
}

impl RunOutcome {
    /// Terminal status line for this outcome.
    pub fn status(&self) -> String {
        match self {
            Self::Completed { elapsed_secs, .. } => completed_status(*elapsed_secs),
            Self::Failed(detail) => error_status(detail),
            Self::Stopped => STATUS_STOPPED.to_string(),
        }
    }
}

/// Progress labels for an image unit; frames report per frame instead.
#[derive(Debug, Clone, Copy)]
struct ImagePosition {
    index: usize,
    total: usize,
}

pub struct UpscaleOrchestrator<'a> {
    config: &'a RunConfig,
    loader: &'a dyn ModelLoader,
    status: &'a dyn ProgressChannel,
    cancel: CancellationToken,
}

impl<'a> UpscaleOrchestrator<'a> {
    pub fn new(
        config: &'a RunConfig,
        loader: &'a dyn ModelLoader,
        status: &'a dyn ProgressChannel,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            loader,
            status,
            cancel,
        }
    }

    /// Runs the whole batch and writes exactly one terminal status.
    pub fn run(&self) -> RunOutcome {
        let started = Instant::now();
        info!(
            files = self.config.files.len(),
            model = %self.config.model,
            precision = %self.config.precision,
            backend = %self.config.backend,
            device = self.config.device,
            resize_percent = self.config.resize_percent,
            tile_budget = self.config.tile_budget(),
            "Starting upscale batch"
        );

        let outcome = match self.run_batch() {
            Ok(outputs) => RunOutcome::Completed {
                elapsed_secs: started.elapsed().as_secs(),
                outputs,
            },
            Err(e) if self.cancel.is_cancelled() || is_cancelled(&e) => RunOutcome::Stopped,
            Err(e) => RunOutcome::Failed(single_line(&format!("{e:#}"))),
        };

        if let Err(e) = remove_scratch_dir(&self.config.scratch_dir()) {
            warn!(error = %format!("{e:#}"), "Failed to clean up scratch directory");
        }

        match &outcome {
            RunOutcome::Completed {
                elapsed_secs,
                outputs,
            } => info!(elapsed_secs, outputs = outputs.len(), "Upscale batch completed"),
            RunOutcome::Failed(detail) => error!(detail = %detail, "Upscale batch failed"),
            RunOutcome::Stopped => info!("Upscale batch stopped"),
        }
        self.report(&outcome.status());
        outcome
    }

    fn checkpoint(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        Ok(())
    }

    fn report(&self, status: &str) {
        info!(status, "Status");
        if let Err(e) = self.status.write(status) {
            warn!(status, error = %format!("{e:#}"), "Failed to write status");
        }
    }

    fn run_batch(&self) -> Result<Vec<PathBuf>> {
        self.checkpoint()?;
        self.report("Preparing model");
        let mut model = self.loader.load(&self.config.model_settings())?;

        let total = self.config.files.len();
        let mut outputs = Vec::with_capacity(total);
        for (i, file) in self.config.files.iter().enumerate() {
            self.checkpoint()?;
            let index = i + 1;
            self.report(&format!("Preparing {} ({index}/{total})", display_name(file)));

            let output = match media_kind(file) {
                Some(MediaKind::Image) => {
                    self.process_image(model.as_mut(), file, ImagePosition { index, total })
                }
                Some(MediaKind::Video) => self.process_video(model.as_mut(), file),
                None => bail!("Unsupported file: {}", file.display()),
            }
            .with_context(|| format!("failed to upscale {}", file.display()))?;

            info!(input = %file.display(), output = %output.display(), "File upscaled");
            outputs.push(output);
        }
        Ok(outputs)
    }

    fn process_image(
        &self,
        model: &mut dyn SuperResModel,
        file: &Path,
        position: ImagePosition,
    ) -> Result<PathBuf> {
        let ImagePosition { index, total } = position;
        let original = read_image(file)?;

        let resized;
        let working = if self.config.resize_percent != 100 {
            self.report(&format!("Resizing image {index}/{total}"));
            resized = resize_by_factor(&original, self.config.resize_factor());
            &resized
        } else {
            &original
        };

        let decision = need_tiling(working.width(), working.height(), self.config.tile_budget());
        let upscaled = self.upscale_unit(model, &original, working, decision, Some(position))?;

        let extension = self.config.image_extension;
        let output = self
            .config
            .output_path(file)
            .with_context(|| format!("Unsupported file: {}", file.display()))?;
        self.checkpoint()?;
        write_image_atomic(&upscaled, &output, extension)?;
        Ok(output)
    }

    /// Upscales one image or frame, tiled or whole.
    fn upscale_unit(
        &self,
        model: &mut dyn SuperResModel,
        original: &DynamicImage,
        working: &DynamicImage,
        decision: TilingDecision,
        position: Option<ImagePosition>,
    ) -> Result<DynamicImage> {
        if !decision.needs_tiling {
            if let Some(ImagePosition { index, total }) = position {
                self.report(&format!("Upscaling image {index}/{total}"));
            }
            return enhance(model, working);
        }

        if let Some(ImagePosition { index, total }) = position {
            self.report(&format!("Tiling image {index}/{total}"));
        }
        let tiles = split(working, decision.grid)?;
        let tile_count = tiles.len();
        debug!(
            tiles_x = decision.grid.tiles_x,
            tiles_y = decision.grid.tiles_y,
            "Split unit into tiles"
        );

        let mut upscaled = Vec::with_capacity(tile_count);
        for (j, tile) in tiles.iter().enumerate() {
            self.checkpoint()?;
            let image = enhance(model, &tile.image)
                .with_context(|| format!("tile ({}, {})", tile.row, tile.col))?;
            upscaled.push(tile.with_image(image));
            if position.is_some() {
                self.report(&format!("Upscaled tiles {}/{tile_count}", j + 1));
            }
        }

        if let Some(ImagePosition { index, total }) = position {
            self.report(&format!("Reconstructing image {index}/{total}"));
        }
        reconstruct(
            &upscaled,
            working.dimensions(),
            original,
            decision.grid,
            model.scale(),
        )
    }

    fn process_video(&self, model: &mut dyn SuperResModel, file: &Path) -> Result<PathBuf> {
        let config = self.config;
        let extension = config.image_extension;
        let scratch = ScratchDir::recreate(config.scratch_dir())?;

        self.report("Extracting video frames...");
        let probe = video::probe(file)?;
        let frames = video::extract_frames(file, scratch.path(), extension)?;
        let audio = if probe.has_audio {
            video::extract_audio(file, scratch.path())
        } else {
            None
        };
        self.checkpoint()?;

        let working_frames = if config.resize_percent != 100 {
            self.report("Resizing video frames...");
            self.resize_frames(&frames)?
        } else {
            frames.clone()
        };

        self.upscale_frames(model, &frames, &working_frames, scratch.path())?;

        self.checkpoint()?;
        self.report("Processing upscaled video...");
        let output = config
            .output_path(file)
            .with_context(|| format!("Unsupported file: {}", file.display()))?;
        let partial = partial_path(&output);
        let job = EncodeJob {
            frame_pattern: upscaled_frame_pattern(
                scratch.path(),
                config.model,
                config.resize_percent,
                extension.as_str(),
            ),
            frame_rate: probe.frame_rate,
            audio,
            container: config.video_container,
            output: partial.clone(),
        };

        if let Err(e) = job.encode().and_then(|()| self.checkpoint()) {
            discard_partial(&partial);
            return Err(e);
        }
        fs::rename(&partial, &output).with_context(|| {
            format!(
                "failed to move output into place: {} -> {}",
                partial.display(),
                output.display()
            )
        })?;

        drop(scratch);
        Ok(output)
    }

    /// Upscales pre-extracted frames into `scratch`, reporting every
    /// `progress_every_frames` frames and on the last one. The first working
    /// frame decides tiling for all of them.
    fn upscale_frames(
        &self,
        model: &mut dyn SuperResModel,
        frames: &[PathBuf],
        working_frames: &[PathBuf],
        scratch: &Path,
    ) -> Result<TilingDecision> {
        let config = self.config;
        let extension = config.image_extension;

        let first = working_frames
            .first()
            .context("ffmpeg produced no frames")
            .and_then(|frame| read_image(frame))?;
        let decision = need_tiling(first.width(), first.height(), config.tile_budget());
        drop(first);
        if decision.needs_tiling {
            self.report("Tiling frames...");
        }

        let total = frames.len();
        let every = config.progress_every_frames.max(1);
        for (i, (frame, working_frame)) in frames.iter().zip(working_frames).enumerate() {
            self.checkpoint()?;
            let index = i + 1;

            let original = read_image(frame)?;
            let resized = if working_frame != frame {
                Some(read_image(working_frame)?)
            } else {
                None
            };
            let working = resized.as_ref().unwrap_or(&original);

            let upscaled = self
                .upscale_unit(model, &original, working, decision, None)
                .with_context(|| format!("frame {index}"))?;
            let out = upscaled_frame_path(
                scratch,
                index,
                config.model,
                config.resize_percent,
                extension.as_str(),
            );
            write_image(&upscaled, &out, extension)?;

            if index % every == 0 || index == total {
                self.report(&format!("Upscaled frame {index}/{total}"));
            }
        }
        Ok(decision)
    }

    /// Resizes every frame on a pool of `cpu_workers` scoped threads; order
    /// of the returned paths matches `frames`.
    fn resize_frames(&self, frames: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let factor = self.config.resize_factor();
        let extension = self.config.image_extension;
        let workers = self.config.cpu_workers.max(1);
        let chunk_len = frames.len().div_ceil(workers).max(1);
        let cancel = &self.cancel;

        thread::scope(|scope| {
            let handles: Vec<_> = frames
                .chunks(chunk_len)
                .map(|chunk| {
                    scope.spawn(move || -> Result<Vec<PathBuf>> {
                        chunk
                            .iter()
                            .map(|frame| {
                                if cancel.is_cancelled() {
                                    return Err(Cancelled.into());
                                }
                                let resized = resize_by_factor(&read_image(frame)?, factor);
                                let out = resized_frame_path(frame);
                                write_image(&resized, &out, extension)?;
                                Ok(out)
                            })
                            .collect()
                    })
                })
                .collect();

            let mut resized = Vec::with_capacity(frames.len());
            for handle in handles {
                let part = handle
                    .join()
                    .map_err(|_| anyhow!("frame resize worker panicked"))??;
                resized.extend(part);
            }
            Ok(resized)
        })
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
