//! Video demux/mux through the ffmpeg command-line tools.
//!
//! Frames travel through the scratch directory as numbered image files;
//! ffmpeg's stderr is drained on a thread and logged under `ffmpeg_stderr`.

use std::collections::VecDeque;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;
use std::thread;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::ImageExtension;
use crate::naming::{frame_path, frame_pattern};
use crate::runtime::command_for;

const AUDIO_FILE_NAME: &str = "audio.mp3";
const LOSSY_CRF: u32 = 18;
/// stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 8;

/// Output container; each maps to one video encoder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    #[default]
    Mp4,
    Mkv,
    Avi,
}

impl VideoContainer {
    pub const ALL: [VideoContainer; 3] =
        [VideoContainer::Mp4, VideoContainer::Mkv, VideoContainer::Avi];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Mkv => "mkv",
            Self::Avi => "avi",
        }
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            Self::Mp4 => "libx264",
            Self::Mkv => "libx265",
            Self::Avi => "png",
        }
    }

    pub fn pixel_format(self) -> &'static str {
        match self {
            Self::Mp4 | Self::Mkv => "yuv420p",
            Self::Avi => "rgb24",
        }
    }

    pub fn audio_codec(self) -> &'static str {
        match self {
            Self::Mp4 | Self::Mkv => "aac",
            Self::Avi => "copy",
        }
    }

    /// Constant rate factor for the lossy encoders.
    fn crf(self) -> Option<u32> {
        match self {
            Self::Mp4 | Self::Mkv => Some(LOSSY_CRF),
            Self::Avi => None,
        }
    }
}

impl fmt::Display for VideoContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for VideoContainer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Ok(Self::Mp4),
            "mkv" => Ok(Self::Mkv),
            "avi" => Ok(Self::Avi),
            other => Err(format!(
                "unknown video container '{other}' (expected mp4, mkv or avi)"
            )),
        }
    }
}

// ffprobe JSON model

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInfo {
    /// Rational as reported by ffprobe, e.g. `24000/1001`; passed to ffmpeg verbatim.
    pub frame_rate: String,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub has_audio: bool,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    let value = match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den <= 0.0 {
                return None;
            }
            num / den
        }
        None => s.trim().parse().ok()?,
    };
    (value.is_finite() && value > 0.0).then_some(value)
}

pub fn parse_probe_json(json: &[u8]) -> Result<ProbeInfo> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let video = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .min_by_key(|s| s.index)
        .context("no video stream found")?;

    let (frame_rate, fps) = [&video.r_frame_rate, &video.avg_frame_rate]
        .into_iter()
        .flatten()
        .find_map(|rate| parse_frame_rate(rate).map(|fps| (rate.trim().to_string(), fps)))
        .context("video stream has no usable frame rate")?;

    Ok(ProbeInfo {
        frame_rate,
        fps,
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
        has_audio: probe
            .streams
            .iter()
            .any(|s| s.codec_type.as_deref() == Some("audio")),
    })
}

pub fn probe(path: &Path) -> Result<ProbeInfo> {
    let output = command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_streams"])
        .arg(path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe, is FFmpeg installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    let info = parse_probe_json(&output.stdout)
        .with_context(|| format!("failed to probe {}", path.display()))?;
    debug!(
        path = %path.display(),
        frame_rate = %info.frame_rate,
        width = info.width,
        height = info.height,
        has_audio = info.has_audio,
        "Probed video"
    );
    Ok(info)
}

fn lossy(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Runs ffmpeg to completion; stderr goes to the debug log and its tail
/// into the error on failure.
pub fn run_ffmpeg(args: &[String], step: &str) -> Result<()> {
    debug!(step, args = ?args, "Running ffmpeg");

    let mut child = command_for("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg, is it installed?")?;

    let stderr = child
        .stderr
        .take()
        .context("ffmpeg stderr was not captured")?;
    let drain = thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.is_empty() => {
                    debug!(target: "ffmpeg_stderr", "{}", line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        tail
    });

    let status = child
        .wait()
        .with_context(|| format!("failed to wait for ffmpeg ({step})"))?;
    let tail = drain.join().unwrap_or_default();

    if !status.success() {
        let detail = Vec::from(tail).join(" | ");
        bail!("ffmpeg {step} exited with status {status}: {detail}");
    }
    Ok(())
}

fn extract_args(video: &Path, scratch: &Path, extension: ImageExtension) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        lossy(video),
        "-map".into(),
        "0:v:0".into(),
        "-fps_mode".into(),
        "passthrough".into(),
        lossy(&frame_pattern(scratch, extension.as_str())),
    ]
}

/// Decodes every frame of the first video stream into
/// `scratch/frame_<n>.<ext>`, numbered from 1.
pub fn extract_frames(video: &Path, scratch: &Path, extension: ImageExtension) -> Result<Vec<PathBuf>> {
    run_ffmpeg(&extract_args(video, scratch, extension), "frame extraction")
        .with_context(|| format!("failed to extract frames from {}", video.display()))?;

    let frames = list_frames(scratch, extension);
    if frames.is_empty() {
        bail!("no frames extracted from {}", video.display());
    }
    info!(video = %video.display(), frames = frames.len(), "Extracted video frames");
    Ok(frames)
}

/// `frame_1`, `frame_2`, ... up to the first gap.
pub fn list_frames(scratch: &Path, extension: ImageExtension) -> Vec<PathBuf> {
    (1..)
        .map(|index| frame_path(scratch, index, extension.as_str()))
        .take_while(|path| path.is_file())
        .collect()
}

/// Extracts the first audio stream as MP3. Failure is logged and yields `None`.
pub fn extract_audio(video: &Path, scratch: &Path) -> Option<PathBuf> {
    let audio = scratch.join(AUDIO_FILE_NAME);
    let args = vec![
        "-nostdin".into(),
        "-y".into(),
        "-i".into(),
        lossy(video),
        "-map".into(),
        "0:a:0".into(),
        "-vn".into(),
        "-c:a".into(),
        "libmp3lame".into(),
        "-q:a".into(),
        "2".into(),
        lossy(&audio),
    ];

    match run_ffmpeg(&args, "audio extraction") {
        Ok(()) if audio.is_file() => Some(audio),
        Ok(()) => None,
        Err(error) => {
            warn!(
                video = %video.display(),
                error = %format!("{error:#}"),
                "Audio extraction failed, continuing without audio"
            );
            None
        }
    }
}

/// Reassembles numbered frames (plus optional audio) into a video file.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    /// image2 pattern with `%d` for the frame number starting at 1.
    pub frame_pattern: PathBuf,
    pub frame_rate: String,
    pub audio: Option<PathBuf>,
    pub container: VideoContainer,
    pub output: PathBuf,
}

impl EncodeJob {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-framerate".into(),
            self.frame_rate.clone(),
            "-start_number".into(),
            "1".into(),
            "-i".into(),
            lossy(&self.frame_pattern),
        ];
        if let Some(audio) = &self.audio {
            args.extend(["-i".into(), lossy(audio)]);
        }

        args.extend(["-map".into(), "0:v:0".into()]);
        if self.audio.is_some() {
            args.extend(["-map".into(), "1:a:0".into()]);
        }

        args.extend(["-c:v".into(), self.container.video_codec().into()]);
        if let Some(crf) = self.container.crf() {
            args.extend(["-crf".into(), crf.to_string()]);
        }
        args.extend(["-pix_fmt".into(), self.container.pixel_format().into()]);

        if self.audio.is_some() {
            args.extend([
                "-c:a".into(),
                self.container.audio_codec().into(),
                "-shortest".into(),
            ]);
        }

        args.extend([
            "-r".into(),
            self.frame_rate.clone(),
            lossy(&self.output),
        ]);
        args
    }

    pub fn encode(&self) -> Result<()> {
        info!(
            output = %self.output.display(),
            codec = self.container.video_codec(),
            frame_rate = %self.frame_rate,
            audio = self.audio.is_some(),
            "Encoding upscaled video"
        );
        run_ffmpeg(&self.build_ffmpeg_args(), "encode")
            .with_context(|| format!("failed to encode {}", self.output.display()))
    }
}
