//! Deterministic names for outputs, partial writes and scratch frames.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::model::ModelId;

const RESIZED_MARKER: &str = "_resized";
const PARTIAL_MARKER: &str = ".partial";

fn output_suffix(model: ModelId, resize_percent: u32) -> String {
    format!("_{model}_{resize_percent}%")
}

/// Drops the `_resized` marker left by the resize step. Suffixes from a
/// previous upscale are kept, so re-upscaling an output never names the
/// result after its own source.
fn base_stem(stem: &str) -> &str {
    let mut stem = stem;
    while let Some(stripped) = stem.strip_suffix(RESIZED_MARKER) {
        stem = stripped;
    }
    stem
}

/// `dir/name.ext` → `dir/name_<model>_<pct>%.<extension>`.
///
/// A `_resized` intermediate maps to the same name as its source.
pub fn prepare_output_filename(
    input: &Path,
    model: ModelId,
    resize_percent: u32,
    extension: &str,
) -> PathBuf {
    let suffix = output_suffix(model, resize_percent);
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = format!("{}{suffix}.{extension}", base_stem(&stem));
    input.with_file_name(name)
}

/// Hidden sibling that receives bytes until the output is complete.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(".");
    name.push(path.file_stem().unwrap_or_default());
    name.push(PARTIAL_MARKER);
    if let Some(extension) = path.extension() {
        name.push(".");
        name.push(extension);
    }
    path.with_file_name(name)
}

/// Scratch frame written by the extractor, numbered from 1.
pub fn frame_path(scratch: &Path, index: usize, extension: &str) -> PathBuf {
    scratch.join(format!("frame_{index}.{extension}"))
}

pub fn frame_pattern(scratch: &Path, extension: &str) -> PathBuf {
    scratch.join(format!("frame_%d.{extension}"))
}

pub fn resized_frame_path(frame: &Path) -> PathBuf {
    let stem = frame
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}{RESIZED_MARKER}");
    if let Some(extension) = frame.extension() {
        name.push('.');
        name.push_str(&extension.to_string_lossy());
    }
    frame.with_file_name(name)
}

/// Upscaled frame `index` inside the scratch directory.
pub fn upscaled_frame_path(
    scratch: &Path,
    index: usize,
    model: ModelId,
    resize_percent: u32,
    extension: &str,
) -> PathBuf {
    scratch.join(format!(
        "frame_{index}{}.{extension}",
        output_suffix(model, resize_percent)
    ))
}

/// ffmpeg image2 pattern matching [`upscaled_frame_path`]; a literal `%`
/// must be doubled.
pub fn upscaled_frame_pattern(
    scratch: &Path,
    model: ModelId,
    resize_percent: u32,
    extension: &str,
) -> PathBuf {
    let suffix = output_suffix(model, resize_percent).replace('%', "%%");
    scratch.join(format!("frame_%d{suffix}.{extension}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_carries_model_and_percent() {
        let out = prepare_output_filename(
            Path::new("/pics/cat.jpeg"),
            ModelId::RealEsrganX4,
            70,
            "png",
        );
        assert_eq!(out, PathBuf::from("/pics/cat_RealESRGANx4_70%.png"));
    }

    #[test]
    fn resized_intermediate_maps_to_source_name() {
        let direct = prepare_output_filename(
            Path::new("dir/photo.png"),
            ModelId::RealEsrGeneralX4,
            50,
            "png",
        );
        let resized = prepare_output_filename(
            Path::new("dir/photo_resized.png"),
            ModelId::RealEsrGeneralX4,
            50,
            "png",
        );
        assert_eq!(resized, PathBuf::from("dir/photo_RealESR_Gx4_50%.png"));
        assert_eq!(resized, direct);
    }

    #[test]
    fn re_upscaling_an_output_never_reuses_its_name() {
        let source = Path::new("pics/cat_RealESRGANx4_100%.png");
        let out = prepare_output_filename(source, ModelId::RealEsrganX4, 100, "png");
        assert_ne!(out, source);
        assert_eq!(
            out,
            PathBuf::from("pics/cat_RealESRGANx4_100%_RealESRGANx4_100%.png")
        );
    }

    #[test]
    fn partial_path_is_hidden_sibling() {
        assert_eq!(
            partial_path(Path::new("/v/clip_RealESRGANx4_100%.mp4")),
            PathBuf::from("/v/.clip_RealESRGANx4_100%.partial.mp4")
        );
        assert_eq!(partial_path(Path::new("noext")), PathBuf::from(".noext.partial"));
    }

    #[test]
    fn frame_names_line_up_with_patterns() {
        let scratch = Path::new("/tmp/RealScaler_temp");
        assert_eq!(frame_path(scratch, 3, "png"), scratch.join("frame_3.png"));
        assert_eq!(
            resized_frame_path(&frame_path(scratch, 3, "png")),
            scratch.join("frame_3_resized.png")
        );
        assert_eq!(
            upscaled_frame_path(scratch, 12, ModelId::RealEsrganX4, 75, "png"),
            scratch.join("frame_12_RealESRGANx4_75%.png")
        );
        assert_eq!(
            upscaled_frame_pattern(scratch, ModelId::RealEsrganX4, 75, "png"),
            scratch.join("frame_%d_RealESRGANx4_75%%.png")
        );
    }
}
