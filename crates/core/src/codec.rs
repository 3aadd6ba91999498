//! Supported file sets and image decode/encode.

use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use image::{DynamicImage, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::naming::partial_path;

pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];

pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "webm", "mkv", "flv", "gif", "m4v", "avi", "mov", "qt", "3gp", "mpg", "mpeg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

/// Classifies a path by extension (case-insensitive). `None` means unsupported.
pub fn media_kind(path: &Path) -> Option<MediaKind> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        Some(MediaKind::Image)
    } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Output image format choice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageExtension {
    #[default]
    Png,
    Jpg,
    Bmp,
    Tiff,
    Webp,
}

impl ImageExtension {
    pub const ALL: [ImageExtension; 5] = [
        ImageExtension::Png,
        ImageExtension::Jpg,
        ImageExtension::Bmp,
        ImageExtension::Tiff,
        ImageExtension::Webp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg => "jpg",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
            Self::Webp => "webp",
        }
    }

    pub fn format(self) -> ImageFormat {
        match self {
            Self::Png => ImageFormat::Png,
            Self::Jpg => ImageFormat::Jpeg,
            Self::Bmp => ImageFormat::Bmp,
            Self::Tiff => ImageFormat::Tiff,
            Self::Webp => ImageFormat::WebP,
        }
    }

    fn keeps_sixteen_bit(self) -> bool {
        matches!(self, Self::Png | Self::Tiff)
    }
}

impl fmt::Display for ImageExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageExtension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "png" => Ok(Self::Png),
            "jpg" | "jpeg" => Ok(Self::Jpg),
            "bmp" => Ok(Self::Bmp),
            "tif" | "tiff" => Ok(Self::Tiff),
            "webp" => Ok(Self::Webp),
            other => Err(format!(
                "unknown image extension '{other}' (expected png, jpg, bmp, tiff or webp)"
            )),
        }
    }
}

pub fn read_image(path: &Path) -> Result<DynamicImage> {
    ImageReader::open(path)
        .with_context(|| format!("failed to open image: {}", path.display()))?
        .with_guessed_format()
        .with_context(|| format!("failed to detect image format: {}", path.display()))?
        .decode()
        .with_context(|| format!("failed to decode image: {}", path.display()))
}

/// Converts `image` into a layout the chosen encoder accepts.
///
/// PNG keeps everything. TIFF keeps 16-bit but has no gray+alpha layout.
/// The other encoders take 8-bit only, and JPEG drops alpha.
pub fn prepare_for_encoding(image: &DynamicImage, extension: ImageExtension) -> DynamicImage {
    let image = if extension.keeps_sixteen_bit() {
        match image {
            DynamicImage::ImageRgb32F(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
            DynamicImage::ImageRgba32F(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
            other => other.clone(),
        }
    } else {
        to_eight_bit(image)
    };

    match (extension, image) {
        (ImageExtension::Jpg, DynamicImage::ImageLumaA8(buf)) => {
            DynamicImage::ImageLuma8(DynamicImage::ImageLumaA8(buf).to_luma8())
        }
        (ImageExtension::Jpg, DynamicImage::ImageRgba8(buf)) => {
            DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(buf).to_rgb8())
        }
        (ImageExtension::Tiff, DynamicImage::ImageLumaA8(buf)) => {
            DynamicImage::ImageRgba8(DynamicImage::ImageLumaA8(buf).to_rgba8())
        }
        (ImageExtension::Tiff, DynamicImage::ImageLumaA16(buf)) => {
            DynamicImage::ImageRgba16(DynamicImage::ImageLumaA16(buf).to_rgba16())
        }
        (_, image) => image,
    }
}

fn to_eight_bit(image: &DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma16(_) => DynamicImage::ImageLuma8(image.to_luma8()),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageLumaA8(image.to_luma_alpha8()),
        DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgb32F(_) => {
            DynamicImage::ImageRgb8(image.to_rgb8())
        }
        DynamicImage::ImageRgba16(_) | DynamicImage::ImageRgba32F(_) => {
            DynamicImage::ImageRgba8(image.to_rgba8())
        }
        other => other.clone(),
    }
}

pub fn write_image(image: &DynamicImage, path: &Path, extension: ImageExtension) -> Result<()> {
    prepare_for_encoding(image, extension)
        .save_with_format(path, extension.format())
        .with_context(|| format!("failed to write image: {}", path.display()))
}

/// Writes to a hidden partial name beside `path`, then renames into place.
pub fn write_image_atomic(image: &DynamicImage, path: &Path, extension: ImageExtension) -> Result<()> {
    let partial = partial_path(path);
    if let Err(error) = write_image(image, &partial, extension) {
        discard_partial(&partial);
        return Err(error);
    }

    fs::rename(&partial, path).with_context(|| {
        discard_partial(&partial);
        format!(
            "failed to move output into place: {} -> {}",
            partial.display(),
            path.display()
        )
    })
}

pub(crate) fn discard_partial(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => {}
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(
            path = %partial.display(),
            error = %error,
            "Failed to remove partial output"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayAlphaImage, ImageBuffer, Rgba, RgbaImage};
    use tempfile::tempdir;

    #[test]
    fn media_kind_is_case_insensitive() {
        assert_eq!(media_kind(Path::new("a/B.PNG")), Some(MediaKind::Image));
        assert_eq!(media_kind(Path::new("x.TiF")), Some(MediaKind::Image));
        assert_eq!(media_kind(Path::new("clip.MoV")), Some(MediaKind::Video));
        assert_eq!(media_kind(Path::new("anim.gif")), Some(MediaKind::Video));
        assert_eq!(media_kind(Path::new("notes.txt")), None);
        assert_eq!(media_kind(Path::new("no_extension")), None);
    }

    #[test]
    fn extension_parses_aliases_and_displays_canonical_name() {
        assert_eq!(".JPEG".parse::<ImageExtension>().unwrap(), ImageExtension::Jpg);
        assert_eq!("tif".parse::<ImageExtension>().unwrap(), ImageExtension::Tiff);
        assert!("gif".parse::<ImageExtension>().is_err());
        for ext in ImageExtension::ALL {
            assert_eq!(ext.to_string().parse::<ImageExtension>().unwrap(), ext);
        }
    }

    #[test]
    fn jpeg_gets_eight_bit_rgb() {
        let image = DynamicImage::ImageRgba16(ImageBuffer::from_pixel(2, 2, Rgba([65535u16, 0, 0, 100])));
        let prepared = prepare_for_encoding(&image, ImageExtension::Jpg);
        assert_eq!(prepared.as_rgb8().expect("rgb8").get_pixel(0, 0).0, [255, 0, 0]);
    }

    #[test]
    fn png_and_tiff_keep_sixteen_bit() {
        let image = DynamicImage::ImageRgba16(ImageBuffer::new(1, 1));
        assert!(prepare_for_encoding(&image, ImageExtension::Png).as_rgba16().is_some());
        assert!(prepare_for_encoding(&image, ImageExtension::Tiff).as_rgba16().is_some());
        assert!(prepare_for_encoding(&image, ImageExtension::Webp).as_rgba8().is_some());

        let gray_alpha = DynamicImage::ImageLumaA8(GrayAlphaImage::new(1, 1));
        assert!(prepare_for_encoding(&gray_alpha, ImageExtension::Tiff).as_rgba8().is_some());
    }

    #[test]
    fn atomic_write_leaves_no_partial_behind() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("out.png");
        let image = DynamicImage::ImageRgba8(RgbaImage::from_pixel(3, 2, Rgba([1, 2, 3, 4])));

        write_image_atomic(&image, &path, ImageExtension::Png).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.png")]);

        let decoded = read_image(&path).unwrap();
        assert_eq!(decoded.to_rgba8().get_pixel(2, 1).0, [1, 2, 3, 4]);
    }

    #[test]
    fn failed_write_cleans_up_partial() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("missing_dir").join("out.png");
        let image = DynamicImage::ImageRgba8(RgbaImage::new(1, 1));

        assert!(write_image_atomic(&image, &path, ImageExtension::Png).is_err());
        assert!(!path.exists());
        assert!(!partial_path(&path).exists());
    }

    #[test]
    fn read_image_reports_the_path_on_failure() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("broken.png");
        fs::write(&path, b"not an image").unwrap();

        let message = format!("{:#}", read_image(&path).expect_err("garbage input"));
        assert!(message.contains("broken.png"), "{message}");
    }
}
