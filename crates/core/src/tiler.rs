//! Splitting units into tiles and recomposing upscaled tiles.
//!
//! Reconstruction is not a plain mosaic. The pasted tiles are blended with a
//! smooth upsample of the original (pre-resize) image so that seams between
//! independently inferred tiles are softened.

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Pixel, Primitive, Rgba};
use tracing::debug;

use crate::geometry::TileGrid;

/// Filter for every non-network resample (resize, global upsample, tile fix-up).
pub const SMOOTH_FILTER: FilterType = FilterType::CatmullRom;

/// Share of the whole-image upsample in the final blend.
pub const BLEND_WEIGHT: f32 = 0.5;

/// One grid cell. `x`/`y` are the cell's origin in the image it was cut from.
#[derive(Debug, Clone)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
    pub x: u32,
    pub y: u32,
    pub image: DynamicImage,
}

impl Tile {
    /// Same cell, different pixels (typically the upscaled result).
    pub fn with_image(&self, image: DynamicImage) -> Tile {
        Tile {
            row: self.row,
            col: self.col,
            x: self.x,
            y: self.y,
            image,
        }
    }
}

/// Cuts `image` into `grid` in row-major order.
///
/// Cell extent is `width / tiles_x` by `height / tiles_y`; the right and
/// bottom remainder strips belong to no cell.
pub fn split(image: &DynamicImage, grid: TileGrid) -> Result<Vec<Tile>> {
    let (width, height) = image.dimensions();
    if grid.tiles_x == 0 || grid.tiles_y == 0 {
        bail!("tile grid must have at least one row and one column");
    }
    let tile_w = width / grid.tiles_x;
    let tile_h = height / grid.tiles_y;
    if tile_w == 0 || tile_h == 0 {
        bail!(
            "{width}x{height} image cannot be split into {}x{} tiles",
            grid.tiles_x,
            grid.tiles_y
        );
    }

    let mut tiles = Vec::with_capacity(grid.count() as usize);
    for row in 0..grid.tiles_y {
        for col in 0..grid.tiles_x {
            let x = col * tile_w;
            let y = row * tile_h;
            tiles.push(Tile {
                row,
                col,
                x,
                y,
                image: image.crop_imm(x, y, tile_w, tile_h),
            });
        }
    }
    Ok(tiles)
}

/// Recomposes upscaled tiles into a `reference × scale` RGBA image.
///
/// `reference` is the size of the image the tiles were cut from; `original`
/// is the image before any resize and feeds the smooth upsample. The result
/// is 16-bit when `original` is, 8-bit otherwise.
pub fn reconstruct(
    tiles: &[Tile],
    reference: (u32, u32),
    original: &DynamicImage,
    grid: TileGrid,
    scale: u32,
) -> Result<DynamicImage> {
    reconstruct_with_weight(tiles, reference, original, grid, scale, BLEND_WEIGHT)
}

/// [`reconstruct`] with an explicit share for the whole-image upsample.
pub fn reconstruct_with_weight(
    tiles: &[Tile],
    reference: (u32, u32),
    original: &DynamicImage,
    grid: TileGrid,
    scale: u32,
    upsample_weight: f32,
) -> Result<DynamicImage> {
    if tiles.len() != grid.count() as usize {
        bail!(
            "expected {} tiles for a {}x{} grid, got {}",
            grid.count(),
            grid.tiles_x,
            grid.tiles_y,
            tiles.len()
        );
    }
    if scale == 0 {
        bail!("scale factor must be positive");
    }

    let layout = Layout::new(reference, grid, scale)?;
    debug!(
        out_width = layout.out_w,
        out_height = layout.out_h,
        tile_width = layout.tile_w,
        tile_height = layout.tile_h,
        tiles = tiles.len(),
        "Reconstructing tiled image"
    );

    let weight = upsample_weight.clamp(0.0, 1.0);
    if is_sixteen_bit(original) {
        compose::<u16>(tiles, original, &layout, weight)
    } else {
        compose::<u8>(tiles, original, &layout, weight)
    }
}

/// Resamples `image` by `factor` with the smooth filter, keeping its color type.
pub fn resize_by_factor(image: &DynamicImage, factor: f64) -> DynamicImage {
    let (width, height) = image.dimensions();
    let new_w = scaled_dim(width, factor);
    let new_h = scaled_dim(height, factor);
    if (new_w, new_h) == (width, height) {
        return image.clone();
    }
    image.resize_exact(new_w, new_h, SMOOTH_FILTER)
}

fn scaled_dim(dim: u32, factor: f64) -> u32 {
    let scaled = (f64::from(dim) * factor).floor();
    if scaled.is_finite() && scaled >= 1.0 {
        scaled.min(f64::from(u32::MAX)) as u32
    } else {
        1
    }
}

fn is_sixteen_bit(image: &DynamicImage) -> bool {
    !matches!(
        image,
        DynamicImage::ImageLuma8(_)
            | DynamicImage::ImageLumaA8(_)
            | DynamicImage::ImageRgb8(_)
            | DynamicImage::ImageRgba8(_)
    )
}

struct Layout {
    out_w: u32,
    out_h: u32,
    /// Expected upscaled cell size.
    tile_w: u32,
    tile_h: u32,
    /// Extent of the output the grid covers.
    covered_w: u32,
    covered_h: u32,
}

impl Layout {
    fn new(reference: (u32, u32), grid: TileGrid, scale: u32) -> Result<Self> {
        let (ref_w, ref_h) = reference;
        let tile_w = (ref_w / grid.tiles_x) * scale;
        let tile_h = (ref_h / grid.tiles_y) * scale;
        if tile_w == 0 || tile_h == 0 {
            bail!(
                "{ref_w}x{ref_h} reference cannot hold {}x{} tiles",
                grid.tiles_x,
                grid.tiles_y
            );
        }
        Ok(Self {
            out_w: ref_w * scale,
            out_h: ref_h * scale,
            tile_w,
            tile_h,
            covered_w: tile_w * grid.tiles_x,
            covered_h: tile_h * grid.tiles_y,
        })
    }
}

type RgbaBuffer<T> = ImageBuffer<Rgba<T>, Vec<T>>;

trait BlendSample: Primitive
where
    Rgba<Self>: Pixel<Subpixel = Self>,
{
    fn rgba(image: &DynamicImage) -> RgbaBuffer<Self>;
    fn wrap(buffer: RgbaBuffer<Self>) -> DynamicImage;
    fn blend_f32(self) -> f32;
    fn from_blend_f32(value: f32) -> Self;
}

impl BlendSample for u8 {
    fn rgba(image: &DynamicImage) -> RgbaBuffer<Self> {
        image.to_rgba8()
    }

    fn wrap(buffer: RgbaBuffer<Self>) -> DynamicImage {
        DynamicImage::ImageRgba8(buffer)
    }

    fn blend_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_blend_f32(value: f32) -> Self {
        value.round().clamp(0.0, f32::from(u8::MAX)) as u8
    }
}

impl BlendSample for u16 {
    fn rgba(image: &DynamicImage) -> RgbaBuffer<Self> {
        image.to_rgba16()
    }

    fn wrap(buffer: RgbaBuffer<Self>) -> DynamicImage {
        DynamicImage::ImageRgba16(buffer)
    }

    fn blend_f32(self) -> f32 {
        f32::from(self)
    }

    fn from_blend_f32(value: f32) -> Self {
        value.round().clamp(0.0, f32::from(u16::MAX)) as u16
    }
}

fn compose<T: BlendSample>(
    tiles: &[Tile],
    original: &DynamicImage,
    layout: &Layout,
    upsample_weight: f32,
) -> Result<DynamicImage>
where
    Rgba<T>: Pixel<Subpixel = T>,
{
    let mut output: RgbaBuffer<T> =
        T::rgba(&original.resize_exact(layout.out_w, layout.out_h, SMOOTH_FILTER));

    let mut mosaic: RgbaBuffer<T> = ImageBuffer::new(layout.covered_w, layout.covered_h);
    for tile in tiles {
        if tile.col * layout.tile_w >= layout.covered_w || tile.row * layout.tile_h >= layout.covered_h
        {
            bail!("tile ({}, {}) lies outside the grid", tile.row, tile.col);
        }

        let fitted = if tile.image.dimensions() == (layout.tile_w, layout.tile_h) {
            T::rgba(&tile.image)
        } else {
            debug!(
                row = tile.row,
                col = tile.col,
                width = tile.image.width(),
                height = tile.image.height(),
                expected_width = layout.tile_w,
                expected_height = layout.tile_h,
                "Resizing mismatched tile"
            );
            T::rgba(
                &tile
                    .image
                    .resize_exact(layout.tile_w, layout.tile_h, SMOOTH_FILTER),
            )
        };

        imageops::replace(
            &mut mosaic,
            &fitted,
            i64::from(tile.col * layout.tile_w),
            i64::from(tile.row * layout.tile_h),
        );
    }

    let tile_weight = 1.0 - upsample_weight;
    for (x, y, tile_pixel) in mosaic.enumerate_pixels() {
        let out = output.get_pixel_mut(x, y);
        for (o, t) in out.0.iter_mut().zip(tile_pixel.0.iter()) {
            *o = T::from_blend_f32(o.blend_f32() * upsample_weight + t.blend_f32() * tile_weight);
        }
    }

    Ok(T::wrap(output))
}
