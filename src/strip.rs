//! Laying out predictions: horizontal strip with an optional caption band,
//! a grid for browsing every candidate, and PNG encoding.

use ab_glyph::{FontVec, PxScale};
use anyhow::{Context, Result};
use image::{imageops, Rgb, RgbImage};
use std::io::Cursor;
use tracing::debug;

use crate::config::CaptionConfig;

const CAPTION_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const CAPTION_ORIGIN: (i32, i32) = (20, 3);

/// Font and geometry for caption text
pub struct CaptionStyle {
    font: FontVec,
    scale: PxScale,
    band_height: u32,
}

impl CaptionStyle {
    /// Load the TTF named in the config. Fails if the font file is missing.
    pub fn load(config: &CaptionConfig) -> Result<Self> {
        let bytes = std::fs::read(&config.font_path)
            .with_context(|| format!("Failed to read caption font: {}", config.font_path.display()))?;
        let font = FontVec::try_from_vec(bytes)
            .map_err(|e| anyhow::anyhow!("Invalid caption font {}: {}", config.font_path.display(), e))?;

        Ok(Self {
            font,
            scale: PxScale::from(config.font_size),
            band_height: config.band_height,
        })
    }

    pub fn band_height(&self) -> u32 {
        self.band_height
    }
}

/// Paste `images` left to right. With a caption, a band is reserved on top
/// and the text is drawn into it.
///
/// The strip is as wide as all images together and as tall as the tallest
/// one plus the band.
pub fn captioned_strip(images: &[RgbImage], caption: Option<(&str, &CaptionStyle)>) -> Result<RgbImage> {
    if images.is_empty() {
        anyhow::bail!("Cannot build a strip from zero images");
    }

    let band = caption.map(|(_, style)| style.band_height).unwrap_or(0);
    let width: u32 = images.iter().map(|img| img.width()).sum();
    let height = images.iter().map(|img| img.height()).max().unwrap_or(0) + band;

    let mut strip = RgbImage::new(width, height);
    let mut x = 0i64;
    for img in images {
        imageops::replace(&mut strip, img, x, band as i64);
        x += img.width() as i64;
    }

    if let Some((text, style)) = caption {
        imageproc::drawing::draw_text_mut(
            &mut strip,
            CAPTION_COLOR,
            CAPTION_ORIGIN.0,
            CAPTION_ORIGIN.1,
            style.scale,
            &style.font,
            text,
        );
    }

    debug!(width, height, count = images.len(), "Strip assembled");
    Ok(strip)
}

/// Arrange images in rows of `columns` cells sized after the first image
pub fn image_grid(images: &[RgbImage], columns: usize) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| anyhow::anyhow!("Cannot build a grid from zero images"))?;
    if columns == 0 {
        anyhow::bail!("Grid needs at least one column");
    }

    let columns = columns.min(images.len());
    let rows = images.len().div_ceil(columns);
    let (cell_w, cell_h) = first.dimensions();

    let mut grid = RgbImage::new(cell_w * columns as u32, cell_h * rows as u32);
    for (i, img) in images.iter().enumerate() {
        let x = (i % columns) as i64 * cell_w as i64;
        let y = (i / columns) as i64 * cell_h as i64;
        imageops::replace(&mut grid, img, x, y);
    }
    Ok(grid)
}

/// Encode RGB data as PNG
pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut png_data = Cursor::new(Vec::new());
    image
        .write_to(&mut png_data, image::ImageFormat::Png)
        .context("Failed to encode PNG")?;
    Ok(png_data.into_inner())
}
