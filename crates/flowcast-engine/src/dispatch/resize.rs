use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use tracing::debug;

use flowcast_core::error::{FlowError, Result};

/// Fraction of the free vertical space placed above content on tall targets.
const TALL_TOP_BIAS: f64 = 0.35;

/// Border samples taken per edge when estimating the fill colour.
const BORDER_SAMPLES: u32 = 64;

/// How a generated image is brought to an exact target size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitStrategy {
    /// Scale uniformly to cover the target and crop the overflow.
    Cover,
    /// Scale uniformly to fit inside the target and fill the rest.
    Letterbox,
}

/// Cover when the aspect ratios differ by at most `tolerance` (relative to the
/// target), letterbox otherwise.
pub fn plan(src_w: u32, src_h: u32, dst_w: u32, dst_h: u32, tolerance: f64) -> FitStrategy {
    let src = src_w.max(1) as f64 / src_h.max(1) as f64;
    let dst = dst_w.max(1) as f64 / dst_h.max(1) as f64;
    if (src - dst).abs() / dst <= tolerance {
        FitStrategy::Cover
    } else {
        FitStrategy::Letterbox
    }
}

/// Decode `bytes`, fit them to exactly `width`x`height` and re-encode as PNG.
pub fn fit_to_target(bytes: &[u8], width: u32, height: u32, tolerance: f64) -> Result<Vec<u8>> {
    if width == 0 || height == 0 {
        return Err(FlowError::Image(format!(
            "invalid target size {}x{}",
            width, height
        )));
    }
    let source = image::load_from_memory(bytes)
        .map_err(|e| FlowError::Image(format!("decoding generated image: {}", e)))?;
    let fitted = fit_image(&source, width, height, tolerance);
    encode_png(&fitted)
}

/// Fit an already decoded image. The output is always exactly `width`x`height`.
pub fn fit_image(source: &DynamicImage, width: u32, height: u32, tolerance: f64) -> DynamicImage {
    let (src_w, src_h) = source.dimensions();
    let strategy = plan(src_w, src_h, width, height, tolerance);
    debug!(src_w, src_h, width, height, ?strategy, "Fitting image to target");

    match strategy {
        FitStrategy::Cover => source.resize_to_fill(width, height, FilterType::Lanczos3),
        FitStrategy::Letterbox => letterbox(source, width, height),
    }
}

fn letterbox(source: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    let background = border_colour(source);
    let content = source.resize(width, height, FilterType::Lanczos3).to_rgba8();
    let (content_w, content_h) = content.dimensions();

    let free_x = width.saturating_sub(content_w);
    let free_y = height.saturating_sub(content_h);
    let x = free_x / 2;
    let y = if height > width {
        (free_y as f64 * TALL_TOP_BIAS).round() as u32
    } else {
        free_y / 2
    };

    let mut canvas = RgbaImage::from_pixel(width, height, background);
    imageops::overlay(&mut canvas, &content, x as i64, y as i64);
    DynamicImage::ImageRgba8(canvas)
}

/// Mean colour along the outer edge of the image.
fn border_colour(image: &DynamicImage) -> Rgba<u8> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Rgba([255, 255, 255, 255]);
    }

    let mut sum = [0u64; 4];
    let mut count = 0u64;
    let mut sample = |x: u32, y: u32| {
        let px = image.get_pixel(x, y);
        for (acc, channel) in sum.iter_mut().zip(px.0) {
            *acc += channel as u64;
        }
        count += 1;
    };

    for i in 0..BORDER_SAMPLES {
        let x = (i as u64 * (w as u64 - 1) / (BORDER_SAMPLES as u64 - 1)) as u32;
        let y = (i as u64 * (h as u64 - 1) / (BORDER_SAMPLES as u64 - 1)) as u32;
        sample(x, 0);
        sample(x, h - 1);
        sample(0, y);
        sample(w - 1, y);
    }

    let mean = sum.map(|c| (c / count.max(1)) as u8);
    Rgba([mean[0], mean[1], mean[2], 255])
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>> {
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| FlowError::Image(format!("encoding png: {}", e)))?;
    Ok(buf.into_inner())
}
