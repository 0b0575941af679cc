use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageFormat, Rgb, RgbImage, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use thiserror::Error;
use xcap::Monitor;

use crate::detector::Detection;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("no primary monitor found")]
    NoMonitor,

    #[error("screen capture failed: {0}")]
    Failed(String),

    #[error("failed to save screenshot {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to encode screenshot: {0}")]
    Encode(#[source] image::ImageError),
}

/// Source of screenshots.
pub trait ScreenCapture: Send + Sync {
    fn capture(&self) -> Result<DynamicImage, CaptureError>;
}

/// Captures the whole primary monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryMonitor;

impl ScreenCapture for PrimaryMonitor {
    fn capture(&self) -> Result<DynamicImage, CaptureError> {
        let monitor = Monitor::all()
            .map_err(|e| CaptureError::Failed(e.to_string()))?
            .into_iter()
            .find(|m| m.is_primary())
            .ok_or(CaptureError::NoMonitor)?;

        let frame = monitor
            .capture_image()
            .map_err(|e| CaptureError::Failed(e.to_string()))?;
        let (width, height) = (frame.width(), frame.height());

        let rgba = RgbaImage::from_raw(width, height, frame.into_raw())
            .ok_or_else(|| CaptureError::Failed("frame buffer size mismatch".into()))?;
        Ok(DynamicImage::ImageRgba8(rgba))
    }
}

const PALETTE: [[u8; 3]; 6] = [
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
];

fn class_color(class_name: &str) -> Rgb<u8> {
    let hash = class_name
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    Rgb(PALETTE[hash % PALETTE.len()])
}

/// Draw a 2px box around each detection.
pub fn annotate(image: &DynamicImage, detections: &[Detection]) -> RgbImage {
    let mut canvas = image.to_rgb8();
    for d in detections {
        let color = class_color(&d.class_name);
        let (w, h) = (d.bbox.width().max(1), d.bbox.height().max(1));
        draw_hollow_rect_mut(
            &mut canvas,
            Rect::at(d.bbox.x1 as i32, d.bbox.y1 as i32).of_size(w, h),
            color,
        );
        if w > 2 && h > 2 {
            draw_hollow_rect_mut(
                &mut canvas,
                Rect::at(d.bbox.x1 as i32 + 1, d.bbox.y1 as i32 + 1).of_size(w - 2, h - 2),
                color,
            );
        }
    }
    canvas
}

pub fn save_png(image: &DynamicImage, path: &Path) -> Result<(), CaptureError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!("failed to create {}: {e}", parent.display());
    }
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|source| CaptureError::Save {
            path: path.to_path_buf(),
            source,
        })
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CaptureError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(CaptureError::Encode)?;
    Ok(buf)
}

/// Number of files in `dir` whose name starts with `prefix`.
pub fn count_with_prefix(dir: &Path, prefix: &str) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(prefix))
            .count(),
        Err(_) => 0,
    }
}

/// `<name>_<YYYYmmdd_HHMMSS>`
pub fn timestamped_name(name: &str) -> String {
    format!("{name}_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"))
}
