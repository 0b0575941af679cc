use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma};
use imageproc::definitions::Image;
use imageproc::integral_image::{integral_image, integral_squared_image};
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};
use serde::Serialize;
use thiserror::Error;

/// Templates narrower or shorter than this after downscaling are unusable.
const MIN_TEMPLATE_SIDE: u32 = 4;

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("template directory not found: {0}")]
    MissingDir(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode template {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("no usable templates found in {0}")]
    Empty(PathBuf),
}

/// A position on screen in full-resolution pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn width(&self) -> u32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> u32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> Point {
        Point::new((self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2)
    }
}

/// One located UI element.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn center(&self) -> Point {
        self.bbox.center()
    }
}

/// Pre-computed grayscale template, already downscaled for matching.
pub struct PreparedTemplate {
    pub class_name: String,
    pub source: PathBuf,
    pub gray: GrayImage,
    /// Size at full resolution.
    pub width: u32,
    pub height: u32,
}

impl PreparedTemplate {
    /// Returns `None` when the template is too small to survive downscaling.
    pub fn new(
        class_name: impl Into<String>,
        source: impl Into<PathBuf>,
        image: &DynamicImage,
        scale_down: u32,
    ) -> Option<Self> {
        let class_name = class_name.into();
        let source = source.into();
        let gray = downscale(&image.to_luma8(), scale_down);

        if gray.width() < MIN_TEMPLATE_SIDE || gray.height() < MIN_TEMPLATE_SIDE {
            tracing::warn!(
                "template {} ({}x{}) too small after downscale, skipping",
                source.display(),
                image.width(),
                image.height()
            );
            return None;
        }

        Some(Self {
            class_name,
            source,
            gray,
            width: image.width(),
            height: image.height(),
        })
    }
}

/// Labeled templates grouped into detection classes.
///
/// Layout on disk: every subdirectory of the root is one class and all images
/// inside it are variants of that class; images directly in the root are
/// classes named after their file stem.
pub struct TemplateLibrary {
    root: PathBuf,
    scale_down: u32,
    templates: Vec<PreparedTemplate>,
}

impl TemplateLibrary {
    pub fn load(root: &Path, scale_down: u32) -> Result<Self, DetectorError> {
        if !root.is_dir() {
            return Err(DetectorError::MissingDir(root.to_path_buf()));
        }
        let scale_down = scale_down.max(1);

        let mut templates = Vec::new();
        for entry in sorted_entries(root)? {
            if entry.is_dir() {
                let Some(class_name) = file_name(&entry) else {
                    continue;
                };
                for file in sorted_entries(&entry)? {
                    if is_image(&file)
                        && let Some(t) = load_template(&class_name, &file, scale_down)
                    {
                        templates.push(t);
                    }
                }
            } else if is_image(&entry) {
                let Some(class_name) = entry.file_stem().map(|s| s.to_string_lossy().to_string())
                else {
                    continue;
                };
                if let Some(t) = load_template(&class_name, &entry, scale_down) {
                    templates.push(t);
                }
            }
        }

        if templates.is_empty() {
            return Err(DetectorError::Empty(root.to_path_buf()));
        }

        let library = Self {
            root: root.to_path_buf(),
            scale_down,
            templates,
        };
        tracing::info!(
            "loaded {} template(s) for classes {:?} from {}",
            library.len(),
            library.class_names(),
            root.display()
        );
        Ok(library)
    }

    pub fn from_templates(root: impl Into<PathBuf>, scale_down: u32, templates: Vec<PreparedTemplate>) -> Self {
        Self {
            root: root.into(),
            scale_down: scale_down.max(1),
            templates,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scale_down(&self) -> u32 {
        self.scale_down
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn class_names(&self) -> Vec<String> {
        self.templates
            .iter()
            .map(|t| t.class_name.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Find every instance of the requested classes (all classes when
    /// `classes` is empty) scoring at least `threshold`.
    /// Sorted by confidence, best first.
    pub fn detect(&self, screenshot: &DynamicImage, classes: &[&str], threshold: f32) -> Vec<Detection> {
        let screen = downscale(&screenshot.to_luma8(), self.scale_down);

        let mut by_class: BTreeMap<&str, Vec<Detection>> = BTreeMap::new();
        for template in &self.templates {
            if !classes.is_empty() && !classes.contains(&template.class_name.as_str()) {
                continue;
            }
            by_class
                .entry(template.class_name.as_str())
                .or_default()
                .extend(find_matches(&screen, template, threshold, self.scale_down));
        }

        // variants of one class compete for the same spot
        let mut all: Vec<Detection> = by_class
            .into_values()
            .flat_map(|candidates| {
                let min_side = candidates
                    .iter()
                    .map(|d| d.bbox.width().min(d.bbox.height()))
                    .min()
                    .unwrap_or(0);
                suppress_overlaps(candidates, min_side)
            })
            .collect();

        all.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        for d in &all {
            let c = d.center();
            tracing::debug!(
                "found {} at ({}, {}) with confidence {:.2}",
                d.class_name,
                c.x,
                c.y,
                d.confidence
            );
        }
        tracing::info!("detection found {} object(s)", all.len());

        all
    }
}

/// Highest-confidence detection.
pub fn pick_best(detections: Vec<Detection>) -> Option<Detection> {
    detections
        .into_iter()
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Search for a single template image, returning the best hit above `threshold`.
pub fn locate(
    screenshot: &DynamicImage,
    template: &DynamicImage,
    threshold: f32,
    scale_down: u32,
) -> Option<Detection> {
    best_match(screenshot, template, scale_down).filter(|d| d.confidence >= threshold)
}

/// Best position of one template regardless of threshold.
pub fn best_match(screenshot: &DynamicImage, template: &DynamicImage, scale_down: u32) -> Option<Detection> {
    let scale_down = scale_down.max(1);
    let prepared = PreparedTemplate::new("template", "<memory>", template, scale_down)?;
    let screen = downscale(&screenshot.to_luma8(), scale_down);

    if !fits(&screen, &prepared) {
        return None;
    }

    let scores = correlation_scores(&screen, &prepared.gray);
    let extremes = find_extremes(&scores);
    if !extremes.max_value.is_finite() {
        return None;
    }

    let (x, y) = extremes.max_value_location;
    Some(to_detection(&prepared, x, y, extremes.max_value, scale_down))
}

/// Scan one template over an already prepared (grayscale, downscaled) screen.
fn find_matches(
    screen: &GrayImage,
    template: &PreparedTemplate,
    threshold: f32,
    scale_down: u32,
) -> Vec<Detection> {
    if !fits(screen, template) {
        tracing::warn!(
            "template {} ({}x{}) is too large for screenshot {}x{}, skipping",
            template.source.display(),
            template.gray.width(),
            template.gray.height(),
            screen.width(),
            screen.height()
        );
        return Vec::new();
    }

    let scores = correlation_scores(screen, &template.gray);

    let mut candidates = Vec::new();
    let mut best_score: f32 = 0.0;
    for (x, y, pixel) in scores.enumerate_pixels() {
        let score = pixel.0[0];
        if !score.is_finite() {
            continue;
        }
        best_score = best_score.max(score);
        if score >= threshold {
            candidates.push(to_detection(template, x, y, score, scale_down));
        }
    }

    tracing::debug!(
        "template {} ({}): best_score={best_score:.4}, {} raw match(es) above {threshold:.2}",
        template.source.display(),
        template.class_name,
        candidates.len()
    );

    candidates
}

/// Zero-mean normalized cross-correlation of `template` at every position
/// of `screen`, in `[-1, 1]`. Windows or templates without contrast score 0,
/// so flat backgrounds never match.
fn correlation_scores(screen: &GrayImage, template: &GrayImage) -> Image<Luma<f32>> {
    let (tw, th) = template.dimensions();
    let n = u64::from(tw) * u64::from(th);
    let t_sum: u64 = template.pixels().map(|p| u64::from(p.0[0])).sum();
    let t_sq: u64 = template.pixels().map(|p| u64::from(p.0[0]).pow(2)).sum();
    let t_var = n * t_sq - t_sum * t_sum;

    let mut scores = match_template(screen, template, MatchTemplateMethod::CrossCorrelation);
    let sums = integral_image::<_, u64>(screen);
    let squares = integral_squared_image::<_, u64>(screen);

    for (x, y, pixel) in scores.enumerate_pixels_mut() {
        let s = window_sum(&sums, x, y, tw, th);
        let s_var = n * window_sum(&squares, x, y, tw, th) - s * s;
        if s_var == 0 || t_var == 0 {
            pixel.0[0] = 0.0;
            continue;
        }
        let numerator = n as f64 * f64::from(pixel.0[0]) - s as f64 * t_sum as f64;
        let denominator = (s_var as f64).sqrt() * (t_var as f64).sqrt();
        pixel.0[0] = (numerator / denominator).clamp(-1.0, 1.0) as f32;
    }
    scores
}

/// Sum of a `w`x`h` window from an integral image with a leading zero row
/// and column.
fn window_sum(integral: &Image<Luma<u64>>, x: u32, y: u32, w: u32, h: u32) -> u64 {
    let at = |x: u32, y: u32| integral.get_pixel(x, y).0[0];
    at(x + w, y + h) + at(x, y) - at(x + w, y) - at(x, y + h)
}

fn fits(screen: &GrayImage, template: &PreparedTemplate) -> bool {
    template.gray.width() <= screen.width() && template.gray.height() <= screen.height()
}

fn to_detection(template: &PreparedTemplate, x: u32, y: u32, score: f32, scale_down: u32) -> Detection {
    let x1 = x * scale_down;
    let y1 = y * scale_down;
    Detection {
        class_name: template.class_name.clone(),
        confidence: score,
        bbox: BoundingBox {
            x1,
            y1,
            x2: x1 + template.width,
            y2: y1 + template.height,
        },
    }
}

/// Keep the best candidate in each neighbourhood of `min_distance` pixels.
fn suppress_overlaps(mut candidates: Vec<Detection>, min_distance: u32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Detection> = Vec::new();
    for c in candidates {
        let center = c.center();
        let too_close = kept.iter().any(|k| {
            let kc = k.center();
            center.x.abs_diff(kc.x) < min_distance && center.y.abs_diff(kc.y) < min_distance
        });
        if !too_close {
            kept.push(c);
        }
    }
    kept
}

fn downscale(gray: &GrayImage, factor: u32) -> GrayImage {
    if factor <= 1 {
        return gray.clone();
    }
    let w = (gray.width() / factor).max(1);
    let h = (gray.height() / factor).max(1);
    image::imageops::resize(gray, w, h, FilterType::Triangle)
}

fn load_template(class_name: &str, path: &Path, scale_down: u32) -> Option<PreparedTemplate> {
    match image::open(path) {
        Ok(img) => PreparedTemplate::new(class_name, path, &img, scale_down),
        Err(e) => {
            tracing::warn!("failed to decode {}: {e}", path.display());
            None
        }
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, DetectorError> {
    let read = std::fs::read_dir(dir).map_err(|source| DetectorError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut entries: Vec<PathBuf> = read.filter_map(|e| e.ok().map(|e| e.path())).collect();
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().map(|s| s.to_string_lossy().to_string())
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.as_str()))
}
