use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, anyhow, bail};
use image::DynamicImage;
use serde::Serialize;
use tokio::time::{Duration, Instant, sleep};

use crate::config::Config;
use crate::detector::{self, Detection, DetectorError, Point, TemplateLibrary};
use crate::input::{self, InputDriver, Key, Keystroke};
use crate::screen::{self, ScreenCapture};

const CLASS_POLL_INTERVAL: Duration = Duration::from_secs(2);
const IMAGE_POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
pub struct DetectionInfo {
    pub method: &'static str,
    pub source: Option<PathBuf>,
    pub classes: Vec<String>,
    pub templates: usize,
    pub scale_down: u32,
}

/// Everything needed to look at the screen and act on it.
///
/// Capture, matching and input simulation are blocking, so they run on the
/// blocking thread pool.
pub struct Session {
    config: Config,
    screen: Arc<dyn ScreenCapture>,
    input: Arc<dyn InputDriver>,
    library: Option<Arc<TemplateLibrary>>,
    images: Mutex<HashMap<PathBuf, Arc<DynamicImage>>>,
}

impl Session {
    pub fn new(
        config: Config,
        screen: Arc<dyn ScreenCapture>,
        input: Arc<dyn InputDriver>,
        library: Option<TemplateLibrary>,
    ) -> Self {
        Self {
            config,
            screen,
            input,
            library: library.map(Arc::new),
            images: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn has_detection(&self) -> bool {
        self.library.is_some()
    }

    /// Fail early for jobs that cannot do anything without templates.
    pub fn require_detection(&self) -> Result<()> {
        if !self.has_detection() {
            bail!("no template library available, see --detection-dir");
        }
        Ok(())
    }

    pub async fn capture(&self) -> Result<DynamicImage> {
        let screen = self.screen.clone();
        tokio::task::spawn_blocking(move || screen.capture())
            .await
            .context("capture task panicked")?
            .context("failed to capture screen")
    }

    /// Run detection on a fresh screenshot. `threshold` defaults to the
    /// configured confidence.
    pub async fn detect(&self, classes: &[&str], threshold: Option<f32>) -> Result<Vec<Detection>> {
        let screenshot = self.capture().await?;
        self.detect_in(screenshot, classes, threshold).await
    }

    async fn detect_in(
        &self,
        screenshot: DynamicImage,
        classes: &[&str],
        threshold: Option<f32>,
    ) -> Result<Vec<Detection>> {
        let library = self
            .library
            .clone()
            .ok_or_else(|| anyhow!("detection unavailable: no template library loaded"))?;
        let threshold = threshold.unwrap_or(self.config.confidence);
        let classes: Vec<String> = classes.iter().map(|c| c.to_string()).collect();

        tokio::task::spawn_blocking(move || {
            let wanted: Vec<&str> = classes.iter().map(String::as_str).collect();
            library.detect(&screenshot, &wanted, threshold)
        })
        .await
        .context("detection task panicked")
    }

    /// Highest-confidence detection among `classes`.
    pub async fn best_match(&self, classes: &[&str], threshold: Option<f32>) -> Result<Option<Detection>> {
        let found = self.detect(classes, threshold).await?;
        let best = detector::pick_best(found);
        if let Some(ref d) = best {
            let c = d.center();
            tracing::info!(
                "best match: {} at ({}, {}) with confidence {:.2}",
                d.class_name,
                c.x,
                c.y,
                d.confidence
            );
        }
        Ok(best)
    }

    /// Center of the best detection of one class.
    pub async fn find_class(&self, class: &str, threshold: Option<f32>) -> Result<Option<Point>> {
        Ok(self.best_match(&[class], threshold).await?.map(|d| d.center()))
    }

    /// Poll for a class every 2 seconds until it shows up or `timeout` passes.
    pub async fn wait_for_class(&self, class: &str, timeout: Duration, threshold: Option<f32>) -> Result<bool> {
        tracing::info!("waiting for class '{class}' (timeout: {}s)", timeout.as_secs());
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.find_class(class, threshold).await?.is_some() {
                tracing::info!("class '{class}' found after {:.1}s", start.elapsed().as_secs_f64());
                return Ok(true);
            }
            sleep(CLASS_POLL_INTERVAL).await;
        }
        tracing::warn!("class '{class}' not found within {}s", timeout.as_secs());
        Ok(false)
    }

    /// Load an image from disk, caching it for later lookups.
    pub fn load_image(&self, path: &Path) -> Result<Arc<DynamicImage>, DetectorError> {
        if let Ok(cache) = self.images.lock()
            && let Some(image) = cache.get(path)
        {
            return Ok(image.clone());
        }

        let image = image::open(path).map_err(|source| DetectorError::Decode {
            path: path.to_path_buf(),
            source,
        })?;
        let image = Arc::new(image);
        if let Ok(mut cache) = self.images.lock() {
            cache.insert(path.to_path_buf(), image.clone());
        }
        tracing::debug!("loaded image {}", path.display());
        Ok(image)
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.images.lock() {
            cache.clear();
        }
        tracing::info!("image cache cleared");
    }

    /// Locate an image file on screen at the configured confidence.
    pub async fn locate_image(&self, path: &Path) -> Result<Option<Point>> {
        let template = self.load_image(path)?;
        let screenshot = self.capture().await?;
        let threshold = self.config.confidence;
        let scale_down = self.config.scale_down;

        let hit = tokio::task::spawn_blocking(move || {
            detector::locate(&screenshot, &template, threshold, scale_down)
        })
        .await
        .context("image search task panicked")?;

        match hit {
            Some(d) => {
                let c = d.center();
                tracing::debug!("found {} at ({}, {}) score {:.2}", path.display(), c.x, c.y, d.confidence);
                Ok(Some(c))
            }
            None => {
                tracing::debug!("{} not found on screen", path.display());
                Ok(None)
            }
        }
    }

    /// Poll for an image every 3 seconds. Returns false on timeout.
    ///
    /// Only an unreadable image file is an error; failed captures count as
    /// "not found yet".
    pub async fn wait_for_image(&self, path: &Path, timeout: Duration) -> Result<bool> {
        self.load_image(path)?;
        tracing::info!("waiting for {} (timeout: {}s)", path.display(), timeout.as_secs());
        let start = Instant::now();
        while start.elapsed() < timeout {
            match self.locate_image(path).await {
                Ok(Some(_)) => {
                    tracing::info!("{} found", path.display());
                    return Ok(true);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("search for {} failed: {e:#}", path.display()),
            }
            sleep(IMAGE_POLL_INTERVAL).await;
        }
        tracing::warn!("{} not found within {}s", path.display(), timeout.as_secs());
        Ok(false)
    }

    /// Move to `point` and click it with the configured click type.
    pub async fn click_at(&self, point: Point) -> Result<()> {
        let input = self.input.clone();
        let click_type = self.config.click_type;
        let move_duration = seconds(self.config.move_duration);
        let delay = seconds(self.config.delay);

        tokio::task::spawn_blocking(move || input::click_at(input.as_ref(), point, click_type, move_duration, delay))
            .await
            .context("click task panicked")?
            .with_context(|| format!("failed to click at ({}, {})", point.x, point.y))
    }

    pub async fn type_keys(&self, strokes: Vec<Keystroke>, interval: Duration) -> Result<()> {
        let input = self.input.clone();
        tokio::task::spawn_blocking(move || input::type_keystrokes(input.as_ref(), &strokes, interval))
            .await
            .context("typing task panicked")?
            .context("failed to type keys")
    }

    pub async fn send_key_combination(&self, keys: Vec<Key>) -> Result<()> {
        tracing::info!("sending key combination {keys:?}");
        let input = self.input.clone();
        tokio::task::spawn_blocking(move || input::key_combination(input.as_ref(), &keys))
            .await
            .context("key task panicked")?
            .context("failed to send key combination")
    }

    /// Save a screenshot as `<screenshot_dir>/<name>.png`. Without a name a
    /// timestamped one is used.
    pub async fn save_screenshot(&self, name: Option<&str>) -> Result<PathBuf> {
        let name = match name {
            Some(n) => n.to_string(),
            None => screen::timestamped_name("screenshot"),
        };
        let screenshot = self.capture().await?;
        self.write_png(screenshot, &name).await
    }

    /// Save `<prefix>_<n>.png`, where `n` counts earlier screenshots with the
    /// same prefix.
    pub async fn save_debug_screenshot(&self, prefix: &str) -> Result<PathBuf> {
        let n = screen::count_with_prefix(&self.config.screenshot_dir, prefix);
        let path = self.save_screenshot(Some(&format!("{prefix}_{n}"))).await?;
        tracing::info!("saved debug screenshot {}", path.display());
        Ok(path)
    }

    /// Save a screenshot with every detection boxed.
    pub async fn save_annotated(
        &self,
        name: Option<&str>,
        classes: &[&str],
        threshold: Option<f32>,
    ) -> Result<(PathBuf, Vec<Detection>)> {
        let screenshot = self.capture().await?;
        let detections = self.detect_in(screenshot.clone(), classes, threshold).await?;
        let annotated = DynamicImage::ImageRgb8(screen::annotate(&screenshot, &detections));
        let name = match name {
            Some(n) => n.to_string(),
            None => screen::timestamped_name("annotated"),
        };
        let path = self.write_png(annotated, &name).await?;
        tracing::info!(
            "saved annotated screenshot with {} detection(s) to {}",
            detections.len(),
            path.display()
        );
        Ok((path, detections))
    }

    async fn write_png(&self, image: DynamicImage, name: &str) -> Result<PathBuf> {
        let path = self.config.screenshot_dir.join(format!("{name}.png"));
        let target = path.clone();
        tokio::task::spawn_blocking(move || screen::save_png(&image, &target))
            .await
            .context("save task panicked")??;
        Ok(path)
    }

    pub fn detection_info(&self) -> DetectionInfo {
        match self.library {
            Some(ref lib) => DetectionInfo {
                method: "template_matching",
                source: Some(lib.root().to_path_buf()),
                classes: lib.class_names(),
                templates: lib.len(),
                scale_down: lib.scale_down(),
            },
            None => DetectionInfo {
                method: "none",
                source: None,
                classes: Vec::new(),
                templates: 0,
                scale_down: self.config.scale_down,
            },
        }
    }
}

/// Config values are validated, but never panic on a bad one.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use image::DynamicImage;

    use super::*;
    use crate::detector::PreparedTemplate;
    use crate::input::testing::RecordingDriver;
    use crate::screen::CaptureError;

    /// Shows `frames[n]` after `n` clicks; the last frame stays up.
    pub struct ScriptedScreen {
        pub input: Arc<RecordingDriver>,
        pub frames: Vec<DynamicImage>,
        pub cycle: bool,
    }

    impl ScreenCapture for ScriptedScreen {
        fn capture(&self) -> Result<DynamicImage, CaptureError> {
            let clicks = self.input.clicks().len();
            let idx = if self.cycle {
                clicks % self.frames.len()
            } else {
                clicks.min(self.frames.len() - 1)
            };
            Ok(self.frames[idx].clone())
        }
    }

    /// Config tuned for tests: instant pointer moves, strict thresholds
    /// and everything written below `dir`.
    pub fn test_config(dir: &Path) -> Config {
        Config {
            confidence: 0.9,
            recheck_confidence: 0.95,
            move_duration: 0.0,
            scale_down: 1,
            images_dir: dir.join("images"),
            screenshot_dir: dir.join("screenshots"),
            log_dir: dir.join("logs"),
            cycle_log: dir.join("logs/cycles.jsonl"),
            ..Config::default()
        }
    }

    pub fn library(classes: &[(&str, &image::GrayImage)]) -> TemplateLibrary {
        let templates = classes
            .iter()
            .filter_map(|(name, img)| {
                PreparedTemplate::new(*name, format!("{name}.png"), &DynamicImage::ImageLuma8((*img).clone()), 1)
            })
            .collect();
        TemplateLibrary::from_templates("mem", 1, templates)
    }

    pub fn scripted_session(
        config: Config,
        frames: Vec<DynamicImage>,
        cycle: bool,
        library: Option<TemplateLibrary>,
    ) -> (Arc<Session>, Arc<RecordingDriver>) {
        let input = Arc::new(RecordingDriver::default());
        let screen = Arc::new(ScriptedScreen {
            input: input.clone(),
            frames,
            cycle,
        });
        let session = Session::new(config, screen, input.clone(), library);
        (Arc::new(session), input)
    }
}
