use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::input::ClickType;

/// Template library location used when nothing else is configured.
pub const DEFAULT_DETECTION_DIR: &str = "models/templates";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("configuration invalid: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Timers and limits for the farming loop. All durations are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmingConfig {
    pub cycle_interval_secs: u64,
    pub max_greens: u32,
    pub rounds: u32,
    /// Ad playback time after the token pack was clicked.
    pub ad_watch_secs: u64,
    /// Ad playback time in player mode.
    pub player_ad_watch_secs: u64,
    pub second_ad_secs: u64,
    pub settle_secs: u64,
    pub post_click_secs: u64,
}

impl Default for FarmingConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 5,
            max_greens: 25,
            rounds: 5,
            ad_watch_secs: 65,
            player_ad_watch_secs: 61,
            second_ad_secs: 65,
            settle_secs: 5,
            post_click_secs: 3,
        }
    }
}

/// Images and timeouts for the emulator launch sequence.
/// Image paths are relative to `images_dir` unless absolute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub start_icon_dark: PathBuf,
    pub start_icon_light: PathBuf,
    pub emulator_home: PathBuf,
    pub game_icon: PathBuf,
    pub emulator_window: PathBuf,
    pub search_text: String,
    pub ready_timeout_secs: u64,
    pub final_ready_timeout_secs: u64,
    pub fallback_wait_secs: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            start_icon_dark: PathBuf::from("Windows/start_icon_dark_mode.png"),
            start_icon_light: PathBuf::from("Windows/start_icon_light_mode.png"),
            emulator_home: PathBuf::from("BlueStacks/BlueStack_homeButton.png"),
            game_icon: PathBuf::from("BlueStacks/top_eleven.png"),
            emulator_window: PathBuf::from("BlueStacks/bluestacks_window.png"),
            search_text: "BlueStacks".into(),
            ready_timeout_secs: 60,
            final_ready_timeout_secs: 120,
            fallback_wait_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pause after each scripted input action (seconds).
    pub delay: f64,
    pub confidence: f32,
    /// Stricter threshold used when checking whether another ad is offered.
    pub recheck_confidence: f32,
    /// Pointer travel time (seconds).
    pub move_duration: f64,
    pub images_dir: PathBuf,
    pub log_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub target_image: String,
    pub click_type: ClickType,
    pub detection_enabled: bool,
    pub detection_dir: Option<PathBuf>,
    pub scale_down: u32,
    pub hotkeys_enabled: bool,
    pub listen_addr: String,
    pub auth_token: Option<String>,
    pub cycle_log: PathBuf,
    pub farming: FarmingConfig,
    pub launch: LaunchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delay: 0.1,
            confidence: 0.65,
            recheck_confidence: 0.8,
            move_duration: 0.2,
            images_dir: PathBuf::from("images"),
            log_dir: PathBuf::from("logs"),
            screenshot_dir: PathBuf::from("screenshots"),
            target_image: "ProductLogo.png".into(),
            click_type: ClickType::Default,
            detection_enabled: true,
            detection_dir: None,
            scale_down: 2,
            hotkeys_enabled: true,
            listen_addr: "127.0.0.1:8090".into(),
            auth_token: None,
            cycle_log: PathBuf::from("logs/cycles.jsonl"),
            farming: FarmingConfig::default(),
            launch: LaunchConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file. Missing keys fall back to their
    /// defaults; a missing file yields the default configuration.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::warn!(
                "config file {} not found, using default settings",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from file, then apply `ELEVENBOT_*` environment overrides.
    pub fn from_file_and_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ELEVENBOT_CONFIDENCE") {
            self.confidence = v.trim().parse().map_err(|e| ConfigError::InvalidValue {
                key: "ELEVENBOT_CONFIDENCE".into(),
                reason: format!("{v}: {e}"),
            })?;
        }
        if let Some(v) = lookup("ELEVENBOT_DETECTION_DIR") {
            self.detection_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("ELEVENBOT_LOG_DIR") {
            self.log_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ELEVENBOT_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("ELEVENBOT_AUTH_TOKEN") {
            self.auth_token = Some(v).filter(|t| !t.is_empty());
        }
        Ok(())
    }

    /// Check every value and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues = Vec::new();

        if !(0.01..=5.0).contains(&self.delay) {
            issues.push(format!("delay ({}) should be between 0.01 and 5.0", self.delay));
        }
        if !(0.1..=1.0).contains(&self.confidence) {
            issues.push(format!(
                "confidence ({}) should be between 0.1 and 1.0",
                self.confidence
            ));
        }
        if !(0.1..=1.0).contains(&self.recheck_confidence) {
            issues.push(format!(
                "recheck_confidence ({}) should be between 0.1 and 1.0",
                self.recheck_confidence
            ));
        }
        if !(0.01..=2.0).contains(&self.move_duration) {
            issues.push(format!(
                "move_duration ({}) should be between 0.01 and 2.0",
                self.move_duration
            ));
        }
        if !(1..=8).contains(&self.scale_down) {
            issues.push(format!("scale_down ({}) should be between 1 and 8", self.scale_down));
        }
        if self.farming.max_greens == 0 {
            issues.push("farming.max_greens must be at least 1".into());
        }
        if self.farming.rounds == 0 {
            issues.push("farming.rounds must be at least 1".into());
        }

        if is_blank(&self.images_dir) {
            issues.push("images_dir cannot be empty".into());
        } else if !self.images_dir.exists() {
            issues.push(format!(
                "images_dir '{}' does not exist",
                self.images_dir.display()
            ));
        }
        if is_blank(&self.log_dir) {
            issues.push("log_dir cannot be empty".into());
        }
        if self.target_image.trim().is_empty() {
            issues.push("target_image cannot be empty".into());
        }

        for issue in &issues {
            tracing::error!("config validation error: {issue}");
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues))
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, json + "\n").map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("configuration saved to {}", path.display());
        Ok(())
    }

    /// Set top-level keys from a JSON map. Returns the keys that are not
    /// configuration fields; those are skipped with a warning.
    pub fn apply_updates(&mut self, updates: &Map<String, Value>) -> Result<Vec<String>, ConfigError> {
        let mut current = match serde_json::to_value(&*self) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(e) => {
                return Err(ConfigError::InvalidValue {
                    key: "<config>".into(),
                    reason: e.to_string(),
                });
            }
        };

        let mut unknown = Vec::new();
        for (key, value) in updates {
            if current.contains_key(key) {
                tracing::info!("updated config: {key} = {value}");
                current.insert(key.clone(), value.clone());
            } else {
                tracing::warn!("unknown config key: {key}");
                unknown.push(key.clone());
            }
        }

        *self = serde_json::from_value(Value::Object(current)).map_err(|e| {
            ConfigError::InvalidValue {
                key: updates.keys().cloned().collect::<Vec<_>>().join(","),
                reason: e.to_string(),
            }
        })?;

        Ok(unknown)
    }

    /// Resolve a launch image against `images_dir`.
    pub fn image_path(&self, relative: &Path) -> PathBuf {
        if relative.is_absolute() {
            relative.to_path_buf()
        } else {
            self.images_dir.join(relative)
        }
    }

    /// Pick the template library directory.
    ///
    /// Order: CLI override, configured `detection_dir`, the
    /// `ELEVENBOT_DETECTION_DIR` variable, then [`DEFAULT_DETECTION_DIR`].
    /// Only directories that exist are accepted.
    pub fn resolve_detection_dir(&self, cli_override: Option<&Path>) -> Option<PathBuf> {
        self.resolve_detection_dir_with(cli_override, |name| std::env::var(name).ok())
    }

    pub fn resolve_detection_dir_with<F>(
        &self,
        cli_override: Option<&Path>,
        lookup: F,
    ) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = cli_override
            && path.is_dir()
        {
            return Some(path.to_path_buf());
        }

        if !self.detection_enabled {
            tracing::info!("detection disabled in config");
            return None;
        }

        if let Some(ref configured) = self.detection_dir {
            if configured.is_dir() {
                return Some(configured.clone());
            }
            tracing::warn!("configured detection_dir not found: {}", configured.display());
        }

        if let Some(env_dir) = lookup("ELEVENBOT_DETECTION_DIR").map(PathBuf::from)
            && env_dir.is_dir()
        {
            return Some(env_dir);
        }

        let fallback = PathBuf::from(DEFAULT_DETECTION_DIR);
        if fallback.is_dir() {
            return Some(fallback);
        }

        tracing::error!("no template library directory found");
        None
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Config(delay={}, confidence={}, move_duration={}, images_dir='{}', log_dir='{}', target_image='{}', click_type={:?}, scale_down={})",
            self.delay,
            self.confidence,
            self.move_duration,
            self.images_dir.display(),
            self.log_dir.display(),
            self.target_image,
            self.click_type,
            self.scale_down,
        )
    }
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().to_string_lossy().trim().is_empty()
}
