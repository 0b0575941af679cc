use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio::time::Duration;

use crate::detector::Point;
use crate::input::{Key, Keystroke};
use crate::session::Session;
use crate::state::{self, BotState};

const TYPE_INTERVAL: Duration = Duration::from_millis(50);

/// Drives the emulator from the desktop to the running game.
pub struct Launcher {
    session: Arc<Session>,
    state: BotState,
}

impl Launcher {
    pub fn new(session: Arc<Session>, state: BotState) -> Self {
        Self { session, state }
    }

    /// Launch the emulator and the game, then wait for it to be ready.
    pub async fn launch_game(&self) -> Result<()> {
        self.launch_emulator().await?;

        let launch = &self.session.config().launch;
        tracing::info!("waiting for the game to load");
        self.wait_for_emulator_ready(Duration::from_secs(launch.final_ready_timeout_secs))
            .await?;
        self.wait(Duration::from_secs(5)).await?;

        tracing::info!("game ready");
        Ok(())
    }

    /// Run the launch sequence. On failure a `launch_error` screenshot is
    /// saved before the error is returned.
    pub async fn launch_emulator(&self) -> Result<()> {
        tracing::info!("starting emulator launch sequence");
        match self.launch_sequence().await {
            Ok(()) => {
                tracing::info!("emulator launch sequence completed");
                Ok(())
            }
            Err(e) => {
                tracing::error!("emulator launch failed: {e:#}");
                let name = crate::screen::timestamped_name("launch_error");
                if let Err(shot_err) = self.session.save_screenshot(Some(&name)).await {
                    tracing::warn!("failed to save launch error screenshot: {shot_err:#}");
                }
                Err(e)
            }
        }
    }

    async fn launch_sequence(&self) -> Result<()> {
        let launch = &self.session.config().launch;

        self.step(1, "opening start menu");
        self.open_start_menu().await?;

        self.step(2, "searching for the emulator");
        self.session
            .type_keys(vec![Keystroke::Text(launch.search_text.clone())], TYPE_INTERVAL)
            .await?;
        self.wait(Duration::from_secs(2)).await?;
        self.session
            .type_keys(vec![Keystroke::Key(Key::Enter)], Duration::ZERO)
            .await?;

        self.step(3, "waiting for the emulator window");
        self.wait_for_emulator_ready(Duration::from_secs(launch.ready_timeout_secs))
            .await?;

        self.step(4, "navigating to the emulator home screen");
        let home = self.image(&launch.emulator_home)?;
        match self.session.locate_image(&home).await? {
            Some(point) => {
                self.click(point).await?;
                self.wait(Duration::from_secs(2)).await?;
            }
            None => tracing::warn!("home button not found, continuing"),
        }

        self.step(5, "launching the game");
        self.wait(Duration::from_secs(5)).await?;
        let game = self.image(&launch.game_icon)?;
        let point = self
            .session
            .locate_image(&game)
            .await?
            .context("game icon not found on screen")?;
        self.click(point).await?;
        self.wait(Duration::from_secs(3)).await?;

        Ok(())
    }

    async fn open_start_menu(&self) -> Result<()> {
        let launch = &self.session.config().launch;
        for icon in [&launch.start_icon_dark, &launch.start_icon_light] {
            let path = self.session.config().image_path(icon);
            if !path.exists() {
                tracing::debug!("start icon {} missing", path.display());
                continue;
            }
            if let Some(point) = self.session.locate_image(&path).await? {
                tracing::debug!("start icon found: {}", path.display());
                self.click(point).await?;
                self.wait(Duration::from_secs(1)).await?;
                return Ok(());
            }
        }
        bail!("start menu icon not found on screen")
    }

    /// Wait for the emulator window image. Without the image file a fixed
    /// fallback wait is used; a timeout is logged and ignored.
    pub async fn wait_for_emulator_ready(&self, timeout: Duration) -> Result<bool> {
        let launch = &self.session.config().launch;
        let window = self.session.config().image_path(&launch.emulator_window);

        if !window.exists() {
            tracing::warn!(
                "emulator window image {} missing, waiting {}s instead",
                window.display(),
                launch.fallback_wait_secs
            );
            self.wait(Duration::from_secs(launch.fallback_wait_secs)).await?;
            return Ok(true);
        }

        let ready = self.session.wait_for_image(&window, timeout).await?;
        if !ready {
            tracing::warn!("emulator not detected as ready within {}s, proceeding anyway", timeout.as_secs());
        }
        Ok(ready)
    }

    /// Press a key combination, e.g. an emulator shortcut.
    pub async fn send_key_combination(&self, keys: Vec<Key>) -> Result<()> {
        self.session.send_key_combination(keys).await
    }

    /// Resolve a launch image that must exist on disk.
    fn image(&self, relative: &Path) -> Result<PathBuf> {
        let path = self.session.config().image_path(relative);
        if !path.exists() {
            bail!("image not found: {}", path.display());
        }
        Ok(path)
    }

    /// Blocks while paused.
    async fn ensure_running(&self) -> Result<()> {
        if !state::check_should_continue(&self.state).await {
            bail!("launch stopped");
        }
        Ok(())
    }

    async fn wait(&self, duration: Duration) -> Result<()> {
        self.ensure_running().await?;
        if !state::sleep_unless_stopped(&self.state, duration).await {
            bail!("launch stopped");
        }
        self.ensure_running().await
    }

    async fn click(&self, point: Point) -> Result<()> {
        self.ensure_running().await?;
        self.session.click_at(point).await
    }

    fn step(&self, n: u32, what: &str) {
        tracing::info!("step {n}/5: {what}");
    }
}
