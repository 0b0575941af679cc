use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;

use crate::session::Session;
use crate::state::{self, BotState, CycleOutcome, CycleReport};

pub const TOKEN_PACK: &str = "token_pack";
pub const WATCH_ADS: &str = "watch_ads_general";
pub const SKIP_AD: &str = "skip_ad";
pub const CLOSE_AD: &str = "close_ad";

/// Anything that dismisses a leftover popup.
pub const CLEANUP_CLASSES: [&str; 5] = ["close_ad", "close", "skip_ad", "skip", "x_button"];

const AFTER_CLICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum FarmError {
    #[error("{0} not found on screen")]
    NotFound(&'static str),

    #[error("stopped")]
    Stopped,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FarmMode {
    /// Open the token pack from the shop, then watch its ad.
    #[default]
    Tokens,
    /// Watch ads offered on the player screen.
    Player,
}

impl fmt::Display for FarmMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FarmMode::Tokens => f.write_str("tokens"),
            FarmMode::Player => f.write_str("player"),
        }
    }
}

/// Flags collected while a cycle runs.
#[derive(Debug, Default)]
struct Progress {
    cleanup_clicked: bool,
    token_clicked: bool,
    ad_started: bool,
    ad_closed: bool,
}

fn log_cycle(path: &Path, report: &CycleReport) {
    use std::fs::OpenOptions;
    use std::io::Write;

    let line = match serde_json::to_string(report) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!("failed to serialize cycle report: {e}");
            return;
        }
    };

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        tracing::warn!("failed to create {}: {e}", parent.display());
    }

    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{line}") {
                tracing::warn!("failed to write to {}: {e}", path.display());
            }
        }
        Err(e) => {
            tracing::warn!("failed to open {}: {e}", path.display());
        }
    }
}

/// Watches in-game ads for rewards.
pub struct Farmer {
    session: Arc<Session>,
    state: BotState,
}

impl Farmer {
    pub fn new(session: Arc<Session>, state: BotState) -> Self {
        Self { session, state }
    }

    /// Sleep, then hold here while paused.
    async fn wait(&self, duration: Duration) -> Result<(), FarmError> {
        if !state::sleep_unless_stopped(&self.state, duration).await {
            return Err(FarmError::Stopped);
        }
        self.ensure_running().await
    }

    async fn ensure_running(&self) -> Result<(), FarmError> {
        if state::check_should_continue(&self.state).await {
            Ok(())
        } else {
            Err(FarmError::Stopped)
        }
    }

    /// Click the best match among `classes`. Returns false when nothing was
    /// found or the attempt failed.
    pub async fn handle_ads(&self, classes: &[&str]) -> bool {
        match self.try_click(classes, None).await {
            Ok(true) => true,
            Ok(false) => {
                tracing::info!("no ads found for {classes:?}");
                false
            }
            Err(FarmError::Stopped) => false,
            Err(e) => {
                tracing::error!("error handling ads: {e:#}");
                false
            }
        }
    }

    async fn try_click(&self, classes: &[&str], threshold: Option<f32>) -> Result<bool, FarmError> {
        self.ensure_running().await?;
        let Some(best) = self.session.best_match(classes, threshold).await? else {
            return Ok(false);
        };
        self.ensure_running().await?;
        tracing::info!("clicking {} ({:.2})", best.class_name, best.confidence);
        self.session.click_at(best.center()).await?;
        tokio::time::sleep(AFTER_CLICK).await;
        Ok(true)
    }

    /// Token mode: open the token pack, then watch the ad it offers.
    pub async fn start_farming(&self) -> Result<(), FarmError> {
        self.start_farming_with(&mut Progress::default()).await
    }

    async fn start_farming_with(&self, progress: &mut Progress) -> Result<(), FarmError> {
        self.ensure_running().await?;

        if !self.try_click(&[TOKEN_PACK], None).await? {
            tracing::warn!("token icon not found");
            self.debug_screenshot("token_icon_not_found").await;
            return Err(FarmError::NotFound(TOKEN_PACK));
        }
        progress.token_clicked = true;

        let watch = Duration::from_secs(self.session.config().farming.ad_watch_secs);
        self.watch_ad_sequence(watch, progress).await
    }

    /// Player mode: watch the ad offered on the player screen.
    pub async fn farm_token_player(&self) -> Result<(), FarmError> {
        self.farm_token_player_with(&mut Progress::default()).await
    }

    async fn farm_token_player_with(&self, progress: &mut Progress) -> Result<(), FarmError> {
        self.ensure_running().await?;
        let watch = Duration::from_secs(self.session.config().farming.player_ad_watch_secs);
        self.watch_ad_sequence(watch, progress).await
    }

    async fn watch_ad_sequence(&self, watch: Duration, progress: &mut Progress) -> Result<(), FarmError> {
        let farming = &self.session.config().farming;

        self.wait(Duration::from_secs(farming.settle_secs)).await?;

        if !self.try_click(&[WATCH_ADS], None).await? {
            tracing::warn!("watch ads button not found");
            self.debug_screenshot("watch_ads_not_found").await;
            return Err(FarmError::NotFound(WATCH_ADS));
        }
        progress.ad_started = true;

        self.wait(Duration::from_secs(farming.post_click_secs)).await?;
        tracing::info!("watching ad for {}s", watch.as_secs());
        self.wait(watch).await?;

        if self.handle_ads(&[SKIP_AD]).await {
            tracing::info!("ad skipped, waiting for the second ad");
            self.wait(Duration::from_secs(farming.second_ad_secs)).await?;
            if self.handle_ads(&[CLOSE_AD]).await {
                progress.ad_closed = true;
                self.follow_up().await?;
            }
        } else if self.handle_ads(&[CLOSE_AD]).await {
            progress.ad_closed = true;
            self.follow_up().await?;
        } else {
            tracing::warn!("could not skip or close the ad");
        }

        Ok(())
    }

    /// After an ad closes, start the next one if offered, otherwise let the
    /// current one finish and dismiss it.
    async fn follow_up(&self) -> Result<(), FarmError> {
        let config = self.session.config();
        let farming = &config.farming;

        match self.try_click(&[WATCH_ADS], Some(config.recheck_confidence)).await {
            Ok(true) => {
                tracing::info!("another ad offered");
                self.wait(Duration::from_secs(farming.post_click_secs)).await?;
                return Ok(());
            }
            Ok(false) => {}
            Err(FarmError::Stopped) => return Err(FarmError::Stopped),
            Err(e) => tracing::warn!("recheck for more ads failed: {e:#}"),
        }

        self.wait(Duration::from_secs(farming.second_ad_secs)).await?;
        if !self.handle_ads(&[CLOSE_AD]).await {
            self.handle_ads(&[SKIP_AD]).await;
        }
        Ok(())
    }

    /// Dismiss leftovers, then run one farming sequence. The report is
    /// recorded in the bot state and appended to the cycle log.
    pub async fn run_farming_cycle(&self, mode: FarmMode) -> CycleReport {
        let started_at = Utc::now();
        let mut progress = Progress::default();
        tracing::info!("starting {mode} farming cycle");

        progress.cleanup_clicked = self.handle_ads(&CLEANUP_CLASSES).await;
        if progress.cleanup_clicked {
            tracing::info!("dismissed a leftover popup");
        }

        let result = match mode {
            FarmMode::Tokens => self.start_farming_with(&mut progress).await,
            FarmMode::Player => self.farm_token_player_with(&mut progress).await,
        };

        let outcome = match result {
            Ok(()) => CycleOutcome::Success,
            Err(FarmError::NotFound(what)) => CycleOutcome::NotFound(what.to_string()),
            Err(FarmError::Stopped) => CycleOutcome::Stopped,
            Err(FarmError::Other(e)) => CycleOutcome::Failed(format!("{e:#}")),
        };

        let report = CycleReport {
            mode: mode.to_string(),
            started_at,
            finished_at: Utc::now(),
            cleanup_clicked: progress.cleanup_clicked,
            token_clicked: progress.token_clicked,
            ad_started: progress.ad_started,
            ad_closed: progress.ad_closed,
            outcome,
        };

        log_cycle(&self.session.config().cycle_log, &report);
        self.state.lock().await.record_cycle(report.clone());
        report
    }

    /// Repeat cycles until stopped, a required element is missing, or
    /// `max_greens` ads were watched. Returns the greens collected.
    pub async fn continuous_farming(&self, mode: FarmMode, interval: Duration) -> u32 {
        let max_greens = self.session.config().farming.max_greens;
        let mut greens = 0;
        tracing::info!("continuous {mode} farming, up to {max_greens} greens");

        while greens < max_greens {
            if !state::check_should_continue(&self.state).await {
                break;
            }

            let report = self.run_farming_cycle(mode).await;
            match report.outcome {
                CycleOutcome::Success => {
                    greens += 1;
                    tracing::info!("cycle complete, greens collected: {greens}/{max_greens}");
                }
                CycleOutcome::NotFound(ref what) => {
                    tracing::warn!("{what} not found, ending farming round");
                    break;
                }
                CycleOutcome::Stopped => break,
                CycleOutcome::Failed(ref e) => {
                    tracing::error!("farming cycle failed: {e}");
                    self.debug_screenshot("farming_error").await;
                }
            }

            if greens >= max_greens {
                tracing::info!("reached {max_greens} greens");
                break;
            }
            if !state::sleep_unless_stopped(&self.state, interval).await {
                break;
            }
        }

        tracing::info!("farming round finished with {greens} green(s)");
        greens
    }

    /// Run up to `rounds` farming rounds. Returns the total greens collected.
    pub async fn farm(&self, mode: FarmMode, rounds: u32) -> u32 {
        let farming = &self.session.config().farming;
        let interval = Duration::from_secs(farming.cycle_interval_secs);
        let mut total = 0;

        for round in 1..=rounds {
            if !state::check_should_continue(&self.state).await {
                break;
            }
            tracing::info!("farming round {round}/{rounds}");
            total += self.continuous_farming(mode, interval).await;

            if round < rounds && !state::sleep_unless_stopped(&self.state, Duration::from_secs(farming.settle_secs)).await {
                break;
            }
        }

        tracing::info!("farming finished, {total} green(s) collected");
        total
    }

    pub async fn stop_farming(&self) {
        if state::request_stop(&self.state).await {
            tracing::info!("farming stop requested");
        }
    }

    async fn debug_screenshot(&self, prefix: &str) {
        if let Err(e) = self.session.save_debug_screenshot(prefix).await {
            tracing::warn!("failed to save debug screenshot: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;
    use crate::detector::testing::*;
    use crate::screen::count_with_prefix;
    use crate::session::testing::*;
    use crate::state::BotPhase;

    async fn farming_state() -> BotState {
        let state = state::new_state();
        state::begin(&state, BotPhase::Farming).await;
        state
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_cycle_closes_ad() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let cycle_log = config.cycle_log.clone();
        let (frame, plus, block) = (frame_template(20), plus_template(20), block_template(20));
        let lib = library(&[(TOKEN_PACK, &block), (WATCH_ADS, &frame), (CLOSE_AD, &plus)]);

        let frames = vec![
            scene(200, 150, &[(&block, 100, 60)]),
            scene(200, 150, &[(&frame, 40, 40)]),
            scene(200, 150, &[(&plus, 150, 100)]),
            scene(200, 150, &[]),
        ];
        let (session, input) = scripted_session(config, frames, false, Some(lib));
        let state = farming_state().await;
        let farmer = Farmer::new(session, state.clone());

        let start = Instant::now();
        let report = farmer.run_farming_cycle(FarmMode::Tokens).await;

        assert_eq!(report.outcome, CycleOutcome::Success);
        assert!(!report.cleanup_clicked);
        assert!(report.token_clicked && report.ad_started && report.ad_closed);
        assert_eq!(input.clicks(), vec![(110, 70), (50, 50), (160, 110)]);
        // settle + post click + ad + second ad wait in follow up
        assert!(start.elapsed() >= Duration::from_secs(5 + 3 + 65 + 65));

        let s = state.lock().await;
        assert_eq!(s.greens_collected, 1);
        drop(s);

        let log = std::fs::read_to_string(cycle_log).unwrap();
        let entry: serde_json::Value = serde_json::from_str(log.trim()).unwrap();
        assert_eq!(entry["mode"], "tokens");
        assert_eq!(entry["outcome"]["status"], "success");
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_icon_saves_debug_screenshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let screenshots = config.screenshot_dir.clone();
        let lib = library(&[(TOKEN_PACK, &block_template(20))]);
        let (session, input) = scripted_session(config, vec![scene(100, 100, &[])], false, Some(lib));
        let farmer = Farmer::new(session, farming_state().await);

        let report = farmer.run_farming_cycle(FarmMode::Tokens).await;
        assert_eq!(report.outcome, CycleOutcome::NotFound(TOKEN_PACK.into()));
        assert!(input.clicks().is_empty());
        assert_eq!(count_with_prefix(&screenshots, "token_icon_not_found"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_player_cycle_skips_then_watches_next_ad() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (frame, plus, block) = (frame_template(20), plus_template(20), block_template(20));
        let lib = library(&[(WATCH_ADS, &frame), (CLOSE_AD, &plus), (SKIP_AD, &block)]);

        let frames = vec![
            scene(200, 150, &[(&frame, 20, 20)]),
            scene(200, 150, &[(&block, 170, 10)]),
            scene(200, 150, &[(&plus, 170, 10)]),
            scene(200, 150, &[(&frame, 20, 20)]),
            scene(200, 150, &[]),
        ];
        let (session, input) = scripted_session(config, frames, false, Some(lib));
        let farmer = Farmer::new(session, farming_state().await);

        let report = farmer.run_farming_cycle(FarmMode::Player).await;
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert!(!report.token_clicked);
        assert!(report.ad_closed);
        assert_eq!(input.clicks(), vec![(30, 30), (180, 20), (180, 20), (30, 30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_pass_dismisses_leftover_popup() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (frame, plus) = (frame_template(20), plus_template(20));
        let lib = library(&[(WATCH_ADS, &frame), ("x_button", &plus)]);

        let frames = vec![
            scene(200, 150, &[(&plus, 0, 0)]),
            scene(200, 150, &[]),
        ];
        let (session, input) = scripted_session(config, frames, false, Some(lib));
        let farmer = Farmer::new(session, farming_state().await);

        let report = farmer.run_farming_cycle(FarmMode::Player).await;
        assert!(report.cleanup_clicked);
        assert_eq!(report.outcome, CycleOutcome::NotFound(WATCH_ADS.into()));
        assert_eq!(input.clicks(), vec![(10, 10)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_farming_stops_at_max_greens() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.farming.max_greens = 2;
        let (frame, plus) = (frame_template(20), plus_template(20));
        let lib = library(&[(WATCH_ADS, &frame), (CLOSE_AD, &plus)]);

        let frames = vec![
            scene(200, 150, &[(&frame, 20, 20)]),
            scene(200, 150, &[(&plus, 150, 100)]),
        ];
        let (session, _) = scripted_session(config, frames, true, Some(lib));
        let state = farming_state().await;
        let farmer = Farmer::new(session, state.clone());

        let greens = farmer.continuous_farming(FarmMode::Player, Duration::from_secs(5)).await;
        assert_eq!(greens, 2);

        let s = state.lock().await;
        assert_eq!(s.cycles_run, 2);
        assert_eq!(s.greens_collected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_farm_rounds_end_when_nothing_to_watch() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let screenshots = config.screenshot_dir.clone();
        let lib = library(&[(WATCH_ADS, &frame_template(20))]);
        let (session, _) = scripted_session(config, vec![scene(100, 100, &[])], false, Some(lib));
        let state = farming_state().await;
        let farmer = Farmer::new(session, state.clone());

        let total = farmer.farm(FarmMode::Player, 3).await;
        assert_eq!(total, 0);
        assert_eq!(state.lock().await.cycles_run, 3);
        assert_eq!(count_with_prefix(&screenshots, "watch_ads_not_found"), 3);
        assert!(screenshots.join("watch_ads_not_found_2.png").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_interrupts_ad_wait() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (frame, plus) = (frame_template(20), plus_template(20));
        let lib = library(&[(WATCH_ADS, &frame), (CLOSE_AD, &plus)]);
        let frames = vec![
            scene(200, 150, &[(&frame, 20, 20)]),
            scene(200, 150, &[(&plus, 150, 100)]),
        ];
        let (session, _) = scripted_session(config, frames, false, Some(lib));
        let state = farming_state().await;
        let farmer = Arc::new(Farmer::new(session, state.clone()));

        let task = {
            let farmer = farmer.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let greens = farmer.farm(FarmMode::Player, 5).await;
                (greens, start.elapsed())
            })
        };

        tokio::time::sleep(Duration::from_secs(30)).await;
        farmer.stop_farming().await;

        let (greens, elapsed) = task.await.unwrap();
        assert_eq!(greens, 0);
        assert!(elapsed < Duration::from_secs(61));

        let s = state.lock().await;
        assert_eq!(s.phase, BotPhase::Stopping);
        assert_eq!(s.last_cycle.as_ref().map(|c| c.outcome.clone()), Some(CycleOutcome::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_mid_ad_holds_clicks_until_resumed() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let (frame, plus, block) = (frame_template(20), plus_template(20), block_template(20));
        let lib = library(&[(TOKEN_PACK, &block), (WATCH_ADS, &frame), (CLOSE_AD, &plus)]);
        let frames = vec![
            scene(200, 150, &[(&block, 100, 60)]),
            scene(200, 150, &[(&frame, 40, 40)]),
            scene(200, 150, &[(&plus, 150, 100)]),
            scene(200, 150, &[]),
        ];
        let (session, input) = scripted_session(config, frames, false, Some(lib));
        let state = farming_state().await;
        let farmer = Arc::new(Farmer::new(session, state.clone()));

        let task = {
            let farmer = farmer.clone();
            tokio::spawn(async move { farmer.run_farming_cycle(FarmMode::Tokens).await })
        };

        // token pack and watch ads clicked, ad now playing
        while input.clicks().len() < 2 {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert_eq!(state::toggle_pause(&state).await, Some(BotPhase::Paused));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(input.clicks().len(), 2);
        assert!(!task.is_finished());
        assert_eq!(state.lock().await.phase, BotPhase::Paused);

        assert_eq!(state::toggle_pause(&state).await, Some(BotPhase::Farming));
        let report = task.await.unwrap();
        assert_eq!(report.outcome, CycleOutcome::Success);
        assert_eq!(input.clicks(), vec![(110, 70), (50, 50), (160, 110)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycles_save_error_screenshot_and_continue() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let screenshots = config.screenshot_dir.clone();
        // no template library: every detection fails
        let (session, _) = scripted_session(config, vec![scene(50, 50, &[])], false, None);
        let state = farming_state().await;
        let farmer = Arc::new(Farmer::new(session, state.clone()));

        let task = {
            let farmer = farmer.clone();
            tokio::spawn(async move { farmer.continuous_farming(FarmMode::Tokens, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_secs(12)).await;
        farmer.stop_farming().await;
        assert_eq!(task.await.unwrap(), 0);

        let s = state.lock().await;
        assert!(s.cycles_run >= 1);
        assert!(matches!(s.last_cycle.as_ref().map(|c| &c.outcome), Some(CycleOutcome::Failed(_))));
        drop(s);
        assert!(count_with_prefix(&screenshots, "farming_error") >= 1);
    }

    #[test]
    fn test_farm_mode_names() {
        assert_eq!(FarmMode::Tokens.to_string(), "tokens");
        let mode: FarmMode = serde_json::from_str("\"player\"").unwrap();
        assert_eq!(mode, FarmMode::Player);
    }
}
