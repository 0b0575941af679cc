use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

/// Long waits are split into slices of this length so a stop request is
/// noticed quickly.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BotPhase {
    Idle,
    Launching,
    Farming,
    Paused,
    Stopping,
}

impl BotPhase {
    pub fn is_active(self) -> bool {
        matches!(self, BotPhase::Launching | BotPhase::Farming)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CycleOutcome {
    Success,
    /// A required UI element was not on screen.
    NotFound(String),
    Stopped,
    Failed(String),
}

/// One farming cycle, also written to the cycle log.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cleanup_clicked: bool,
    pub token_clicked: bool,
    pub ad_started: bool,
    pub ad_closed: bool,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    pub fn is_success(&self) -> bool {
        self.outcome == CycleOutcome::Success
    }

    pub fn error(&self) -> Option<String> {
        match &self.outcome {
            CycleOutcome::Success | CycleOutcome::Stopped => None,
            CycleOutcome::NotFound(what) => Some(format!("{what} not found")),
            CycleOutcome::Failed(e) => Some(e.clone()),
        }
    }
}

pub struct BotStateInner {
    pub phase: BotPhase,
    /// Phase to return to when resuming from a pause.
    pub resume_phase: BotPhase,
    pub task: Option<JoinHandle<()>>,
    pub pause_notify: Arc<Notify>,
    pub greens_collected: u32,
    pub cycles_run: u32,
    pub last_cycle: Option<CycleReport>,
    pub last_error: Option<String>,
}

pub type BotState = Arc<Mutex<BotStateInner>>;

impl Default for BotStateInner {
    fn default() -> Self {
        Self::new()
    }
}

impl BotStateInner {
    pub fn new() -> Self {
        Self {
            phase: BotPhase::Idle,
            resume_phase: BotPhase::Farming,
            task: None,
            pause_notify: Arc::new(Notify::new()),
            greens_collected: 0,
            cycles_run: 0,
            last_cycle: None,
            last_error: None,
        }
    }

    pub fn record_cycle(&mut self, report: CycleReport) {
        self.cycles_run += 1;
        if report.is_success() {
            self.greens_collected += 1;
        }
        if let Some(err) = report.error() {
            self.last_error = Some(err);
        }
        self.last_cycle = Some(report);
    }
}

pub fn new_state() -> BotState {
    Arc::new(Mutex::new(BotStateInner::new()))
}

/// Move from `Idle` into `phase`. Returns false when something else is
/// already running.
pub async fn begin(state: &BotState, phase: BotPhase) -> bool {
    let mut s = state.lock().await;
    match s.phase {
        BotPhase::Idle => {
            s.phase = phase;
            s.last_error = None;
            true
        }
        _ => false,
    }
}

/// Check whether the current job should keep going. Blocks while paused.
/// Returns `true` for Launching/Farming, `false` once a stop was requested.
pub async fn check_should_continue(state: &BotState) -> bool {
    loop {
        let (phase, notify) = {
            let s = state.lock().await;
            (s.phase, s.pause_notify.clone())
        };
        match phase {
            BotPhase::Launching | BotPhase::Farming => return true,
            BotPhase::Paused => {
                tracing::info!("paused, waiting for resume");
                notify.notified().await;
            }
            _ => return false,
        }
    }
}

/// Sleep for `duration`, returning false early if a stop was requested.
pub async fn sleep_unless_stopped(state: &BotState, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if matches!(state.lock().await.phase, BotPhase::Stopping | BotPhase::Idle) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        sleep(SLEEP_SLICE.min(deadline - now)).await;
    }
}

/// Pause a running job or resume a paused one. Returns the new phase, or
/// `None` when there is nothing to pause.
pub async fn toggle_pause(state: &BotState) -> Option<BotPhase> {
    let mut s = state.lock().await;
    match s.phase {
        BotPhase::Launching | BotPhase::Farming => {
            s.resume_phase = s.phase;
            s.phase = BotPhase::Paused;
            tracing::info!("paused");
            Some(BotPhase::Paused)
        }
        BotPhase::Paused => {
            s.phase = s.resume_phase;
            s.pause_notify.notify_one();
            tracing::info!("resumed");
            Some(s.phase)
        }
        _ => None,
    }
}

/// Ask the running job to stop. Returns false when nothing was running.
pub async fn request_stop(state: &BotState) -> bool {
    let mut s = state.lock().await;
    match s.phase {
        BotPhase::Idle => false,
        BotPhase::Stopping => true,
        _ => {
            s.phase = BotPhase::Stopping;
            // wake a paused job so it can observe the stop
            s.pause_notify.notify_one();
            tracing::info!("stop requested");
            true
        }
    }
}

/// Mark the current job as finished.
pub async fn finish_task(state: &BotState, error: Option<String>) {
    let mut s = state.lock().await;
    s.phase = BotPhase::Idle;
    s.task = None;
    if error.is_some() {
        s.last_error = error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(success: bool) -> CycleReport {
        CycleReport {
            mode: "tokens".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            cleanup_clicked: false,
            token_clicked: success,
            ad_started: success,
            ad_closed: false,
            outcome: if success {
                CycleOutcome::Success
            } else {
                CycleOutcome::NotFound("token_pack".into())
            },
        }
    }

    #[tokio::test]
    async fn test_begin_only_from_idle() {
        let state = new_state();
        assert!(begin(&state, BotPhase::Farming).await);
        assert!(!begin(&state, BotPhase::Launching).await);
        finish_task(&state, None).await;
        assert!(begin(&state, BotPhase::Launching).await);
    }

    #[tokio::test]
    async fn test_toggle_pause_round_trip() {
        let state = new_state();
        assert_eq!(toggle_pause(&state).await, None);

        begin(&state, BotPhase::Launching).await;
        assert_eq!(toggle_pause(&state).await, Some(BotPhase::Paused));
        assert_eq!(toggle_pause(&state).await, Some(BotPhase::Launching));
        assert!(check_should_continue(&state).await);
    }

    #[tokio::test]
    async fn test_check_should_continue_blocks_while_paused() {
        let state = new_state();
        begin(&state, BotPhase::Farming).await;
        toggle_pause(&state).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { check_should_continue(&state).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        toggle_pause(&state).await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_wakes_paused_job() {
        let state = new_state();
        begin(&state, BotPhase::Farming).await;
        toggle_pause(&state).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { check_should_continue(&state).await })
        };
        tokio::task::yield_now().await;

        assert!(request_stop(&state).await);
        assert!(!waiter.await.unwrap());
        assert_eq!(state.lock().await.phase, BotPhase::Stopping);
    }

    #[tokio::test]
    async fn test_request_stop_when_idle() {
        let state = new_state();
        assert!(!request_stop(&state).await);
        assert_eq!(state.lock().await.phase, BotPhase::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs_full_duration() {
        let state = new_state();
        begin(&state, BotPhase::Farming).await;
        let start = Instant::now();
        assert!(sleep_unless_stopped(&state, Duration::from_secs(65)).await);
        assert!(start.elapsed() >= Duration::from_secs(65));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_returns_early_on_stop() {
        let state = new_state();
        begin(&state, BotPhase::Farming).await;

        let sleeper = {
            let state = state.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let finished = sleep_unless_stopped(&state, Duration::from_secs(65)).await;
                (finished, start.elapsed())
            })
        };

        sleep(Duration::from_secs(2)).await;
        request_stop(&state).await;

        let (finished, elapsed) = sleeper.await.unwrap();
        assert!(!finished);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_record_cycle_counts_greens() {
        let state = new_state();
        {
            let mut s = state.lock().await;
            s.record_cycle(report(true));
            s.record_cycle(report(false));
            s.record_cycle(report(true));
        }
        let s = state.lock().await;
        assert_eq!(s.cycles_run, 3);
        assert_eq!(s.greens_collected, 2);
        assert!(s.last_cycle.as_ref().is_some_and(|c| c.is_success()));
        assert_eq!(s.last_error.as_deref(), Some("token_pack not found"));
    }
}
