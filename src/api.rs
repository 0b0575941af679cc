use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::farmer::{FarmMode, Farmer};
use crate::launcher::Launcher;
use crate::screen;
use crate::session::{DetectionInfo, Session};
use crate::state::{self, BotPhase, BotState, CycleReport};

pub fn router(state: BotState, session: Arc<Session>) -> Router {
    Router::new()
        .route("/launch", post(launch))
        .route("/farm", post(farm))
        .route("/pause", post(pause))
        .route("/stop", post(stop))
        .route("/status", get(get_status))
        .route("/screenshot", get(get_screenshot))
        .route("/detect", get(detect))
        .with_state(ApiState { app: state, session })
}

#[derive(Clone)]
struct ApiState {
    app: BotState,
    session: Arc<Session>,
}

fn check_auth(headers: &HeaderMap, expected_token: Option<&str>) -> Result<(), StatusCode> {
    let Some(expected_token) = expected_token else {
        return Ok(());
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if let Some(token) = auth.strip_prefix("Bearer ")
        && token == expected_token
    {
        return Ok(());
    }

    Err(StatusCode::UNAUTHORIZED)
}

impl ApiState {
    fn authorize(&self, headers: &HeaderMap) -> Result<(), StatusCode> {
        check_auth(headers, self.session.config().auth_token.as_deref())
    }
}

async fn launch(State(api): State<ApiState>, headers: HeaderMap) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    let mut state = api.app.lock().await;
    if state.phase != BotPhase::Idle {
        return Err(StatusCode::CONFLICT);
    }
    state.phase = BotPhase::Launching;
    state.last_error = None;

    let app_state = api.app.clone();
    let launcher = Launcher::new(api.session.clone(), app_state.clone());
    let handle = tokio::spawn(async move {
        let error = match launcher.launch_game().await {
            Ok(()) => None,
            Err(e) => {
                tracing::error!("launch error: {e:#}");
                Some(format!("{e:#}"))
            }
        };
        state::finish_task(&app_state, error).await;
    });
    state.task = Some(handle);

    Ok(Json(json!({"status": "launching"})))
}

#[derive(Deserialize)]
struct FarmQuery {
    #[serde(default)]
    mode: FarmMode,
    rounds: Option<u32>,
}

async fn farm(
    State(api): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<FarmQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    if !api.session.has_detection() {
        tracing::warn!("farming requested without a template library");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let mut state = api.app.lock().await;
    if state.phase != BotPhase::Idle {
        return Err(StatusCode::CONFLICT);
    }
    state.phase = BotPhase::Farming;
    state.last_error = None;

    let rounds = query.rounds.unwrap_or(api.session.config().farming.rounds);
    let mode = query.mode;
    let app_state = api.app.clone();
    let farmer = Farmer::new(api.session.clone(), app_state.clone());
    let handle = tokio::spawn(async move {
        let greens = farmer.farm(mode, rounds).await;
        tracing::info!("farming task finished with {greens} green(s)");
        state::finish_task(&app_state, None).await;
    });
    state.task = Some(handle);

    Ok(Json(json!({"status": "started", "mode": mode, "rounds": rounds})))
}

async fn pause(State(api): State<ApiState>, headers: HeaderMap) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    match state::toggle_pause(&api.app).await {
        Some(BotPhase::Paused) => Ok(Json(json!({"status": "paused"}))),
        Some(_) => Ok(Json(json!({"status": "resumed"}))),
        None => Err(StatusCode::CONFLICT),
    }
}

async fn stop(State(api): State<ApiState>, headers: HeaderMap) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    if state::request_stop(&api.app).await {
        Ok(Json(json!({"status": "stopping"})))
    } else {
        Ok(Json(json!({"status": "idle"})))
    }
}

#[derive(Serialize)]
struct StatusResponse {
    phase: BotPhase,
    running: bool,
    paused: bool,
    greens_collected: u32,
    cycles_run: u32,
    last_cycle: Option<CycleReport>,
    last_error: Option<String>,
    detection: DetectionInfo,
}

async fn get_status(State(api): State<ApiState>, headers: HeaderMap) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    let state = api.app.lock().await;
    Ok(Json(StatusResponse {
        phase: state.phase,
        running: state.phase.is_active(),
        paused: state.phase == BotPhase::Paused,
        greens_collected: state.greens_collected,
        cycles_run: state.cycles_run,
        last_cycle: state.last_cycle.clone(),
        last_error: state.last_error.clone(),
        detection: api.session.detection_info(),
    }))
}

async fn get_screenshot(State(api): State<ApiState>, headers: HeaderMap) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    let screenshot = api.session.capture().await.map_err(|e| {
        tracing::error!("screenshot failed: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let png = screen::encode_png(&screenshot).map_err(|e| {
        tracing::error!("screenshot encoding failed: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

#[derive(Deserialize)]
struct DetectQuery {
    /// Comma-separated class names; all classes when absent.
    class: Option<String>,
    threshold: Option<f32>,
}

async fn detect(
    State(api): State<ApiState>,
    headers: HeaderMap,
    Query(query): Query<DetectQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    api.authorize(&headers)?;

    if !api.session.has_detection() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let classes: Vec<&str> = query
        .class
        .as_deref()
        .map(|c| c.split(',').map(str::trim).filter(|c| !c.is_empty()).collect())
        .unwrap_or_default();

    let detections = api.session.detect(&classes, query.threshold).await.map_err(|e| {
        tracing::error!("detection failed: {e:#}");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(detections))
}
