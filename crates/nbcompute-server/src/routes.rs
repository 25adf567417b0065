use crate::State;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::{Extension, Json};
use futures::stream::{self, Stream, StreamExt};
use nbcompute_control_plane::{
    Endpoint, Identity, InstanceSpecOverride, LifecycleState, SessionEvent, SessionHealth,
};
use nbcompute_controller::ControllerError;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct StartResponse {
    pub endpoint: Endpoint,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub identity: Identity,
    #[serde(flatten)]
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,
    pub attempt: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub health: SessionHealth,
    pub exit_code: Option<i32>,
}

pub async fn start_session(
    Extension(state): Extension<State>,
    Path(identity): Path<String>,
    payload: Option<Json<InstanceSpecOverride>>,
) -> Result<Json<StartResponse>, (StatusCode, String)> {
    let identity = parse_identity(identity)?;
    let overrides = payload.map(|Json(overrides)| overrides);

    // runs to completion even if the client disconnects
    let controller = state.controller.clone();
    let task_identity = identity.clone();
    let result = tokio::spawn(async move {
        controller
            .start(&task_identity, overrides.as_ref())
            .await
    })
    .await
    .map_err(|e| handle_anyhow_error("start_session", e.into()))?;

    match result {
        Ok(endpoint) => {
            info!(identity = %identity, endpoint = %endpoint, "session running");
            Ok(Json(StartResponse { endpoint }))
        }
        Err(e) => Err(handle_controller_error("start_session", &identity, e)),
    }
}

pub async fn stop_session(
    Extension(state): Extension<State>,
    Path(identity): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let identity = parse_identity(identity)?;

    let controller = state.controller.clone();
    let task_identity = identity.clone();
    tokio::spawn(async move { controller.stop(&task_identity).await })
        .await
        .map_err(|e| handle_anyhow_error("stop_session", e.into()))?;

    info!(identity = %identity, "session stopped");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_session(
    Extension(state): Extension<State>,
    Path(identity): Path<String>,
) -> Result<Json<StatusResponse>, (StatusCode, String)> {
    let identity = parse_identity(identity)?;
    let response = match state.controller.snapshot(&identity) {
        Some(snapshot) => StatusResponse {
            identity,
            state: snapshot.state,
            resource_id: snapshot.resource_id,
            endpoint: snapshot.endpoint,
            attempt: snapshot.attempt,
        },
        None => StatusResponse {
            identity,
            state: LifecycleState::Idle,
            resource_id: None,
            endpoint: None,
            attempt: 0,
        },
    };
    Ok(Json(response))
}

pub async fn session_health(
    Extension(state): Extension<State>,
    Path(identity): Path<String>,
) -> Result<Json<HealthResponse>, (StatusCode, String)> {
    let identity = parse_identity(identity)?;
    let health = state.controller.health(&identity).await;
    Ok(Json(HealthResponse {
        health,
        exit_code: health.exit_code(),
    }))
}

pub async fn record_activity(
    Extension(state): Extension<State>,
    Path(identity): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    let identity = parse_identity(identity)?;
    if state.controller.touch(&identity) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err((StatusCode::NOT_FOUND, format!("no session for {identity}")))
    }
}

/// Server-sent progress and state changes for one session.
pub async fn session_events(
    Extension(state): Extension<State>,
    Path(identity): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, (StatusCode, String)> {
    let identity = parse_identity(identity)?;
    let events = event_stream(state.controller.subscribe_events(&identity)).map(|event| {
        let name = match &event {
            SessionEvent::Progress(_) => "progress",
            SessionEvent::StateChanged { .. } => "state",
        };
        Event::default().event(name).json_data(&event).map_err(axum::Error::new)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Events from `rx` until the session is dropped; lagged subscribers skip ahead.
pub(crate) fn event_stream(
    rx: broadcast::Receiver<SessionEvent>,
) -> impl Stream<Item = SessionEvent> {
    stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => return Some((event, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
}

pub async fn health_check() -> Result<Json<()>, (StatusCode, String)> {
    Ok(Json(()))
}

fn parse_identity(raw: String) -> Result<Identity, (StatusCode, String)> {
    Identity::new(raw).map_err(|e| (StatusCode::BAD_REQUEST, format!("{e}")))
}

fn status_for(err: &ControllerError) -> StatusCode {
    match err {
        ControllerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        ControllerError::RemoteRejected(_) | ControllerError::AttachFailed(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ControllerError::RemoteUnavailable(_)
        | ControllerError::MalformedResponse(_)
        | ControllerError::NotFound(_)
        | ControllerError::InstanceFailed(_) => StatusCode::BAD_GATEWAY,
        ControllerError::Cancelled => StatusCode::CONFLICT,
    }
}

pub(crate) fn handle_controller_error(
    function: &str,
    identity: &Identity,
    err: ControllerError,
) -> (StatusCode, String) {
    let status = status_for(&err);
    warn!(identity = %identity, status = status.as_u16(), "Error in {function}: {err}");
    (status, format!("{err}"))
}

pub(crate) fn handle_anyhow_error(function: &str, err: anyhow::Error) -> (StatusCode, String) {
    error!("Error in {function}: {err:?}");
    (StatusCode::INTERNAL_SERVER_ERROR, format!("{err}"))
}
