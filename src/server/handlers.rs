//! HTTP request handlers for API endpoints

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::header,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::Utc;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use super::state::{AppState, PanelSession, MAX_SESSIONS};
use crate::panel::{PanelPhase, PanelState, TrafficAnalysisPanel};
use crate::reporting::{Notice, NoticeLog};
use crate::traffic::{parse_date_time, DateRange};

/// Health check endpoint
///
/// Returns a simple status response to verify the server is running
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok"
    }))
}

/// Optional date window carried by several requests
#[derive(Debug, Default, Deserialize)]
pub struct RangeRequest {
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl RangeRequest {
    /// Parses an optional JSON body; an empty body means no override.
    fn from_body(body: &Bytes) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(RangeRequest::default());
        }
        Ok(serde_json::from_slice(body)?)
    }

    /// Overrides the ends of `current` that the request names.
    fn resolve(&self, current: DateRange) -> Result<DateRange, ApiError> {
        let start = match &self.start {
            Some(value) => parse_date_time(value)?,
            None => current.start,
        };
        let end = match &self.end {
            Some(value) => parse_date_time(value)?,
            None => current.end,
        };
        let range = DateRange::new(start, end);
        if !range.is_valid() {
            return Err(ApiError::InvalidDateRange(
                "Start date must be before or equal to end date".to_string(),
            ));
        }
        Ok(range)
    }

    fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Request to select an application
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRequest {
    pub application_name: String,
}

/// Request to select an experiment
#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    pub experiment: String,
    #[serde(flatten)]
    pub range: RangeRequest,
}

/// Session snapshot returned by most endpoints
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub created_at: String,
    pub state: PanelState,
    pub notices: Vec<Notice>,
    pub stream_url: String,
}

impl SessionResponse {
    fn from_session(session: &PanelSession) -> Self {
        SessionResponse {
            session_id: session.id.to_string(),
            created_at: session.created_at.to_rfc3339(),
            state: session.panel.snapshot(),
            notices: session.notices.notices(),
            stream_url: format!("/sessions/{}/stream", session.id),
        }
    }
}

/// Response for session deletion
#[derive(Debug, Serialize)]
pub struct CloseSessionResponse {
    pub session_id: String,
    pub status: String,
    pub message: String,
}

fn parse_session_id(session_id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(session_id)
        .map_err(|_| ApiError::InvalidParameter("Invalid session ID".to_string()))
}

async fn find_session(state: &AppState, session_id: &str) -> Result<PanelSession, ApiError> {
    let id = parse_session_id(session_id)?;
    state.session(id).await.ok_or(ApiError::SessionNotFound(id))
}

/// POST /sessions - Open a new panel session
///
/// The panel loads the accessible applications and, when possible, the
/// experiments of the default application before the response is sent.
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SessionResponse>, ApiError> {
    let request = RangeRequest::from_body(&body)?;
    if state.sessions.read().await.len() >= MAX_SESSIONS {
        return Err(ApiError::SessionLimitReached);
    }

    let range = request.resolve(DateRange::default_window())?;
    let notices = Arc::new(NoticeLog::new());
    let panel = TrafficAnalysisPanel::open(
        state.service.clone(),
        notices.clone(),
        state.preferences.clone(),
        range,
    )
    .await;

    let session = PanelSession {
        id: Uuid::new_v4(),
        panel: Arc::new(panel),
        notices,
        created_at: Utc::now(),
    };

    let mut sessions = state.sessions.write().await;
    if sessions.len() >= MAX_SESSIONS {
        return Err(ApiError::SessionLimitReached);
    }
    sessions.insert(session.id, session.clone());
    drop(sessions);

    tracing::info!(session_id = %session.id, "opened panel session");
    Ok(Json(SessionResponse::from_session(&session)))
}

/// GET /sessions/{session_id} - Current panel state and notices
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    Ok(Json(SessionResponse::from_session(&session)))
}

/// DELETE /sessions/{session_id} - Close a panel session
///
/// Work still in flight for the session is discarded.
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<CloseSessionResponse>, ApiError> {
    let id = parse_session_id(&session_id)?;
    let session = state
        .sessions
        .write()
        .await
        .remove(&id)
        .ok_or(ApiError::SessionNotFound(id))?;

    session.panel.close();
    tracing::info!(session_id = %id, "closed panel session");

    Ok(Json(CloseSessionResponse {
        session_id: id.to_string(),
        status: PanelPhase::Closed.to_string(),
        message: "Panel session closed".to_string(),
    }))
}

/// PUT /sessions/{session_id}/application - Select an application
pub async fn select_application(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<ApplicationRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    session
        .panel
        .select_application(&request.application_name)
        .await?;
    Ok(Json(SessionResponse::from_session(&session)))
}

/// POST /sessions/{session_id}/reload - Reload the experiments of the
/// selected application
pub async fn reload_experiments(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    session.panel.load_experiments(true).await?;
    Ok(Json(SessionResponse::from_session(&session)))
}

/// POST /sessions/{session_id}/selection - Select an experiment and build
/// its traffic table
pub async fn select_experiment(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SelectionRequest>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let range = request.range.resolve(session.panel.snapshot().range)?;
    session
        .panel
        .select_experiment(&request.experiment, range)
        .await?;
    Ok(Json(SessionResponse::from_session(&session)))
}

/// POST /sessions/{session_id}/refresh - Rebuild the table of the selected
/// experiment, optionally over a new date window
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    body: Bytes,
) -> Result<Json<SessionResponse>, ApiError> {
    let request = RangeRequest::from_body(&body)?;
    let session = find_session(&state, &session_id).await?;
    if !request.is_empty() {
        let range = request.resolve(session.panel.snapshot().range)?;
        session.panel.set_range(range)?;
    }
    session.panel.refresh().await?;
    Ok(Json(SessionResponse::from_session(&session)))
}

/// DELETE /sessions/{session_id}/notices - Acknowledge notices
///
/// Returns the notices raised so far and removes them from the session.
pub async fn acknowledge_notices(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Vec<Notice>>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    Ok(Json(session.notices.drain()))
}

/// GET /sessions/{session_id}/table.csv - The traffic table as CSV
pub async fn export_table(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let table = session
        .panel
        .snapshot()
        .table
        .ok_or_else(|| ApiError::Conflict("No traffic table has been built yet".to_string()))?;
    let csv = table.to_csv()?;
    Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv))
}

/// GET /sessions/{session_id}/stream - SSE stream of panel states
///
/// Sends the current state first, then one `state` event per transition.
/// The stream ends once the panel is closed.
pub async fn handle_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = find_session(&state, &session_id).await?;
    let mut updates = session.panel.subscribe();
    let id = session.id;
    drop(session);

    let stream = async_stream::stream! {
        let mut snapshot = updates.borrow_and_update().clone();
        loop {
            match Event::default().event("state").json_data(&snapshot) {
                Ok(event) => yield Ok::<Event, Infallible>(event),
                Err(err) => tracing::warn!(session_id = %id, error = %err, "could not encode panel state"),
            }
            if snapshot.phase == PanelPhase::Closed || updates.changed().await.is_err() {
                break;
            }
            snapshot = updates.borrow_and_update().clone();
        }
        tracing::debug!(session_id = %id, "panel stream finished");
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
