// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


use axum::{
    extract::{Path, Query, State},
    Json,
};
use feedback_core::{
    CleanupReason, CleanupReport, FeedbackResult, ManagerStatsSnapshot, SessionId, SessionInfo,
    SessionParams, StatusInfo, WaitOutcome,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use crate::api::{ApiError, AppState};

/// Request body for creating a feedback session
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub project_directory: String,
    pub summary: String,
    /// Overrides the configured request timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CreateSessionRequest {
    fn into_params(self) -> Result<SessionParams, ApiError> {
        if self.project_directory.trim().is_empty() {
            return Err(ApiError::BadRequest(
                "project_directory must not be empty".to_string(),
            ));
        }
        let mut params = SessionParams::new(self.project_directory, self.summary);
        if let Some(secs) = self.timeout_secs {
            if secs == 0 {
                return Err(ApiError::BadRequest(
                    "timeout_secs must be positive".to_string(),
                ));
            }
            params = params.with_timeout(Duration::from_secs(secs));
        }
        Ok(params)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitQuery {
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CleanupResponse {
    pub session_id: String,
    pub performed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<CleanupReport>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub tracked_sessions: usize,
    pub current_session: Option<String>,
    pub active_tabs: usize,
    pub cleanup: ManagerStatsSnapshot,
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid session id '{}': {}", raw, e)))
}

fn wait_response(
    session_id: SessionId,
    outcome: WaitOutcome,
) -> Result<Json<FeedbackResult>, ApiError> {
    match outcome {
        WaitOutcome::Submitted(result) => Ok(Json(result)),
        WaitOutcome::TimedOut => Err(ApiError::RequestTimeout(format!(
            "No feedback for session {} before the deadline",
            session_id
        ))),
        WaitOutcome::Cancelled(reason) => Err(ApiError::Conflict(format!(
            "Session {} ended without feedback: {}",
            session_id,
            reason.message()
        ))),
    }
}

/// POST /api/v1/sessions - Start a session, replacing the current one
#[tracing::instrument(skip(state, request), fields(project = %request.project_directory))]
pub async fn create_session(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<SessionInfo>, ApiError> {
    let params = request.into_params()?;
    let session = state.manager.create_session(params).await?;
    info!(session_id = %session.id(), project = %session.project_directory(), "Session created");
    Ok(Json(session.session_info()))
}

/// POST /api/v1/feedback - Start a session and wait for the human's answer
#[tracing::instrument(skip(state, request), fields(project = %request.project_directory))]
pub async fn collect_feedback(
    State(state): State<AppState>,
    Json(request): Json<CreateSessionRequest>,
) -> Result<Json<FeedbackResult>, ApiError> {
    let params = request.into_params()?;
    let session = state.manager.create_session(params).await?;
    info!(session_id = %session.id(), "Waiting for feedback");
    let outcome = session.wait_for_result(None).await;
    wait_response(session.id(), outcome)
}

/// GET /api/v1/sessions/current - Status of the current session
pub async fn current_session(State(state): State<AppState>) -> Result<Json<StatusInfo>, ApiError> {
    state
        .manager
        .current()
        .map(|session| Json(session.status_info()))
        .ok_or_else(|| ApiError::NotFound("No current session".to_string()))
}

/// POST /api/v1/sessions/:id/wait - Block until the session resolves
#[tracing::instrument(skip(state))]
pub async fn wait_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<FeedbackResult>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let session = state.manager.get(session_id)?;
    let outcome = session
        .wait_for_result(query.timeout_secs.map(Duration::from_secs))
        .await;
    wait_response(session_id, outcome)
}

/// DELETE /api/v1/sessions/:id - Close a session and stop tracking it
#[tracing::instrument(skip(state))]
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CleanupResponse>, ApiError> {
    let session_id = parse_session_id(&id)?;
    let outcome = state
        .manager
        .cleanup_session(session_id, CleanupReason::Manual)
        .await?;
    Ok(Json(CleanupResponse {
        session_id: session_id.to_string(),
        performed: outcome.performed(),
        report: outcome.report().cloned(),
    }))
}

/// GET /api/v1/stats - Manager-wide cleanup counters
pub async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let manager = &state.manager;
    Json(StatsResponse {
        tracked_sessions: manager.session_count(),
        current_session: manager.current().map(|session| session.id().to_string()),
        active_tabs: manager.count_active_tabs(),
        cleanup: manager.stats(),
    })
}
