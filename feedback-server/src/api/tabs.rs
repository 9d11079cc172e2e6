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


use axum::{extract::State, Json};
use feedback_core::ActiveTab;
use serde::{Deserialize, Serialize};

use crate::api::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct TabsResponse {
    pub active: usize,
    pub tabs: Vec<ActiveTab>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterTabRequest {
    pub tab_id: String,
}

/// GET /api/v1/tabs - Tabs heard from within the liveness threshold
pub async fn list_tabs(State(state): State<AppState>) -> Json<TabsResponse> {
    let tabs = state.manager.active_tabs();
    Json(TabsResponse {
        active: tabs.len(),
        tabs,
    })
}

/// POST /api/v1/tabs - Register a tab without a socket
#[tracing::instrument(skip(state))]
pub async fn register_tab(
    State(state): State<AppState>,
    Json(request): Json<RegisterTabRequest>,
) -> Result<Json<TabsResponse>, ApiError> {
    let tab_id = request.tab_id.trim();
    if tab_id.is_empty() {
        return Err(ApiError::BadRequest("tab_id must not be empty".to_string()));
    }
    state.manager.register_tab(tab_id);
    Ok(list_tabs(State(state)).await)
}
