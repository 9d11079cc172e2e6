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

//! Wire protocol spoken over the per-session duplex connection.
//!
//! Every frame is a JSON object discriminated by its `type` field.
//!
//! ```text
//! front end                                   server
//!   | -- heartbeat {tabId, timestamp} -------->  |
//!   | <------- heartbeat_response {tabId, ...} - |
//!   | -- submit_feedback {feedback, ...} ------> |
//!   | <------------- feedback_received {...} --- |
//!   | <-- session_updated {session_info} ------- |  (handoff)
//!   | <-- session_cleanup {reason, message} ---- |  (teardown)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::{CleanupReason, SessionStatus};

/// One file attached to a feedback submission. The payload is opaque here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, alias = "type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Base64 encoded content as sent by the front end.
    #[serde(default)]
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// What the human sent back to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResult {
    pub feedback: String,
    #[serde(default, alias = "images")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub settings: serde_json::Value,
}

impl FeedbackResult {
    pub fn text(feedback: impl Into<String>) -> Self {
        Self {
            feedback: feedback.into(),
            attachments: Vec::new(),
            settings: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    SubmitFeedback(FeedbackResult),
    Heartbeat {
        #[serde(rename = "tabId", alias = "tab_id")]
        tab_id: String,
        #[serde(default)]
        timestamp: f64,
    },
    GetStatus,
    UserTimeout,
    RunCommand {
        command: String,
    },
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::SubmitFeedback(_) => "submit_feedback",
            InboundMessage::Heartbeat { .. } => "heartbeat",
            InboundMessage::GetStatus => "get_status",
            InboundMessage::UserTimeout => "user_timeout",
            InboundMessage::RunCommand { .. } => "run_command",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    ConnectionEstablished {
        session_id: String,
    },
    SessionUpdated {
        session_info: SessionInfo,
    },
    StatusUpdate {
        status_info: StatusInfo,
    },
    HeartbeatResponse {
        #[serde(rename = "tabId")]
        tab_id: String,
        timestamp: f64,
    },
    FeedbackReceived {
        message: String,
    },
    SessionCleanup {
        reason: CleanupReason,
        message: String,
    },
    CommandOutput {
        output: String,
    },
    CommandComplete {
        exit_code: Option<i32>,
    },
    Error {
        message: String,
    },
}

impl OutboundMessage {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundMessage::Error {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::ConnectionEstablished { .. } => "connection_established",
            OutboundMessage::SessionUpdated { .. } => "session_updated",
            OutboundMessage::StatusUpdate { .. } => "status_update",
            OutboundMessage::HeartbeatResponse { .. } => "heartbeat_response",
            OutboundMessage::FeedbackReceived { .. } => "feedback_received",
            OutboundMessage::SessionCleanup { .. } => "session_cleanup",
            OutboundMessage::CommandOutput { .. } => "command_output",
            OutboundMessage::CommandComplete { .. } => "command_complete",
            OutboundMessage::Error { .. } => "error",
        }
    }
}

/// Announcement of a (new) session, sent during handoff.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_directory: String,
    pub summary: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// Point-in-time view of a session for `status_update` and the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusInfo {
    pub session_id: String,
    pub status: SessionStatus,
    pub message: String,
    pub project_directory: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub has_result: bool,
    pub has_connection: bool,
    pub active_tabs: usize,
}
