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

//! Error types for the feedback session engine.

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::session::SessionId;
use crate::status::{InvalidTransition, SessionStatus};

pub type Result<T> = std::result::Result<T, FeedbackError>;

#[derive(Debug, Error)]
pub enum FeedbackError {
    /// No free port after bounded probing. Fatal at startup.
    #[error("No free port found starting at {start} after {attempts} attempts")]
    PortExhausted { start: u16, attempts: u16 },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The superseded connection could not carry the update notification.
    #[error("Connection handoff failed: {0}")]
    HandoffFailed(String),

    #[error("Cleanup of session {session_id} failed during {operation}: {message}")]
    Cleanup {
        session_id: SessionId,
        operation: &'static str,
        message: String,
    },

    #[error("Session is already terminal ({status:?})")]
    SessionTerminal { status: SessionStatus },

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    #[error("Session {0} has no attached connection")]
    NoConnection(SessionId),

    #[error("A command is already running in this session")]
    CommandBusy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FeedbackError {
    pub fn session_not_found(id: impl ToString) -> Self {
        FeedbackError::SessionNotFound(id.to_string())
    }
}
