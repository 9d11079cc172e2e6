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

//! Feedback session lifecycle state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Waiting,
    Active,
    FeedbackSubmitted,
    Completed,
    Timeout,
    Error,
    Expired,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed
                | SessionStatus::Timeout
                | SessionStatus::Error
                | SessionStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::FeedbackSubmitted => "feedback_submitted",
            SessionStatus::Completed => "completed",
            SessionStatus::Timeout => "timeout",
            SessionStatus::Error => "error",
            SessionStatus::Expired => "expired",
        }
    }

    /// Short text shown to the front end alongside the status.
    pub fn default_message(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "Waiting for user feedback",
            SessionStatus::Active => "Session active",
            SessionStatus::FeedbackSubmitted => "Feedback submitted",
            SessionStatus::Completed => "Session completed",
            SessionStatus::Timeout => "Session timed out",
            SessionStatus::Error => "Session failed",
            SessionStatus::Expired => "Session expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A connection is attached and the first protocol message arrived.
    Activate,
    Submit,
    TimeOut,
    Expire,
    Fail,
    /// Replaced by a newer session, closed manually, or shut down.
    Close,
}

#[derive(Debug, Error)]
#[error("Invalid transition: {current:?} -> {event:?}")]
pub struct InvalidTransition {
    pub current: SessionStatus,
    pub event: SessionEvent,
}

impl SessionStatus {
    pub fn transition(self, event: SessionEvent) -> Result<SessionStatus, InvalidTransition> {
        use SessionEvent::*;
        use SessionStatus::*;

        let next = match (self, event) {
            (Waiting, Activate) => Active,
            (Waiting | Active, Submit) => FeedbackSubmitted,
            (s, TimeOut) if !s.is_terminal() => Timeout,
            (s, Expire) if !s.is_terminal() => Expired,
            (s, Fail) if !s.is_terminal() => Error,
            (s, Close) if !s.is_terminal() => Completed,
            _ => {
                return Err(InvalidTransition {
                    current: self,
                    event,
                })
            }
        };

        Ok(next)
    }
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    Timeout,
    Expired,
    MemoryPressure,
    Manual,
    Error,
    Shutdown,
    /// A newer session took over. Never sent on the wire: the connection is
    /// handed off instead of being told to close.
    Replaced,
}

impl CleanupReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CleanupReason::Timeout => "timeout",
            CleanupReason::Expired => "expired",
            CleanupReason::MemoryPressure => "memory_pressure",
            CleanupReason::Manual => "manual",
            CleanupReason::Error => "error",
            CleanupReason::Shutdown => "shutdown",
            CleanupReason::Replaced => "replaced",
        }
    }

    pub fn event(self) -> SessionEvent {
        match self {
            CleanupReason::Timeout => SessionEvent::TimeOut,
            CleanupReason::Expired | CleanupReason::MemoryPressure => SessionEvent::Expire,
            CleanupReason::Error => SessionEvent::Fail,
            CleanupReason::Manual | CleanupReason::Shutdown | CleanupReason::Replaced => {
                SessionEvent::Close
            }
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CleanupReason::Timeout => "The feedback request timed out",
            CleanupReason::Expired => "The session expired after being idle",
            CleanupReason::MemoryPressure => "The session was closed to free memory",
            CleanupReason::Manual => "The session was closed",
            CleanupReason::Error => "The session was closed after an error",
            CleanupReason::Shutdown => "The server is shutting down",
            CleanupReason::Replaced => "A new feedback request replaced this session",
        }
    }
}

impl std::fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
