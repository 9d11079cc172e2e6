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

//! Feedback Core
//!
//! Session lifecycle and connection handoff engine for interactive feedback
//! requests. One [`SessionManager`] owns at most one current [`Session`];
//! transports plug in through [`Connection`].

pub mod cleanup;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod launcher;
pub mod manager;
pub mod memory;
pub mod port;
pub mod protocol;
pub mod session;
pub mod status;
pub mod tabs;

pub use cleanup::{
    CleanupObserver, CleanupOutcome, CleanupReport, CleanupStats, ManagerStatsSnapshot,
    ReleasedResources,
};
pub use config::{ManagerConfig, SessionConfig};
pub use connection::{Connection, ConnectionId};
pub use error::{FeedbackError, Result};
pub use launcher::{BrowserLauncher, NoopLauncher, SurfaceLauncher};
pub use manager::{DispatchOutcome, HandoffOutcome, SessionManager};
pub use memory::{MemoryConfig, MemoryPressureMonitor, MemorySampler, PressureLevel, SysinfoSampler};
pub use port::{PortAllocator, PortReservation, ReclaimPolicy};
pub use protocol::{Attachment, FeedbackResult, InboundMessage, OutboundMessage, SessionInfo, StatusInfo};
pub use session::{Session, SessionId, SessionParams, WaitOutcome};
pub use status::{CleanupReason, SessionStatus};
pub use tabs::{ActiveTab, TabRegistry};
