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

//! Per-session expiry timer and cleanup bookkeeping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::session::{Session, SessionId};
use crate::status::{CleanupReason, SessionStatus};

/// Hook run during session teardown. Failures are collected, never fatal.
pub type CleanupCallback =
    Box<dyn Fn(&Session, CleanupReason) -> Result<(), String> + Send + Sync + 'static>;

/// Receives the report of every cleanup that actually ran.
pub trait CleanupObserver: Send + Sync {
    fn session_cleaned(&self, report: &CleanupReport);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReleasedResources {
    pub timers: u64,
    pub connections: u64,
    pub processes: u64,
    pub callbacks: u64,
}

impl ReleasedResources {
    fn add(&mut self, other: &ReleasedResources) {
        self.timers += other.timers;
        self.connections += other.connections;
        self.processes += other.processes;
        self.callbacks += other.callbacks;
    }
}

/// Result of one cleanup pass over a session.
#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub session_id: SessionId,
    pub reason: CleanupReason,
    pub previous_status: SessionStatus,
    pub final_status: SessionStatus,
    pub duration: Duration,
    pub released: ReleasedResources,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone)]
pub enum CleanupOutcome {
    Performed(CleanupReport),
    /// Another trigger won the race; nothing was released.
    AlreadyCleaned,
}

impl CleanupOutcome {
    pub fn performed(&self) -> bool {
        matches!(self, CleanupOutcome::Performed(_))
    }

    pub fn report(&self) -> Option<&CleanupReport> {
        match self {
            CleanupOutcome::Performed(report) => Some(report),
            CleanupOutcome::AlreadyCleaned => None,
        }
    }
}

/// Session-level cleanup counters. Only ever grow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupStats {
    pub cleanups: u64,
    pub total_duration: Duration,
    pub last_duration: Option<Duration>,
    pub last_reason: Option<CleanupReason>,
    pub released: ReleasedResources,
    pub errors: u64,
}

impl CleanupStats {
    pub fn record(&mut self, report: &CleanupReport) {
        self.cleanups += 1;
        self.total_duration += report.duration;
        self.last_duration = Some(report.duration);
        self.last_reason = Some(report.reason);
        self.released.add(&report.released);
        self.errors += report.errors.len() as u64;
    }
}

/// Manager-wide aggregate across every session ever cleaned.
#[derive(Debug, Default)]
pub struct ManagerCleanupStats {
    inner: Mutex<ManagerStatsSnapshot>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ManagerStatsSnapshot {
    pub total_cleanups: u64,
    pub by_reason: HashMap<CleanupReason, u64>,
    pub total_duration: Duration,
    pub released: ReleasedResources,
    pub errors: u64,
    pub expiry_sweeps: u64,
    pub memory_pressure_sweeps: u64,
    pub sessions_removed: u64,
}

impl ManagerCleanupStats {
    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        self.inner.lock().clone()
    }

    pub fn record_expiry_sweep(&self, removed: usize) {
        let mut stats = self.inner.lock();
        stats.expiry_sweeps += 1;
        stats.sessions_removed += removed as u64;
    }

    pub fn record_memory_sweep(&self, removed: usize) {
        let mut stats = self.inner.lock();
        stats.memory_pressure_sweeps += 1;
        stats.sessions_removed += removed as u64;
    }

    pub fn record_removed(&self, removed: usize) {
        self.inner.lock().sessions_removed += removed as u64;
    }
}

impl CleanupObserver for ManagerCleanupStats {
    fn session_cleaned(&self, report: &CleanupReport) {
        let mut stats = self.inner.lock();
        stats.total_cleanups += 1;
        *stats.by_reason.entry(report.reason).or_insert(0) += 1;
        stats.total_duration += report.duration;
        stats.released.add(&report.released);
        stats.errors += report.errors.len() as u64;
    }
}

struct TimerSlot {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// One rearm-able timer.
///
/// Arming replaces any pending timer. A timer that fires detaches itself
/// before running its callback, so the callback may rearm or cancel the
/// scheduler without aborting the task it is running on.
pub struct CleanupScheduler {
    slot: Mutex<TimerSlot>,
}

impl Default for CleanupScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl CleanupScheduler {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(TimerSlot {
                generation: 0,
                handle: None,
            }),
        }
    }

    /// Arm the timer to run `on_fire` after `delay`, replacing any pending
    /// one. Must be called within a tokio runtime.
    pub fn schedule<F, Fut>(self: &Arc<Self>, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let scheduler = Arc::clone(self);
        let mut slot = self.slot.lock();
        slot.generation += 1;
        let generation = slot.generation;
        if let Some(previous) = slot.handle.take() {
            previous.abort();
        }
        slot.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !scheduler.detach(generation) {
                return;
            }
            on_fire().await;
        }));
    }

    /// Claim the firing for `generation`. False if the timer was rearmed or
    /// cancelled while sleeping.
    fn detach(&self, generation: u64) -> bool {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return false;
        }
        slot.handle = None;
        true
    }

    /// Disarm. Returns true if a pending timer was released.
    pub fn cancel(&self) -> bool {
        let mut slot = self.slot.lock();
        slot.generation += 1;
        match slot.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot.lock().handle.is_some()
    }
}

impl Drop for CleanupScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().handle.take() {
            handle.abort();
        }
    }
}
