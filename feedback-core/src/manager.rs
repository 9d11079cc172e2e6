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

//! Session manager: the single owner of the current feedback session.
//!
//! Creation is serialised behind an async lock. Replacing a session migrates
//! its live connection to the successor (handoff) instead of closing it.
//! Superseded and terminal sessions stay tracked until a sweep removes them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cleanup::{CleanupObserver, CleanupOutcome, ManagerCleanupStats, ManagerStatsSnapshot};
use crate::config::ManagerConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{FeedbackError, Result};
use crate::launcher::{NoopLauncher, SurfaceLauncher};
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::session::{Session, SessionId, SessionParams};
use crate::status::{CleanupReason, SessionStatus};
use crate::tabs::{ActiveTab, TabRegistry};

/// Submitted sessions idle longer than this go second under memory pressure.
const SUBMITTED_IDLE_EVICTION: Duration = Duration::from_secs(5 * 60);
/// Any session idle longer than this goes third under memory pressure.
const IDLE_EVICTION: Duration = Duration::from_secs(10 * 60);

/// How a connection handoff to a new session ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandoffOutcome {
    Reattached { connection_id: ConnectionId },
    /// `session_updated` could not be delivered; the next connection gets it.
    Failed { reason: String },
    /// The client reconnected on its own before reattachment.
    Superseded,
    /// The new session became terminal before reattachment.
    Rejected,
    /// A newer session took the connection over during the delay.
    Retargeted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled(SessionId),
    /// A heartbeat from a connection no session owns. Recorded, not answered.
    Unowned,
}

#[derive(Default)]
struct Registry {
    current: Option<SessionId>,
    sessions: HashMap<SessionId, Arc<Session>>,
}

pub struct SessionManager {
    config: ManagerConfig,
    creation: tokio::sync::Mutex<()>,
    registry: RwLock<Registry>,
    global_tabs: Arc<TabRegistry>,
    pending_update: Arc<AtomicBool>,
    handoff: Mutex<Option<JoinHandle<HandoffOutcome>>>,
    /// Connection between detach from the old session and reattach to the new.
    in_flight: Arc<Mutex<Option<Connection>>>,
    stats: Arc<ManagerCleanupStats>,
    launcher: Arc<dyn SurfaceLauncher>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_launcher(config, Arc::new(NoopLauncher))
    }

    pub fn with_launcher(config: ManagerConfig, launcher: Arc<dyn SurfaceLauncher>) -> Self {
        Self {
            config,
            creation: tokio::sync::Mutex::new(()),
            registry: RwLock::new(Registry::default()),
            global_tabs: Arc::new(TabRegistry::new()),
            pending_update: Arc::new(AtomicBool::new(false)),
            handoff: Mutex::new(None),
            in_flight: Arc::new(Mutex::new(None)),
            stats: Arc::new(ManagerCleanupStats::default()),
            launcher,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn tabs(&self) -> Arc<TabRegistry> {
        self.global_tabs.clone()
    }

    /// Observer to pass to sessions built outside [`Self::create_session`].
    pub fn observer(&self) -> Arc<dyn CleanupObserver> {
        self.stats.clone()
    }

    pub fn stats(&self) -> ManagerStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pending_update(&self) -> bool {
        self.pending_update.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        let registry = self.registry.read();
        registry
            .current
            .and_then(|id| registry.sessions.get(&id).cloned())
    }

    pub fn get(&self, id: SessionId) -> Result<Arc<Session>> {
        self.registry
            .read()
            .sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| FeedbackError::session_not_found(id))
    }

    pub fn tracked(&self) -> Vec<Arc<Session>> {
        self.registry.read().sessions.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.registry.read().sessions.len()
    }

    /// Register a session built elsewhere so sweeps see it. It does not
    /// become current.
    pub fn track(&self, session: Arc<Session>) {
        self.registry.write().sessions.insert(session.id(), session);
    }

    fn untrack(&self, id: SessionId) -> bool {
        let mut registry = self.registry.write();
        if registry.current == Some(id) {
            registry.current = None;
        }
        registry.sessions.remove(&id).is_some()
    }

    /// Replace the current session with a new one.
    ///
    /// The new session is current before the previous one has finished its
    /// teardown, so dropping this future never leaves a half-replaced
    /// session behind.
    pub async fn create_session(&self, params: SessionParams) -> Result<Arc<Session>> {
        let _creating = self.creation.lock().await;

        let previous = self.current();
        // A connection still in flight from an earlier handoff moves on to
        // the session created now.
        let handed_off = {
            let mut in_flight = self.in_flight.lock();
            previous
                .as_ref()
                .and_then(|previous| previous.take_connection())
                .or_else(|| in_flight.take())
        };
        let mut teardown = None;
        if let Some(previous) = &previous {
            self.global_tabs.merge(previous.tab_snapshot().iter());
            teardown = previous.start_cleanup(CleanupReason::Replaced);
            debug!(
                session_id = %previous.id(),
                handoff = handed_off.is_some(),
                "Replacing current session"
            );
        }

        let session = Session::new(
            params,
            &self.config.session,
            self.global_tabs.clone(),
            Some(self.observer()),
        );
        {
            let mut registry = self.registry.write();
            registry.sessions.insert(session.id(), session.clone());
            registry.current = Some(session.id());
        }
        info!(
            session_id = %session.id(),
            project_directory = session.project_directory(),
            "Feedback session created"
        );

        let handing_off = handed_off.is_some();
        if let Some(connection) = handed_off {
            self.spawn_handoff(session.clone(), connection);
        }

        if !handing_off && self.global_tabs.count_active() == 0 {
            self.launch_surface();
        } else {
            debug!(
                session_id = %session.id(),
                active_tabs = self.global_tabs.count_active(),
                "Live client present, skipping launch"
            );
        }

        if let Some(teardown) = teardown {
            if let Err(e) = teardown.await {
                error!(error = %e, "Replaced session teardown failed");
            }
        }
        Ok(session)
    }

    fn launch_surface(&self) {
        let Some(url) = self.config.frontend_url.as_deref() else {
            return;
        };
        if let Err(e) = self.launcher.launch(url) {
            warn!(url, error = %e, "Failed to launch feedback UI");
        }
    }

    fn spawn_handoff(&self, session: Arc<Session>, connection: Connection) {
        let delay = self.config.handoff_delay();
        let pending_update = self.pending_update.clone();
        let in_flight = self.in_flight.clone();
        *in_flight.lock() = Some(connection);

        let task = tokio::spawn(async move {
            let outcome = hand_off(&session, &in_flight, delay).await;
            match &outcome {
                HandoffOutcome::Reattached { connection_id } => {
                    info!(session_id = %session.id(), %connection_id, "Connection handed off");
                }
                HandoffOutcome::Failed { reason } => {
                    let err = FeedbackError::HandoffFailed(reason.clone());
                    warn!(session_id = %session.id(), error = %err, "Handoff failed, deferring update");
                    pending_update.store(true, Ordering::SeqCst);
                }
                other => {
                    debug!(session_id = %session.id(), outcome = ?other, "Handoff did not reattach");
                }
            }
            outcome
        });
        if let Some(previous) = self.handoff.lock().replace(task) {
            previous.abort();
        }
    }

    /// Wait for the most recent handoff to finish. `None` if there is none.
    pub async fn wait_for_handoff(&self) -> Option<HandoffOutcome> {
        let task = self.handoff.lock().take()?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => Some(HandoffOutcome::Failed {
                reason: e.to_string(),
            }),
        }
    }

    /// Attach a new inbound connection to the current session.
    pub fn attach_connection(&self, connection: Connection) -> Result<ConnectionId> {
        let Some(session) = self.current() else {
            debug!(connection_id = %connection.id(), "No current session, dropping connection");
            return Err(FeedbackError::session_not_found("current"));
        };
        if session.cleanup_started() {
            return Err(FeedbackError::SessionTerminal {
                status: session.status(),
            });
        }

        if self.pending_update.swap(false, Ordering::SeqCst) {
            let update = OutboundMessage::SessionUpdated {
                session_info: session.session_info(),
            };
            if let Err(e) = connection.send(update) {
                warn!(error = %e, "Failed to deliver deferred session update");
            }
        }
        connection.send(OutboundMessage::ConnectionEstablished {
            session_id: session.id().to_string(),
        })?;

        let outcome = session.attach_connection(connection)?;
        Ok(outcome.connection_id)
    }

    pub fn session_for_connection(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        self.registry
            .read()
            .sessions
            .values()
            .find(|session| session.connection_id() == Some(connection_id))
            .cloned()
    }

    /// Route an inbound frame to the session that owns `connection_id`.
    pub async fn dispatch(
        &self,
        connection_id: ConnectionId,
        message: InboundMessage,
    ) -> Result<DispatchOutcome> {
        if let Some(session) = self.session_for_connection(connection_id) {
            session.handle_message(message).await?;
            return Ok(DispatchOutcome::Handled(session.id()));
        }
        match message {
            InboundMessage::Heartbeat { tab_id, timestamp } => {
                self.global_tabs.heartbeat(&tab_id, timestamp);
                Ok(DispatchOutcome::Unowned)
            }
            other => {
                debug!(%connection_id, kind = other.kind(), "Message from unowned connection");
                Err(FeedbackError::session_not_found(format!(
                    "connection {}",
                    connection_id
                )))
            }
        }
    }

    /// The transport went away. The owning session keeps its status.
    pub fn connection_closed(&self, connection_id: ConnectionId) -> bool {
        match self.session_for_connection(connection_id) {
            Some(session) => {
                debug!(session_id = %session.id(), %connection_id, "Connection closed");
                session.detach_connection(connection_id)
            }
            None => false,
        }
    }

    /// Explicit cleanup, e.g. on a DELETE request. The session is untracked.
    pub async fn cleanup_session(
        &self,
        id: SessionId,
        reason: CleanupReason,
    ) -> Result<CleanupOutcome> {
        let session = self.get(id)?;
        let outcome = session.cleanup(reason).await;
        if self.untrack(id) {
            self.stats.record_removed(1);
        }
        Ok(outcome)
    }

    /// Expire idle sessions and drop terminal ones past the grace window.
    pub async fn cleanup_expired(&self) -> usize {
        let grace = self.config.terminal_grace();
        let now = Instant::now();
        let mut removed = 0;

        for session in self.tracked() {
            let remove = if session.is_terminal() {
                session
                    .terminal_at()
                    .map(|at| now.saturating_duration_since(at) > grace)
                    .unwrap_or(false)
            } else if session.is_expired() {
                session.cleanup(CleanupReason::Expired).await;
                true
            } else {
                false
            };
            if remove && self.untrack(session.id()) {
                removed += 1;
            }
        }

        let pruned = self.global_tabs.prune();
        self.stats.record_expiry_sweep(removed);
        if removed > 0 || pruned > 0 {
            info!(removed, pruned_tabs = pruned, "Expiry sweep finished");
        }
        removed
    }

    /// Sessions to evict under memory pressure, in eviction order.
    pub fn memory_pressure_candidates(&self, force: bool) -> Vec<Arc<Session>> {
        let current = self.registry.read().current;
        let mut ranked: Vec<(u8, Duration, Arc<Session>)> = self
            .tracked()
            .into_iter()
            .filter(|session| force || Some(session.id()) != current)
            .filter_map(|session| {
                let idle = session.idle_time();
                let class = if session.is_terminal() {
                    0
                } else if session.status() == SessionStatus::FeedbackSubmitted
                    && idle > SUBMITTED_IDLE_EVICTION
                {
                    1
                } else if idle > IDLE_EVICTION {
                    2
                } else {
                    return None;
                };
                Some((class, idle, session))
            })
            .collect();

        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        if !force {
            ranked.truncate(self.config.memory_cleanup_batch);
        }
        ranked.into_iter().map(|(_, _, session)| session).collect()
    }

    pub async fn cleanup_under_memory_pressure(&self, force: bool) -> usize {
        let candidates = self.memory_pressure_candidates(force);
        let mut removed = 0;
        for session in candidates {
            session.cleanup(CleanupReason::MemoryPressure).await;
            if self.untrack(session.id()) {
                removed += 1;
            }
        }
        self.stats.record_memory_sweep(removed);
        warn!(removed, force, "Memory pressure cleanup finished");
        removed
    }

    /// Run [`Self::cleanup_expired`] every `interval` until `cancel` fires or
    /// the manager shuts down.
    pub fn spawn_expiry_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = manager.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.cleanup_expired().await;
                    }
                }
            }
            debug!("Expiry sweeper stopped");
        })
    }

    /// Clean up every tracked session and stop background work.
    pub async fn shutdown(&self) -> usize {
        self.shutdown.cancel();
        if let Some(task) = self.handoff.lock().take() {
            task.abort();
        }
        drop(self.in_flight.lock().take());

        let sessions: Vec<Arc<Session>> = {
            let mut registry = self.registry.write();
            registry.current = None;
            registry.sessions.drain().map(|(_, session)| session).collect()
        };
        let count = sessions.len();
        for session in sessions {
            if let CleanupOutcome::Performed(report) =
                session.cleanup(CleanupReason::Shutdown).await
            {
                if !report.errors.is_empty() {
                    error!(session_id = %report.session_id, errors = ?report.errors, "Cleanup errors during shutdown");
                }
            }
        }
        self.stats.record_removed(count);
        info!(sessions = count, "Session manager shut down");
        count
    }

    pub fn register_tab(&self, tab_id: &str) {
        self.global_tabs.heartbeat(tab_id, chrono::Utc::now().timestamp() as f64);
    }

    pub fn active_tabs(&self) -> Vec<ActiveTab> {
        self.global_tabs.active()
    }

    pub fn count_active_tabs(&self) -> usize {
        self.global_tabs.count_active()
    }
}

async fn hand_off(
    session: &Session,
    in_flight: &Mutex<Option<Connection>>,
    delay: Duration,
) -> HandoffOutcome {
    let update = OutboundMessage::SessionUpdated {
        session_info: session.session_info(),
    };
    {
        let mut slot = in_flight.lock();
        let Some(connection) = slot.as_ref() else {
            return HandoffOutcome::Retargeted;
        };
        if let Err(e) = connection.send(update) {
            slot.take();
            return HandoffOutcome::Failed {
                reason: e.to_string(),
            };
        }
    }

    tokio::time::sleep(delay).await;

    // Held across the attach so a concurrent create_session cannot take the
    // connection half way.
    let mut slot = in_flight.lock();
    let Some(connection) = slot.take() else {
        return HandoffOutcome::Retargeted;
    };
    let connection_id = connection.id();
    if connection.is_closed() {
        // The client went away during the delay; its next socket gets the update.
        return HandoffOutcome::Failed {
            reason: FeedbackError::ConnectionClosed(connection_id).to_string(),
        };
    }
    match session.attach_if_vacant(connection) {
        Ok(true) => HandoffOutcome::Reattached { connection_id },
        Ok(false) => HandoffOutcome::Superseded,
        Err(_) => HandoffOutcome::Rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    use crate::config::SessionConfig;
    use crate::launcher::RecordingLauncher;
    use crate::protocol::FeedbackResult;

    fn manager() -> SessionManager {
        SessionManager::new(ManagerConfig::default())
    }

    fn params() -> SessionParams {
        SessionParams::new("/tmp/project", "Implemented the parser")
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_replaces_current() {
        let manager = manager();
        let first = manager.create_session(params()).await.unwrap();
        let second = manager.create_session(params()).await.unwrap();

        assert_eq!(manager.current().unwrap().id(), second.id());
        assert_eq!(first.status(), SessionStatus::Completed);
        assert_eq!(first.cleanup_reason(), Some(CleanupReason::Replaced));
        // Replaced sessions stay tracked until swept.
        assert_eq!(manager.session_count(), 2);
        assert!(manager.wait_for_handoff().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_sends_connection_established() {
        let manager = manager();
        let session = manager.create_session(params()).await.unwrap();
        let (conn, mut rx) = Connection::channel();
        let id = manager.attach_connection(conn).unwrap();

        assert_eq!(session.connection_id(), Some(id));
        match rx.recv().await {
            Some(OutboundMessage::ConnectionEstablished { session_id }) => {
                assert_eq!(session_id, session.id().to_string());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_without_session_rejected() {
        let manager = manager();
        let (conn, mut rx) = Connection::channel();
        assert!(matches!(
            manager.attach_connection(conn),
            Err(FeedbackError::SessionNotFound(_))
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_handoff_sets_pending_update() {
        let manager = manager();
        let first = manager.create_session(params()).await.unwrap();
        let (conn, rx) = Connection::channel();
        first.attach_connection(conn).unwrap();
        drop(rx);

        let second = manager.create_session(params()).await.unwrap();
        assert!(matches!(
            manager.wait_for_handoff().await,
            Some(HandoffOutcome::Failed { .. })
        ));
        assert!(manager.pending_update());

        let (conn, mut rx) = Connection::channel();
        manager.attach_connection(conn).unwrap();
        assert!(!manager.pending_update());
        match rx.recv().await {
            Some(OutboundMessage::SessionUpdated { session_info }) => {
                assert_eq!(session_info.session_id, second.id().to_string());
            }
            other => panic!("expected session_updated first, got {:?}", other),
        }
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::ConnectionEstablished { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_gone_during_delay_defers_update() {
        let manager = manager();
        let first = manager.create_session(params()).await.unwrap();
        let (conn, mut rx) = Connection::channel();
        first.attach_connection(conn).unwrap();

        let second = manager.create_session(params()).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::SessionUpdated { .. })
        ));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(rx);

        assert!(matches!(
            manager.wait_for_handoff().await,
            Some(HandoffOutcome::Failed { .. })
        ));
        assert!(!second.has_connection());
        assert!(!second.status_info().has_connection);
        assert!(manager.pending_update());

        let (conn, mut rx) = Connection::channel();
        manager.attach_connection(conn).unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::SessionUpdated { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_during_handoff_supersedes() {
        let manager = manager();
        let first = manager.create_session(params()).await.unwrap();
        let (old, mut old_rx) = Connection::channel();
        first.attach_connection(old).unwrap();

        let second = manager.create_session(params()).await.unwrap();
        let (fresh, _fresh_rx) = Connection::channel();
        let fresh_id = manager.attach_connection(fresh).unwrap();

        assert_eq!(
            manager.wait_for_handoff().await,
            Some(HandoffOutcome::Superseded)
        );
        assert_eq!(second.connection_id(), Some(fresh_id));
        assert!(matches!(
            old_rx.recv().await,
            Some(OutboundMessage::SessionUpdated { .. })
        ));
        assert!(old_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handoff_follows_newest_session() {
        let manager = manager();
        let first = manager.create_session(params()).await.unwrap();
        let (conn, mut rx) = Connection::channel();
        let conn_id = conn.id();
        first.attach_connection(conn).unwrap();

        // Both replacements land inside the handoff delay.
        let second = manager.create_session(params()).await.unwrap();
        let third = manager.create_session(params()).await.unwrap();

        assert_eq!(
            manager.wait_for_handoff().await,
            Some(HandoffOutcome::Reattached {
                connection_id: conn_id
            })
        );
        assert_eq!(third.connection_id(), Some(conn_id));
        assert!(second.connection_id().is_none());
        assert!(first.is_terminal() && second.is_terminal());

        let mut announced = Vec::new();
        let drained = loop {
            match rx.try_recv() {
                Ok(OutboundMessage::SessionUpdated { session_info }) => {
                    announced.push(session_info.session_id)
                }
                Ok(other) => panic!("unexpected frame {other:?}"),
                Err(err) => break err,
            }
        };
        assert!(matches!(drained, TryRecvError::Empty));
        assert_eq!(announced.last(), Some(&third.id().to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unowned_heartbeat_updates_global_tabs() {
        let manager = manager();
        let outcome = manager
            .dispatch(
                ConnectionId::new(),
                InboundMessage::Heartbeat {
                    tab_id: "orphan".to_string(),
                    timestamp: 1.0,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::Unowned);
        assert_eq!(manager.count_active_tabs(), 1);

        let err = manager
            .dispatch(ConnectionId::new(), InboundMessage::GetStatus)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedbackError::SessionNotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_closed_is_soft() {
        let manager = manager();
        let session = manager.create_session(params()).await.unwrap();
        let (conn, _rx) = Connection::channel();
        let id = manager.attach_connection(conn).unwrap();
        manager
            .dispatch(id, InboundMessage::GetStatus)
            .await
            .unwrap();
        assert!(manager.connection_closed(id));
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(!session.has_connection());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_session_untracks() {
        let manager = manager();
        let session = manager.create_session(params()).await.unwrap();
        let outcome = manager
            .cleanup_session(session.id(), CleanupReason::Manual)
            .await
            .unwrap();
        assert!(outcome.performed());
        assert!(manager.current().is_none());
        assert!(matches!(
            manager.get(session.id()),
            Err(FeedbackError::SessionNotFound(_))
        ));
        assert!(matches!(
            manager
                .cleanup_session(session.id(), CleanupReason::Manual)
                .await,
            Err(FeedbackError::SessionNotFound(_))
        ));
        assert_eq!(manager.stats().by_reason[&CleanupReason::Manual], 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_sweep_respects_terminal_grace() {
        let manager = manager();
        let first = manager.create_session(params()).await.unwrap();
        let _second = manager.create_session(params()).await.unwrap();
        assert!(first.is_terminal());

        assert_eq!(manager.cleanup_expired().await, 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(manager.cleanup_expired().await, 1);
        assert!(manager.get(first.id()).is_err());
        assert_eq!(manager.stats().expiry_sweeps, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_candidates_skip_current_unless_forced() {
        let manager = manager();
        let session = manager.create_session(params()).await.unwrap();
        session.submit_feedback(FeedbackResult::text("ok")).unwrap();
        tokio::time::advance(Duration::from_secs(400)).await;

        assert!(manager.memory_pressure_candidates(false).is_empty());
        let forced = manager.memory_pressure_candidates(true);
        assert_eq!(forced.len(), 1);
        assert_eq!(manager.cleanup_under_memory_pressure(true).await, 1);
        assert_eq!(session.status(), SessionStatus::Expired);
        assert!(manager.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_sweep_takes_bounded_batch_in_priority_order() {
        let config = ManagerConfig {
            session: SessionConfig {
                timeout_secs: 7200,
                max_idle_secs: 7200,
                ..SessionConfig::default()
            },
            ..ManagerConfig::default()
        };
        let manager = SessionManager::new(config.clone());
        let step = Duration::from_secs(60);
        let build = || {
            let session = Session::new(
                params(),
                &config.session,
                manager.tabs(),
                Some(manager.observer()),
            );
            manager.track(session.clone());
            session
        };

        let mut waiting = Vec::new();
        for _ in 0..3 {
            waiting.push(build());
            tokio::time::advance(step).await;
        }
        let mut submitted = Vec::new();
        for _ in 0..2 {
            let session = build();
            session.submit_feedback(FeedbackResult::text("ok")).unwrap();
            submitted.push(session);
            tokio::time::advance(step).await;
        }
        let mut terminal = Vec::new();
        for _ in 0..2 {
            let session = build();
            session.cleanup(CleanupReason::Manual).await;
            terminal.push(session);
            tokio::time::advance(step).await;
        }
        tokio::time::advance(Duration::from_secs(600)).await;

        let expected: Vec<SessionId> = terminal
            .iter()
            .chain(&submitted)
            .chain(&waiting)
            .map(|session| session.id())
            .collect();
        let ids = |sessions: Vec<Arc<Session>>| -> Vec<SessionId> {
            sessions.iter().map(|session| session.id()).collect()
        };
        assert_eq!(ids(manager.memory_pressure_candidates(true)), expected);
        assert_eq!(
            ids(manager.memory_pressure_candidates(false)),
            expected[..5].to_vec()
        );

        assert_eq!(manager.cleanup_under_memory_pressure(false).await, 5);
        assert_eq!(manager.session_count(), 2);
        assert!(manager.get(waiting[1].id()).is_ok());
        assert!(manager.get(waiting[2].id()).is_ok());
        assert_eq!(submitted[0].status(), SessionStatus::Expired);

        assert_eq!(manager.cleanup_under_memory_pressure(true).await, 2);
        assert_eq!(manager.session_count(), 0);
        assert_eq!(waiting[2].status(), SessionStatus::Expired);
        assert_eq!(manager.stats().memory_pressure_sweeps, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_only_without_live_tabs() {
        let launcher = Arc::new(RecordingLauncher::default());
        let config = ManagerConfig {
            frontend_url: Some("http://127.0.0.1:8765/".to_string()),
            ..ManagerConfig::default()
        };
        let manager = SessionManager::with_launcher(config, launcher.clone());

        manager.create_session(params()).await.unwrap();
        assert_eq!(launcher.launched().len(), 1);

        manager.register_tab("t1");
        manager.create_session(params()).await.unwrap();
        assert_eq!(launcher.launched().len(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        manager.create_session(params()).await.unwrap();
        assert_eq!(launcher.launched().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cleans_everything() {
        let manager = Arc::new(manager());
        let sweeper = manager.spawn_expiry_sweeper(Duration::from_secs(60), CancellationToken::new());
        let session = manager.create_session(params()).await.unwrap();
        let (conn, mut rx) = Connection::channel();
        manager.attach_connection(conn).unwrap();

        assert_eq!(manager.shutdown().await, 1);
        assert!(manager.current().is_none());
        assert_eq!(session.status(), SessionStatus::Completed);
        let _ = rx.recv().await; // connection_established
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::SessionCleanup {
                reason: CleanupReason::Shutdown,
                ..
            })
        ));
        sweeper.await.unwrap();
    }
}
