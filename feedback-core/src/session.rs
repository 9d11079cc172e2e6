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

//! One feedback request and everything it owns.
//!
//! A [`Session`] holds the lifecycle state machine, the write-once result,
//! at most one attached [`Connection`], at most one running command and its
//! own expiry timer. Every teardown path funnels into [`Session::cleanup`],
//! which releases resources exactly once.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cleanup::{
    CleanupCallback, CleanupObserver, CleanupOutcome, CleanupReport, CleanupScheduler,
    CleanupStats, ReleasedResources,
};
use crate::command::{OutputSink, RunningCommand, Termination};
use crate::config::SessionConfig;
use crate::connection::{Connection, ConnectionId};
use crate::error::{FeedbackError, Result};
use crate::protocol::{FeedbackResult, InboundMessage, OutboundMessage, SessionInfo, StatusInfo};
use crate::status::{CleanupReason, SessionEvent, SessionStatus};
use crate::tabs::TabRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What the agent supplies when it asks for feedback.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionParams {
    pub project_directory: String,
    pub summary: String,
    /// Overrides the configured request deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl SessionParams {
    pub fn new(project_directory: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            project_directory: project_directory.into(),
            summary: summary.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// How a wait on a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Submitted(FeedbackResult),
    TimedOut,
    Cancelled(CleanupReason),
}

#[derive(Debug, Clone, PartialEq)]
enum Completion {
    Pending,
    Submitted(FeedbackResult),
    Terminated(CleanupReason),
}

impl Completion {
    fn outcome(&self) -> Option<WaitOutcome> {
        match self {
            Completion::Pending => None,
            Completion::Submitted(result) => Some(WaitOutcome::Submitted(result.clone())),
            Completion::Terminated(CleanupReason::Timeout) => Some(WaitOutcome::TimedOut),
            Completion::Terminated(reason) => Some(WaitOutcome::Cancelled(*reason)),
        }
    }
}

/// Result of attaching a connection to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOutcome {
    pub connection_id: ConnectionId,
    /// A previously attached connection that was closed to make room.
    pub replaced: Option<ConnectionId>,
}

enum TimerAction {
    Idle,
    Cleanup(CleanupReason),
    Rearm(Duration),
}

struct SessionState {
    status: SessionStatus,
    status_message: String,
    last_activity: Instant,
    connection: Option<Connection>,
    result: Option<FeedbackResult>,
    active_tabs: HashMap<String, Instant>,
    command: Option<RunningCommand>,
    cleanup_started: bool,
    terminal_at: Option<Instant>,
    cleanup_reason: Option<CleanupReason>,
}

pub struct Session {
    id: SessionId,
    project_directory: String,
    summary: String,
    created_at: Instant,
    created_at_utc: DateTime<Utc>,
    timeout: Duration,
    config: SessionConfig,
    state: Mutex<SessionState>,
    completion: watch::Sender<Completion>,
    scheduler: Arc<CleanupScheduler>,
    callbacks: Mutex<Vec<CleanupCallback>>,
    stats: Mutex<CleanupStats>,
    observer: Option<Arc<dyn CleanupObserver>>,
    tabs: Arc<TabRegistry>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("project_directory", &self.project_directory)
            .finish()
    }
}

impl Session {
    /// Create a session and arm its expiry timer. Must be called within a
    /// tokio runtime.
    ///
    /// The session starts with the live entries of `tabs` as its own tabs.
    pub fn new(
        params: SessionParams,
        config: &SessionConfig,
        tabs: Arc<TabRegistry>,
        observer: Option<Arc<dyn CleanupObserver>>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let timeout = params.timeout.unwrap_or_else(|| config.timeout());
        let (completion, _) = watch::channel(Completion::Pending);

        let session = Arc::new(Self {
            id: SessionId::new(),
            project_directory: params.project_directory,
            summary: params.summary,
            created_at: now,
            created_at_utc: Utc::now(),
            timeout,
            config: config.clone(),
            state: Mutex::new(SessionState {
                status: SessionStatus::Waiting,
                status_message: SessionStatus::Waiting.default_message().to_string(),
                last_activity: now,
                connection: None,
                result: None,
                active_tabs: tabs.snapshot_active(),
                command: None,
                cleanup_started: false,
                terminal_at: None,
                cleanup_reason: None,
            }),
            completion,
            scheduler: Arc::new(CleanupScheduler::new()),
            callbacks: Mutex::new(Vec::new()),
            stats: Mutex::new(CleanupStats::default()),
            observer,
            tabs,
        });

        let first = timeout.min(config.auto_cleanup_delay());
        session.arm_timer(first);
        debug!(
            session_id = %session.id,
            timeout_secs = timeout.as_secs(),
            "Session created"
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn project_directory(&self) -> &str {
        &self.project_directory
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        self.created_at_utc
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn request_deadline(&self) -> Instant {
        self.created_at + self.timeout
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().status
    }

    pub fn status_message(&self) -> String {
        self.state.lock().status_message.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    pub fn cleanup_started(&self) -> bool {
        self.state.lock().cleanup_started
    }

    pub fn terminal_at(&self) -> Option<Instant> {
        self.state.lock().terminal_at
    }

    pub fn cleanup_reason(&self) -> Option<CleanupReason> {
        self.state.lock().cleanup_reason
    }

    pub fn result(&self) -> Option<FeedbackResult> {
        self.state.lock().result.clone()
    }

    pub fn last_activity(&self) -> Instant {
        self.state.lock().last_activity
    }

    pub fn idle_time(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity())
    }

    pub fn is_expired(&self) -> bool {
        self.idle_time() > self.config.max_idle()
    }

    pub fn cleanup_stats(&self) -> CleanupStats {
        self.stats.lock().clone()
    }

    pub fn timer_armed(&self) -> bool {
        self.scheduler.is_armed()
    }

    /// Record activity now. Ignored once cleanup has started.
    pub fn touch(&self) {
        let mut state = self.state.lock();
        if !state.cleanup_started {
            state.last_activity = Instant::now();
        }
    }

    pub fn add_cleanup_callback<F>(&self, callback: F)
    where
        F: Fn(&Session, CleanupReason) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        self.callbacks.lock().push(Box::new(callback));
    }

    // ---- connection ----

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.state.lock().connection.as_ref().map(Connection::id)
    }

    pub fn has_connection(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    /// Attach `connection`, closing any connection attached before.
    pub fn attach_connection(&self, connection: Connection) -> Result<AttachOutcome> {
        let connection_id = connection.id();
        let previous = {
            let mut state = self.state.lock();
            if state.cleanup_started {
                return Err(FeedbackError::SessionTerminal {
                    status: state.status,
                });
            }
            state.last_activity = Instant::now();
            state.connection.replace(connection)
        };

        let replaced = previous.as_ref().map(Connection::id);
        if let Some(old) = replaced {
            debug!(session_id = %self.id, connection_id = %old, "Closing superseded connection");
        }
        drop(previous);
        debug!(session_id = %self.id, %connection_id, "Connection attached");
        Ok(AttachOutcome {
            connection_id,
            replaced,
        })
    }

    /// Attach `connection` only if no other connection is attached. A
    /// refused connection is dropped.
    pub fn attach_if_vacant(&self, connection: Connection) -> Result<bool> {
        let connection_id = connection.id();
        let mut state = self.state.lock();
        if state.cleanup_started {
            return Err(FeedbackError::SessionTerminal {
                status: state.status,
            });
        }
        if state.connection.is_some() {
            return Ok(false);
        }
        state.last_activity = Instant::now();
        state.connection = Some(connection);
        debug!(session_id = %self.id, %connection_id, "Connection attached");
        Ok(true)
    }

    /// Detach the connection without closing it, for handoff.
    pub fn take_connection(&self) -> Option<Connection> {
        self.state.lock().connection.take()
    }

    /// Forget the connection if it is `connection_id`. Status is unchanged.
    pub fn detach_connection(&self, connection_id: ConnectionId) -> bool {
        let mut state = self.state.lock();
        if state.connection.as_ref().map(Connection::id) != Some(connection_id) {
            return false;
        }
        state.connection = None;
        true
    }

    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        let state = self.state.lock();
        match &state.connection {
            Some(conn) => conn.send(message),
            None => Err(FeedbackError::NoConnection(self.id)),
        }
    }

    // ---- protocol ----

    /// Apply one inbound frame. Rejected frames are answered with an
    /// `error` message before the error is returned.
    pub async fn handle_message(self: &Arc<Self>, message: InboundMessage) -> Result<()> {
        let kind = message.kind();
        let result = self.apply(message).await;
        if let Err(e) = &result {
            debug!(session_id = %self.id, kind, error = %e, "Rejected inbound message");
            let _ = self.send(OutboundMessage::error(e.to_string()));
        }
        result
    }

    async fn apply(self: &Arc<Self>, message: InboundMessage) -> Result<()> {
        self.activate()?;
        match message {
            InboundMessage::SubmitFeedback(result) => {
                self.submit_feedback(result)?;
                let _ = self.send(OutboundMessage::FeedbackReceived {
                    message: SessionStatus::FeedbackSubmitted.default_message().to_string(),
                });
            }
            InboundMessage::Heartbeat { tab_id, timestamp } => {
                self.heartbeat(&tab_id, timestamp);
                let _ = self.send(OutboundMessage::HeartbeatResponse { tab_id, timestamp });
            }
            InboundMessage::GetStatus => {
                let _ = self.send(OutboundMessage::StatusUpdate {
                    status_info: self.status_info(),
                });
            }
            InboundMessage::UserTimeout => {
                self.cleanup(CleanupReason::Timeout).await;
            }
            InboundMessage::RunCommand { command } => {
                self.run_command(&command)?;
            }
        }
        Ok(())
    }

    /// Record activity and move `Waiting` to `Active` once a connection is
    /// attached.
    fn activate(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.cleanup_started {
            return Err(FeedbackError::SessionTerminal {
                status: state.status,
            });
        }
        state.last_activity = Instant::now();
        if state.status == SessionStatus::Waiting && state.connection.is_some() {
            state.status = state.status.transition(SessionEvent::Activate)?;
            state.status_message = state.status.default_message().to_string();
            debug!(session_id = %self.id, "Session active");
        }
        Ok(())
    }

    /// Store the result and wake every waiter. Write-once.
    pub fn submit_feedback(&self, result: FeedbackResult) -> Result<()> {
        let mut state = self.state.lock();
        if state.cleanup_started {
            return Err(FeedbackError::SessionTerminal {
                status: state.status,
            });
        }
        state.status = state.status.transition(SessionEvent::Submit)?;
        state.status_message = state.status.default_message().to_string();
        state.last_activity = Instant::now();
        state.result = Some(result.clone());
        self.completion.send_replace(Completion::Submitted(result));
        info!(session_id = %self.id, "Feedback submitted");
        Ok(())
    }

    /// Record a heartbeat in this session and in the shared registry.
    pub fn heartbeat(&self, tab_id: &str, client_timestamp: f64) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            if state.cleanup_started {
                return;
            }
            state.active_tabs.insert(tab_id.to_string(), now);
            state.last_activity = now;
        }
        self.tabs.record_at(tab_id, client_timestamp, now);
    }

    /// Tab ids this session has seen within the liveness threshold.
    pub fn active_tabs(&self) -> Vec<String> {
        let now = Instant::now();
        let threshold = self.tabs.threshold();
        let mut ids: Vec<String> = self
            .state
            .lock()
            .active_tabs
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) <= threshold)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn tab_snapshot(&self) -> HashMap<String, Instant> {
        self.state.lock().active_tabs.clone()
    }

    pub fn status_info(&self) -> StatusInfo {
        let now = Instant::now();
        let threshold = self.tabs.threshold();
        let state = self.state.lock();
        let active_tabs = state
            .active_tabs
            .values()
            .filter(|seen| now.saturating_duration_since(**seen) <= threshold)
            .count();
        StatusInfo {
            session_id: self.id.to_string(),
            status: state.status,
            message: state.status_message.clone(),
            project_directory: self.project_directory.clone(),
            summary: self.summary.clone(),
            created_at: self.created_at_utc,
            idle_secs: now.saturating_duration_since(state.last_activity).as_secs(),
            has_result: state.result.is_some(),
            has_connection: state.connection.is_some(),
            active_tabs,
        }
    }

    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.to_string(),
            project_directory: self.project_directory.clone(),
            summary: self.summary.clone(),
            status: self.status(),
            created_at: self.created_at_utc,
        }
    }

    // ---- command ----

    /// Run `command` in the project directory, streaming output to the
    /// attached connection.
    pub fn run_command(self: &Arc<Self>, command: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.cleanup_started {
            return Err(FeedbackError::SessionTerminal {
                status: state.status,
            });
        }
        if state.command.is_some() {
            return Err(FeedbackError::CommandBusy);
        }

        let weak = Arc::downgrade(self);
        let sink: OutputSink = Arc::new(move |message| {
            if let Some(session) = weak.upgrade() {
                let _ = session.send(message);
            }
        });
        let weak = Arc::downgrade(self);
        let running = RunningCommand::spawn(
            command,
            Some(Path::new(&self.project_directory)),
            sink,
            move |exit_code| Session::command_exited(&weak, exit_code),
        )?;
        info!(session_id = %self.id, command, pid = ?running.pid(), "Command started");
        state.command = Some(running);
        Ok(())
    }

    fn command_exited(weak: &Weak<Session>, exit_code: Option<i32>) {
        let Some(session) = weak.upgrade() else {
            return;
        };
        let finished = session.state.lock().command.take();
        let _ = session.send(OutboundMessage::CommandComplete { exit_code });
        debug!(session_id = %session.id, ?exit_code, "Command finished");
        drop(finished);
    }

    // ---- wait ----

    /// Wait for feedback, a terminal transition or the deadline.
    ///
    /// Without an explicit `timeout` the session's own request deadline
    /// applies. On deadline the session is cleaned up with reason
    /// `Timeout` unless a submission raced in.
    pub async fn wait_for_result(self: &Arc<Self>, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = match timeout {
            Some(timeout) => Instant::now() + timeout,
            None => self.request_deadline(),
        };
        let signalled = tokio::time::timeout_at(deadline, self.resolved()).await;
        if let Ok(Some(outcome)) = signalled {
            return outcome;
        }
        if let Some(outcome) = self.completion.borrow().outcome() {
            return outcome;
        }

        if !self.cleanup(CleanupReason::Timeout).await.performed() {
            // A teardown with another reason is still running; report its reason.
            if let Some(outcome) = self.resolved().await {
                return outcome;
            }
        }
        let outcome = self.completion.borrow().outcome();
        outcome.unwrap_or(WaitOutcome::TimedOut)
    }

    /// Resolves once the completion leaves `Pending`.
    async fn resolved(&self) -> Option<WaitOutcome> {
        let mut rx = self.completion.subscribe();
        let completion = rx
            .wait_for(|c| *c != Completion::Pending)
            .await
            .map(|c| c.clone())
            .ok()?;
        completion.outcome()
    }

    // ---- timer ----

    fn arm_timer(self: &Arc<Self>, delay: Duration) {
        let weak = Arc::downgrade(self);
        self.scheduler.schedule(delay, move || async move {
            let Some(session) = weak.upgrade() else {
                return;
            };
            match session.timer_action() {
                TimerAction::Idle => {}
                TimerAction::Cleanup(reason) => {
                    session.cleanup(reason).await;
                }
                TimerAction::Rearm(delay) => session.arm_timer(delay),
            }
        });
    }

    fn timer_action(&self) -> TimerAction {
        let state = self.state.lock();
        if state.cleanup_started || state.status.is_terminal() {
            return TimerAction::Idle;
        }
        let now = Instant::now();
        let deadline = self.request_deadline();
        let awaiting = state.status != SessionStatus::FeedbackSubmitted;
        if awaiting && now >= deadline {
            return TimerAction::Cleanup(CleanupReason::Timeout);
        }

        let max_idle = self.config.max_idle();
        let idle = now.saturating_duration_since(state.last_activity);
        if idle > max_idle {
            return TimerAction::Cleanup(CleanupReason::Expired);
        }

        // One tick past the idle limit so the check above is strict.
        let mut next = max_idle - idle + Duration::from_millis(1);
        if awaiting {
            next = next.min(deadline - now);
        }
        TimerAction::Rearm(next)
    }

    // ---- cleanup ----

    /// Tear the session down. Only the first call does any work; every later
    /// or concurrent call returns [`CleanupOutcome::AlreadyCleaned`].
    ///
    /// The teardown runs on its own task, so dropping the returned future
    /// does not leave the session half cleaned.
    pub async fn cleanup(self: &Arc<Self>, reason: CleanupReason) -> CleanupOutcome {
        let Some(teardown) = self.start_cleanup(reason) else {
            return CleanupOutcome::AlreadyCleaned;
        };
        match teardown.await {
            Ok(report) => CleanupOutcome::Performed(report),
            Err(e) => {
                error!(session_id = %self.id, %reason, error = %e, "Cleanup task failed");
                CleanupOutcome::AlreadyCleaned
            }
        }
    }

    /// Claim the cleanup and spawn the teardown. `None` if another trigger
    /// already claimed it.
    pub fn start_cleanup(
        self: &Arc<Self>,
        reason: CleanupReason,
    ) -> Option<JoinHandle<CleanupReport>> {
        let claimed = {
            let mut state = self.state.lock();
            if state.cleanup_started {
                return None;
            }
            state.cleanup_started = true;
            Claimed {
                previous_status: state.status,
                connection: state.connection.take(),
                command: state.command.take(),
            }
        };
        let session = Arc::clone(self);
        Some(tokio::spawn(async move { session.teardown(reason, claimed).await }))
    }

    async fn teardown(self: Arc<Self>, reason: CleanupReason, claimed: Claimed) -> CleanupReport {
        let started = std::time::Instant::now();
        let Claimed {
            previous_status,
            connection,
            command,
        } = claimed;

        let mut released = ReleasedResources::default();
        let mut errors = Vec::new();
        let mut record_error = |operation: &'static str, message: String| {
            let err = FeedbackError::Cleanup {
                session_id: self.id,
                operation,
                message,
            };
            warn!(session_id = %self.id, %reason, operation, error = %err, "Cleanup step failed");
            errors.push(err.to_string());
        };

        if self.scheduler.cancel() {
            released.timers += 1;
        }

        if let Some(conn) = connection {
            if reason != CleanupReason::Replaced {
                let notice = OutboundMessage::SessionCleanup {
                    reason,
                    message: reason.message().to_string(),
                };
                if let Err(e) = conn.send(notice) {
                    record_error("notify_connection", e.to_string());
                }
            }
            released.connections += 1;
            drop(conn);
        }

        if let Some(command) = command {
            match command.terminate(self.config.subprocess_grace()).await {
                Ok(Termination::Graceful) => {}
                Ok(Termination::Forced) => {
                    debug!(session_id = %self.id, "Command needed a forced kill");
                }
                Err(e) => record_error("terminate_command", e.to_string()),
            }
            released.processes += 1;
        }

        self.state.lock().result = None;

        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for callback in &callbacks {
            released.callbacks += 1;
            if let Err(message) = callback(self.as_ref(), reason) {
                record_error("callback", message);
            }
        }

        let final_status = {
            let mut state = self.state.lock();
            let next = match state.status.transition(reason.event()) {
                Ok(next) => next,
                Err(e) => {
                    warn!(session_id = %self.id, error = %e, "Status already terminal");
                    state.status
                }
            };
            state.status = next;
            state.status_message = reason.message().to_string();
            state.terminal_at = Some(Instant::now());
            state.cleanup_reason = Some(reason);
            next
        };
        self.completion.send_if_modified(|completion| {
            if *completion == Completion::Pending {
                *completion = Completion::Terminated(reason);
                true
            } else {
                false
            }
        });

        let report = CleanupReport {
            session_id: self.id,
            reason,
            previous_status,
            final_status,
            duration: started.elapsed(),
            released,
            errors,
        };
        self.stats.lock().record(&report);
        if let Some(observer) = &self.observer {
            observer.session_cleaned(&report);
        }
        info!(
            session_id = %self.id,
            %reason,
            status = final_status.as_str(),
            duration_ms = report.duration.as_millis() as u64,
            errors = report.errors.len(),
            "Session cleaned up"
        );
        report
    }
}

/// Resources taken out of the session when cleanup is claimed.
struct Claimed {
    previous_status: SessionStatus,
    connection: Option<Connection>,
    command: Option<RunningCommand>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(config: SessionConfig) -> Arc<Session> {
        Session::new(
            SessionParams::new("/tmp", "review the change"),
            &config,
            Arc::new(TabRegistry::new()),
            None,
        )
    }

    fn session() -> Arc<Session> {
        session_with(SessionConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_session_waiting_and_not_expired() {
        let session = session();
        assert_eq!(session.status(), SessionStatus::Waiting);
        assert!(!session.is_expired());
        assert!(session.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_message_activates() {
        let session = session();
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();
        session
            .handle_message(InboundMessage::GetStatus)
            .await
            .unwrap();
        assert_eq!(session.status(), SessionStatus::Active);
        let Some(OutboundMessage::StatusUpdate { status_info }) = rx.recv().await else {
            panic!("expected status_update");
        };
        assert_eq!(status_info.status, SessionStatus::Active);
        assert!(status_info.has_connection);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_is_write_once() {
        let session = session();
        session.submit_feedback(FeedbackResult::text("first")).unwrap();
        let err = session
            .submit_feedback(FeedbackResult::text("second"))
            .unwrap_err();
        assert!(matches!(err, FeedbackError::InvalidTransition(_)));
        assert_eq!(session.result().unwrap().feedback, "first");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_returns_submitted_result() {
        let session = session();
        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.wait_for_result(None).await })
        };
        tokio::task::yield_now().await;
        session.submit_feedback(FeedbackResult::text("ship it")).unwrap();
        assert_eq!(
            waiter.await.unwrap(),
            WaitOutcome::Submitted(FeedbackResult::text("ship it"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_result_survives_replacement_for_waiter() {
        let session = session();
        session.submit_feedback(FeedbackResult::text("done")).unwrap();
        session.cleanup(CleanupReason::Replaced).await;
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.result().is_none());
        assert_eq!(
            session.wait_for_result(Some(Duration::from_secs(1))).await,
            WaitOutcome::Submitted(FeedbackResult::text("done"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_wait_timeout_cleans_up() {
        let session = session();
        let outcome = session.wait_for_result(Some(Duration::from_secs(5))).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(session.status(), SessionStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_notifies_and_closes_connection() {
        let session = session();
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();

        let outcome = session.cleanup(CleanupReason::Manual).await;
        let report = outcome.report().unwrap();
        assert_eq!(report.released.connections, 1);
        assert_eq!(report.released.timers, 1);
        assert_eq!(report.final_status, SessionStatus::Completed);

        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::SessionCleanup {
                reason: CleanupReason::Manual,
                ..
            })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_cleanup_sends_nothing() {
        let session = session();
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();
        session.cleanup(CleanupReason::Replaced).await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_events_rejected() {
        let session = session();
        session.cleanup(CleanupReason::Expired).await;
        assert_eq!(session.status(), SessionStatus::Expired);

        let err = session
            .submit_feedback(FeedbackResult::text("too late"))
            .unwrap_err();
        assert!(matches!(err, FeedbackError::SessionTerminal { .. }));
        let (conn, _rx) = Connection::channel();
        assert!(session.attach_connection(conn).is_err());
        assert!(!session.cleanup(CleanupReason::Manual).await.performed());
        assert_eq!(session.status(), SessionStatus::Expired);
        assert_eq!(session.cleanup_stats().cleanups, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_run_in_order_and_errors_collected() {
        let session = session();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            session.add_cleanup_callback(move |_, _| {
                order.lock().push(i);
                if i == 1 {
                    Err("callback one failed".to_string())
                } else {
                    Ok(())
                }
            });
        }
        let outcome = session.cleanup(CleanupReason::Error).await;
        let report = outcome.report().unwrap();
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(report.released.callbacks, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expires_idle_submitted_session() {
        let session = session_with(SessionConfig {
            timeout_secs: 10,
            max_idle_secs: 30,
            ..SessionConfig::default()
        });
        session.submit_feedback(FeedbackResult::text("x")).unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        // Submitted sessions are past the request deadline but not timed out.
        assert_eq!(session.status(), SessionStatus::FeedbackSubmitted);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(session.status(), SessionStatus::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_postpones_expiry() {
        let session = session_with(SessionConfig {
            timeout_secs: 3600,
            max_idle_secs: 30,
            ..SessionConfig::default()
        });
        tokio::time::sleep(Duration::from_secs(20)).await;
        session.touch();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(session.status(), SessionStatus::Waiting);
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(session.is_terminal());
        assert_eq!(session.cleanup_reason(), Some(CleanupReason::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_updates_session_and_registry() {
        let tabs = Arc::new(TabRegistry::new());
        let session = Session::new(
            SessionParams::new("/tmp", "s"),
            &SessionConfig::default(),
            tabs.clone(),
            None,
        );
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();
        session
            .handle_message(InboundMessage::Heartbeat {
                tab_id: "t1".to_string(),
                timestamp: 42.0,
            })
            .await
            .unwrap();
        assert_eq!(session.active_tabs(), vec!["t1".to_string()]);
        assert!(tabs.is_active("t1"));
        assert!(matches!(
            rx.recv().await,
            Some(OutboundMessage::HeartbeatResponse { tab_id, .. }) if tab_id == "t1"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_tabs_not_reported() {
        let session = session();
        session.heartbeat("t1", 1.0);
        assert_eq!(session.status_info().active_tabs, 1);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(session.active_tabs().is_empty());
        assert_eq!(session.status_info().active_tabs, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_message_answered_with_error() {
        let session = session();
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();
        session.submit_feedback(FeedbackResult::text("a")).unwrap();
        assert!(session
            .handle_message(InboundMessage::SubmitFeedback(FeedbackResult::text("b")))
            .await
            .is_err());
        assert!(matches!(rx.recv().await, Some(OutboundMessage::Error { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_replaces_previous_connection() {
        let session = session();
        let (first, mut first_rx) = Connection::channel();
        let first_id = first.id();
        session.attach_connection(first).unwrap();
        let (second, _second_rx) = Connection::channel();
        let outcome = session.attach_connection(second).unwrap();
        assert_eq!(outcome.replaced, Some(first_id));
        assert!(first_rx.recv().await.is_none());
        assert!(!session.detach_connection(first_id));
        assert!(session.detach_connection(outcome.connection_id));
        assert!(!session.has_connection());
    }

    /// A session running a command that ignores SIGTERM. Returns once the
    /// shell reported that its trap is installed.
    #[cfg(unix)]
    async fn stubborn_session() -> (
        Arc<Session>,
        tokio::sync::mpsc::UnboundedReceiver<OutboundMessage>,
    ) {
        let session = session_with(SessionConfig {
            subprocess_grace_ms: 300,
            ..SessionConfig::default()
        });
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();
        session.run_command("trap '' TERM; echo ready; sleep 30").unwrap();
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(OutboundMessage::CommandOutput { output })) if output == "ready" => break,
                Ok(Some(_)) => {}
                other => panic!("command never became ready: {:?}", other),
            }
        }
        (session, rx)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropped_cleanup_still_finishes() {
        let (session, _rx) = stubborn_session().await;
        let cleanup = session.cleanup(CleanupReason::Manual);
        assert!(tokio::time::timeout(Duration::from_millis(50), cleanup)
            .await
            .is_err());
        assert!(session.cleanup_started());
        assert!(!session.is_terminal());

        assert_eq!(
            session.wait_for_result(None).await,
            WaitOutcome::Cancelled(CleanupReason::Manual)
        );
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.terminal_at().is_some());
        assert_eq!(session.cleanup_stats().released.processes, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_waiter_reports_reason_of_running_cleanup() {
        let (session, _rx) = stubborn_session().await;
        let teardown = session.start_cleanup(CleanupReason::Manual).unwrap();

        // The deadline passes while the subprocess is still inside its grace.
        let outcome = session
            .wait_for_result(Some(Duration::from_millis(20)))
            .await;
        assert_eq!(outcome, WaitOutcome::Cancelled(CleanupReason::Manual));
        assert_eq!(session.cleanup_reason(), Some(CleanupReason::Manual));

        let report = teardown.await.unwrap();
        assert_eq!(report.reason, CleanupReason::Manual);
        assert_eq!(report.released.processes, 1);
        assert!(report.duration >= Duration::from_millis(300));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cleanup_leaves_no_background_process() {
        use crate::command::tests::{assert_gone, is_running};

        let session = session();
        let (conn, mut rx) = Connection::channel();
        session.attach_connection(conn).unwrap();
        session.run_command("sleep 4545 & echo $!; wait").unwrap();
        let child: u32 = loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(OutboundMessage::CommandOutput { output })) => break output.parse().unwrap(),
                Ok(Some(_)) => {}
                other => panic!("no pid reported: {:?}", other),
            }
        };
        assert!(is_running(child));

        let outcome = session.cleanup(CleanupReason::Manual).await;
        assert_eq!(outcome.report().unwrap().released.processes, 1);
        assert_gone(child).await;
    }
}
