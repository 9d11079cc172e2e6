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


//! Feedback Server
//!
//! HTTP and WebSocket surface over `feedback-core`. Agents create sessions
//! and wait for answers through the REST API; the front end connects to
//! `/ws` and speaks the session protocol.

pub mod api;
pub mod config;

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use feedback_core::{
    BrowserLauncher, MemoryPressureMonitor, NoopLauncher, PortAllocator, ReclaimPolicy,
    SessionManager, SurfaceLauncher,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::AppState;
use crate::config::ServerConfig;

/// Process name fragment used to recognize a stale instance holding our port.
const PROCESS_MARKER: &str = "feedback-server";

fn default_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "feedback_server=info,feedback_core=info,tower_http=info".into())
}

/// Plain-text subscriber for messages logged while the configuration that
/// picks the real one is still being loaded.
pub fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync {
    tracing_subscriber::registry()
        .with(default_filter())
        .with(tracing_subscriber::fmt::layer())
}

/// Install the global subscriber. Safe to call more than once.
pub fn init_tracing(json: bool) {
    let filter = default_filter();
    let result = if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Build the HTTP router
pub fn router(state: AppState, enable_cors: bool) -> Router {
    let app = Router::new()
        .route("/health", get(api::health_check))
        .route("/ws", get(api::ws_session))
        // Session routes
        .route("/api/v1/sessions", post(api::create_session))
        .route("/api/v1/sessions/current", get(api::current_session))
        .route("/api/v1/sessions/:id", delete(api::delete_session))
        .route("/api/v1/sessions/:id/wait", post(api::wait_session))
        .route("/api/v1/feedback", post(api::collect_feedback))
        // Tab registry routes
        .route(
            "/api/v1/tabs",
            get(api::list_tabs).post(api::register_tab),
        )
        .route("/api/v1/stats", get(api::get_stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if enable_cors {
        app.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
    } else {
        app
    }
}

/// Run the server until Ctrl-C
pub async fn run_server(config: ServerConfig) -> Result<()> {
    config.validate()?;
    tracing::info!("Starting Feedback Server");
    tracing::debug!("Configuration: {:#?}", config);

    let mut allocator = PortAllocator::new(config.host_addr()?)
        .with_max_attempts(config.server.max_port_attempts);
    if config.server.allow_port_reclaim {
        allocator = allocator.with_reclaim(ReclaimPolicy::new(PROCESS_MARKER));
    }
    let reservation = allocator.reserve(config.server.port).await?;
    let addr = reservation.local_addr();
    if addr.port() != config.server.port {
        tracing::warn!(
            "Port {} unavailable, listening on {} instead",
            config.server.port,
            addr.port()
        );
    }
    let std_listener = reservation.into_listener();
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;
    allocator.mark_running();

    let frontend_url = format!("http://{}/", addr);
    let launcher: Arc<dyn SurfaceLauncher> = if config.ui.launch_browser {
        Arc::new(BrowserLauncher)
    } else {
        Arc::new(NoopLauncher)
    };
    let manager = Arc::new(SessionManager::with_launcher(
        config.manager_config(Some(frontend_url.clone())),
        launcher,
    ));

    let cancel = CancellationToken::new();
    let sweeper = manager.spawn_expiry_sweeper(config.sweep_interval(), cancel.clone());
    let monitor = if config.memory.enabled {
        let monitor = Arc::new(MemoryPressureMonitor::new(config.memory.clone()));
        monitor.register_manager(manager.clone());
        tracing::info!(
            "Memory monitor enabled: warning {}%, critical {}%, emergency {}%",
            config.memory.warning_percent,
            config.memory.critical_percent,
            config.memory.emergency_percent
        );
        Some(monitor.spawn(cancel.clone()))
    } else {
        None
    };

    let app = router(AppState::new(manager.clone()), config.server.enable_cors);

    tracing::info!("Feedback server listening on {}", addr);
    tracing::info!("Front end available at {}", frontend_url);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Shutdown signal received");
                }
                _ = shutdown.cancelled() => {}
            }
        })
        .await?;

    cancel.cancel();
    let cleaned = manager.shutdown().await;
    let _ = sweeper.await;
    if let Some(monitor) = monitor {
        let _ = monitor.await;
    }
    tracing::info!("Feedback server stopped, {} sessions cleaned up", cleaned);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_subscriber_passes_config_warnings() {
        tracing::subscriber::with_default(bootstrap_subscriber(), || {
            assert!(tracing::enabled!(
                target: "feedback_server::config",
                tracing::Level::WARN
            ));
        });
    }
}
