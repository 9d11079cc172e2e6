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


use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use feedback_core::{FeedbackResult, ManagerConfig, NoopLauncher, SessionManager};
use feedback_server::{api::AppState, router};
use serde_json::{json, Value};
use tower::ServiceExt;

fn setup() -> (Arc<SessionManager>, Router) {
    let manager = Arc::new(SessionManager::with_launcher(
        ManagerConfig::default(),
        Arc::new(NoopLauncher),
    ));
    let app = router(AppState::new(manager.clone()), false);
    (manager, app)
}

async fn read_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create(app: &Router, summary: &str) -> Value {
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/sessions",
            json!({"project_directory": "/tmp/project", "summary": summary}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    read_json(response).await
}

#[tokio::test]
async fn test_health() {
    let (_manager, app) = setup();
    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = read_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["has_current_session"], false);
}

#[tokio::test]
async fn test_current_session_lifecycle() {
    let (_manager, app) = setup();

    let response = app.clone().oneshot(get("/api/v1/sessions/current")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = read_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("No current session"));

    let created = create(&app, "first change").await;
    assert_eq!(created["status"], "waiting");
    assert_eq!(created["summary"], "first change");

    let response = app.clone().oneshot(get("/api/v1/sessions/current")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["session_id"], created["session_id"]);
    assert_eq!(body["has_connection"], false);
}

#[tokio::test]
async fn test_new_session_replaces_current() {
    let (manager, app) = setup();
    let first = create(&app, "first").await;
    let second = create(&app, "second").await;
    assert_ne!(first["session_id"], second["session_id"]);

    let current = manager.current().unwrap();
    assert_eq!(current.id().to_string(), second["session_id"].as_str().unwrap());
}

#[tokio::test]
async fn test_wait_returns_submitted_feedback() {
    let (manager, app) = setup();
    let created = create(&app, "review this").await;
    let id = created["session_id"].as_str().unwrap().to_string();

    manager
        .current()
        .unwrap()
        .submit_feedback(FeedbackResult::text("ship it"))
        .unwrap();

    let response = app
        .oneshot(post_json(&format!("/api/v1/sessions/{}/wait", id), json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["feedback"], "ship it");
}

#[tokio::test]
async fn test_wait_times_out() {
    let (manager, app) = setup();
    let created = create(&app, "nobody answers").await;
    let id = created["session_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(post_json(
            &format!("/api/v1/sessions/{}/wait?timeout_secs=1", id),
            json!({}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    assert_eq!(manager.current().unwrap().status().as_str(), "timeout");
}

#[tokio::test]
async fn test_collect_feedback_cancelled_by_delete() {
    let (manager, app) = setup();

    let waiter = tokio::spawn({
        let app = app.clone();
        async move {
            app.oneshot(post_json(
                "/api/v1/feedback",
                json!({"project_directory": "/tmp/project", "summary": "pending"}),
            ))
            .await
            .unwrap()
        }
    });

    let session = loop {
        if let Some(session) = manager.current() {
            break session;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/v1/sessions/{}", session.id()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["performed"], true);
    assert_eq!(body["report"]["reason"], "manual");

    let response = waiter.await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_delete_unknown_session() {
    let (_manager, app) = setup();
    let created = create(&app, "to delete").await;
    let uri = format!("/api/v1/sessions/{}", created["session_id"].as_str().unwrap());

    let delete = |uri: String| {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };
    let response = app.clone().oneshot(delete(uri.clone())).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(delete(uri)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(delete("/api/v1/sessions/not-a-uuid".to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_rejects_bad_input() {
    let (_manager, app) = setup();
    let response = app
        .clone()
        .oneshot(post_json(
            "/api/v1/sessions",
            json!({"project_directory": " ", "summary": "x"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post_json(
            "/api/v1/sessions",
            json!({"project_directory": "/tmp", "summary": "x", "timeout_secs": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_tabs_register_and_list() {
    let (_manager, app) = setup();

    let response = app
        .clone()
        .oneshot(post_json("/api/v1/tabs", json!({"tab_id": "tab-1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["active"], 1);

    let response = app.clone().oneshot(get("/api/v1/tabs")).await.unwrap();
    let body = read_json(response).await;
    assert_eq!(body["tabs"][0]["tab_id"], "tab-1");

    let response = app
        .oneshot(post_json("/api/v1/tabs", json!({"tab_id": ""})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_count_cleanups() {
    let (_manager, app) = setup();
    create(&app, "first").await;
    create(&app, "second").await;

    let response = app.oneshot(get("/api/v1/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["cleanup"]["total_cleanups"], 1);
    assert_eq!(body["cleanup"]["by_reason"]["replaced"], 1);
    assert!(body["current_session"].is_string());
}
