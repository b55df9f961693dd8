// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
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

//! Integration tests for the REST API server with concurrent requests.
//!
//! These tests verify that the server correctly handles concurrent requests
//! while keeping the ledger consistent.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_ledger_rs::{
    EndedBy, Engine, ExternalEventId, LedgerError, LocationId, Outcome, PackageId,
    ParkingSession, PaymentMethod, PaymentTransaction, ReconcilePayload, SessionId,
    TransactionId, UserId, UserView,
};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

// === DTOs and router (duplicated from the demo for test isolation) ===

#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    user_id: String,
    package_id: String,
    method: PaymentMethod,
    reference: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartSessionRequest {
    user_id: String,
    location: String,
    spot: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndSessionRequest {
    ended_by: EndedBy,
}

#[derive(Debug, Deserialize)]
struct WebhookRequest {
    event_id: String,
    payload: ReconcilePayload,
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    already_applied: bool,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
    code: String,
}

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

struct AppError(LedgerError);

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            LedgerError::InsufficientBalance => {
                (StatusCode::UNPROCESSABLE_ENTITY, "INSUFFICIENT_BALANCE")
            }
            LedgerError::SessionAlreadyActive => (StatusCode::CONFLICT, "SESSION_ALREADY_ACTIVE"),
            LedgerError::SessionNotFound => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
            LedgerError::TransactionNotFound => (StatusCode::NOT_FOUND, "TRANSACTION_NOT_FOUND"),
            LedgerError::InvalidTransition => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            LedgerError::PackageNotFound => (StatusCode::NOT_FOUND, "PACKAGE_NOT_FOUND"),
            LedgerError::PaymentAuthDenied => (StatusCode::PAYMENT_REQUIRED, "PAYMENT_AUTH_DENIED"),
            LedgerError::UserMismatch => (StatusCode::BAD_REQUEST, "USER_MISMATCH"),
            LedgerError::InvalidMinutes => (StatusCode::BAD_REQUEST, "INVALID_MINUTES"),
            LedgerError::StoreUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE")
            }
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

async fn initiate_purchase(
    State(state): State<AppState>,
    Json(request): Json<PurchaseRequest>,
) -> Result<(StatusCode, Json<PaymentTransaction>), AppError> {
    let transaction = state.engine.initiate_purchase(
        UserId::new(request.user_id),
        &PackageId::new(request.package_id),
        request.method,
        request.reference,
    )?;
    Ok((StatusCode::CREATED, Json(transaction)))
}

async fn complete_purchase(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.engine.complete_transaction(&id)?))
}

async fn start_session(
    State(state): State<AppState>,
    Json(request): Json<StartSessionRequest>,
) -> Result<(StatusCode, Json<ParkingSession>), AppError> {
    let session = state.engine.start_session(
        UserId::new(request.user_id),
        LocationId::new(request.location),
        request.spot,
    )?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(request): Json<EndSessionRequest>,
) -> Result<Json<ParkingSession>, AppError> {
    Ok(Json(state.engine.end_session(&id, request.ended_by)?))
}

async fn webhook(
    State(state): State<AppState>,
    Json(request): Json<WebhookRequest>,
) -> Result<Json<WebhookResponse>, AppError> {
    let outcome = state
        .engine
        .reconcile(ExternalEventId::new(request.event_id), request.payload)?;
    Ok(Json(WebhookResponse {
        already_applied: matches!(outcome, Outcome::AlreadyApplied(_)),
    }))
}

async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> Json<UserView> {
    Json(state.engine.user_view(&UserId::new(id)))
}

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/purchases", post(initiate_purchase))
        .route("/purchases/{id}/complete", post(complete_purchase))
        .route("/sessions", post(start_session))
        .route("/sessions/{id}/end", post(end_session))
        .route("/webhooks", post(webhook))
        .route("/users/{id}", get(get_user))
        .with_state(state)
}

/// Test server that binds to an ephemeral port.
struct TestServer {
    base_url: String,
    engine: Arc<Engine>,
}

impl TestServer {
    async fn new() -> Self {
        let engine = Arc::new(Engine::default());
        let state = AppState {
            engine: engine.clone(),
        };

        let app = create_router(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to be ready by polling with retries
        let client = Client::new();
        let health_url = format!("{}/users/health-probe", base_url);
        for _ in 0..50 {
            match client.get(&health_url).send().await {
                Ok(_) => break,
                Err(_) => tokio::time::sleep(tokio::time::Duration::from_millis(50)).await,
            }
        }

        TestServer { base_url, engine }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

// === Tests ===
// These tests are ignored in CI due to connection issues on some platforms.
// Run manually with: cargo test --test server_test -- --ignored

/// Purchase, park, and close over HTTP.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn purchase_park_close_flow() {
    let server = TestServer::new().await;
    let client = Client::new();

    // Card purchase credits immediately.
    let response = client
        .post(server.url("/purchases"))
        .json(&json!({
            "user_id": "u-1",
            "package_id": "pkg-60",
            "method": "card",
            "reference": "tok-visa"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Start a session.
    let response = client
        .post(server.url("/sessions"))
        .json(&json!({
            "user_id": "u-1",
            "location": "downtown",
            "spot": "B-12"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let session: serde_json::Value = response.json().await.unwrap();
    let session_id = session["session_id"].as_str().unwrap().to_string();

    // User view shows the active session and the credited minutes.
    let view: serde_json::Value = client
        .get(server.url("/users/u-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(view["minutes"], 60);
    assert!(!view["active_session"].is_null());

    // Close it.
    let response = client
        .post(server.url(&format!("/sessions/{session_id}/end")))
        .json(&json!({"ended_by": "guard"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let closed: serde_json::Value = response.json().await.unwrap();
    assert_eq!(closed["status"], "completed");
}

/// Starting without balance maps to 422 with an actionable code.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn start_without_balance_maps_to_422() {
    let server = TestServer::new().await;
    let client = Client::new();

    let response = client
        .post(server.url("/sessions"))
        .json(&json!({"user_id": "u-broke", "location": "downtown"}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], "INSUFFICIENT_BALANCE");
}

/// Concurrent card purchases for many users: each balance equals the sum of
/// that user's purchases.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn concurrent_purchases_for_multiple_users() {
    let server = TestServer::new().await;
    let client = Client::new();

    const NUM_USERS: usize = 20;
    const PURCHASES_PER_USER: usize = 5;

    let mut requests = Vec::new();
    for u in 0..NUM_USERS {
        for _ in 0..PURCHASES_PER_USER {
            let client = client.clone();
            let url = server.url("/purchases");
            requests.push(async move {
                client
                    .post(&url)
                    .json(&json!({
                        "user_id": format!("u-{u}"),
                        "package_id": "pkg-30",
                        "method": "card",
                        "reference": "tok-visa"
                    }))
                    .send()
                    .await
                    .unwrap()
                    .status()
            });
        }
    }

    for status in futures::future::join_all(requests).await {
        assert_eq!(status, StatusCode::CREATED);
    }

    for u in 0..NUM_USERS {
        let view = server.engine.user_view(&UserId::new(format!("u-{u}")));
        assert_eq!(view.minutes, 30 * PURCHASES_PER_USER as i64);
    }
}

/// Two concurrent closes of the same session: both succeed with the same
/// record and exactly one debit happens.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn concurrent_double_close_debits_once() {
    let server = TestServer::new().await;
    let client = Client::new();

    server
        .engine
        .grant_bonus(UserId::new("u-1"), 100, "funding")
        .unwrap();
    let session = server
        .engine
        .start_session(UserId::new("u-1"), LocationId::new("downtown"), None)
        .unwrap();

    let url = server.url(&format!("/sessions/{}/end", session.session_id));
    let (a, b) = tokio::join!(
        client.post(&url).json(&json!({"ended_by": "guard"})).send(),
        client.post(&url).json(&json!({"ended_by": "guard"})).send(),
    );

    let a: serde_json::Value = a.unwrap().json().await.unwrap();
    let b: serde_json::Value = b.unwrap().json().await.unwrap();
    assert_eq!(a["status"], "completed");
    assert_eq!(a["cost"], b["cost"]);
    assert_eq!(a["duration_minutes"], b["duration_minutes"]);

    let view = server.engine.user_view(&UserId::new("u-1"));
    let debited = 100 - view.minutes;
    assert_eq!(
        debited,
        a["duration_minutes"].as_i64().unwrap(),
        "exactly one debit for one session"
    );
}

/// Replayed webhook deliveries report already_applied.
#[tokio::test]
#[ignore = "requires running server, may fail in CI"]
async fn replayed_webhook_reports_already_applied() {
    let server = TestServer::new().await;
    let client = Client::new();

    server
        .engine
        .grant_bonus(UserId::new("u-1"), 100, "funding")
        .unwrap();
    let session = server
        .engine
        .start_session(UserId::new("u-1"), LocationId::new("downtown"), None)
        .unwrap();

    let body = json!({
        "event_id": "scan-1",
        "payload": {"kind": "guard_exit", "session_id": session.session_id}
    });

    let first: serde_json::Value = client
        .post(server.url("/webhooks"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["already_applied"], false);

    let second: serde_json::Value = client
        .post(server.url("/webhooks"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["already_applied"], true);

    let view = server.engine.user_view(&UserId::new("u-1"));
    assert!(view.minutes >= 99, "at most one sub-minute debit applied");
}
