//! Simple REST API server example for the parking ledger engine.
//!
//! Run with: `cargo run --example server`
//!
//! ## Endpoints
//!
//! - `POST /purchases` - Initiate a purchase (card credits immediately)
//! - `POST /purchases/:id/complete` - Confirm a pending purchase
//! - `POST /purchases/:id/cancel` - Cancel a pending purchase
//! - `POST /sessions` - Start a parking session
//! - `POST /sessions/:id/end` - End a session (meters and debits)
//! - `POST /webhooks` - Reconcile an external event delivery
//! - `GET /users/:id` - User view (balance, active session, flags)
//! - `GET /users/:id/transactions` - Transaction history
//!
//! ## Example Usage
//!
//! ```bash
//! # Buy 60 minutes by card
//! curl -X POST http://localhost:3000/purchases \
//!   -H "Content-Type: application/json" \
//!   -d '{"user_id": "u-1", "package_id": "pkg-60", "method": "card", "reference": "tok-visa"}'
//!
//! # Start parking
//! curl -X POST http://localhost:3000/sessions \
//!   -H "Content-Type: application/json" \
//!   -d '{"user_id": "u-1", "location": "downtown", "spot": "B-12"}'
//!
//! # Check the user view
//! curl http://localhost:3000/users/u-1
//! ```

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
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

/// Request body for initiating purchases.
#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: String,
    pub package_id: String,
    pub method: PaymentMethod,
    pub reference: Option<String>,
}

/// Request body for cancelling a pending purchase.
#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub reason: String,
}

/// Request body for starting a session.
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    pub user_id: String,
    pub location: String,
    pub spot: Option<String>,
}

/// Request body for ending a session.
#[derive(Debug, Deserialize)]
pub struct EndSessionRequest {
    pub ended_by: EndedBy,
}

/// Request body for webhook deliveries.
///
/// The payload uses the engine's tagged representation:
/// ```json
/// {"event_id": "evt-1", "payload": {"kind": "payment_confirmed", "external_ref": "auth-1"}}
/// ```
#[derive(Debug, Deserialize)]
pub struct WebhookRequest {
    pub event_id: String,
    pub payload: ReconcilePayload,
}

/// Response body for webhook deliveries.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub already_applied: bool,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

/// Shared application state containing the ledger engine.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

// === Error Handling ===

/// Wrapper for converting `LedgerError` into HTTP responses.
pub struct AppError(LedgerError);

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

// === Handlers ===

/// POST /purchases - Initiate a purchase.
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

/// POST /purchases/:id/complete - Confirm a pending purchase.
async fn complete_purchase(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.engine.complete_transaction(&id)?))
}

/// POST /purchases/:id/cancel - Cancel a pending purchase.
async fn cancel_purchase(
    State(state): State<AppState>,
    Path(id): Path<TransactionId>,
    Json(request): Json<CancelRequest>,
) -> Result<Json<PaymentTransaction>, AppError> {
    Ok(Json(state.engine.cancel_transaction(&id, request.reason)?))
}

/// POST /sessions - Start a parking session.
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

/// POST /sessions/:id/end - End a session.
async fn end_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(request): Json<EndSessionRequest>,
) -> Result<Json<ParkingSession>, AppError> {
    Ok(Json(state.engine.end_session(&id, request.ended_by)?))
}

/// POST /webhooks - Reconcile an external event delivery.
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

/// GET /users/:id - User view.
async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> Json<UserView> {
    Json(state.engine.user_view(&UserId::new(id)))
}

/// GET /users/:id/transactions - Transaction history.
async fn list_transactions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<Vec<PaymentTransaction>> {
    Json(state.engine.transactions_of(&UserId::new(id)))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/purchases", post(initiate_purchase))
        .route("/purchases/{id}/complete", post(complete_purchase))
        .route("/purchases/{id}/cancel", post(cancel_purchase))
        .route("/sessions", post(start_session))
        .route("/sessions/{id}/end", post(end_session))
        .route("/webhooks", post(webhook))
        .route("/users/{id}", get(get_user))
        .route("/users/{id}/transactions", get(list_transactions))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let state = AppState {
        engine: Arc::new(Engine::default()),
    };

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Parking ledger API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /purchases                - Initiate a purchase");
    println!("  POST /purchases/:id/complete   - Confirm a pending purchase");
    println!("  POST /purchases/:id/cancel     - Cancel a pending purchase");
    println!("  POST /sessions                 - Start a parking session");
    println!("  POST /sessions/:id/end         - End a session");
    println!("  POST /webhooks                 - Reconcile an external event");
    println!("  GET  /users/:id                - User view");
    println!("  GET  /users/:id/transactions   - Transaction history");

    axum::serve(listener, app).await.unwrap();
}
