//! HTTP Surface
//!
//! Pre-flight room validation for the frontend, plus a health probe.
//! Runs on its own listener next to the WebSocket server and shares the
//! same registry and token verifier.

use std::sync::Arc;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::network::auth::{bearer_token, IdentityVerifier};
use crate::network::server::ServerError;
use crate::presence::registry::Registry;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    /// Room registry.
    pub registry: Arc<Registry>,
    /// Token verifier.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Reported by `/health`.
    pub version: String,
}

/// `POST /validate-room` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRoomRequest {
    /// Room to check.
    pub room_id: String,
}

/// `POST /validate-room` success body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRoomResponse {
    /// Always true; refusals use an error status.
    pub allowed: bool,
    /// Echo of the requested room.
    pub room_id: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn reject(status: StatusCode, reason: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: reason.into() })).into_response()
}

/// Build the CORS layer from a comma separated origin list, or `*`.
pub fn cors_layer(cors_origins: &str) -> CorsLayer {
    if cors_origins.trim() == "*" {
        return CorsLayer::permissive();
    }

    let origins: Vec<_> = cors_origins
        .split(',')
        .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        warn!("no valid CORS origins configured, using permissive CORS");
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Create the HTTP router.
pub fn create_router(state: HttpState, cors_origins: &str) -> Router {
    Router::new()
        .route("/validate-room", post(validate_room))
        .route("/health", get(health_check))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Check whether the bearer of the `Authorization` header may join a room.
///
/// 401 for a missing or bad token, 400 for a bad body, 404 for an unknown
/// room, 403 when a private room's allow-list excludes the caller.
async fn validate_room(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Result<Json<ValidateRoomRequest>, JsonRejection>,
) -> Response {
    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
    else {
        return reject(StatusCode::UNAUTHORIZED, "missing bearer token");
    };

    let identity = match state.verifier.verify(token) {
        Ok(identity) => identity,
        Err(e) => {
            debug!(error = %e, "validate-room token rejected");
            return reject(StatusCode::UNAUTHORIZED, e.to_string());
        }
    };

    let request = match body {
        Ok(Json(request)) => request,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.body_text()),
    };

    let Some(room) = state.registry.get_room(&request.room_id).await else {
        return reject(StatusCode::NOT_FOUND, "room not found");
    };

    if !room.admits(&identity.email).is_allowed() {
        info!(room_id = %request.room_id, email = %identity.email, "room access denied");
        return reject(StatusCode::FORBIDDEN, "not allowed to join room");
    }

    Json(ValidateRoomResponse { allowed: true, room_id: request.room_id }).into_response()
}

async fn health_check(State(state): State<HttpState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.version,
        "rooms": state.registry.room_count().await,
    }))
}

/// Serve the router until `shutdown` resolves.
pub async fn serve_http<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<(), ServerError>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    info!("http server listening on {}", listener.local_addr()?);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
