//! HQ relay: brokers browser terminal sessions onto runner agents.
//!
//! Runners attach at `/ws/runner`, browsers at `/ws/terminal/{runner_id}`;
//! the [`hub::Hub`] matches the two and relays frames between them. HQ holds
//! connection state only — PTYs live on the runners and nothing is persisted.

pub mod hub;
pub mod ws;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

pub use hub::{Frame, Hub, HubError};

/// Build the HQ router: health and runner listing, plus the two WebSocket
/// attachment points. Responses carry permissive CORS headers so browser
/// front-ends can be served from anywhere.
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/runners", get(list_runners))
        .route("/ws/runner", get(ws::runner_ws))
        .route("/ws/terminal/{runner_id}", get(ws::terminal_ws))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(cors))
        .with_state(hub)
}

/// Permissive CORS: every response gets the allow-everything headers, and
/// preflight requests are answered directly with 204.
async fn cors(req: Request, next: Next) -> Response {
    let mut response = if req.method() == Method::OPTIONS {
        let mut response = Response::new(Default::default());
        *response.status_mut() = StatusCode::NO_CONTENT;
        response
    } else {
        next.run(req).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization"),
    );
    response
}

async fn health(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "runners": hub.list_runners(),
    }))
}

async fn list_runners(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "runners": hub.list_runners() }))
}
