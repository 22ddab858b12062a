// Module: http
// WebSocket signaling endpoint, HTTP method calls and health check

pub mod error;
pub mod health;
pub mod method;
pub mod websocket;

use axum::{
    http::HeaderValue,
    routing::{get, post},
    Router,
};
use sessionlink_core::config::{ServerConfig, SignalingConfig};
use sessionlink_signaling::CallMembershipCoordinator;
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

pub use error::{AppError, AppResult};

use crate::methods::MethodRegistry;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: CallMembershipCoordinator,
    pub methods: Arc<MethodRegistry>,
    pub signaling: Arc<SignalingConfig>,
}

impl AppState {
    #[must_use]
    pub fn new(coordinator: CallMembershipCoordinator, methods: MethodRegistry, signaling: SignalingConfig) -> Self {
        Self {
            coordinator,
            methods: Arc::new(methods),
            signaling: Arc::new(signaling),
        }
    }
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .merge(health::create_health_router())
        .route("/api/ws", get(websocket::websocket_handler))
        .route("/api/method", post(method::call_method));

    router
        .layer(cors_layer(&server.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
