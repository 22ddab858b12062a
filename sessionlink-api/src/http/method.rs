//! `POST /api/method`: the method registry over plain HTTP.

use axum::{extract::State, Json};
use serde::Deserialize;
use serde_json::Value;
use sessionlink_core::models::ConnectionId;
use tracing::debug;

use crate::http::{AppResult, AppState};
use crate::methods::{MethodCall, MethodContext};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodRequest {
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub params: Option<Value>,
    /// Identity to act as, for methods that relay on behalf of a socket
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

pub async fn call_method(
    State(state): State<AppState>,
    Json(request): Json<MethodRequest>,
) -> AppResult<Json<Value>> {
    debug!(method = %request.method, "HTTP method call");
    let ctx = MethodContext {
        coordinator: state.coordinator.clone(),
        connection_id: request.connection_id,
    };
    let call = MethodCall {
        args: request.args,
        params: request.params,
    };
    let result = state.methods.call(&request.method, ctx, call).await?;
    Ok(Json(result))
}
