//! Named RPC methods shared by the WebSocket and HTTP surfaces.
//!
//! Handlers are registered at startup; dispatch is a map lookup by the
//! method name carried in the request.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sessionlink_core::{
    models::{CallId, ConnectionId},
    protocol::{methods, CallMessageParams, RpcRequest, RpcResponse, SuccessResult, VideoCallResult},
    Error,
};
use sessionlink_signaling::CallMembershipCoordinator;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodErrorKind {
    UnknownMethod,
    NotFound,
    InvalidInput,
    Internal,
}

/// Error reported in an RPC response as `{error, details}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodError {
    pub kind: MethodErrorKind,
    pub message: String,
    pub details: Option<String>,
}

impl MethodError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: MethodErrorKind::InvalidInput,
            message: message.into(),
            details: None,
        }
    }

    #[must_use]
    pub fn unknown_method(method: &str) -> Self {
        Self {
            kind: MethodErrorKind::UnknownMethod,
            message: format!("Method {method} not found"),
            details: None,
        }
    }
}

impl From<Error> for MethodError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound(message) => Self {
                kind: MethodErrorKind::NotFound,
                message,
                details: None,
            },
            Error::InvalidInput(message) => Self::invalid_input(message),
            other => Self {
                kind: MethodErrorKind::Internal,
                message: "Internal server error".to_string(),
                details: Some(other.to_string()),
            },
        }
    }
}

pub type MethodResult = Result<Value, MethodError>;

/// Who is calling and what they can reach
#[derive(Clone)]
pub struct MethodContext {
    pub coordinator: CallMembershipCoordinator,
    /// Connection id of the calling socket; `None` over plain HTTP unless the
    /// request names one
    pub connection_id: Option<ConnectionId>,
}

/// Positional arguments plus the optional `params` object
#[derive(Debug, Clone, Default)]
pub struct MethodCall {
    pub args: Vec<Value>,
    pub params: Option<Value>,
}

impl MethodCall {
    /// Deserialize positional argument `index`
    pub fn arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<T, MethodError> {
        let value = self
            .args
            .get(index)
            .cloned()
            .ok_or_else(|| MethodError::invalid_input(format!("Missing argument: {name}")))?;
        serde_json::from_value(value).map_err(|e| MethodError::invalid_input(format!("Invalid {name}: {e}")))
    }

    /// Like [`arg`](Self::arg) but absent or null yields `None`
    pub fn optional_arg<T: DeserializeOwned>(&self, index: usize, name: &str) -> Result<Option<T>, MethodError> {
        match self.args.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.arg(index, name).map(Some),
        }
    }
}

type Handler = Arc<dyn Fn(MethodContext, MethodCall) -> BoxFuture<'static, MethodResult> + Send + Sync>;

/// Method name to handler map
#[derive(Clone, Default)]
pub struct MethodRegistry {
    handlers: HashMap<String, Handler>,
}

impl MethodRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every `videoCall.*` method
    #[must_use]
    pub fn with_video_call_methods() -> Self {
        let mut registry = Self::new();
        registry.register(methods::CREATE, create);
        registry.register(methods::JOIN, join);
        registry.register(methods::LEAVE, leave);
        registry.register(methods::MESSAGE, message);
        registry.register(methods::GET, get);
        registry
    }

    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(MethodContext, MethodCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, call| Box::pin(handler(ctx, call)));
        self.handlers.insert(name.to_string(), handler);
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub async fn call(&self, name: &str, ctx: MethodContext, call: MethodCall) -> MethodResult {
        let handler = self
            .handlers
            .get(name)
            .cloned()
            .ok_or_else(|| MethodError::unknown_method(name))?;
        handler(ctx, call).await
    }

    /// Run a request and build its response
    pub async fn dispatch(&self, ctx: MethodContext, request: RpcRequest) -> RpcResponse {
        let connection_id = ctx.connection_id.clone();
        let call = MethodCall {
            args: request.args,
            params: request.params,
        };
        match self.call(&request.method, ctx, call).await {
            Ok(result) => RpcResponse::ok(request.id, result),
            Err(err) => {
                if err.kind == MethodErrorKind::Internal {
                    error!(
                        method = %request.method,
                        connection_id = ?connection_id,
                        details = ?err.details,
                        "Method failed"
                    );
                } else {
                    debug!(method = %request.method, error = %err.message, "Method rejected");
                }
                RpcResponse::err(request.id, err.message, err.details)
            }
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> MethodResult {
    serde_json::to_value(value).map_err(|e| Error::from(e).into())
}

/// Connection id from argument `index`, falling back to the caller's
fn connection_arg(ctx: &MethodContext, call: &MethodCall, index: usize) -> Result<ConnectionId, MethodError> {
    call.optional_arg::<ConnectionId>(index, "connectionId")?
        .filter(|c| !c.is_blank())
        .or_else(|| ctx.connection_id.clone())
        .ok_or_else(|| MethodError::invalid_input("connectionId is required"))
}

/// `videoCall.create(connections?)`
async fn create(ctx: MethodContext, call: MethodCall) -> MethodResult {
    let connections: Vec<ConnectionId> = call.optional_arg(0, "connections")?.unwrap_or_default();
    let video_call = ctx.coordinator.create(None, connections).await?;
    to_value(&VideoCallResult { video_call })
}

/// `videoCall.join(callId, connectionId)`
async fn join(ctx: MethodContext, call: MethodCall) -> MethodResult {
    let call_id: CallId = call.arg(0, "callId")?;
    let connection_id = connection_arg(&ctx, &call, 1)?;
    let joined = ctx.coordinator.join(&call_id, &connection_id).await?;
    to_value(&joined)
}

/// `videoCall.leave(callId, connectionId)`
async fn leave(ctx: MethodContext, call: MethodCall) -> MethodResult {
    let call_id: CallId = call.arg(0, "callId")?;
    let connection_id = connection_arg(&ctx, &call, 1)?;
    ctx.coordinator.leave(&call_id, &connection_id).await?;
    to_value(&SuccessResult::OK)
}

/// `videoCall.message({callId, type, data})`, taken from the first argument
/// or from `params`
async fn message(ctx: MethodContext, call: MethodCall) -> MethodResult {
    let raw = match call.args.first() {
        Some(Value::Object(_)) => call.args[0].clone(),
        _ => call
            .params
            .clone()
            .ok_or_else(|| MethodError::invalid_input("Missing argument: message"))?,
    };
    let params: CallMessageParams =
        serde_json::from_value(raw).map_err(|e| MethodError::invalid_input(format!("Invalid message: {e}")))?;

    // join/leave may name the member in `data.connectionId` when the caller
    // has no socket identity
    let sender = ctx.connection_id.clone().or_else(|| {
        matches!(params.kind.as_str(), "join" | "leave")
            .then(|| params.data.get("connectionId").cloned())
            .flatten()
            .and_then(|v| serde_json::from_value::<ConnectionId>(v).ok())
    });
    let sender = sender
        .filter(|c| !c.is_blank())
        .ok_or_else(|| MethodError::invalid_input("connectionId is required"))?;

    ctx.coordinator
        .relay_message(&params.call_id, &sender, &params.kind, params.data)
        .await?;
    to_value(&SuccessResult::OK)
}

/// `videoCall.get(id, connectionId?)`
async fn get(ctx: MethodContext, call: MethodCall) -> MethodResult {
    let call_id: CallId = call.arg(0, "id")?;
    let connection_id: Option<ConnectionId> = call.optional_arg(1, "connectionId")?;
    let video_call = ctx.coordinator.get(&call_id, connection_id.as_ref()).await?;
    to_value(&VideoCallResult { video_call })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sessionlink_core::repository::MemoryCallStore;
    use sessionlink_signaling::ConnectionHub;
    use std::time::Duration;

    fn context(connection_id: Option<&str>) -> MethodContext {
        MethodContext {
            coordinator: CallMembershipCoordinator::new(
                Arc::new(MemoryCallStore::new()),
                ConnectionHub::new(),
                Duration::from_secs(3),
            ),
            connection_id: connection_id.map(ConnectionId::from),
        }
    }

    fn request(method: &str, args: Vec<Value>) -> RpcRequest {
        RpcRequest {
            id: Some("msg_1_1".to_string()),
            method: method.to_string(),
            args,
            params: None,
        }
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let registry = MethodRegistry::with_video_call_methods();
        let response = registry.dispatch(context(None), request("session.summarize", vec![])).await;

        assert_eq!(response.id.as_deref(), Some("msg_1_1"));
        assert_eq!(response.error.as_deref(), Some("Method session.summarize not found"));
    }

    #[tokio::test]
    async fn test_create_join_get() {
        let registry = MethodRegistry::with_video_call_methods();
        let ctx = context(Some("tab-a"));
        // A member without an open socket is pruned by the join broadcast
        let (tx, _rx) = tokio::sync::mpsc::channel(16);
        ctx.coordinator.hub().register(ConnectionId::from("tab-a"), tx);

        let created = registry
            .call(methods::CREATE, ctx.clone(), MethodCall {
                args: vec![json!(["tab-a", "", "tab-a"])],
                params: None,
            })
            .await
            .unwrap();
        let call_id = created["videoCall"]["id"].clone();
        assert_eq!(created["videoCall"]["connections"], json!(["tab-a"]));

        let joined = registry
            .call(methods::JOIN, ctx.clone(), MethodCall {
                args: vec![call_id.clone()],
                params: None,
            })
            .await
            .unwrap();
        assert_eq!(joined["activeConnections"], json!(["tab-a"]));

        let fetched = registry
            .call(methods::GET, ctx, MethodCall {
                args: vec![call_id, json!("tab-b")],
                params: None,
            })
            .await
            .unwrap();
        assert_eq!(fetched["videoCall"]["connections"], json!(["tab-a", "tab-b"]));
    }

    #[tokio::test]
    async fn test_missing_call_reports_not_found() {
        let registry = MethodRegistry::with_video_call_methods();
        let response = registry
            .dispatch(context(Some("tab-a")), request(methods::JOIN, vec![json!("nope"), json!("tab-a")]))
            .await;

        assert_eq!(response.error.as_deref(), Some("Video call not found"));
        assert!(response.result.is_none());
    }

    #[tokio::test]
    async fn test_argument_validation() {
        let registry = MethodRegistry::with_video_call_methods();

        let err = registry
            .call(methods::JOIN, context(None), MethodCall::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, MethodErrorKind::InvalidInput);
        assert_eq!(err.message, "Missing argument: callId");

        let err = registry
            .call(methods::LEAVE, context(None), MethodCall {
                args: vec![json!("c1")],
                params: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.message, "connectionId is required");
    }

    #[tokio::test]
    async fn test_message_accepts_params_object() {
        let registry = MethodRegistry::with_video_call_methods();
        let ctx = context(Some("tab-a"));
        let created = registry
            .call(methods::CREATE, ctx.clone(), MethodCall::default())
            .await
            .unwrap();
        let call_id = created["videoCall"]["id"].clone();

        let result = registry
            .call(methods::MESSAGE, ctx, MethodCall {
                args: vec![],
                params: Some(json!({"callId": call_id, "type": "chat", "data": {"text": "hi"}})),
            })
            .await
            .unwrap();
        assert_eq!(result, json!({"success": true}));
    }

    #[tokio::test]
    async fn test_custom_method_registration() {
        let mut registry = MethodRegistry::new();
        registry.register("echo", |_ctx, call: MethodCall| async move { Ok(Value::Array(call.args)) });

        assert!(registry.contains("echo"));
        assert!(!registry.contains(methods::CREATE));
        let response = registry.dispatch(context(None), request("echo", vec![json!(1)])).await;
        assert_eq!(response.result, Some(json!([1])));
    }
}
