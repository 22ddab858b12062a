//! HTTP and WebSocket surface of the signaling relay.

pub mod http;
pub mod methods;

pub use http::{create_router, AppState};
pub use methods::{MethodCall, MethodContext, MethodError, MethodErrorKind, MethodRegistry, MethodResult};
