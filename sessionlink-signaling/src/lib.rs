//! Server-side signaling relay: the connection hub that owns every open
//! socket's outbound channel, and the call membership coordinator that routes
//! signals between members of a call.

pub mod hub;
pub mod membership;

pub use hub::{BroadcastOutcome, ConnectionHandle, ConnectionHub, DeliveryError, Outbound};
pub use membership::{CallMembershipCoordinator, RelayOutcome};
