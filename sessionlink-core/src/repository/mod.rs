//! Persistence for video calls.
//!
//! The membership coordinator only depends on [`CallStore`]; the binary picks
//! [`PgCallStore`] when a database URL is configured and [`MemoryCallStore`]
//! otherwise.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryCallStore;
#[cfg(feature = "postgres")]
pub use postgres::PgCallStore;

use async_trait::async_trait;

use crate::{
    models::{CallId, ConnectionId, VideoCall},
    Result,
};

/// Storage seam for persisted calls
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Insert a new call and return it as stored
    async fn create(&self, call: &VideoCall) -> Result<VideoCall>;

    /// Fetch a call by id
    async fn get(&self, id: &CallId) -> Result<Option<VideoCall>>;

    /// Overwrite the persisted membership list.
    ///
    /// Returns `NotFound` when the call does not exist.
    async fn replace_connections(&self, id: &CallId, connections: &[ConnectionId]) -> Result<()>;

    /// Remove every listed id from the persisted membership (set difference).
    /// Ids not present are ignored.
    async fn remove_connections(&self, id: &CallId, connections: &[ConnectionId]) -> Result<()>;
}
