use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::CallStore;
use crate::{
    models::{normalize_connections, CallId, ConnectionId, VideoCall},
    Error, Result,
};

/// Process-local call store for single-node deployments and tests
#[derive(Debug, Default)]
pub struct MemoryCallStore {
    calls: DashMap<CallId, VideoCall>,
}

impl MemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[async_trait]
impl CallStore for MemoryCallStore {
    async fn create(&self, call: &VideoCall) -> Result<VideoCall> {
        if self.calls.contains_key(&call.id) {
            return Err(Error::InvalidInput(format!("Video call {} already exists", call.id)));
        }
        self.calls.insert(call.id.clone(), call.clone());
        Ok(call.clone())
    }

    async fn get(&self, id: &CallId) -> Result<Option<VideoCall>> {
        Ok(self.calls.get(id).map(|c| c.clone()))
    }

    async fn replace_connections(&self, id: &CallId, connections: &[ConnectionId]) -> Result<()> {
        let mut call = self
            .calls
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Video call {id} not found")))?;
        call.connections = normalize_connections(connections.iter().cloned())
            .into_iter()
            .collect();
        call.updated = Utc::now();
        Ok(())
    }

    async fn remove_connections(&self, id: &CallId, connections: &[ConnectionId]) -> Result<()> {
        let mut call = self
            .calls
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("Video call {id} not found")))?;
        call.connections.retain(|c| !connections.contains(c));
        call.updated = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<ConnectionId> {
        raw.iter().map(|s| ConnectionId::from(*s)).collect()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryCallStore::new();
        let call = VideoCall::new(Some("creator".into()), vec!["a".into()]);

        store.create(&call).await.unwrap();
        let loaded = store.get(&call.id).await.unwrap().unwrap();
        assert_eq!(loaded, call);

        assert!(store.create(&call).await.is_err());
        assert!(store.get(&CallId::from("missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_and_remove_connections() {
        let store = MemoryCallStore::new();
        let call = VideoCall::new(None, vec![]);
        store.create(&call).await.unwrap();

        store
            .replace_connections(&call.id, &["a".into(), "b".into(), "a".into(), "c".into()])
            .await
            .unwrap();
        let loaded = store.get(&call.id).await.unwrap().unwrap();
        assert_eq!(loaded.connections, ids(&["a", "b", "c"]));

        store
            .remove_connections(&call.id, &["a".into(), "zzz".into()])
            .await
            .unwrap();
        let loaded = store.get(&call.id).await.unwrap().unwrap();
        assert_eq!(loaded.connections, ids(&["b", "c"]));
    }

    #[tokio::test]
    async fn test_update_missing_call() {
        let store = MemoryCallStore::new();
        let err = store
            .replace_connections(&CallId::from("nope"), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
