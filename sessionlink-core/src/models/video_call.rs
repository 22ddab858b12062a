use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

use super::{CallId, ConnectionId};

/// Persisted video call.
///
/// `connections` lags the in-memory membership by up to the sync throttle
/// window; it may briefly hold ids of clients that vanished without leaving.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoCall {
    pub id: CallId,
    pub creator: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub connections: Vec<ConnectionId>,
}

impl VideoCall {
    #[must_use]
    pub fn new(creator: Option<String>, connections: Vec<ConnectionId>) -> Self {
        let now = Utc::now();
        Self {
            id: CallId::new(),
            creator,
            created: now,
            updated: now,
            connections: normalize_connections(connections).into_iter().collect(),
        }
    }

    #[must_use]
    pub fn has_connection(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains(connection_id)
    }
}

/// Drop blank ids and duplicates, keeping first-seen order.
pub fn normalize_connections<I>(connections: I) -> IndexSet<ConnectionId>
where
    I: IntoIterator<Item = ConnectionId>,
{
    connections.into_iter().filter(|c| !c.is_blank()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_call_normalizes_connections() {
        let call = VideoCall::new(
            Some("therapist".to_string()),
            vec!["a".into(), "".into(), "b".into(), "a".into()],
        );

        assert_eq!(call.connections, vec![ConnectionId::from("a"), ConnectionId::from("b")]);
        assert!(call.has_connection(&"b".into()));
        assert!(!call.has_connection(&"c".into()));
        assert_eq!(call.created, call.updated);
    }

    #[test]
    fn test_serializes_camel_case() {
        let call = VideoCall::new(None, vec!["a".into()]);
        let json = serde_json::to_value(&call).unwrap();

        assert_eq!(json["connections"], serde_json::json!(["a"]));
        assert!(json.get("id").is_some());
        assert!(json.get("created").is_some());
    }
}
