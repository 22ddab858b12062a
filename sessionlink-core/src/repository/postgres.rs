use async_trait::async_trait;
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use super::CallStore;
use crate::{
    models::{normalize_connections, CallId, ConnectionId, VideoCall},
    Error, Result,
};

/// Postgres-backed call store over the `video_calls` table
#[derive(Clone)]
pub struct PgCallStore {
    pool: PgPool,
}

impl PgCallStore {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_call(row: &PgRow) -> Result<VideoCall> {
        let Json(connections): Json<Vec<Option<String>>> = row.try_get("connections")?;

        Ok(VideoCall {
            id: CallId::from_string(row.try_get("id")?),
            creator: row.try_get("creator")?,
            created: row.try_get("created")?,
            updated: row.try_get("updated")?,
            // Older rows may carry nulls or duplicates
            connections: normalize_connections(
                connections.into_iter().flatten().map(ConnectionId::from),
            )
            .into_iter()
            .collect(),
        })
    }
}

#[async_trait]
impl CallStore for PgCallStore {
    async fn create(&self, call: &VideoCall) -> Result<VideoCall> {
        let row = sqlx::query(
            "INSERT INTO video_calls (id, creator, created, updated, connections)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, creator, created, updated, connections",
        )
        .bind(&call.id)
        .bind(call.creator.as_deref())
        .bind(call.created)
        .bind(call.updated)
        .bind(Json(&call.connections))
        .fetch_one(&self.pool)
        .await?;

        Self::row_to_call(&row)
    }

    async fn get(&self, id: &CallId) -> Result<Option<VideoCall>> {
        let row = sqlx::query(
            "SELECT id, creator, created, updated, connections
             FROM video_calls
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_call).transpose()
    }

    async fn replace_connections(&self, id: &CallId, connections: &[ConnectionId]) -> Result<()> {
        let connections: Vec<ConnectionId> = normalize_connections(connections.iter().cloned())
            .into_iter()
            .collect();

        let result = sqlx::query(
            "UPDATE video_calls
             SET connections = $2, updated = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(&connections))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Video call {id} not found")));
        }
        Ok(())
    }

    async fn remove_connections(&self, id: &CallId, connections: &[ConnectionId]) -> Result<()> {
        if connections.is_empty() {
            return Ok(());
        }
        let ids: Vec<&str> = connections.iter().map(ConnectionId::as_str).collect();

        // jsonb - text[] drops every matching string element
        let result = sqlx::query(
            "UPDATE video_calls
             SET connections = connections - $2::text[], updated = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(&ids)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Video call {id} not found")));
        }
        Ok(())
    }
}
