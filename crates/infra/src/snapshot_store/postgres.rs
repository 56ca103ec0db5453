//! Postgres-backed snapshot store.
//!
//! The conditional put is a single upsert whose update arm only fires for a
//! strictly newer version, so concurrent replayers never move a snapshot
//! backwards.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::{Snapshot, SnapshotPerspective};

use super::r#trait::{SnapshotStore, SnapshotStoreError};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    stream      TEXT   NOT NULL,
    perspective TEXT   NOT NULL,
    version     BIGINT NOT NULL,
    raw         BYTEA  NOT NULL,
    PRIMARY KEY (stream, perspective)
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresSnapshotStore {
    pool: Arc<PgPool>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn migrate(&self) -> Result<(), SnapshotStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    #[instrument(skip(self), fields(stream = %stream, perspective = %perspective), err)]
    async fn read_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<Snapshot, SnapshotStoreError> {
        let row = sqlx::query(
            "SELECT version, raw FROM snapshots WHERE stream = $1 AND perspective = $2",
        )
        .bind(stream.as_str())
        .bind(perspective.key())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read_snapshot", e))?
        .ok_or_else(|| SnapshotStoreError::not_found(stream, perspective))?;

        let version: i64 = row
            .try_get("version")
            .map_err(|e| map_sqlx_error("read_snapshot", e))?;
        let raw: Vec<u8> = row
            .try_get("raw")
            .map_err(|e| map_sqlx_error("read_snapshot", e))?;

        Ok(Snapshot::new(
            Cursor::new(stream.clone(), version),
            raw,
            perspective.clone(),
        ))
    }

    #[instrument(
        skip(self, snapshot),
        fields(
            stream = %snapshot.cursor.stream(),
            version = snapshot.cursor.version(),
            perspective = %snapshot.perspective
        ),
        err
    )]
    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), SnapshotStoreError> {
        sqlx::query(
            r#"
            INSERT INTO snapshots (stream, perspective, version, raw)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (stream, perspective)
            DO UPDATE SET
                version = EXCLUDED.version,
                raw = EXCLUDED.raw
            WHERE snapshots.version < EXCLUDED.version
            "#,
        )
        .bind(snapshot.cursor.stream().as_str())
        .bind(snapshot.perspective.key())
        .bind(snapshot.cursor.version())
        .bind(&snapshot.raw_data)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("write_snapshot", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(stream = %stream, perspective = %perspective), err)]
    async fn delete_snapshot(
        &self,
        stream: &StreamName,
        perspective: &SnapshotPerspective,
    ) -> Result<(), SnapshotStoreError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE stream = $1 AND perspective = $2")
            .bind(stream.as_str())
            .bind(perspective.key())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_snapshot", e))?;

        if result.rows_affected() == 0 {
            return Err(SnapshotStoreError::not_found(stream, perspective));
        }
        Ok(())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SnapshotStoreError {
    match err {
        sqlx::Error::Database(db_err) => SnapshotStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        other => SnapshotStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
