//! Postgres-backed event log.
//!
//! One row per stream position:
//!
//! ```sql
//! CREATE TABLE log_entries (
//!     stream  TEXT     NOT NULL,
//!     version BIGINT   NOT NULL,
//!     kind    SMALLINT NOT NULL,
//!     raw     BYTEA    NOT NULL,
//!     PRIMARY KEY (stream, version)
//! );
//! ```
//!
//! The primary key is the whole concurrency story: two writers racing for
//! the same `(stream, version)` cannot both succeed.
//!
//! ## Error mapping
//!
//! | SQLx error | Postgres code | `EventLogError` |
//! |------------|---------------|-----------------|
//! | Database (unique violation) | `23505` | `OptimisticLockingFailed` / `StreamAlreadyExists` (by call site) |
//! | anything else | | `Storage` |
//!
//! A guarded insert that writes nothing is classified by the head observed
//! afterwards: missing stream, conflict (head moved past `after`) or
//! `InvalidAppend` (`after` is beyond the head).

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use streamlog_core::{Cursor, StreamName};
use streamlog_events::{DekEnvelope, LogData, LogDataKind, LogEntry};

use super::r#trait::{AppendResult, EventLog, EventLogError, ReadResult};
use super::{child_stream_created_entry, stream_started_entry, APPEND_RETRIES};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS log_entries (
    stream  TEXT     NOT NULL,
    version BIGINT   NOT NULL,
    kind    SMALLINT NOT NULL,
    raw     BYTEA    NOT NULL,
    PRIMARY KEY (stream, version)
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresEventLog {
    pool: Arc<PgPool>,
    page_size: i64,
}

impl PostgresEventLog {
    pub fn new(pool: PgPool, page_size: usize) -> Self {
        Self {
            pool: Arc::new(pool),
            page_size: page_size.max(1) as i64,
        }
    }

    /// Create the table if it does not exist yet.
    pub async fn migrate(&self) -> Result<(), EventLogError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(stream = %stream), err)]
    async fn head(&self, stream: &StreamName) -> Result<Option<i64>, EventLogError> {
        let row = sqlx::query("SELECT MAX(version) AS head FROM log_entries WHERE stream = $1")
            .bind(stream.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("head", e))?;

        row.try_get::<Option<i64>, _>("head")
            .map_err(|e| map_sqlx_error("head", e))
    }
}

async fn insert_entry(
    tx: &mut Transaction<'_, Postgres>,
    stream: &StreamName,
    version: i64,
    data: &LogData,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO log_entries (stream, version, kind, raw) VALUES ($1, $2, $3, $4)")
        .bind(stream.as_str())
        .bind(version)
        .bind(data.kind.code())
        .bind(&data.raw)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

#[async_trait]
impl EventLog for PostgresEventLog {
    #[instrument(skip(self), fields(stream = %after.stream(), after = after.version()), err)]
    async fn read(&self, after: &Cursor) -> Result<ReadResult, EventLogError> {
        // One extra row tells us whether the page was truncated.
        let rows = sqlx::query(
            r#"
            SELECT version, kind, raw
            FROM log_entries
            WHERE stream = $1 AND version > $2
            ORDER BY version ASC
            LIMIT $3
            "#,
        )
        .bind(after.stream().as_str())
        .bind(after.version())
        .bind(self.page_size + 1)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("read", e))?;

        let more = rows.len() as i64 > self.page_size;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows.iter().take(self.page_size as usize) {
            let version: i64 = row.try_get("version").map_err(|e| map_sqlx_error("read", e))?;
            let kind: i16 = row.try_get("kind").map_err(|e| map_sqlx_error("read", e))?;
            let raw: Vec<u8> = row.try_get("raw").map_err(|e| map_sqlx_error("read", e))?;
            entries.push(LogEntry::new(
                Cursor::new(after.stream().clone(), version),
                LogData::new(LogDataKind::from_code(kind), raw),
            ));
        }

        let last_entry = entries
            .last()
            .map(|e| e.cursor.clone())
            .unwrap_or_else(|| after.clone());

        Ok(ReadResult {
            entries,
            last_entry,
            more,
        })
    }

    #[instrument(skip(self, data), fields(stream = %stream), err)]
    async fn append(
        &self,
        stream: &StreamName,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        let mut last_conflict = None;
        for attempt in 1..=APPEND_RETRIES {
            let head = self
                .head(stream)
                .await?
                .ok_or_else(|| EventLogError::StreamNotFound(stream.clone()))?;

            match self
                .append_after(&Cursor::new(stream.clone(), head), data.clone())
                .await
            {
                Err(err) if err.is_optimistic_locking() => {
                    tracing::debug!(attempt, head, "append lost a race, re-resolving head");
                    last_conflict = Some(err);
                }
                other => return other,
            }
        }

        Err(last_conflict.unwrap_or_else(|| {
            EventLogError::Storage(format!("append to {stream} made no attempt"))
        }))
    }

    #[instrument(skip(self, data), fields(stream = %after.stream(), after = after.version()), err)]
    async fn append_after(
        &self,
        after: &Cursor,
        data: LogData,
    ) -> Result<AppendResult, EventLogError> {
        let target = after.next();

        // Only lands when `after` is exactly the head; a rival that slipped in
        // between is caught by the primary key.
        let result = sqlx::query(
            r#"
            INSERT INTO log_entries (stream, version, kind, raw)
            SELECT $1, $2, $3, $4
            WHERE (SELECT MAX(version) FROM log_entries WHERE stream = $1) = $5
            "#,
        )
        .bind(after.stream().as_str())
        .bind(target.version())
        .bind(data.kind.code())
        .bind(&data.raw)
        .bind(after.version())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EventLogError::conflict(after)
            } else {
                map_sqlx_error("append_after", e)
            }
        })?;

        if result.rows_affected() == 0 {
            let head = self.head(after.stream()).await?;
            return Err(rejected_append(after, head));
        }

        Ok(AppendResult::at(target))
    }

    #[instrument(skip(self, dek_envelope, initial_data), fields(stream = %stream), err)]
    async fn create_stream(
        &self,
        stream: &StreamName,
        dek_envelope: &DekEnvelope,
        initial_data: Option<LogData>,
    ) -> Result<AppendResult, EventLogError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let started = stream_started_entry(dek_envelope)?;
        insert_entry(&mut tx, stream, 0, &started)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventLogError::StreamAlreadyExists(stream.clone())
                } else {
                    map_sqlx_error("insert_stream_started", e)
                }
            })?;

        let mut parent_cursor = None;
        if let Some(parent) = stream.parent() {
            let row = sqlx::query("SELECT MAX(version) AS head FROM log_entries WHERE stream = $1")
                .bind(parent.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("parent_head", e))?;
            let parent_head: Option<i64> = row
                .try_get("head")
                .map_err(|e| map_sqlx_error("parent_head", e))?;
            let parent_head = parent_head.ok_or_else(|| EventLogError::StreamNotFound(parent.clone()))?;

            let child_created = child_stream_created_entry(stream)?;
            parent_cursor = Some(Cursor::new(parent.clone(), parent_head + 1));
            insert_entry(&mut tx, &parent, parent_head + 1, &child_created)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        EventLogError::conflict(&Cursor::new(parent.clone(), parent_head))
                    } else {
                        map_sqlx_error("insert_child_stream_created", e)
                    }
                })?;
        }

        let mut head = 0;
        if let Some(data) = &initial_data {
            head = 1;
            insert_entry(&mut tx, stream, head, data)
                .await
                .map_err(|e| map_sqlx_error("insert_initial_data", e))?;
        }

        // Dropping `tx` without commit rolls everything back.
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        Ok(AppendResult {
            cursor: Cursor::new(stream.clone(), head),
            parent: parent_cursor,
        })
    }
}

/// Why a guarded insert at `after.next()` wrote nothing, given the head
/// observed afterwards.
fn rejected_append(after: &Cursor, head: Option<i64>) -> EventLogError {
    match head {
        None => EventLogError::StreamNotFound(after.stream().clone()),
        Some(head) if head > after.version() => EventLogError::conflict(after),
        Some(head) => EventLogError::InvalidAppend(format!(
            "{after} is beyond the head of {} (version {head})",
            after.stream()
        )),
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventLogError {
    match err {
        sqlx::Error::Database(db_err) => {
            EventLogError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            EventLogError::Storage(format!("connection pool closed in {operation}"))
        }
        other => EventLogError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
