//! SQLite EventRepository
//!
//! Timestamps are stored as microseconds since the epoch so that keyset
//! ordering by (start_time, id) is a plain integer/text comparison.

use super::repository::{EventFilter, EventRepository, PageCursor};
use crate::error::{Error, Result};
use crate::models::{CloseReason, Event, EventStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "id, source_id, start_time_us, end_time_us, status, \
    max_confidence, mean_confidence, labels, frame_count, close_reason, snapshot_path";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY NOT NULL,
        source_id TEXT NOT NULL,
        start_time_us INTEGER NOT NULL,
        end_time_us INTEGER,
        status TEXT NOT NULL,
        max_confidence REAL NOT NULL,
        mean_confidence REAL NOT NULL,
        labels TEXT NOT NULL,
        frame_count INTEGER NOT NULL,
        close_reason TEXT,
        snapshot_path TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_events_order ON events (start_time_us, id)",
    "CREATE INDEX IF NOT EXISTS idx_events_source ON events (source_id, start_time_us)",
];

#[derive(Clone)]
pub struct SqliteEventRepository {
    pool: SqlitePool,
}

impl SqliteEventRepository {
    /// Connect and create the schema if needed
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // Every connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.migrate().await?;
        tracing::info!(url = %url, "Event database ready");
        Ok(repo)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(
        us.div_euclid(1_000_000),
        (us.rem_euclid(1_000_000) * 1_000) as u32,
    )
    .ok_or_else(|| Error::Database(format!("timestamp out of range: {}", us)))
}

fn row_to_event(row: &SqliteRow) -> Result<Event> {
    let id: String = row.try_get("id")?;
    let labels: String = row.try_get("labels")?;
    let status: String = row.try_get("status")?;
    let close_reason: Option<String> = row.try_get("close_reason")?;
    let end_time_us: Option<i64> = row.try_get("end_time_us")?;
    let max_confidence: f64 = row.try_get("max_confidence")?;
    let mean_confidence: f64 = row.try_get("mean_confidence")?;
    let frame_count: i64 = row.try_get("frame_count")?;

    Ok(Event {
        id: Uuid::parse_str(&id).map_err(|e| Error::Database(format!("bad id {}: {}", id, e)))?,
        source_id: row.try_get("source_id")?,
        start_time: from_micros(row.try_get("start_time_us")?)?,
        end_time: end_time_us.map(from_micros).transpose()?,
        status: status.parse()?,
        max_confidence: max_confidence as f32,
        mean_confidence: mean_confidence as f32,
        labels: serde_json::from_str::<BTreeSet<String>>(&labels)?,
        frame_count: frame_count.max(0) as u64,
        close_reason: close_reason
            .as_deref()
            .map(CloseReason::from_str)
            .transpose()?,
        snapshot_path: row.try_get("snapshot_path")?,
    })
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn insert(&self, event: &Event) -> Result<()> {
        let query = format!(
            "INSERT INTO events ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT(id) DO NOTHING",
            EVENT_COLUMNS
        );
        sqlx::query(&query)
            .bind(event.id.to_string())
            .bind(&event.source_id)
            .bind(to_micros(event.start_time))
            .bind(event.end_time.map(to_micros))
            .bind(event.status.as_str())
            .bind(event.max_confidence as f64)
            .bind(event.mean_confidence as f64)
            .bind(serde_json::to_string(&event.labels)?)
            .bind(event.frame_count as i64)
            .bind(event.close_reason.map(|r| r.as_str()))
            .bind(event.snapshot_path.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        let query = format!("SELECT {} FROM events WHERE id = ?", EVENT_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE events SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_page(
        &self,
        filter: &EventFilter,
        after: Option<PageCursor>,
        limit: u32,
    ) -> Result<Vec<Event>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM events WHERE 1 = 1", EVENT_COLUMNS));

        if let Some(source_id) = &filter.source_id {
            qb.push(" AND source_id = ").push_bind(source_id.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(from) = filter.from {
            qb.push(" AND start_time_us >= ").push_bind(to_micros(from));
        }
        if let Some(to) = filter.to {
            qb.push(" AND start_time_us < ").push_bind(to_micros(to));
        }
        if let Some(cursor) = after {
            let ts = to_micros(cursor.start_time);
            qb.push(" AND (start_time_us > ")
                .push_bind(ts)
                .push(" OR (start_time_us = ")
                .push_bind(ts)
                .push(" AND id > ")
                .push_bind(cursor.id.to_string())
                .push("))");
        }
        qb.push(" ORDER BY start_time_us, id LIMIT ")
            .push_bind(limit as i64);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_event).collect()
    }

    async fn source_ids(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT source_id FROM events ORDER BY source_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("source_id").map_err(Error::from))
            .collect()
    }

    async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }
}
