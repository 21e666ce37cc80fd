//! PostgreSQL session backend.
//!
//! Uses the `session(sid, sess, expire)` table layout of connect-pg-simple so
//! rows written by the previous store stay readable.

use super::{SessionBackend, SessionError, SessionRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use serde_json::Value;
use tracing::{error, info, info_span, instrument, warn, Instrument};

const SCHEMA: &str = include_str!("../../sql/session.sql");

#[derive(Debug, Clone)]
pub struct PgSessionBackend {
    pool: PgPool,
}

fn expiry(ttl: Duration) -> DateTime<Utc> {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Decode one `sess` column, `None` when the row does not hold a session.
fn decode_row(sid: &str, sess: Value) -> Option<SessionRecord> {
    match serde_json::from_value(sess) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(sid, "Skipping unreadable session row: {err}");
            None
        }
    }
}

fn query_span(operation: &'static str, statement: &'static str) -> tracing::Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

impl PgSessionBackend {
    /// Connect a small pool to `dsn`.
    ///
    /// # Errors
    /// Returns an error if the database is unreachable.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::from_pool(pool))
    }

    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the session table and its expiry index when missing.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be applied.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("Failed to apply session schema")?;
        Ok(())
    }

    /// Delete expired rows, returning how many were removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn prune_expired(&self) -> Result<u64> {
        let query = "DELETE FROM session WHERE expire < NOW()";
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to prune expired sessions")?;
        Ok(result.rows_affected())
    }

    /// Prune expired rows every `every` until the task is aborted.
    pub fn spawn_pruner(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match self.prune_expired().await {
                    Ok(0) => {}
                    Ok(pruned) => info!(pruned, "Pruned expired sessions"),
                    Err(err) => error!("Failed to prune expired sessions: {err:#}"),
                }
            }
        })
    }
}

#[async_trait]
impl SessionBackend for PgSessionBackend {
    #[instrument(skip_all)]
    async fn get(&self, sid: &str) -> Result<Option<SessionRecord>, SessionError> {
        let query = "SELECT sess FROM session WHERE sid = $1 AND expire >= NOW()";
        let row = sqlx::query_scalar::<_, Json<Value>>(query)
            .bind(sid)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to load session")?;
        Ok(row.and_then(|Json(sess)| decode_row(sid, sess)))
    }

    #[instrument(skip_all)]
    async fn set(
        &self,
        sid: &str,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let query = "INSERT INTO session (sid, sess, expire) VALUES ($1, $2::json, $3) \
                     ON CONFLICT (sid) DO UPDATE SET sess = EXCLUDED.sess, expire = EXCLUDED.expire";
        sqlx::query(query)
            .bind(sid)
            .bind(Json(record))
            .bind(expiry(ttl))
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("Failed to store session")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn destroy(&self, sid: &str) -> Result<(), SessionError> {
        let query = "DELETE FROM session WHERE sid = $1";
        sqlx::query(query)
            .bind(sid)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to destroy session")?;
        Ok(())
    }

    /// Only the expiry moves; the stored payload is left as written.
    #[instrument(skip_all)]
    async fn touch(
        &self,
        sid: &str,
        _record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        let query = "UPDATE session SET expire = $2 WHERE sid = $1";
        sqlx::query(query)
            .bind(sid)
            .bind(expiry(ttl))
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("Failed to touch session")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn all(&self) -> Result<HashMap<String, SessionRecord>, SessionError> {
        let query = "SELECT sid, sess FROM session WHERE expire >= NOW()";
        let rows = sqlx::query_as::<_, (String, Json<Value>)>(query)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to list sessions")?;
        Ok(rows
            .into_iter()
            .filter_map(|(sid, Json(sess))| decode_row(&sid, sess).map(|record| (sid, record)))
            .collect())
    }

    #[instrument(skip_all)]
    async fn clear(&self) -> Result<(), SessionError> {
        let query = "DELETE FROM session";
        sqlx::query(query)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("Failed to clear sessions")?;
        Ok(())
    }

    #[instrument(skip_all)]
    async fn count(&self) -> Result<usize, SessionError> {
        let query = "SELECT COUNT(sid) FROM session WHERE expire >= NOW()";
        let count: i64 = sqlx::query_scalar(query)
            .fetch_one(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("Failed to count sessions")?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
