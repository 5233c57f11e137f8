//! Fixed-window rate limiting.
//!
//! Each (key, window) pair is one row whose counter is incremented with an
//! upsert, so concurrent checks against the same key serialize on that row
//! and never lose a count.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{Pool, Postgres};
use tracing::{debug, info};

use keel_core::{Error, RateLimitDecision, RateLimiter, Result};

/// PostgreSQL implementation of RateLimiter.
#[derive(Clone)]
pub struct PgRateLimiter {
    pool: Pool<Postgres>,
}

impl PgRateLimiter {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

/// Start and end of the window of `window_secs` seconds containing `now`.
///
/// Windows are aligned to the Unix epoch so every process agrees on them.
pub fn window_bounds(now: DateTime<Utc>, window_secs: i64) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if window_secs < 1 {
        return Err(Error::InvalidInput(format!(
            "rate limit window must be at least 1 second, got {}",
            window_secs
        )));
    }
    let start_secs = now.timestamp().div_euclid(window_secs) * window_secs;
    let start = Utc
        .timestamp_opt(start_secs, 0)
        .single()
        .ok_or_else(|| Error::InvalidInput(format!("timestamp out of range: {}", start_secs)))?;
    let end = start + chrono::Duration::seconds(window_secs);
    Ok((start, end))
}

#[async_trait]
impl RateLimiter for PgRateLimiter {
    async fn check_rate_limit(
        &self,
        key: &str,
        limit: i64,
        window_seconds: i64,
    ) -> Result<RateLimitDecision> {
        if key.is_empty() {
            return Err(Error::InvalidInput("rate limit key must not be empty".into()));
        }
        if limit < 1 {
            return Err(Error::InvalidInput(format!(
                "rate limit must be at least 1, got {}",
                limit
            )));
        }

        // Window placement uses the database clock, like every other
        // timestamp in the schema.
        let now: DateTime<Utc> = sqlx::query_scalar("SELECT NOW()")
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        let (window_start, window_end) = window_bounds(now, window_seconds)?;

        let count: i64 = sqlx::query_scalar(
            "INSERT INTO rate_limits (key, window_start, count, expires_at)
             VALUES ($1, $2, 1, $3)
             ON CONFLICT (key, window_start) DO UPDATE
             SET count = rate_limits.count + 1
             RETURNING count",
        )
        .bind(key)
        .bind(window_start)
        .bind(window_end)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let allowed = count <= limit;
        if !allowed {
            debug!(
                subsystem = "db",
                component = "rate_limit",
                op = "check",
                rate_limit_key = %key,
                count,
                limit,
                window_seconds,
                "Rate limit exceeded"
            );
        }

        Ok(RateLimitDecision {
            allowed,
            count,
            reset_at: window_end,
        })
    }

    async fn cleanup_expired(&self) -> Result<u64> {
        let deleted = sqlx::query("DELETE FROM rate_limits WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?
            .rows_affected();

        if deleted > 0 {
            info!(
                subsystem = "db",
                component = "rate_limit",
                op = "cleanup",
                rows_affected = deleted,
                "Expired rate limit windows removed"
            );
        }
        Ok(deleted)
    }
}
