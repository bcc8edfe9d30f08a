//! Postgres-backed [`LockStore`] shared by every controller process.
//!
//! The table is provisioned outside the controller:
//!
//! ```sql
//! CREATE TABLE reconcile_locks (
//!     bucket     TEXT        NOT NULL,
//!     key        TEXT        NOT NULL,
//!     holder     TEXT        NOT NULL,
//!     expires_at TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (bucket, key)
//! );
//! ```
//!
//! Acquisition is a single `INSERT .. ON CONFLICT DO UPDATE .. WHERE
//! expires_at <= now()`: it creates the row when absent, takes over an
//! expired row, and touches nothing when a live row exists. Expiry is
//! judged by the database clock so skewed controller clocks cannot
//! disagree about it.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use super::store::{LockRecord, LockStore, LockStoreError};

/// Default lock table name.
pub const DEFAULT_LOCK_TABLE: &str = "reconcile_locks";

/// TTL lock bucket stored in a Postgres table.
#[derive(Debug, Clone)]
pub struct PgLockStore {
    pool: PgPool,
    table: String,
    bucket: String,
    ttl: Duration,
}

impl PgLockStore {
    /// # Errors
    ///
    /// Returns [`LockStoreError::Unavailable`] if `table` is not a plain
    /// SQL identifier.
    pub fn new(
        pool: PgPool,
        table: &str,
        bucket: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self, LockStoreError> {
        if !is_identifier(table) {
            return Err(LockStoreError::Unavailable(format!(
                "invalid lock table name {table:?}"
            )));
        }
        Ok(Self {
            pool,
            table: table.to_string(),
            bucket: bucket.into(),
            ttl,
        })
    }

    fn ttl_secs(&self) -> f64 {
        self.ttl.as_secs_f64()
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`, optionally schema-qualified once.
pub(crate) fn is_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2
        && parts.iter().all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

#[async_trait]
impl LockStore for PgLockStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn verify(&self) -> Result<(), LockStoreError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&self.table)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            Ok(())
        } else {
            Err(LockStoreError::MissingBucket(self.bucket.clone()))
        }
    }

    async fn try_acquire(&self, key: &str, holder: &str) -> Result<bool, LockStoreError> {
        let sql = format!(
            "INSERT INTO {table} (bucket, key, holder, expires_at) \
             VALUES ($1, $2, $3, now() + make_interval(secs => $4)) \
             ON CONFLICT (bucket, key) DO UPDATE \
                 SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
                 WHERE {table}.expires_at <= now() \
             RETURNING key",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(&self.bucket)
            .bind(key)
            .bind(holder)
            .bind(self.ttl_secs())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockStoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE bucket = $1 AND key = $2 AND expires_at > now())",
            self.table
        );
        let locked: bool = sqlx::query_scalar(&sql)
            .bind(&self.bucket)
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(locked)
    }

    async fn release(&self, key: &str) -> Result<bool, LockStoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE bucket = $1 AND key = $2 RETURNING expires_at > now() AS live",
            self.table
        );
        let live: Option<bool> = sqlx::query_scalar(&sql)
            .bind(&self.bucket)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(live.unwrap_or(false))
    }

    async fn get(&self, key: &str) -> Result<Option<LockRecord>, LockStoreError> {
        let sql = format!(
            "SELECT holder, (extract(epoch FROM expires_at) * 1000)::BIGINT AS expires_at_ms \
             FROM {} WHERE bucket = $1 AND key = $2 AND expires_at > now()",
            self.table
        );
        let row = sqlx::query(&sql)
            .bind(&self.bucket)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<LockRecord, sqlx::Error> {
            let expires_at_ms: i64 = row.try_get("expires_at_ms")?;
            Ok(LockRecord {
                holder: row.try_get("holder")?,
                expires_at_ms: u64::try_from(expires_at_ms).unwrap_or(0),
            })
        })
        .transpose()
        .map_err(LockStoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_validation() {
        assert!(is_identifier("reconcile_locks"));
        assert!(is_identifier("ops.reconcile_locks"));
        assert!(!is_identifier("locks; DROP TABLE x"));
        assert!(!is_identifier("1locks"));
        assert!(!is_identifier("a.b.c"));
        assert!(!is_identifier(""));
    }
}
