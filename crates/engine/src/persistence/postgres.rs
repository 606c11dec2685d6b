//! PostgreSQL implementation of KeyValueStore
//!
//! Production-ready persistence using a single table:
//! - `id BIGSERIAL` keeps insertion order for prefix scans
//! - `expires_at` gives TTL semantics for the run lock
//! - compare-and-set is a single `INSERT ... ON CONFLICT ... RETURNING`

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;

/// Default table name
pub const DEFAULT_TABLE: &str = "batchrun_kv";

/// PostgreSQL implementation of KeyValueStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use batchrun_engine::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresStore::new(pool);
/// store.ensure_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    table: String,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_TABLE.to_string(),
        }
    }

    /// Use a custom table name (must be a plain SQL identifier)
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the backing table and its index if missing
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let create_table = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id BIGSERIAL PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                value JSONB NOT NULL,
                expires_at TIMESTAMPTZ NULL
            )
            "#,
            table = self.table
        );
        let create_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_key_pattern_idx ON {table} (key text_pattern_ops)",
            table = self.table
        );

        for statement in [create_table, create_index] {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(db_error)?;
        }

        debug!("schema ready");
        Ok(())
    }

    /// Physically remove expired rows
    ///
    /// Expired rows are already invisible to reads; this only reclaims space.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= now()",
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn upsert(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let ttl_secs = ttl.map(|ttl| ttl.as_secs_f64());

        // An expired row is replaced as a fresh insert so it lands at the tail
        sqlx::query(&format!(
            r#"
            INSERT INTO {table} (key, value, expires_at)
            VALUES ($1, $2, {EXPIRES_AT})
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at,
                id = CASE
                    WHEN {table}.expires_at IS NOT NULL AND {table}.expires_at <= now()
                    THEN nextval(pg_get_serial_sequence('{table}', 'id'))
                    ELSE {table}.id
                END
            "#,
            table = self.table
        ))
        .bind(key)
        .bind(&value)
        .bind(ttl_secs)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(%key, "Failed to write key: {}", e);
            db_error(e)
        })?;

        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for PostgresStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT value FROM {}
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())
            "#,
            self.table
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(|r| r.get("value")))
    }

    #[instrument(skip(self, value))]
    async fn set(&self, key: &str, value: serde_json::Value) -> Result<(), StoreError> {
        self.upsert(key, value, None).await
    }

    #[instrument(skip(self, value))]
    async fn set_with_ttl(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.upsert(key, value, Some(ttl)).await
    }

    #[instrument(skip(self, value))]
    async fn set_if_absent(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        // The conflict branch only fires for an expired row, so a live row
        // makes the statement return nothing
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (key, value, expires_at)
            VALUES ($1, $2, {EXPIRES_AT})
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            WHERE {table}.expires_at IS NOT NULL AND {table}.expires_at <= now()
            RETURNING key
            "#,
            table = self.table
        ))
        .bind(key)
        .bind(&value)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.is_some())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query(&format!("DELETE FROM {} WHERE key = $1", self.table))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT key FROM {}
            WHERE key LIKE $1 ESCAPE '\' AND (expires_at IS NULL OR expires_at > now())
            ORDER BY id ASC
            "#,
            self.table
        ))
        .bind(like_prefix(prefix))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(|r| r.get("key")).collect())
    }

    #[instrument(skip(self))]
    async fn count_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT COUNT(*) AS total FROM {}
            WHERE key LIKE $1 ESCAPE '\' AND (expires_at IS NULL OR expires_at > now())
            "#,
            self.table
        ))
        .bind(like_prefix(prefix))
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let total: i64 = row.get("total");
        Ok(total.max(0) as usize)
    }

    #[instrument(skip(self))]
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE key LIKE $1 ESCAPE '\\'",
            self.table
        ))
        .bind(like_prefix(prefix))
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() as usize)
    }
}

fn db_error(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Expiry of a TTL write, `$3` being the TTL in seconds
///
/// Taken from the database clock, the same one every read compares against.
/// A NULL TTL gives a NULL expiry.
const EXPIRES_AT: &str = "now() + $3::float8 * interval '1 second'";

/// Build a LIKE pattern matching `prefix` literally
///
/// `_` and `%` are wildcards in LIKE, and batch keys are full of underscores.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 8);
    for c in prefix.chars() {
        if matches!(c, '\\' | '_' | '%') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("wpbg_process_batch_"), r"wpbg\_process\_batch\_%");
        assert_eq!(like_prefix("a%b"), r"a\%b%");
        assert_eq!(like_prefix(r"a\b"), r"a\\b%");
    }

    #[test]
    fn test_expiry_uses_database_clock() {
        assert!(EXPIRES_AT.starts_with("now()"));
        assert!(EXPIRES_AT.contains("$3"));
    }
}
