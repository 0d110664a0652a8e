//! Persistent key-value tier backed by SQLite.
//!
//! One table, namespaced keys. Values are JSON text; a NULL value is a
//! cached negative result. Callers treat the store as linearizable KV and
//! compute freshness themselves from `created_at` + `ttl_secs`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{migrate::MigrateDatabase, Pool, Row, Sqlite};
use std::time::Duration;

use crate::config::DatabaseConfig;

#[derive(Clone)]
pub struct KvStore {
    pool: Pool<Sqlite>,
}

/// A raw row from the persistent tier.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl StoredEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.num_milliseconds() >= 0 && (age.num_milliseconds() as u128) < self.ttl.as_millis()
    }
}

impl KvStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT,
                created_at INTEGER NOT NULL,
                ttl_secs   INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kv_created ON kv_entries (namespace, created_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<StoredEntry>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT value, created_at, ttl_secs FROM kv_entries WHERE namespace = ? AND key = ?",
        )
        .bind(namespace)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value: Option<String> = row.get("value");
        let created_at: i64 = row.get("created_at");
        let ttl_secs: i64 = row.get("ttl_secs");

        let value = match value {
            Some(text) => serde_json::from_str(&text).ok(),
            None => None,
        };

        Ok(Some(StoredEntry {
            value,
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
            ttl: Duration::from_secs(ttl_secs.max(0) as u64),
        }))
    }

    pub async fn put(
        &self,
        namespace: &str,
        key: &str,
        value: Option<&serde_json::Value>,
        ttl: Duration,
    ) -> Result<(), sqlx::Error> {
        let text = value.map(|v| v.to_string());
        sqlx::query(
            r#"
            INSERT INTO kv_entries (namespace, key, value, created_at, ttl_secs)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (namespace, key)
            DO UPDATE SET value = excluded.value,
                          created_at = excluded.created_at,
                          ttl_secs = excluded.ttl_secs
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(text)
        .bind(Utc::now().timestamp())
        .bind(ttl.as_secs() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM kv_entries WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Drop rows whose TTL has elapsed. Run periodically, not per request.
    pub async fn purge_expired(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE created_at + ttl_secs < ?")
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn count(&self, namespace: &str) -> Result<u64, sqlx::Error> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM kv_entries WHERE namespace = ?")
                .bind(namespace)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
