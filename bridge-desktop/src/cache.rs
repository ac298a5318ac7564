//! Local Cache using SQLite

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{CacheCollection, LocalCache},
};
use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::debug;

/// SQLite-backed local cache implementation
///
/// All collections share one table keyed by `(collection, key)`; values are
/// stored as JSON text. The cache survives process restarts, which makes it
/// the authoritative per-page scan status store during an active run.
pub struct SqliteLocalCache {
    pool: SqlitePool,
}

impl SqliteLocalCache {
    /// Open (or create) a cache at the given database path
    pub async fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(BridgeError::Io)?;
        }

        let path_str = db_path.to_string_lossy().replace('\\', "/");
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path_str))
            .map_err(|e| BridgeError::DatabaseError(format!("Invalid cache path: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to connect to DB: {}", e)))?;

        let cache = Self { pool };
        cache.initialize().await?;

        debug!(path = ?db_path, "Initialized local cache");
        Ok(cache)
    }

    /// Create an in-memory cache (for testing)
    pub async fn in_memory() -> Result<Self> {
        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to connect to DB: {}", e)))?;

        let cache = Self { pool };
        cache.initialize().await?;
        Ok(cache)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_records (
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::DatabaseError(format!("Failed to create table: {}", e)))?;

        Ok(())
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn decode(collection: CacheCollection, key: &str, raw: &str) -> Result<Value> {
        serde_json::from_str(raw).map_err(|e| {
            BridgeError::DatabaseError(format!(
                "Corrupt cache record {}/{}: {}",
                collection, key, e
            ))
        })
    }
}

#[async_trait]
impl LocalCache for SqliteLocalCache {
    async fn get(&self, collection: CacheCollection, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT value FROM cache_records WHERE collection = ? AND key = ?")
            .bind(collection.as_str())
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to read record: {}", e)))?;

        match row {
            Some(row) => {
                let raw: String = row.get(0);
                Self::decode(collection, key, &raw).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, collection: CacheCollection, key: &str, value: &Value) -> Result<()> {
        let raw = serde_json::to_string(value).map_err(|e| {
            BridgeError::OperationFailed(format!("JSON serialization failed: {}", e))
        })?;

        sqlx::query(
            r#"
            INSERT INTO cache_records (collection, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(collection, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(collection.as_str())
        .bind(key)
        .bind(raw)
        .bind(Self::now())
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::DatabaseError(format!("Failed to write record: {}", e)))?;

        Ok(())
    }

    async fn get_all(&self, collection: CacheCollection) -> Result<Vec<(String, Value)>> {
        let rows = sqlx::query("SELECT key, value FROM cache_records WHERE collection = ? ORDER BY key")
            .bind(collection.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to list records: {}", e)))?;

        rows.into_iter()
            .map(|row| {
                let key: String = row.get(0);
                let raw: String = row.get(1);
                let value = Self::decode(collection, &key, &raw)?;
                Ok((key, value))
            })
            .collect()
    }

    async fn delete(&self, collection: CacheCollection, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM cache_records WHERE collection = ? AND key = ?")
            .bind(collection.as_str())
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to delete record: {}", e)))?;

        Ok(())
    }

    async fn clear(&self, collection: CacheCollection) -> Result<()> {
        let result = sqlx::query("DELETE FROM cache_records WHERE collection = ?")
            .bind(collection.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::DatabaseError(format!("Failed to clear collection: {}", e)))?;

        debug!(
            collection = collection.as_str(),
            removed = result.rows_affected(),
            "Cleared cache collection"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_put_and_get() {
        let cache = SqliteLocalCache::in_memory().await.unwrap();

        cache
            .put(CacheCollection::ScanStatus, "/org/repo/a.html", &json!({"status": "completed"}))
            .await
            .unwrap();

        let value = cache
            .get(CacheCollection::ScanStatus, "/org/repo/a.html")
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"status": "completed"})));
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let cache = SqliteLocalCache::in_memory().await.unwrap();

        cache.put(CacheCollection::Sessions, "s1", &json!(1)).await.unwrap();
        cache.put(CacheCollection::Sessions, "s1", &json!(2)).await.unwrap();

        let all = cache.get_all(CacheCollection::Sessions).await.unwrap();
        assert_eq!(all, vec![("s1".to_string(), json!(2))]);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let cache = SqliteLocalCache::in_memory().await.unwrap();

        cache.put(CacheCollection::Media, "k", &json!("media")).await.unwrap();
        cache.put(CacheCollection::UploadBatches, "k", &json!("batch")).await.unwrap();
        cache.clear(CacheCollection::Media).await.unwrap();

        assert!(cache.get(CacheCollection::Media, "k").await.unwrap().is_none());
        assert_eq!(
            cache.get(CacheCollection::UploadBatches, "k").await.unwrap(),
            Some(json!("batch"))
        );
    }

    #[tokio::test]
    async fn test_get_all_is_ordered_by_key() {
        let cache = SqliteLocalCache::in_memory().await.unwrap();

        for key in ["c", "a", "b"] {
            cache.put(CacheCollection::UploadHistory, key, &json!(key)).await.unwrap();
        }

        let keys: Vec<String> = cache
            .get_all(CacheCollection::UploadHistory)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_delete_record() {
        let cache = SqliteLocalCache::in_memory().await.unwrap();

        cache.put(CacheCollection::ProcessingQueue, "s1", &json!([])).await.unwrap();
        cache.delete(CacheCollection::ProcessingQueue, "s1").await.unwrap();

        assert!(cache
            .get(CacheCollection::ProcessingQueue, "s1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_file_backed_cache_persists() {
        let dir = std::env::temp_dir().join(format!("media-index-cache-{}", uuid::Uuid::new_v4()));
        let path = dir.join("cache.db");

        {
            let cache = SqliteLocalCache::new(path.clone()).await.unwrap();
            cache.put(CacheCollection::Media, "m1", &json!({"src": "a.png"})).await.unwrap();
        }

        let reopened = SqliteLocalCache::new(path).await.unwrap();
        assert!(reopened.get(CacheCollection::Media, "m1").await.unwrap().is_some());

        let _ = std::fs::remove_dir_all(dir);
    }
}
