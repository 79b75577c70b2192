/// Application context and dependency injection
use crate::{
    config::AppViewConfig,
    db,
    error::AppViewResult,
    firehose::IngestStatus,
    store::Store,
};
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppViewConfig>,
    pub db: SqlitePool,
    pub store: Store,
    /// Written by the firehose client, read by /health
    pub ingest: Arc<IngestStatus>,
    pub started_at: Instant,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: AppViewConfig) -> AppViewResult<Self> {
        // Validate configuration
        config.validate()?;

        let db = db::create_pool(
            &config.storage.db_location,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                enable_wal: true,
            },
        )
        .await?;

        // Run migrations
        db::run_migrations(&db).await?;

        // Test connection
        db::test_connection(&db).await?;

        Ok(Self::from_pool(config, db))
    }

    /// Assemble a context around an already-migrated pool
    pub fn from_pool(config: AppViewConfig, db: SqlitePool) -> Self {
        Self {
            config: Arc::new(config),
            store: Store::new(db.clone()),
            db,
            ingest: Arc::new(IngestStatus::default()),
            started_at: Instant::now(),
        }
    }

    /// Public getBlob URL for a blob held by the upstream server
    pub fn blob_url(&self, did: &str, cid: &str) -> String {
        format!(
            "{}/xrpc/com.atproto.sync.getBlob?did={}&cid={}",
            self.config.pds_http_url(),
            urlencoding::encode(did),
            urlencoding::encode(cid)
        )
    }
}

/// Context over a fresh temporary database
#[cfg(test)]
pub async fn test_context() -> (AppContext, tempfile::TempDir) {
    let (pool, dir) = db::test_pool().await;
    let mut config = AppViewConfig::default();
    config.upstream.pds_url = "https://pds.test".to_string();
    (AppContext::from_pool(config, pool), dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_creates_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppViewConfig::default();
        config.storage.db_location = dir.path().join("nested").join("appview.sqlite");

        let ctx = AppContext::new(config).await.unwrap();
        assert!(ctx.store.needs_backfill().await.unwrap());
        assert!(dir.path().join("nested").join("appview.sqlite").exists());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = AppViewConfig::default();
        config.ingest.reconnect_max_attempts = 0;
        assert!(AppContext::new(config).await.is_err());
    }

    #[tokio::test]
    async fn test_blob_url() {
        let (ctx, _dir) = test_context().await;
        assert_eq!(
            ctx.blob_url("did:plc:alice", "bafkblob"),
            "https://pds.test/xrpc/com.atproto.sync.getBlob?did=did%3Aplc%3Aalice&cid=bafkblob"
        );
    }
}
