/// Configuration management for Aurora AppView
use crate::error::{AppViewError, AppViewResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Main AppView configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppViewConfig {
    pub service: ServiceConfig,
    pub upstream: UpstreamConfig,
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub backfill: BackfillConfig,
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    /// Header carrying the caller-asserted viewer DID
    pub viewer_header: String,
}

/// Upstream repository server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub pds_url: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub db_location: PathBuf,
    pub max_connections: u32,
}

/// Firehose reconnect policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub reconnect_base_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_max_attempts: u32,
}

/// Cold-start backfill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackfillConfig {
    pub enabled: bool,
    pub page_size: u32,
    pub batch_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for AppViewConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                hostname: "0.0.0.0".to_string(),
                port: 3000,
                viewer_header: "x-viewer-did".to_string(),
            },
            upstream: UpstreamConfig {
                pds_url: "https://localhost:2583".to_string(),
            },
            storage: StorageConfig {
                db_location: PathBuf::from("./data/appview.sqlite"),
                max_connections: 10,
            },
            ingest: IngestConfig {
                reconnect_base_ms: 1000,
                reconnect_max_delay_ms: 30_000,
                reconnect_max_attempts: 10,
            },
            backfill: BackfillConfig {
                enabled: true,
                page_size: 100,
                batch_size: 500,
            },
            logging: LoggingConfig {
                level: "aurora_appview=info,tower_http=info".to_string(),
            },
        }
    }
}

impl AppViewConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> AppViewResult<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from any key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> AppViewResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let hostname = lookup("APPVIEW_HOSTNAME").unwrap_or(defaults.service.hostname);
        let port = parsed(&lookup, "APPVIEW_PORT", defaults.service.port)?;
        let viewer_header = lookup("APPVIEW_VIEWER_HEADER")
            .map(|h| h.to_ascii_lowercase())
            .unwrap_or(defaults.service.viewer_header);

        let pds_url = lookup("APPVIEW_PDS_URL")
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or(defaults.upstream.pds_url);

        let db_location = lookup("APPVIEW_DB_LOCATION")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.db_location);
        let max_connections = parsed(
            &lookup,
            "APPVIEW_DB_MAX_CONNECTIONS",
            defaults.storage.max_connections,
        )?;

        let reconnect_base_ms = parsed(
            &lookup,
            "APPVIEW_RECONNECT_BASE_MS",
            defaults.ingest.reconnect_base_ms,
        )?;
        let reconnect_max_delay_ms = parsed(
            &lookup,
            "APPVIEW_RECONNECT_MAX_DELAY_MS",
            defaults.ingest.reconnect_max_delay_ms,
        )?;
        let reconnect_max_attempts = parsed(
            &lookup,
            "APPVIEW_RECONNECT_MAX_ATTEMPTS",
            defaults.ingest.reconnect_max_attempts,
        )?;

        let backfill_enabled = parsed(&lookup, "APPVIEW_BACKFILL_ENABLED", defaults.backfill.enabled)?;
        let page_size: u32 = parsed(
            &lookup,
            "APPVIEW_BACKFILL_PAGE_SIZE",
            defaults.backfill.page_size,
        )?;
        let batch_size = parsed(
            &lookup,
            "APPVIEW_BACKFILL_BATCH_SIZE",
            defaults.backfill.batch_size,
        )?;

        let level = lookup("RUST_LOG").unwrap_or(defaults.logging.level);

        Ok(AppViewConfig {
            service: ServiceConfig {
                hostname,
                port,
                viewer_header,
            },
            upstream: UpstreamConfig { pds_url },
            storage: StorageConfig {
                db_location,
                max_connections,
            },
            ingest: IngestConfig {
                reconnect_base_ms,
                reconnect_max_delay_ms,
                reconnect_max_attempts,
            },
            backfill: BackfillConfig {
                enabled: backfill_enabled,
                // listRecords caps pages at 100
                page_size: page_size.clamp(1, 100),
                batch_size,
            },
            logging: LoggingConfig { level },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> AppViewResult<()> {
        if self.service.hostname.is_empty() {
            return Err(AppViewError::Validation("Hostname cannot be empty".to_string()));
        }

        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.upstream.pds_url.starts_with(scheme));
        if !scheme_ok {
            return Err(AppViewError::Validation(format!(
                "PDS URL must use http, https, ws or wss: {}",
                self.upstream.pds_url
            )));
        }

        if self.ingest.reconnect_max_attempts == 0 {
            return Err(AppViewError::Validation(
                "Reconnect attempt budget must be at least 1".to_string(),
            ));
        }

        if self.ingest.reconnect_base_ms > self.ingest.reconnect_max_delay_ms {
            return Err(AppViewError::Validation(
                "Reconnect base delay cannot exceed the maximum delay".to_string(),
            ));
        }

        if self.backfill.batch_size == 0 {
            return Err(AppViewError::Validation(
                "Backfill batch size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Upstream base URL over HTTP(S)
    pub fn pds_http_url(&self) -> String {
        let url = &self.upstream.pds_url;
        if let Some(rest) = url.strip_prefix("wss://") {
            format!("https://{}", rest)
        } else if let Some(rest) = url.strip_prefix("ws://") {
            format!("http://{}", rest)
        } else {
            url.clone()
        }
    }

    /// Upstream base URL over WebSocket
    pub fn pds_ws_url(&self) -> String {
        self.pds_http_url()
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }

    /// Listen address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.service.hostname, self.service.port)
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> AppViewResult<T>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| AppViewError::Validation(format!("Invalid value for {}: {}", key, raw))),
        None => Ok(default),
    }
}
