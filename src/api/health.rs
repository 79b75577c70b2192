/// Health check endpoints
///
/// `/health` reports row counts, backfill progress, firehose connectivity
/// and the persisted sync cursor. Backfilling or losing the firehose degrades
/// the service but queries keep being answered from the existing index.
use crate::{
    context::AppContext,
    error::AppViewResult,
    firehose::IngestSnapshot,
    store::StoreStats,
};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use std::time::Instant;

/// Health status response
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Overall status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    pub version: String,

    pub uptime_seconds: f64,

    /// Individual component checks
    pub checks: Vec<ComponentHealth>,

    /// Row counts, absent when the database is unreachable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StoreStats>,

    pub ingest: IngestSnapshot,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<SyncCursor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Health status of individual component
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,

    /// Status: "healthy", "degraded", or "unhealthy"
    pub status: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted firehose position
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub rev: Option<String>,
    pub seq: Option<i64>,
    pub last_sync: Option<String>,
    pub backfill_completed_at: Option<String>,
}

/// Build health check routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(health_detailed))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
}

/// Liveness probe: responding at all is the signal
pub async fn liveness_probe() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "alive",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Readiness probe: the index must be readable
pub async fn readiness_probe(
    State(ctx): State<AppContext>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if let Err(e) = check_database(&ctx).await {
        tracing::warn!(error = %e, "readiness_probe_failed: database check failed");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    Ok(Json(serde_json::json!({
        "status": "ready",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

/// Full status with counts, ingest state and cursor
pub async fn health_detailed(State(ctx): State<AppContext>) -> (StatusCode, Json<HealthStatus>) {
    let start = Instant::now();

    let (database, stats, cursor) = check_database_detailed(&ctx).await;
    let ingest = ctx.ingest.snapshot();
    let checks = vec![database, ingest_health(&ingest)];

    let overall_status = determine_overall_status(&checks);

    let health = HealthStatus {
        status: overall_status.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: ctx.started_at.elapsed().as_secs_f64(),
        checks,
        stats,
        ingest,
        cursor,
        message: if overall_status == "healthy" {
            None
        } else {
            Some("One or more components are unhealthy".to_string())
        },
    };

    let status_code = match overall_status.as_str() {
        "healthy" => StatusCode::OK,
        "degraded" => StatusCode::OK, // Still serving queries
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };

    tracing::debug!(
        status = %overall_status,
        duration_ms = start.elapsed().as_millis(),
        "health_check_completed"
    );

    (status_code, Json(health))
}

async fn check_database(ctx: &AppContext) -> AppViewResult<()> {
    sqlx::query("SELECT 1").fetch_one(&ctx.db).await?;
    Ok(())
}

async fn check_database_detailed(
    ctx: &AppContext,
) -> (ComponentHealth, Option<StoreStats>, Option<SyncCursor>) {
    let start = Instant::now();

    let result = async {
        let stats = ctx.store.stats().await?;
        let state = ctx.store.sync_state().await?;
        AppViewResult::Ok((stats, state))
    }
    .await;

    let elapsed = Some(start.elapsed().as_millis() as u64);
    match result {
        Ok((stats, state)) => (
            ComponentHealth {
                name: "database".to_string(),
                status: "healthy".to_string(),
                response_time_ms: elapsed,
                error: None,
            },
            Some(stats),
            Some(SyncCursor {
                rev: state.pds_cursor,
                seq: state.pds_seq,
                last_sync: state.last_sync,
                backfill_completed_at: state.backfill_completed_at,
            }),
        ),
        Err(e) => (
            ComponentHealth {
                name: "database".to_string(),
                status: "unhealthy".to_string(),
                response_time_ms: elapsed,
                error: Some(e.to_string()),
            },
            None,
            None,
        ),
    }
}

/// Firehose state; never worse than degraded since queries still work
fn ingest_health(snapshot: &IngestSnapshot) -> ComponentHealth {
    let (status, error) = if snapshot.backfilling {
        ("degraded", Some("backfill in progress".to_string()))
    } else if snapshot.gave_up {
        ("degraded", Some("reconnect attempts exhausted".to_string()))
    } else if !snapshot.connected {
        ("degraded", Some("not connected".to_string()))
    } else {
        ("healthy", None)
    };

    ComponentHealth {
        name: "firehose".to_string(),
        status: status.to_string(),
        response_time_ms: None,
        error,
    }
}

/// Determine overall health status from individual checks
fn determine_overall_status(checks: &[ComponentHealth]) -> String {
    let unhealthy_count = checks.iter().filter(|c| c.status == "unhealthy").count();
    let degraded_count = checks.iter().filter(|c| c.status == "degraded").count();

    if unhealthy_count > 0 {
        "unhealthy".to_string()
    } else if degraded_count > 0 {
        "degraded".to_string()
    } else {
        "healthy".to_string()
    }
}
