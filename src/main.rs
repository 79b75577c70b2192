/// Aurora AppView - ATProto read index for a single PDS
///
/// Follows the upstream firehose, materializes posts, likes, reposts,
/// follows, blocks and profiles into SQLite, and serves the app.bsky read
/// endpoints over that index.

mod api;
mod backfill;
mod car;
mod config;
mod context;
mod db;
mod error;
mod firehose;
mod metrics;
mod records;
mod server;
mod store;

use backfill::Backfill;
use config::AppViewConfig;
use context::AppContext;
use error::AppViewResult;
use firehose::{FirehoseClient, FirehoseHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> AppViewResult<()> {
    // Load configuration (also pulls in .env)
    let config = AppViewConfig::from_env()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_new(&config.logging.level)
                .unwrap_or_else(|_| "aurora_appview=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    print_banner();

    // Create application context
    let ctx = AppContext::new(config).await?;

    // Ingest runs beside the server so /health answers during a cold start
    let ingest = tokio::spawn(start_ingest(ctx.clone()));

    // Serve until a shutdown signal arrives
    let result = server::serve(ctx, server::shutdown_signal()).await;

    ingest.abort();
    match ingest.await {
        Ok(Some(firehose)) => {
            firehose.stop().await;
            tracing::info!("firehose stopped");
        }
        Ok(None) => {}
        Err(e) if e.is_cancelled() => tracing::info!("backfill interrupted by shutdown"),
        Err(e) => tracing::error!(error = %e, "ingest task failed"),
    }

    result
}

/// Backfill an empty index, then follow the firehose
///
/// Backfill must finish before live commits are applied. When it does not,
/// queries are still served and the next start resumes it.
async fn start_ingest(ctx: AppContext) -> Option<FirehoseHandle> {
    if ctx.config.backfill.enabled {
        let needed = match ctx.store.needs_backfill().await {
            Ok(needed) => needed,
            Err(e) => {
                tracing::error!(error = %e, "failed to read backfill state; firehose not started");
                return None;
            }
        };

        if needed {
            tracing::info!("empty index, starting backfill");
            let outcome = match Backfill::new(&ctx.config, ctx.store.clone(), ctx.ingest.clone()) {
                Ok(backfill) => backfill.run().await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(report) if report.is_complete() => {}
                Ok(_) => {
                    tracing::error!("backfill unfinished; serving without the firehose until restart");
                    return None;
                }
                Err(e) => {
                    tracing::error!(error = %e, "backfill aborted; serving without the firehose until restart");
                    return None;
                }
            }
        }
    }

    Some(FirehoseClient::new(&ctx.config, ctx.store.clone(), ctx.ingest.clone()).start())
}

fn print_banner() {
    println!(
        r#"
    ___                                      _
   /   | __  ___________  _________ _      | |  / (_)__ _      __
  / /| |/ / / / ___/ __ \/ ___/ __ `/      | | / / / _ \ | /| / /
 / ___ / /_/ / /  / /_/ / /  / /_/ /       | |/ / /  __/ |/ |/ /
/_/  |_\__,_/_/   \____/_/   \__,_/        |___/_/\___/|__/|__/

        ATProto AppView v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
