/// API routes and handlers
pub mod actor;
pub mod embed;
pub mod feed;
pub mod graph;
pub mod health;
pub mod hydrate;
pub mod middleware;
pub mod params;
pub mod views;

use crate::context::AppContext;
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(feed::routes())
        .merge(actor::routes())
        .merge(graph::routes())
}
