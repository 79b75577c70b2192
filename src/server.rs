/// HTTP server setup and routing
use crate::{
    api::middleware::track_http_metrics,
    context::AppContext,
    error::{AppViewError, AppViewResult},
    metrics,
};
use axum::{
    http::{header, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use std::future::Future;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Build the main application router
/// Returns Router<()> because state is already provided
pub fn build_router(ctx: AppContext) -> Router {
    // Read-only surface
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET])
        .allow_headers(Any);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(crate::api::routes())
        // Provide state - converts Router<AppContext> to Router<()>
        .with_state(ctx)
        .layer(middleware::from_fn(track_http_metrics))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// Prometheus text exposition
async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Resolves on Ctrl-C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}

/// Start the HTTP server and run until `shutdown` resolves
pub async fn serve<F>(ctx: AppContext, shutdown: F) -> AppViewResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = ctx.config.bind_address();

    info!("Aurora AppView listening on {}", addr);
    info!("   Upstream PDS: {}", ctx.config.pds_http_url());

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppViewError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AppViewError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::records::{at_uri, Collection};
    use crate::store::tests::{follow, like, post, reply, write, ALICE, BOB, CAROL};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get(app: &Router, uri: &str, viewer: Option<&str>) -> (StatusCode, Value) {
        let mut request = Request::builder().uri(uri);
        if let Some(did) = viewer {
            request = request.header("x-viewer-did", did);
        }
        let response = app
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_uri(did: &str, rkey: &str) -> String {
        at_uri(did, Collection::Post.nsid(), rkey)
    }

    fn encoded(value: &str) -> String {
        urlencoding::encode(value).into_owned()
    }

    #[tokio::test]
    async fn test_unknown_route_is_json_404() {
        let (ctx, _dir) = test_context().await;
        let app = build_router(ctx);

        let (status, body) = get(&app, "/xrpc/app.bsky.feed.nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");
    }

    #[tokio::test]
    async fn test_thread_counts_follow_likes() {
        let (ctx, _dir) = test_context().await;
        let p1 = post_uri(ALICE, "p1");
        ctx.store
            .put_record(&post(ALICE, "p1", "hi", "2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        ctx.store.put_record(&like(BOB, "l1", &p1)).await.unwrap();
        ctx.store
            .put_record(&reply(CAROL, "r1", &p1, &p1, "2024-05-01T11:00:00Z"))
            .await
            .unwrap();
        let app = build_router(ctx.clone());

        let uri = format!("/xrpc/app.bsky.feed.getPostThread?uri={}", encoded(&p1));
        let (status, body) = get(&app, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["thread"]["$type"], "app.bsky.feed.defs#threadViewPost");
        assert_eq!(body["thread"]["post"]["likeCount"], 1);
        assert_eq!(body["thread"]["post"]["replyCount"], 1);
        assert_eq!(body["thread"]["replies"][0]["post"]["author"]["did"], CAROL);

        ctx.store
            .delete_record(BOB, Collection::Like, "l1")
            .await
            .unwrap();
        let (_, body) = get(&app, &uri, None).await;
        assert_eq!(body["thread"]["post"]["likeCount"], 0);
    }

    #[tokio::test]
    async fn test_thread_errors() {
        let (ctx, _dir) = test_context().await;
        let app = build_router(ctx);
        let missing = encoded(&post_uri(ALICE, "missing"));

        let (status, body) = get(
            &app,
            &format!("/xrpc/app.bsky.feed.getPostThread?uri={}", missing),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NotFound");

        let (status, body) = get(
            &app,
            &format!("/xrpc/app.bsky.feed.getPostThread?uri={}&depth=1001", missing),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidRequest");
    }

    #[tokio::test]
    async fn test_author_feed_pagination() {
        let (ctx, _dir) = test_context().await;
        for i in 0..7 {
            let created_at = format!("2024-05-01T10:{:02}:00Z", i);
            ctx.store
                .put_record(&post(ALICE, &format!("p{}", i), "post", &created_at))
                .await
                .unwrap();
        }
        let app = build_router(ctx);

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut uri = format!("/xrpc/app.bsky.feed.getAuthorFeed?actor={}&limit=3", ALICE);
            if let Some(c) = &cursor {
                uri.push_str(&format!("&cursor={}", encoded(c)));
            }
            let (status, body) = get(&app, &uri, None).await;
            assert_eq!(status, StatusCode::OK);

            for item in body["feed"].as_array().unwrap() {
                seen.push(item["post"]["uri"].as_str().unwrap().to_string());
            }
            match body["cursor"].as_str() {
                Some(c) => cursor = Some(c.to_string()),
                None => break,
            }
        }

        let expected: Vec<String> = (0..7).rev().map(|i| post_uri(ALICE, &format!("p{}", i))).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn test_limit_out_of_range_is_rejected() {
        let (ctx, _dir) = test_context().await;
        let app = build_router(ctx);

        for limit in ["0", "101", "lots"] {
            let uri = format!("/xrpc/app.bsky.feed.getAuthorFeed?actor={}&limit={}", ALICE, limit);
            let (status, body) = get(&app, &uri, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "limit={}", limit);
            assert_eq!(body["error"], "InvalidRequest");
        }
    }

    #[tokio::test]
    async fn test_timeline_requires_viewer() {
        let (ctx, _dir) = test_context().await;
        ctx.store
            .put_record(&post(BOB, "b1", "from bob", "2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        ctx.store
            .put_record(&post(CAROL, "c1", "from carol", "2024-05-01T11:00:00Z"))
            .await
            .unwrap();
        ctx.store.put_record(&follow(ALICE, "f1", BOB)).await.unwrap();
        let app = build_router(ctx);

        let (status, body) = get(&app, "/xrpc/app.bsky.feed.getTimeline", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "AuthenticationRequired");

        let (status, _) = get(&app, "/xrpc/app.bsky.feed.getTimeline", Some("alice")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = get(&app, "/xrpc/app.bsky.feed.getTimeline", Some(ALICE)).await;
        assert_eq!(status, StatusCode::OK);
        let feed = body["feed"].as_array().unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0]["post"]["uri"], post_uri(BOB, "b1"));
        assert_eq!(feed[0]["post"]["author"]["viewer"]["following"], at_uri(ALICE, Collection::Follow.nsid(), "f1"));
        assert!(body.get("cursor").is_none());
    }

    #[tokio::test]
    async fn test_repost_reason_in_author_feed() {
        let (ctx, _dir) = test_context().await;
        let p1 = post_uri(ALICE, "p1");
        ctx.store
            .put_record(&post(ALICE, "p1", "original", "2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        ctx.store.set_handle(BOB, "bob.test").await.unwrap();
        ctx.store
            .put_record(&write(
                BOB,
                Collection::Repost,
                "rp1",
                serde_json::json!({"subject": {"uri": p1, "cid": "bafyp1"}, "createdAt": "2024-05-01T12:00:00Z"}),
            ))
            .await
            .unwrap();
        let app = build_router(ctx);

        let (_, body) = get(&app, &format!("/xrpc/app.bsky.feed.getAuthorFeed?actor={}", BOB), None).await;
        let feed = body["feed"].as_array().unwrap();
        assert_eq!(feed.len(), 1);
        assert_eq!(feed[0]["post"]["uri"], p1);
        assert_eq!(feed[0]["reason"]["$type"], "app.bsky.feed.defs#reasonRepost");
        assert_eq!(feed[0]["reason"]["by"]["handle"], "bob.test");
        assert_eq!(feed[0]["post"]["repostCount"], 1);

        let (_, body) = get(
            &app,
            "/xrpc/app.bsky.feed.getAuthorFeed?actor=bob.test&filter=posts_with_media",
            None,
        )
        .await;
        assert_eq!(body["feed"].as_array().unwrap().len(), 0);

        let (status, _) = get(
            &app,
            &format!("/xrpc/app.bsky.feed.getAuthorFeed?actor={}&filter=everything", BOB),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_posts_keeps_request_order() {
        let (ctx, _dir) = test_context().await;
        for rkey in ["a", "b"] {
            ctx.store
                .put_record(&post(ALICE, rkey, rkey, "2024-05-01T10:00:00Z"))
                .await
                .unwrap();
        }
        let app = build_router(ctx);

        let uri = format!(
            "/xrpc/app.bsky.feed.getPosts?uris={}&uris={}&uris={}",
            encoded(&post_uri(ALICE, "b")),
            encoded(&post_uri(ALICE, "missing")),
            encoded(&post_uri(ALICE, "a")),
        );
        let (status, body) = get(&app, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let posts = body["posts"].as_array().unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0]["record"]["text"], "b");
        assert_eq!(posts[1]["record"]["text"], "a");

        let too_many: Vec<String> = (0..26)
            .map(|i| format!("uris={}", encoded(&post_uri(ALICE, &i.to_string()))))
            .collect();
        let (status, _) = get(&app, &format!("/xrpc/app.bsky.feed.getPosts?{}", too_many.join("&")), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_profile_and_graph() {
        let (ctx, _dir) = test_context().await;
        ctx.store.set_handle(ALICE, "alice.test").await.unwrap();
        ctx.store
            .put_record(&write(
                ALICE,
                Collection::Profile,
                "self",
                serde_json::json!({"displayName": "Alice", "description": "hello"}),
            ))
            .await
            .unwrap();
        ctx.store.put_record(&follow(BOB, "f1", ALICE)).await.unwrap();
        ctx.store.put_record(&follow(CAROL, "f2", ALICE)).await.unwrap();
        let app = build_router(ctx);

        let (status, body) = get(&app, "/xrpc/app.bsky.actor.getProfile?actor=alice.test", Some(BOB)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["did"], ALICE);
        assert_eq!(body["displayName"], "Alice");
        assert_eq!(body["followersCount"], 2);
        assert_eq!(body["viewer"]["followedBy"].as_str(), None);
        assert_eq!(body["viewer"]["following"], at_uri(BOB, Collection::Follow.nsid(), "f1"));

        let (status, _) = get(&app, "/xrpc/app.bsky.actor.getProfile?actor=nobody.test", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = get(
            &app,
            &format!("/xrpc/app.bsky.actor.getProfiles?actors=alice.test&actors={}", BOB),
            None,
        )
        .await;
        assert_eq!(body["profiles"].as_array().unwrap().len(), 1);

        let (status, body) = get(
            &app,
            &format!("/xrpc/app.bsky.graph.getFollowers?actor={}&limit=1", ALICE),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["subject"]["handle"], "alice.test");
        assert_eq!(body["followers"].as_array().unwrap().len(), 1);
        assert!(body["cursor"].is_string());

        let (_, body) = get(&app, &format!("/xrpc/app.bsky.graph.getFollows?actor={}", BOB), None).await;
        assert_eq!(body["follows"][0]["did"], ALICE);
        assert_eq!(body["subject"]["handle"], "handle.invalid");
    }

    #[tokio::test]
    async fn test_search_and_likes() {
        let (ctx, _dir) = test_context().await;
        let p1 = post_uri(ALICE, "p1");
        ctx.store
            .put_record(&post(ALICE, "p1", "100% rust", "2024-05-01T10:00:00Z"))
            .await
            .unwrap();
        ctx.store
            .put_record(&post(ALICE, "p2", "1000 rust", "2024-05-01T11:00:00Z"))
            .await
            .unwrap();
        ctx.store.put_record(&like(BOB, "l1", &p1)).await.unwrap();
        let app = build_router(ctx);

        let (status, body) = get(&app, "/xrpc/app.bsky.feed.searchPosts?q=100%25", None).await;
        assert_eq!(status, StatusCode::OK);
        let posts = body["posts"].as_array().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0]["uri"], p1);

        let (status, _) = get(&app, "/xrpc/app.bsky.feed.searchPosts?q=", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = get(&app, &format!("/xrpc/app.bsky.feed.getLikes?uri={}", encoded(&p1)), None).await;
        assert_eq!(body["uri"], p1);
        assert_eq!(body["likes"][0]["actor"]["did"], BOB);

        let (_, body) = get(&app, &format!("/xrpc/app.bsky.feed.getRepostedBy?uri={}", encoded(&p1)), None).await;
        assert_eq!(body["repostedBy"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_health_and_metrics_endpoints() {
        let (ctx, _dir) = test_context().await;
        let app = build_router(ctx);

        let (status, body) = get(&app, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stats"]["posts"], 0);
        assert_eq!(body["ingest"]["connected"], false);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("appview_http_requests_total"));
    }
}
