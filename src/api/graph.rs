/// app.bsky.graph.* endpoints
use crate::{
    api::{
        hydrate::Hydrator,
        params::{next_cursor, page_cursor, page_limit, Viewer, XrpcQuery},
        views::ProfileView,
    },
    context::AppContext,
    error::{AppViewError, AppViewResult},
    store::EdgeRow,
};
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

/// Build graph routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/app.bsky.graph.getFollowers", get(get_followers))
        .route("/xrpc/app.bsky.graph.getFollows", get(get_follows))
}

#[derive(Debug, Deserialize)]
struct GraphParams {
    actor: String,
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct FollowersResponse {
    subject: ProfileView,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    followers: Vec<ProfileView>,
}

#[derive(Debug, Serialize)]
struct FollowsResponse {
    subject: ProfileView,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    follows: Vec<ProfileView>,
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Followers,
    Follows,
}

/// Subject view, one page of the related profiles and the next cursor
async fn graph_page(
    ctx: &AppContext,
    viewer: &Viewer,
    params: &GraphParams,
    direction: Direction,
) -> AppViewResult<(ProfileView, Vec<ProfileView>, Option<String>)> {
    let limit = page_limit(params.limit)?;
    let cursor = page_cursor(params.cursor.as_deref())?;

    let did = ctx
        .store
        .resolve_actor(&params.actor)
        .await?
        .ok_or_else(|| AppViewError::NotFound(format!("Profile not found: {}", params.actor)))?;

    let rows = match direction {
        Direction::Followers => ctx.store.followers_of(&did, cursor.as_ref(), limit).await?,
        Direction::Follows => ctx.store.follows_of(&did, cursor.as_ref(), limit).await?,
    };
    let next = next_cursor(&rows, limit, EdgeRow::cursor);

    let hydrator = Hydrator::new(ctx, viewer);
    let subject = hydrator
        .profile_views(&[did.clone()])
        .await?
        .pop()
        .ok_or_else(|| AppViewError::Internal("subject hydration returned nothing".to_string()))?;
    let dids: Vec<String> = rows.into_iter().map(|row| row.actor_did).collect();
    let profiles = hydrator.profile_views(&dids).await?;

    Ok((subject, profiles, next))
}

async fn get_followers(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<GraphParams>,
) -> AppViewResult<Json<FollowersResponse>> {
    let (subject, followers, cursor) =
        graph_page(&ctx, &viewer, &params, Direction::Followers).await?;

    Ok(Json(FollowersResponse {
        subject,
        cursor,
        followers,
    }))
}

async fn get_follows(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<GraphParams>,
) -> AppViewResult<Json<FollowsResponse>> {
    let (subject, follows, cursor) = graph_page(&ctx, &viewer, &params, Direction::Follows).await?;

    Ok(Json(FollowsResponse {
        subject,
        cursor,
        follows,
    }))
}
