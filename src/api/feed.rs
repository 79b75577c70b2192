/// app.bsky.feed.* endpoints
use crate::{
    api::{
        hydrate::Hydrator,
        params::{check_batch, next_cursor, page_cursor, page_limit, Viewer, XrpcQuery},
        views::{FeedViewPost, PostView, ProfileView, ThreadItem},
    },
    context::AppContext,
    error::{AppViewError, AppViewResult},
    store::{AuthorFilter, EdgeQuery, EdgeRow, PageCursor},
};
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

const DEFAULT_THREAD_DEPTH: u32 = 6;
const DEFAULT_PARENT_HEIGHT: u32 = 80;
const MAX_THREAD_SPAN: u32 = 1000;

/// Build feed routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/app.bsky.feed.getTimeline", get(get_timeline))
        .route("/xrpc/app.bsky.feed.getAuthorFeed", get(get_author_feed))
        .route("/xrpc/app.bsky.feed.getPosts", get(get_posts))
        .route("/xrpc/app.bsky.feed.getPostThread", get(get_post_thread))
        .route("/xrpc/app.bsky.feed.getLikes", get(get_likes))
        .route("/xrpc/app.bsky.feed.getRepostedBy", get(get_reposted_by))
        .route("/xrpc/app.bsky.feed.searchPosts", get(search_posts))
}

#[derive(Debug, Deserialize)]
struct PageParams {
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct FeedResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    feed: Vec<FeedViewPost>,
}

/// Timeline for the viewer: their own posts plus everyone they follow
async fn get_timeline(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<PageParams>,
) -> AppViewResult<Json<FeedResponse>> {
    let did = viewer.require()?;
    let limit = page_limit(params.limit)?;
    let cursor = page_cursor(params.cursor.as_deref())?;

    let items = ctx.store.timeline(did, cursor.as_ref(), limit).await?;
    let cursor = next_cursor(&items, limit, |item| item.cursor());
    let feed = Hydrator::new(&ctx, &viewer).feed(items).await?;

    Ok(Json(FeedResponse { cursor, feed }))
}

#[derive(Debug, Deserialize)]
struct AuthorFeedParams {
    actor: String,
    filter: Option<String>,
    limit: Option<u32>,
    cursor: Option<String>,
}

async fn get_author_feed(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<AuthorFeedParams>,
) -> AppViewResult<Json<FeedResponse>> {
    let limit = page_limit(params.limit)?;
    let cursor = page_cursor(params.cursor.as_deref())?;
    let filter = match params.filter.as_deref() {
        Some(raw) => AuthorFilter::parse(raw)?,
        None => AuthorFilter::default(),
    };

    let did = ctx
        .store
        .resolve_actor(&params.actor)
        .await?
        .ok_or_else(|| AppViewError::NotFound(format!("Profile not found: {}", params.actor)))?;

    let items = ctx
        .store
        .posts_by_author(&did, filter, cursor.as_ref(), limit)
        .await?;
    let cursor = next_cursor(&items, limit, |item| item.cursor());
    let feed = Hydrator::new(&ctx, &viewer).feed(items).await?;

    Ok(Json(FeedResponse { cursor, feed }))
}

#[derive(Debug, Deserialize)]
struct GetPostsParams {
    #[serde(default)]
    uris: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PostsResponse {
    posts: Vec<PostView>,
}

/// Batch post fetch; unknown uris are omitted and request order is kept
async fn get_posts(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<GetPostsParams>,
) -> AppViewResult<Json<PostsResponse>> {
    check_batch("uris", &params.uris)?;

    let mut found = ctx.store.posts_by_uris(&params.uris).await?;
    let rows = params
        .uris
        .iter()
        .filter_map(|uri| found.remove(uri))
        .collect();
    let posts = Hydrator::new(&ctx, &viewer).posts(rows).await?;

    Ok(Json(PostsResponse { posts }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThreadParams {
    uri: String,
    depth: Option<u32>,
    parent_height: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ThreadResponse {
    thread: ThreadItem,
}

fn thread_span(name: &str, value: Option<u32>, default: u32) -> AppViewResult<u32> {
    match value {
        None => Ok(default),
        Some(n) if n <= MAX_THREAD_SPAN => Ok(n),
        Some(n) => Err(AppViewError::Validation(format!(
            "{} must be at most {}, got {}",
            name, MAX_THREAD_SPAN, n
        ))),
    }
}

async fn get_post_thread(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<ThreadParams>,
) -> AppViewResult<Json<ThreadResponse>> {
    let depth = thread_span("depth", params.depth, DEFAULT_THREAD_DEPTH)?;
    let parent_height = thread_span("parentHeight", params.parent_height, DEFAULT_PARENT_HEIGHT)?;

    let thread = ctx
        .store
        .post_thread(&params.uri, depth, parent_height)
        .await?
        .ok_or_else(|| AppViewError::NotFound(format!("Post not found: {}", params.uri)))?;
    let thread = Hydrator::new(&ctx, &viewer).thread(thread).await?;

    Ok(Json(ThreadResponse { thread }))
}

#[derive(Debug, Deserialize)]
struct SubjectPageParams {
    uri: String,
    cid: Option<String>,
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Like {
    indexed_at: String,
    created_at: String,
    actor: ProfileView,
}

#[derive(Debug, Serialize)]
struct LikesResponse {
    uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    likes: Vec<Like>,
}

/// One page of likes or reposts with the acting profiles hydrated
async fn edge_page(
    ctx: &AppContext,
    viewer: &Viewer,
    query: EdgeQuery<'_>,
    params: &SubjectPageParams,
) -> AppViewResult<(Vec<EdgeRow>, Vec<ProfileView>, Option<String>)> {
    let limit = page_limit(params.limit)?;
    let cursor = page_cursor(params.cursor.as_deref())?;

    let rows = ctx.store.edges(query, cursor.as_ref(), limit).await?;
    let next = next_cursor(&rows, limit, EdgeRow::cursor);
    let dids: Vec<String> = rows.iter().map(|row| row.actor_did.clone()).collect();
    let actors = Hydrator::new(ctx, viewer).profile_views(&dids).await?;

    Ok((rows, actors, next))
}

async fn get_likes(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<SubjectPageParams>,
) -> AppViewResult<Json<LikesResponse>> {
    let (rows, actors, cursor) =
        edge_page(&ctx, &viewer, EdgeQuery::LikesOf(&params.uri), &params).await?;

    let likes = rows
        .into_iter()
        .zip(actors)
        .map(|(row, actor)| Like {
            indexed_at: row.indexed_at,
            created_at: row.created_at,
            actor,
        })
        .collect();

    Ok(Json(LikesResponse {
        uri: params.uri,
        cid: params.cid,
        cursor,
        likes,
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RepostedByResponse {
    uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    reposted_by: Vec<ProfileView>,
}

async fn get_reposted_by(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<SubjectPageParams>,
) -> AppViewResult<Json<RepostedByResponse>> {
    let (_, reposted_by, cursor) =
        edge_page(&ctx, &viewer, EdgeQuery::RepostsOf(&params.uri), &params).await?;

    Ok(Json(RepostedByResponse {
        uri: params.uri,
        cid: params.cid,
        cursor,
        reposted_by,
    }))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: String,
    limit: Option<u32>,
    cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    posts: Vec<PostView>,
}

/// Substring search over post text, newest first
async fn search_posts(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<SearchParams>,
) -> AppViewResult<Json<SearchResponse>> {
    let query = params.q.trim();
    if query.is_empty() {
        return Err(AppViewError::Validation("q must not be empty".to_string()));
    }
    let limit = page_limit(params.limit)?;
    let cursor = page_cursor(params.cursor.as_deref())?;

    let rows = ctx.store.search_posts(query, cursor.as_ref(), limit).await?;
    let cursor = next_cursor(&rows, limit, |row| PageCursor::new(&row.created_at, &row.uri));
    let posts = Hydrator::new(&ctx, &viewer).posts(rows).await?;

    Ok(Json(SearchResponse { cursor, posts }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_span() {
        assert_eq!(thread_span("depth", None, 6).unwrap(), 6);
        assert_eq!(thread_span("depth", Some(0), 6).unwrap(), 0);
        assert_eq!(thread_span("depth", Some(1000), 6).unwrap(), 1000);
        assert!(thread_span("depth", Some(1001), 6).is_err());
    }
}
