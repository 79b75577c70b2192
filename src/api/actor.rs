/// app.bsky.actor.* endpoints
use crate::{
    api::{
        hydrate::Hydrator,
        params::{check_batch, Viewer, XrpcQuery},
        views::ProfileViewDetailed,
    },
    context::AppContext,
    error::{AppViewError, AppViewResult},
};
use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

/// Build actor routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/xrpc/app.bsky.actor.getProfile", get(get_profile))
        .route("/xrpc/app.bsky.actor.getProfiles", get(get_profiles))
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    actor: String,
}

/// Profile by DID or handle
async fn get_profile(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<ProfileParams>,
) -> AppViewResult<Json<ProfileViewDetailed>> {
    let row = ctx
        .store
        .profile(&params.actor)
        .await?
        .ok_or_else(|| AppViewError::NotFound(format!("Profile not found: {}", params.actor)))?;

    Hydrator::new(&ctx, &viewer)
        .profiles_detailed(vec![row])
        .await?
        .pop()
        .map(Json)
        .ok_or_else(|| AppViewError::Internal("profile hydration returned nothing".to_string()))
}

#[derive(Debug, Deserialize)]
struct ProfilesParams {
    #[serde(default)]
    actors: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProfilesResponse {
    profiles: Vec<ProfileViewDetailed>,
}

/// Batch profile fetch; unknown actors are omitted
async fn get_profiles(
    State(ctx): State<AppContext>,
    viewer: Viewer,
    XrpcQuery(params): XrpcQuery<ProfilesParams>,
) -> AppViewResult<Json<ProfilesResponse>> {
    check_batch("actors", &params.actors)?;

    let mut dids = Vec::with_capacity(params.actors.len());
    for actor in &params.actors {
        if let Some(did) = ctx.store.resolve_actor(actor).await? {
            if !dids.contains(&did) {
                dids.push(did);
            }
        }
    }

    let mut found = ctx.store.profiles(&dids).await?;
    let rows = dids.iter().filter_map(|did| found.remove(did)).collect();
    let profiles = Hydrator::new(&ctx, &viewer).profiles_detailed(rows).await?;

    Ok(Json(ProfilesResponse { profiles }))
}
