/// Request extractors and pagination helpers shared by the XRPC handlers
use crate::{
    context::AppContext,
    error::{AppViewError, AppViewResult},
    store::PageCursor,
};
use axum::{async_trait, extract::FromRequestParts, http::request::Parts};
use serde::de::DeserializeOwned;

pub const DEFAULT_LIMIT: u32 = 50;
pub const MAX_LIMIT: u32 = 100;
/// Cap on `uris` / `actors` for the batch endpoints
pub const MAX_BATCH: usize = 25;

/// Query string extractor that accepts repeated keys and rejects with an XRPC error body
#[derive(Debug, Clone)]
pub struct XrpcQuery<T>(pub T);

#[async_trait]
impl<T, S> FromRequestParts<S> for XrpcQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AppViewError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let axum_extra::extract::Query(value) =
            axum_extra::extract::Query::<T>::from_request_parts(parts, state)
                .await
                .map_err(|e| AppViewError::Validation(e.to_string()))?;
        Ok(Self(value))
    }
}

/// The caller-asserted viewer DID, taken from the configured header
///
/// No signature or session check happens here; a fronting layer is trusted
/// to have established the identity.
#[derive(Debug, Clone, Default)]
pub struct Viewer(pub Option<String>);

impl Viewer {
    pub fn did(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// The viewer DID, or 401 when the header was absent
    pub fn require(&self) -> AppViewResult<&str> {
        self.did().ok_or_else(|| {
            AppViewError::Authentication("viewer identity header is required".to_string())
        })
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for Viewer {
    type Rejection = AppViewError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let header = state.config.service.viewer_header.as_str();
        let Some(value) = parts.headers.get(header) else {
            return Ok(Viewer(None));
        };

        let did = value
            .to_str()
            .map_err(|_| AppViewError::Validation(format!("{} is not valid text", header)))?
            .trim();

        if did.is_empty() {
            return Ok(Viewer(None));
        }
        if !did.starts_with("did:") {
            return Err(AppViewError::Validation(format!(
                "{} must carry a DID",
                header
            )));
        }

        Ok(Viewer(Some(did.to_string())))
    }
}

/// Resolve the page size, defaulting to 50 and rejecting anything outside 1..=100
pub fn page_limit(limit: Option<u32>) -> AppViewResult<u32> {
    match limit {
        None => Ok(DEFAULT_LIMIT),
        Some(n) if (1..=MAX_LIMIT).contains(&n) => Ok(n),
        Some(n) => Err(AppViewError::Validation(format!(
            "limit must be between 1 and {}, got {}",
            MAX_LIMIT, n
        ))),
    }
}

pub fn page_cursor(raw: Option<&str>) -> AppViewResult<Option<PageCursor>> {
    match raw {
        None | Some("") => Ok(None),
        Some(raw) => PageCursor::parse(raw)
            .map(Some)
            .ok_or_else(|| AppViewError::Validation(format!("malformed cursor: {}", raw))),
    }
}

/// Cursor for the next page; a short page means the listing is exhausted
pub fn next_cursor<T, F>(items: &[T], limit: u32, cursor_of: F) -> Option<String>
where
    F: Fn(&T) -> PageCursor,
{
    if items.len() < limit as usize {
        return None;
    }
    items.last().map(|item| cursor_of(item).encode())
}

/// Reject batch requests that are empty or larger than 25
pub fn check_batch(name: &str, items: &[String]) -> AppViewResult<()> {
    if items.is_empty() {
        return Err(AppViewError::Validation(format!("{} is required", name)));
    }
    if items.len() > MAX_BATCH {
        return Err(AppViewError::Validation(format!(
            "at most {} {} per request",
            MAX_BATCH, name
        )));
    }
    Ok(())
}
