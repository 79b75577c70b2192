/// Row models and read-side value types
use crate::error::{AppViewError, AppViewResult};
use crate::records::Record;
use serde::Serialize;
use sqlx::FromRow;

/// One record ready to be written, keyed by `(did, collection, rkey)`
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub did: String,
    pub rkey: String,
    pub cid: String,
    pub record: Record,
}

/// A post joined with its author's profile and live engagement counts
#[derive(Debug, Clone, FromRow)]
pub struct PostRow {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub text: String,
    pub reply_parent: Option<String>,
    pub reply_root: Option<String>,
    pub embed_data: Option<String>,
    pub facets: Option<String>,
    pub langs: Option<String>,
    pub created_at: String,
    pub indexed_at: String,
    pub author_handle: Option<String>,
    pub author_display_name: Option<String>,
    pub author_avatar_cid: Option<String>,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
}

/// One entry of a feed: a post, or a repost pointing at a post
#[derive(Debug, Clone, FromRow)]
pub struct FeedItemRow {
    pub item_uri: String,
    pub post_uri: String,
    pub repost_by: Option<String>,
    pub sort_at: String,
}

impl FeedItemRow {
    pub fn cursor(&self) -> PageCursor {
        PageCursor::new(&self.sort_at, &self.item_uri)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ProfileRow {
    pub did: String,
    pub handle: Option<String>,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar_cid: Option<String>,
    pub banner_cid: Option<String>,
    pub indexed_at: String,
    pub followers_count: i64,
    pub follows_count: i64,
    pub posts_count: i64,
}

/// A like, repost or follow seen from the actor side
#[derive(Debug, Clone, FromRow)]
pub struct EdgeRow {
    pub uri: String,
    pub actor_did: String,
    pub created_at: String,
    pub indexed_at: String,
}

impl EdgeRow {
    pub fn cursor(&self) -> PageCursor {
        PageCursor::new(&self.created_at, &self.uri)
    }
}

/// Which edge set to page through
#[derive(Debug, Clone, Copy)]
pub enum EdgeQuery<'a> {
    /// Likes on a post
    LikesOf(&'a str),
    /// Reposts of a post
    RepostsOf(&'a str),
    /// Accounts following an actor
    FollowersOf(&'a str),
    /// Accounts an actor follows
    FollowsOf(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PostCounts {
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
}

/// The viewer's own interactions with a post
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostViewerState {
    pub like: Option<String>,
    pub repost: Option<String>,
}

/// Relationship between the viewer and another actor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActorViewerState {
    pub following: Option<String>,
    pub followed_by: Option<String>,
    pub blocking: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, FromRow)]
pub struct SyncState {
    pub pds_cursor: Option<String>,
    pub pds_seq: Option<i64>,
    pub last_sync: Option<String>,
    pub backfill_completed_at: Option<String>,
}

/// Row counts per table
#[derive(Debug, Clone, Default, PartialEq, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub posts: i64,
    pub likes: i64,
    pub reposts: i64,
    pub follows: i64,
    pub blocks: i64,
    pub profiles: i64,
}

/// Counts from one batch of writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Author feed filters accepted by getAuthorFeed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AuthorFilter {
    #[default]
    PostsWithReplies,
    PostsNoReplies,
    PostsWithMedia,
    PostsAndAuthorThreads,
}

impl AuthorFilter {
    pub fn parse(value: &str) -> AppViewResult<Self> {
        match value {
            "posts_with_replies" => Ok(Self::PostsWithReplies),
            "posts_no_replies" => Ok(Self::PostsNoReplies),
            "posts_with_media" => Ok(Self::PostsWithMedia),
            "posts_and_author_threads" => Ok(Self::PostsAndAuthorThreads),
            other => Err(AppViewError::Validation(format!("unknown filter: {}", other))),
        }
    }
}

/// Keyset pagination position: `"{timestamp}:{uri}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub sort_at: String,
    pub uri: String,
}

impl PageCursor {
    pub fn new(sort_at: &str, uri: &str) -> Self {
        Self {
            sort_at: sort_at.to_string(),
            uri: uri.to_string(),
        }
    }

    /// Parse a cursor; the timestamp itself contains colons, so split on the uri scheme
    pub fn parse(raw: &str) -> Option<Self> {
        let idx = raw.find(":at://")?;
        let (sort_at, uri) = (&raw[..idx], &raw[idx + 1..]);
        if sort_at.is_empty() {
            return None;
        }
        Some(Self::new(sort_at, uri))
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.sort_at, self.uri)
    }
}
