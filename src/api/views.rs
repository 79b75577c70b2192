/// Response shapes following the app.bsky lexicons
use serde::Serialize;
use serde_json::Value;

/// Handle shown for actors whose handle has not been learned yet
pub const INVALID_HANDLE: &str = "handle.invalid";

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActorViewerView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub following: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub followed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileViewBasic {
    pub did: String,
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ActorViewerView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileView {
    pub did: String,
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ActorViewerView>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileViewDetailed {
    pub did: String,
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
    pub followers_count: i64,
    pub follows_count: i64,
    pub posts_count: i64,
    pub indexed_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ActorViewerView>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostViewerView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repost: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: ProfileViewBasic,
    pub record: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<Value>,
    pub reply_count: i64,
    pub repost_count: i64,
    pub like_count: i64,
    pub indexed_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<PostViewerView>,
}

/// A post slot that may point at something never indexed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "$type")]
pub enum PostRef {
    #[serde(rename = "app.bsky.feed.defs#postView")]
    Post(PostView),
    #[serde(rename = "app.bsky.feed.defs#notFoundPost", rename_all = "camelCase")]
    NotFound { uri: String, not_found: bool },
}

impl PostRef {
    pub fn not_found(uri: &str) -> Self {
        PostRef::NotFound {
            uri: uri.to_string(),
            not_found: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplyContext {
    pub root: PostRef,
    pub parent: PostRef,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "$type")]
pub enum FeedReason {
    #[serde(rename = "app.bsky.feed.defs#reasonRepost", rename_all = "camelCase")]
    Repost {
        by: ProfileViewBasic,
        indexed_at: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedViewPost {
    pub post: PostView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<FeedReason>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadViewPost {
    pub post: PostView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ThreadItem>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<ThreadItem>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "$type")]
pub enum ThreadItem {
    #[serde(rename = "app.bsky.feed.defs#threadViewPost")]
    Post(ThreadViewPost),
    #[serde(rename = "app.bsky.feed.defs#notFoundPost", rename_all = "camelCase")]
    NotFound { uri: String, not_found: bool },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn author() -> ProfileViewBasic {
        ProfileViewBasic {
            did: "did:plc:alice".to_string(),
            handle: "alice.test".to_string(),
            display_name: None,
            avatar: None,
            viewer: None,
        }
    }

    #[test]
    fn test_union_members_carry_type() {
        let reason = FeedReason::Repost {
            by: author(),
            indexed_at: "2024-05-01T00:00:00.000Z".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&reason).unwrap(),
            json!({
                "$type": "app.bsky.feed.defs#reasonRepost",
                "by": {"did": "did:plc:alice", "handle": "alice.test"},
                "indexedAt": "2024-05-01T00:00:00.000Z"
            })
        );

        assert_eq!(
            serde_json::to_value(PostRef::not_found("at://x/y/z")).unwrap(),
            json!({"$type": "app.bsky.feed.defs#notFoundPost", "uri": "at://x/y/z", "notFound": true})
        );
    }

    #[test]
    fn test_empty_viewer_fields_are_omitted() {
        let view = ProfileViewBasic {
            viewer: Some(ActorViewerView {
                following: Some("at://did:plc:bob/app.bsky.graph.follow/1".to_string()),
                ..Default::default()
            }),
            ..author()
        };
        let value = serde_json::to_value(&view).unwrap();
        assert_eq!(
            value["viewer"],
            json!({"following": "at://did:plc:bob/app.bsky.graph.follow/1"})
        );
    }
}
