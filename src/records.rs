/// Typed record model for the indexed collections
///
/// Generic records coming out of the block decoder (or the backfill JSON
/// listing) are turned into a [`Record`] exactly once, at the dispatch
/// boundary, so the store only ever sees typed data.
use crate::error::{AppViewError, AppViewResult};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Indexed record collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Post,
    Like,
    Repost,
    Follow,
    Block,
    Profile,
}

impl Collection {
    pub const ALL: [Collection; 6] = [
        Collection::Profile,
        Collection::Post,
        Collection::Like,
        Collection::Repost,
        Collection::Follow,
        Collection::Block,
    ];

    pub fn nsid(&self) -> &'static str {
        match self {
            Collection::Post => "app.bsky.feed.post",
            Collection::Like => "app.bsky.feed.like",
            Collection::Repost => "app.bsky.feed.repost",
            Collection::Follow => "app.bsky.graph.follow",
            Collection::Block => "app.bsky.graph.block",
            Collection::Profile => "app.bsky.actor.profile",
        }
    }

    pub fn from_nsid(nsid: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.nsid() == nsid)
    }

    /// Short name used in logs and metric labels
    pub fn label(&self) -> &'static str {
        match self {
            Collection::Post => "post",
            Collection::Like => "like",
            Collection::Repost => "repost",
            Collection::Follow => "follow",
            Collection::Block => "block",
            Collection::Profile => "profile",
        }
    }
}

/// Record key of the singleton profile record
pub const PROFILE_RKEY: &str = "self";

/// Build `at://{did}/{collection}/{rkey}`
pub fn at_uri(did: &str, collection: &str, rkey: &str) -> String {
    format!("at://{}/{}/{}", did, collection, rkey)
}

/// Split an AT-URI into `(did, collection, rkey)`
pub fn parse_at_uri(uri: &str) -> Option<(&str, &str, &str)> {
    let rest = uri.strip_prefix("at://")?;
    let mut parts = rest.splitn(3, '/');
    let did = parts.next().filter(|s| !s.is_empty())?;
    let collection = parts.next().filter(|s| !s.is_empty())?;
    let rkey = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    Some((did, collection, rkey))
}

/// Split a repo op path `"{collection}/{rkey}"`
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let (collection, rkey) = path.split_once('/')?;
    if collection.is_empty() || rkey.is_empty() || rkey.contains('/') {
        return None;
    }
    Some((collection, rkey))
}

/// Normalise a protocol timestamp to UTC RFC 3339 with millisecond precision
///
/// The fixed width makes lexical order equal chronological order, which the
/// feed queries and pagination cursors rely on.
pub fn normalize_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> String {
    raw.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(fallback)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in the normalised timestamp format
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `{uri, cid}` reference to another record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrongRef {
    pub uri: String,
    #[serde(default)]
    pub cid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub root: StrongRef,
    pub parent: StrongRef,
}

/// app.bsky.feed.post
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRecord {
    #[serde(default)]
    pub text: String,
    pub created_at: Option<String>,
    pub reply: Option<ReplyRef>,
    pub embed: Option<Value>,
    pub facets: Option<Value>,
    pub langs: Option<Vec<String>>,
}

impl PostRecord {
    /// The embed's `$type`, if any
    pub fn embed_type(&self) -> Option<&str> {
        self.embed.as_ref()?.get("$type")?.as_str()
    }
}

/// app.bsky.feed.like and app.bsky.feed.repost
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectRecord {
    pub subject: StrongRef,
    pub created_at: Option<String>,
}

/// app.bsky.graph.follow and app.bsky.graph.block
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRecord {
    pub subject: String,
    pub created_at: Option<String>,
}

/// Blob reference, either `{ref: {$link}}` or the legacy `{cid}` form
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobRef {
    #[serde(rename = "ref")]
    pub link: Option<Value>,
    pub cid: Option<String>,
    pub mime_type: Option<String>,
}

impl BlobRef {
    pub fn cid(&self) -> Option<String> {
        self.link
            .as_ref()
            .and_then(|l| l.get("$link"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.cid.clone())
    }
}

/// app.bsky.actor.profile
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRecord {
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<BlobRef>,
    pub banner: Option<BlobRef>,
}

/// A decoded record, discriminated by collection
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Post(PostRecord),
    Like(SubjectRecord),
    Repost(SubjectRecord),
    Follow(GraphRecord),
    Block(GraphRecord),
    Profile(ProfileRecord),
}

impl Record {
    /// Type a generic record according to its collection
    pub fn from_value(collection: Collection, value: Value) -> AppViewResult<Self> {
        let record = match collection {
            Collection::Post => Record::Post(parse(collection, value)?),
            Collection::Like => Record::Like(parse(collection, value)?),
            Collection::Repost => Record::Repost(parse(collection, value)?),
            Collection::Follow => Record::Follow(parse(collection, value)?),
            Collection::Block => Record::Block(parse(collection, value)?),
            Collection::Profile => Record::Profile(parse(collection, value)?),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn collection(&self) -> Collection {
        match self {
            Record::Post(_) => Collection::Post,
            Record::Like(_) => Collection::Like,
            Record::Repost(_) => Collection::Repost,
            Record::Follow(_) => Collection::Follow,
            Record::Block(_) => Collection::Block,
            Record::Profile(_) => Collection::Profile,
        }
    }

    fn validate(&self) -> AppViewResult<()> {
        match self {
            Record::Like(r) | Record::Repost(r) => {
                if parse_at_uri(&r.subject.uri).is_none() {
                    return Err(AppViewError::Validation(format!(
                        "malformed subject uri: {}",
                        r.subject.uri
                    )));
                }
            }
            Record::Follow(r) | Record::Block(r) => {
                if !r.subject.starts_with("did:") {
                    return Err(AppViewError::Validation(format!(
                        "malformed subject did: {}",
                        r.subject
                    )));
                }
            }
            Record::Post(r) => {
                if let Some(reply) = &r.reply {
                    if parse_at_uri(&reply.parent.uri).is_none()
                        || parse_at_uri(&reply.root.uri).is_none()
                    {
                        return Err(AppViewError::Validation(
                            "malformed reply reference".to_string(),
                        ));
                    }
                }
            }
            Record::Profile(_) => {}
        }
        Ok(())
    }
}

fn parse<T: for<'de> Deserialize<'de>>(collection: Collection, value: Value) -> AppViewResult<T> {
    serde_json::from_value(value).map_err(|e| {
        AppViewError::Validation(format!("invalid {} record: {}", collection.label(), e))
    })
}
