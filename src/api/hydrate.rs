/// Hydration of store rows into lexicon views
///
/// Every builder works on a whole page at once so profile, viewer-state and
/// quote lookups are batched rather than issued per item.
use crate::{
    api::{
        embed::{embed_view, quoted_uri},
        params::Viewer,
        views::*,
    },
    context::AppContext,
    error::{AppViewError, AppViewResult},
    records::Collection,
    store::{
        ActorViewerState, FeedItemRow, PostRow, PostThread, PostViewerState, ProfileRow,
        ThreadNode, ThreadParent,
    },
};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

pub struct Hydrator<'a> {
    ctx: &'a AppContext,
    viewer: Option<&'a str>,
}

fn parse_json(raw: Option<&str>) -> Option<Value> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

fn unique<'s, I>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = &'s str>,
{
    values
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn actor_viewer(state: Option<&ActorViewerState>) -> ActorViewerView {
    state
        .map(|s| ActorViewerView {
            following: s.following.clone(),
            followed_by: s.followed_by.clone(),
            blocking: s.blocking.clone(),
        })
        .unwrap_or_default()
}

fn post_viewer(state: Option<&PostViewerState>) -> PostViewerView {
    state
        .map(|s| PostViewerView {
            like: s.like.clone(),
            repost: s.repost.clone(),
        })
        .unwrap_or_default()
}

/// Rebuild the stored post as its `app.bsky.feed.post` record value
pub fn post_record(row: &PostRow, cids: &HashMap<String, String>) -> Value {
    let mut record = json!({
        "$type": Collection::Post.nsid(),
        "text": row.text,
        "createdAt": row.created_at,
    });

    if let Some(parent) = row.reply_parent.as_deref() {
        let root = row.reply_root.as_deref().unwrap_or(parent);
        let strong_ref = |uri: &str| {
            json!({
                "uri": uri,
                "cid": cids.get(uri).cloned().unwrap_or_default(),
            })
        };
        record["reply"] = json!({
            "root": strong_ref(root),
            "parent": strong_ref(parent),
        });
    }

    for (key, raw) in [
        ("embed", &row.embed_data),
        ("facets", &row.facets),
        ("langs", &row.langs),
    ] {
        if let Some(value) = parse_json(raw.as_deref()) {
            record[key] = value;
        }
    }

    record
}

impl<'a> Hydrator<'a> {
    pub fn new(ctx: &'a AppContext, viewer: &'a Viewer) -> Self {
        Self {
            ctx,
            viewer: viewer.did(),
        }
    }

    async fn actor_states(&self, dids: &[String]) -> AppViewResult<HashMap<String, ActorViewerState>> {
        match self.viewer {
            Some(viewer) => self.ctx.store.actor_viewer_state(viewer, dids).await,
            None => Ok(HashMap::new()),
        }
    }

    fn avatar(&self, did: &str, cid: Option<&str>) -> Option<String> {
        cid.map(|cid| self.ctx.blob_url(did, cid))
    }

    fn viewer_of(&self, states: &HashMap<String, ActorViewerState>, did: &str) -> Option<ActorViewerView> {
        self.viewer.map(|_| actor_viewer(states.get(did)))
    }

    fn author_of(&self, row: &PostRow, states: &HashMap<String, ActorViewerState>) -> ProfileViewBasic {
        ProfileViewBasic {
            did: row.author_did.clone(),
            handle: row
                .author_handle
                .clone()
                .unwrap_or_else(|| INVALID_HANDLE.to_string()),
            display_name: row.author_display_name.clone(),
            avatar: self.avatar(&row.author_did, row.author_avatar_cid.as_deref()),
            viewer: self.viewer_of(states, &row.author_did),
        }
    }

    /// Post views in the order given
    pub async fn posts(&self, rows: Vec<PostRow>) -> AppViewResult<Vec<PostView>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let embeds: Vec<Option<Value>> = rows
            .iter()
            .map(|row| parse_json(row.embed_data.as_deref()))
            .collect();

        let quoted_uris = unique(embeds.iter().flatten().filter_map(|embed| quoted_uri(embed)));
        let quoted_rows = self.ctx.store.posts_by_uris(&quoted_uris).await?;

        let authors = unique(
            rows.iter()
                .chain(quoted_rows.values())
                .map(|row| row.author_did.as_str()),
        );
        let actor_states = self.actor_states(&authors).await?;

        let uris: Vec<String> = rows.iter().map(|row| row.uri.clone()).collect();
        let post_states = match self.viewer {
            Some(viewer) => self.ctx.store.post_viewer_state(viewer, &uris).await?,
            None => HashMap::new(),
        };

        // Reply refs carry the cid of the post they point at
        let mut cids: HashMap<String, String> = rows
            .iter()
            .chain(quoted_rows.values())
            .map(|row| (row.uri.clone(), row.cid.clone()))
            .collect();
        let unresolved = unique(
            rows.iter()
                .flat_map(|row| [row.reply_parent.as_deref(), row.reply_root.as_deref()])
                .flatten()
                .filter(|uri| !cids.contains_key(*uri)),
        );
        for (uri, row) in self.ctx.store.posts_by_uris(&unresolved).await? {
            cids.insert(uri, row.cid);
        }

        let quoted: HashMap<String, Value> = quoted_rows
            .values()
            .map(|row| {
                let view = json!({
                    "$type": "app.bsky.embed.record#viewRecord",
                    "uri": row.uri,
                    "cid": row.cid,
                    "author": self.author_of(row, &actor_states),
                    "value": post_record(row, &cids),
                    "likeCount": row.like_count,
                    "replyCount": row.reply_count,
                    "repostCount": row.repost_count,
                    "indexedAt": row.indexed_at,
                });
                (row.uri.clone(), view)
            })
            .collect();

        Ok(rows
            .iter()
            .zip(embeds)
            .map(|(row, embed)| PostView {
                uri: row.uri.clone(),
                cid: row.cid.clone(),
                author: self.author_of(row, &actor_states),
                record: post_record(row, &cids),
                embed: embed.and_then(|e| embed_view(self.ctx, &row.author_did, &e, &quoted)),
                reply_count: row.reply_count,
                repost_count: row.repost_count,
                like_count: row.like_count,
                indexed_at: row.indexed_at.clone(),
                viewer: self.viewer.map(|_| post_viewer(post_states.get(&row.uri))),
            })
            .collect())
    }

    async fn post_map(&self, rows: Vec<PostRow>) -> AppViewResult<HashMap<String, PostView>> {
        Ok(self
            .posts(rows)
            .await?
            .into_iter()
            .map(|view| (view.uri.clone(), view))
            .collect())
    }

    /// Feed entries with reply context and repost reasons; items whose post vanished are dropped
    pub async fn feed(&self, items: Vec<FeedItemRow>) -> AppViewResult<Vec<FeedViewPost>> {
        let post_uris = unique(items.iter().map(|item| item.post_uri.as_str()));
        let mut rows = self.ctx.store.posts_by_uris(&post_uris).await?;

        let reply_uris = unique(
            rows.values()
                .flat_map(|row| [row.reply_parent.as_deref(), row.reply_root.as_deref()])
                .flatten()
                .filter(|uri| !rows.contains_key(*uri)),
        );
        let reply_rows = self.ctx.store.posts_by_uris(&reply_uris).await?;

        let reply_targets: HashMap<String, (Option<String>, Option<String>)> = rows
            .values()
            .map(|row| {
                (
                    row.uri.clone(),
                    (row.reply_parent.clone(), row.reply_root.clone()),
                )
            })
            .collect();

        rows.extend(reply_rows);
        let views = self.post_map(rows.into_values().collect()).await?;

        let reposters = unique(items.iter().filter_map(|item| item.repost_by.as_deref()));
        let reposters = self.basic_profiles(&reposters).await?;

        let post_ref = |uri: &str| match views.get(uri) {
            Some(view) => PostRef::Post(view.clone()),
            None => PostRef::not_found(uri),
        };

        let mut feed = Vec::with_capacity(items.len());
        for item in items {
            let Some(post) = views.get(&item.post_uri) else {
                continue;
            };

            let reply = match reply_targets.get(&item.post_uri) {
                Some((Some(parent), root)) => Some(ReplyContext {
                    root: post_ref(root.as_deref().unwrap_or(parent)),
                    parent: post_ref(parent),
                }),
                _ => None,
            };

            let reason = item.repost_by.as_deref().and_then(|did| {
                reposters.get(did).map(|by| FeedReason::Repost {
                    by: by.clone(),
                    indexed_at: item.sort_at.clone(),
                })
            });

            feed.push(FeedViewPost {
                post: post.clone(),
                reply,
                reason,
            });
        }

        Ok(feed)
    }

    /// Thread tree rooted at the anchor post, parents nested upward
    pub async fn thread(&self, thread: PostThread) -> AppViewResult<ThreadItem> {
        fn collect(nodes: &[ThreadNode], rows: &mut Vec<PostRow>) {
            for node in nodes {
                rows.push(node.post.clone());
                collect(&node.replies, rows);
            }
        }

        let mut rows = vec![thread.post.clone()];
        rows.extend(thread.parents.iter().filter_map(|slot| match slot {
            ThreadParent::Found(row) => Some(row.clone()),
            ThreadParent::NotFound(_) => None,
        }));
        collect(&thread.replies, &mut rows);

        let views = self.post_map(rows).await?;

        // Farthest ancestor first, so each step wraps the chain built so far
        let mut parent: Option<Box<ThreadItem>> = None;
        for slot in thread.parents.iter().rev() {
            let uri = match slot {
                ThreadParent::Found(row) => row.uri.as_str(),
                ThreadParent::NotFound(uri) => uri.as_str(),
            };
            let item = match views.get(uri) {
                Some(view) => ThreadItem::Post(ThreadViewPost {
                    post: view.clone(),
                    parent: parent.take(),
                    replies: None,
                }),
                None => ThreadItem::NotFound {
                    uri: uri.to_string(),
                    not_found: true,
                },
            };
            parent = Some(Box::new(item));
        }

        let post = views
            .get(&thread.post.uri)
            .cloned()
            .ok_or_else(|| AppViewError::NotFound(thread.post.uri.clone()))?;

        Ok(ThreadItem::Post(ThreadViewPost {
            post,
            parent,
            replies: Some(reply_items(&thread.replies, &views)),
        }))
    }

    /// Basic profile views keyed by DID; unknown actors get a placeholder handle
    pub async fn basic_profiles(&self, dids: &[String]) -> AppViewResult<HashMap<String, ProfileViewBasic>> {
        let rows = self.ctx.store.profiles(dids).await?;
        let states = self.actor_states(dids).await?;

        Ok(dids
            .iter()
            .map(|did| {
                let row = rows.get(did);
                let view = ProfileViewBasic {
                    did: did.clone(),
                    handle: row
                        .and_then(|r| r.handle.clone())
                        .unwrap_or_else(|| INVALID_HANDLE.to_string()),
                    display_name: row.and_then(|r| r.display_name.clone()),
                    avatar: self.avatar(did, row.and_then(|r| r.avatar_cid.as_deref())),
                    viewer: self.viewer_of(&states, did),
                };
                (did.clone(), view)
            })
            .collect())
    }

    /// Profile views in the order given
    pub async fn profile_views(&self, dids: &[String]) -> AppViewResult<Vec<ProfileView>> {
        let rows = self.ctx.store.profiles(dids).await?;
        let states = self.actor_states(dids).await?;

        Ok(dids
            .iter()
            .map(|did| {
                let row = rows.get(did);
                ProfileView {
                    did: did.clone(),
                    handle: row
                        .and_then(|r| r.handle.clone())
                        .unwrap_or_else(|| INVALID_HANDLE.to_string()),
                    display_name: row.and_then(|r| r.display_name.clone()),
                    description: row.and_then(|r| r.description.clone()),
                    avatar: self.avatar(did, row.and_then(|r| r.avatar_cid.as_deref())),
                    indexed_at: row.map(|r| r.indexed_at.clone()),
                    viewer: self.viewer_of(&states, did),
                }
            })
            .collect())
    }

    pub async fn profiles_detailed(&self, rows: Vec<ProfileRow>) -> AppViewResult<Vec<ProfileViewDetailed>> {
        let dids: Vec<String> = rows.iter().map(|row| row.did.clone()).collect();
        let states = self.actor_states(&dids).await?;

        Ok(rows
            .into_iter()
            .map(|row| ProfileViewDetailed {
                handle: row
                    .handle
                    .clone()
                    .unwrap_or_else(|| INVALID_HANDLE.to_string()),
                avatar: self.avatar(&row.did, row.avatar_cid.as_deref()),
                banner: self.avatar(&row.did, row.banner_cid.as_deref()),
                viewer: self.viewer_of(&states, &row.did),
                display_name: row.display_name,
                description: row.description,
                followers_count: row.followers_count,
                follows_count: row.follows_count,
                posts_count: row.posts_count,
                indexed_at: row.indexed_at,
                did: row.did,
            })
            .collect())
    }
}

fn reply_items(nodes: &[ThreadNode], views: &HashMap<String, PostView>) -> Vec<ThreadItem> {
    nodes
        .iter()
        .filter_map(|node| {
            let post = views.get(&node.post.uri)?.clone();
            Some(ThreadItem::Post(ThreadViewPost {
                post,
                parent: None,
                replies: Some(reply_items(&node.replies, views)),
            }))
        })
        .collect()
}
