/// Read queries
///
/// Engagement and graph counts are aggregated per request with `COUNT(*)`
/// subqueries. Pages are ordered by `(timestamp DESC, uri DESC)`.
use crate::{
    error::AppViewResult,
    store::{
        models::{
            ActorViewerState, AuthorFilter, EdgeQuery, EdgeRow, FeedItemRow, PageCursor,
            PostCounts, PostRow, PostViewerState, ProfileRow, StoreStats,
        },
        Store,
    },
};
use sqlx::{QueryBuilder, Sqlite};
use std::collections::HashMap;

pub(crate) const POST_SELECT: &str = r#"
    SELECT p.uri, p.cid, p.author_did, p.text, p.reply_parent, p.reply_root,
           p.embed_data, p.facets, p.langs, p.created_at, p.indexed_at,
           a.handle AS author_handle,
           a.display_name AS author_display_name,
           a.avatar_cid AS author_avatar_cid,
           (SELECT COUNT(*) FROM post_like l WHERE l.subject_uri = p.uri) AS like_count,
           (SELECT COUNT(*) FROM repost r WHERE r.subject_uri = p.uri) AS repost_count,
           (SELECT COUNT(*) FROM post c WHERE c.reply_parent = p.uri) AS reply_count
    FROM post p
    LEFT JOIN profile a ON a.did = p.author_did
"#;

const PROFILE_SELECT: &str = r#"
    SELECT pr.did, pr.handle, pr.display_name, pr.description, pr.avatar_cid, pr.banner_cid,
           pr.indexed_at,
           (SELECT COUNT(*) FROM follow f WHERE f.subject_did = pr.did) AS followers_count,
           (SELECT COUNT(*) FROM follow f WHERE f.author_did = pr.did) AS follows_count,
           (SELECT COUNT(*) FROM post p WHERE p.author_did = pr.did) AS posts_count
    FROM profile pr
"#;

const MEDIA_EMBEDS: [&str; 3] = [
    "app.bsky.embed.images",
    "app.bsky.embed.video",
    "app.bsky.embed.recordWithMedia",
];

/// Whose posts a feed draws from
#[derive(Debug, Clone, Copy)]
enum FeedScope<'a> {
    Author(&'a str),
    /// The viewer plus everyone they follow, minus everyone they block
    Timeline(&'a str),
}

fn push_scope(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, scope: FeedScope<'_>) {
    match scope {
        FeedScope::Author(did) => {
            qb.push(format!("{} = ", column)).push_bind(did.to_string());
        }
        FeedScope::Timeline(viewer) => {
            qb.push(format!("({} = ", column))
                .push_bind(viewer.to_string())
                .push(format!(
                    " OR {} IN (SELECT subject_did FROM follow WHERE author_did = ",
                    column
                ))
                .push_bind(viewer.to_string())
                .push("))");
        }
    }
}

fn push_not_blocked(qb: &mut QueryBuilder<'_, Sqlite>, column: &str, scope: FeedScope<'_>) {
    if let FeedScope::Timeline(viewer) = scope {
        qb.push(format!(
            " AND {} NOT IN (SELECT subject_did FROM actor_block WHERE author_did = ",
            column
        ))
        .push_bind(viewer.to_string())
        .push(")");
    }
}

/// Keyset condition: strictly after `cursor` in `(ts DESC, uri DESC)` order
fn push_cursor(
    qb: &mut QueryBuilder<'_, Sqlite>,
    ts_column: &str,
    uri_column: &str,
    cursor: Option<&PageCursor>,
) {
    if let Some(cursor) = cursor {
        qb.push(format!(" AND ({} < ", ts_column))
            .push_bind(cursor.sort_at.clone())
            .push(format!(" OR ({} = ", ts_column))
            .push_bind(cursor.sort_at.clone())
            .push(format!(" AND {} < ", uri_column))
            .push_bind(cursor.uri.clone())
            .push("))");
    }
}

fn push_in_list<'a>(qb: &mut QueryBuilder<'a, Sqlite>, values: &[String]) {
    qb.push("(");
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    separated.push_unseparated(")");
}

impl Store {
    async fn feed_items(
        &self,
        scope: FeedScope<'_>,
        filter: AuthorFilter,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<FeedItemRow>> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT item_uri, post_uri, repost_by, sort_at FROM (\
             SELECT p.uri AS item_uri, p.uri AS post_uri, NULL AS repost_by, p.created_at AS sort_at \
             FROM post p WHERE ",
        );
        push_scope(&mut qb, "p.author_did", scope);
        push_not_blocked(&mut qb, "p.author_did", scope);

        match filter {
            AuthorFilter::PostsWithReplies => {}
            AuthorFilter::PostsNoReplies => {
                qb.push(" AND p.reply_parent IS NULL");
            }
            AuthorFilter::PostsWithMedia => {
                qb.push(" AND p.embed_type IN ");
                let media: Vec<String> = MEDIA_EMBEDS.iter().map(|s| s.to_string()).collect();
                push_in_list(&mut qb, &media);
            }
            AuthorFilter::PostsAndAuthorThreads => {
                qb.push(
                    " AND (p.reply_parent IS NULL OR \
                     substr(p.reply_root, 1, length('at://' || p.author_did || '/')) = 'at://' || p.author_did || '/')",
                );
            }
        }

        if filter != AuthorFilter::PostsWithMedia {
            qb.push(
                " UNION ALL \
                 SELECT r.uri, r.subject_uri, r.author_did, r.created_at \
                 FROM repost r JOIN post p ON p.uri = r.subject_uri WHERE ",
            );
            push_scope(&mut qb, "r.author_did", scope);
            push_not_blocked(&mut qb, "p.author_did", scope);
        }

        qb.push(") AS feed WHERE 1 = 1");
        push_cursor(&mut qb, "sort_at", "item_uri", cursor);
        qb.push(" ORDER BY sort_at DESC, item_uri DESC LIMIT ")
            .push_bind(limit as i64);

        Ok(qb.build_query_as::<FeedItemRow>().fetch_all(&self.db).await?)
    }

    /// An author's posts (and reposts, except for the media filter)
    pub async fn posts_by_author(
        &self,
        did: &str,
        filter: AuthorFilter,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<FeedItemRow>> {
        self.feed_items(FeedScope::Author(did), filter, cursor, limit)
            .await
    }

    /// Posts and reposts by the viewer and the accounts they follow
    pub async fn timeline(
        &self,
        viewer: &str,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<FeedItemRow>> {
        self.feed_items(
            FeedScope::Timeline(viewer),
            AuthorFilter::PostsWithReplies,
            cursor,
            limit,
        )
        .await
    }

    /// Case-insensitive substring search over post text
    pub async fn search_posts(
        &self,
        query: &str,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<PostRow>> {
        let pattern = format!("%{}%", escape_like(query));

        let mut qb = QueryBuilder::<Sqlite>::new(POST_SELECT);
        qb.push(" WHERE p.text LIKE ").push_bind(pattern).push(" ESCAPE '\\'");
        push_cursor(&mut qb, "p.created_at", "p.uri", cursor);
        qb.push(" ORDER BY p.created_at DESC, p.uri DESC LIMIT ")
            .push_bind(limit as i64);

        Ok(qb.build_query_as::<PostRow>().fetch_all(&self.db).await?)
    }

    pub async fn post(&self, uri: &str) -> AppViewResult<Option<PostRow>> {
        let sql = format!("{} WHERE p.uri = ?", POST_SELECT);
        Ok(sqlx::query_as::<_, PostRow>(&sql)
            .bind(uri)
            .fetch_optional(&self.db)
            .await?)
    }

    /// Fetch posts by uri, keyed by uri; unknown uris are absent from the map
    pub async fn posts_by_uris(&self, uris: &[String]) -> AppViewResult<HashMap<String, PostRow>> {
        if uris.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(POST_SELECT);
        qb.push(" WHERE p.uri IN ");
        push_in_list(&mut qb, uris);

        let rows = qb.build_query_as::<PostRow>().fetch_all(&self.db).await?;
        Ok(rows.into_iter().map(|row| (row.uri.clone(), row)).collect())
    }

    /// Direct replies to any of `parents`, oldest first
    pub(crate) async fn replies_to(&self, parents: &[String]) -> AppViewResult<Vec<PostRow>> {
        if parents.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(POST_SELECT);
        qb.push(" WHERE p.reply_parent IN ");
        push_in_list(&mut qb, parents);
        qb.push(" ORDER BY p.created_at ASC, p.uri ASC");

        Ok(qb.build_query_as::<PostRow>().fetch_all(&self.db).await?)
    }

    /// Live like, repost and reply counts for one post
    pub async fn counts_for(&self, uri: &str) -> AppViewResult<PostCounts> {
        Ok(sqlx::query_as::<_, PostCounts>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM post_like WHERE subject_uri = ?) AS like_count,
                (SELECT COUNT(*) FROM repost WHERE subject_uri = ?) AS repost_count,
                (SELECT COUNT(*) FROM post WHERE reply_parent = ?) AS reply_count
            "#,
        )
        .bind(uri)
        .bind(uri)
        .bind(uri)
        .fetch_one(&self.db)
        .await?)
    }

    /// Look up a profile by DID or handle
    pub async fn profile(&self, identifier: &str) -> AppViewResult<Option<ProfileRow>> {
        let column = if identifier.starts_with("did:") {
            "pr.did"
        } else {
            "pr.handle"
        };
        let sql = format!("{} WHERE {} = ? LIMIT 1", PROFILE_SELECT, column);

        Ok(sqlx::query_as::<_, ProfileRow>(&sql)
            .bind(identifier)
            .fetch_optional(&self.db)
            .await?)
    }

    /// Resolve a DID or handle to a DID, if the actor is known
    pub async fn resolve_actor(&self, identifier: &str) -> AppViewResult<Option<String>> {
        if identifier.starts_with("did:") {
            return Ok(Some(identifier.to_string()));
        }

        Ok(
            sqlx::query_scalar::<_, String>("SELECT did FROM profile WHERE handle = ? LIMIT 1")
                .bind(identifier)
                .fetch_optional(&self.db)
                .await?,
        )
    }

    /// Fetch profiles by DID, keyed by DID
    pub async fn profiles(&self, dids: &[String]) -> AppViewResult<HashMap<String, ProfileRow>> {
        if dids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(PROFILE_SELECT);
        qb.push(" WHERE pr.did IN ");
        push_in_list(&mut qb, dids);

        let rows = qb.build_query_as::<ProfileRow>().fetch_all(&self.db).await?;
        Ok(rows.into_iter().map(|row| (row.did.clone(), row)).collect())
    }

    /// Page through likes, reposts, followers or follows
    pub async fn edges(
        &self,
        query: EdgeQuery<'_>,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<EdgeRow>> {
        let (select, key) = match query {
            EdgeQuery::LikesOf(uri) => (
                "SELECT uri, author_did AS actor_did, created_at, indexed_at FROM post_like WHERE subject_uri = ",
                uri,
            ),
            EdgeQuery::RepostsOf(uri) => (
                "SELECT uri, author_did AS actor_did, created_at, indexed_at FROM repost WHERE subject_uri = ",
                uri,
            ),
            EdgeQuery::FollowersOf(did) => (
                "SELECT uri, author_did AS actor_did, created_at, indexed_at FROM follow WHERE subject_did = ",
                did,
            ),
            EdgeQuery::FollowsOf(did) => (
                "SELECT uri, subject_did AS actor_did, created_at, indexed_at FROM follow WHERE author_did = ",
                did,
            ),
        };

        let mut qb = QueryBuilder::<Sqlite>::new(select);
        qb.push_bind(key.to_string());
        push_cursor(&mut qb, "created_at", "uri", cursor);
        qb.push(" ORDER BY created_at DESC, uri DESC LIMIT ")
            .push_bind(limit as i64);

        Ok(qb.build_query_as::<EdgeRow>().fetch_all(&self.db).await?)
    }

    pub async fn followers_of(
        &self,
        did: &str,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<EdgeRow>> {
        self.edges(EdgeQuery::FollowersOf(did), cursor, limit).await
    }

    pub async fn follows_of(
        &self,
        did: &str,
        cursor: Option<&PageCursor>,
        limit: u32,
    ) -> AppViewResult<Vec<EdgeRow>> {
        self.edges(EdgeQuery::FollowsOf(did), cursor, limit).await
    }

    /// The viewer's likes and reposts of each post
    pub async fn post_viewer_state(
        &self,
        viewer: &str,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostViewerState>> {
        let mut states: HashMap<String, PostViewerState> = HashMap::new();
        if uris.is_empty() {
            return Ok(states);
        }

        for (table, is_like) in [("post_like", true), ("repost", false)] {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT subject_uri, uri FROM {} WHERE author_did = ",
                table
            ));
            qb.push_bind(viewer.to_string()).push(" AND subject_uri IN ");
            push_in_list(&mut qb, uris);

            let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.db).await?;
            for (subject, uri) in rows {
                let state = states.entry(subject).or_default();
                if is_like {
                    state.like = Some(uri);
                } else {
                    state.repost = Some(uri);
                }
            }
        }

        Ok(states)
    }

    /// Follow and block relationships between the viewer and each actor
    pub async fn actor_viewer_state(
        &self,
        viewer: &str,
        dids: &[String],
    ) -> AppViewResult<HashMap<String, ActorViewerState>> {
        let mut states: HashMap<String, ActorViewerState> = HashMap::new();
        if dids.is_empty() {
            return Ok(states);
        }

        // (table, viewer column, other column)
        let relations = [
            ("follow", "author_did", "subject_did"),
            ("follow", "subject_did", "author_did"),
            ("actor_block", "author_did", "subject_did"),
        ];

        for (index, (table, viewer_column, other_column)) in relations.into_iter().enumerate() {
            let mut qb = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {other}, uri FROM {table} WHERE {viewer_col} = ",
                other = other_column,
                table = table,
                viewer_col = viewer_column
            ));
            qb.push_bind(viewer.to_string())
                .push(format!(" AND {} IN ", other_column));
            push_in_list(&mut qb, dids);

            let rows: Vec<(String, String)> = qb.build_query_as().fetch_all(&self.db).await?;
            for (did, uri) in rows {
                let state = states.entry(did).or_default();
                match index {
                    0 => state.following = Some(uri),
                    1 => state.followed_by = Some(uri),
                    _ => state.blocking = Some(uri),
                }
            }
        }

        Ok(states)
    }

    /// Row counts per table
    pub async fn stats(&self) -> AppViewResult<StoreStats> {
        Ok(sqlx::query_as::<_, StoreStats>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM post) AS posts,
                (SELECT COUNT(*) FROM post_like) AS likes,
                (SELECT COUNT(*) FROM repost) AS reposts,
                (SELECT COUNT(*) FROM follow) AS follows,
                (SELECT COUNT(*) FROM actor_block) AS blocks,
                (SELECT COUNT(*) FROM profile) AS profiles
            "#,
        )
        .fetch_one(&self.db)
        .await?)
    }
}

/// Escape LIKE wildcards so user input only ever matches literally
fn escape_like(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
