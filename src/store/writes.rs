/// Per-collection upserts and deletes
///
/// Every function here takes any SQLite executor, so the live ingest path
/// passes the pool and backfill passes an open transaction. None of them
/// touch a row other than the one addressed by its key.
use crate::{
    error::AppViewResult,
    records::{
        at_uri, normalize_timestamp, now_timestamp, Collection, GraphRecord, PostRecord,
        ProfileRecord, Record, SubjectRecord, PROFILE_RKEY,
    },
    store::models::RecordWrite,
};
use chrono::{DateTime, Utc};
use sqlx::{Executor, Sqlite};

/// Write one typed record; returns `false` when the record is not indexable
pub async fn put_record<'e, E>(executor: E, write: &RecordWrite) -> AppViewResult<bool>
where
    E: Executor<'e, Database = Sqlite>,
{
    let indexed_at = now_timestamp();
    let uri = at_uri(&write.did, write.record.collection().nsid(), &write.rkey);

    match &write.record {
        Record::Post(post) => {
            upsert_post(executor, &uri, &write.cid, &write.did, post, &indexed_at).await?
        }
        Record::Like(like) => {
            upsert_subject(executor, "post_like", &uri, &write.cid, &write.did, like, &indexed_at)
                .await?
        }
        Record::Repost(repost) => {
            upsert_subject(executor, "repost", &uri, &write.cid, &write.did, repost, &indexed_at)
                .await?
        }
        Record::Follow(follow) => {
            upsert_graph(executor, "follow", &uri, &write.cid, &write.did, follow, &indexed_at)
                .await?
        }
        Record::Block(block) => {
            upsert_graph(executor, "actor_block", &uri, &write.cid, &write.did, block, &indexed_at)
                .await?
        }
        Record::Profile(profile) => {
            if write.rkey != PROFILE_RKEY {
                return Ok(false);
            }
            upsert_profile(executor, &write.did, &write.cid, profile, &indexed_at).await?
        }
    }

    Ok(true)
}

/// Remove the record addressed by `(did, collection, rkey)`
///
/// Deleting a record that was never indexed affects zero rows and is not an error.
pub async fn delete_record<'e, E>(
    executor: E,
    did: &str,
    collection: Collection,
    rkey: &str,
) -> AppViewResult<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let uri = at_uri(did, collection.nsid(), rkey);

    let result = match collection {
        Collection::Post => {
            sqlx::query("DELETE FROM post WHERE uri = ?")
                .bind(&uri)
                .execute(executor)
                .await?
        }
        Collection::Like => {
            sqlx::query("DELETE FROM post_like WHERE uri = ?")
                .bind(&uri)
                .execute(executor)
                .await?
        }
        Collection::Repost => {
            sqlx::query("DELETE FROM repost WHERE uri = ?")
                .bind(&uri)
                .execute(executor)
                .await?
        }
        Collection::Follow => {
            sqlx::query("DELETE FROM follow WHERE uri = ?")
                .bind(&uri)
                .execute(executor)
                .await?
        }
        Collection::Block => {
            sqlx::query("DELETE FROM actor_block WHERE uri = ?")
                .bind(&uri)
                .execute(executor)
                .await?
        }
        Collection::Profile => {
            if rkey != PROFILE_RKEY {
                return Ok(0);
            }
            // The handle comes from identity events, not the record, so the row stays
            sqlx::query(
                r#"
                UPDATE profile
                SET display_name = NULL, description = NULL, avatar_cid = NULL,
                    banner_cid = NULL, record_cid = NULL
                WHERE did = ? AND record_cid IS NOT NULL
                "#,
            )
            .bind(did)
            .execute(executor)
            .await?
        }
    };

    Ok(result.rows_affected())
}

/// Record the handle announced for a DID
pub async fn set_handle<'e, E>(executor: E, did: &str, handle: &str) -> AppViewResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO profile (did, handle, indexed_at)
        VALUES (?, ?, ?)
        ON CONFLICT(did) DO UPDATE SET handle = excluded.handle
        "#,
    )
    .bind(did)
    .bind(handle)
    .bind(now_timestamp())
    .execute(executor)
    .await?;

    Ok(())
}

fn created_at(raw: Option<&str>, indexed_at: &str) -> String {
    let fallback = DateTime::parse_from_rfc3339(indexed_at)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    normalize_timestamp(raw, fallback)
}

fn to_json<T: serde::Serialize>(value: Option<&T>) -> Option<String> {
    value.and_then(|v| serde_json::to_string(v).ok())
}

async fn upsert_post<'e, E>(
    executor: E,
    uri: &str,
    cid: &str,
    did: &str,
    post: &PostRecord,
    indexed_at: &str,
) -> AppViewResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let (reply_parent, reply_root) = match &post.reply {
        Some(reply) => (Some(reply.parent.uri.as_str()), Some(reply.root.uri.as_str())),
        None => (None, None),
    };

    // Posts are immutable upstream; a replayed create keeps the first created_at and indexed_at
    sqlx::query(
        r#"
        INSERT INTO post (uri, cid, author_did, text, reply_parent, reply_root,
                          embed_type, embed_data, facets, langs, created_at, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO UPDATE SET
            cid = excluded.cid,
            text = excluded.text,
            reply_parent = excluded.reply_parent,
            reply_root = excluded.reply_root,
            embed_type = excluded.embed_type,
            embed_data = excluded.embed_data,
            facets = excluded.facets,
            langs = excluded.langs
        "#,
    )
    .bind(uri)
    .bind(cid)
    .bind(did)
    .bind(&post.text)
    .bind(reply_parent)
    .bind(reply_root)
    .bind(post.embed_type())
    .bind(to_json(post.embed.as_ref()))
    .bind(to_json(post.facets.as_ref()))
    .bind(to_json(post.langs.as_ref()))
    .bind(created_at(post.created_at.as_deref(), indexed_at))
    .bind(indexed_at)
    .execute(executor)
    .await?;

    Ok(())
}

async fn upsert_subject<'e, E>(
    executor: E,
    table: &'static str,
    uri: &str,
    cid: &str,
    did: &str,
    record: &SubjectRecord,
    indexed_at: &str,
) -> AppViewResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        INSERT INTO {table} (uri, cid, author_did, subject_uri, subject_cid, created_at, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO UPDATE SET
            cid = excluded.cid,
            subject_uri = excluded.subject_uri,
            subject_cid = excluded.subject_cid
        "#
    );

    sqlx::query(&sql)
        .bind(uri)
        .bind(cid)
        .bind(did)
        .bind(&record.subject.uri)
        .bind(record.subject.cid.as_deref())
        .bind(created_at(record.created_at.as_deref(), indexed_at))
        .bind(indexed_at)
        .execute(executor)
        .await?;

    Ok(())
}

async fn upsert_graph<'e, E>(
    executor: E,
    table: &'static str,
    uri: &str,
    cid: &str,
    did: &str,
    record: &GraphRecord,
    indexed_at: &str,
) -> AppViewResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!(
        r#"
        INSERT INTO {table} (uri, cid, author_did, subject_did, created_at, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(uri) DO UPDATE SET
            cid = excluded.cid,
            subject_did = excluded.subject_did
        "#
    );

    sqlx::query(&sql)
        .bind(uri)
        .bind(cid)
        .bind(did)
        .bind(&record.subject)
        .bind(created_at(record.created_at.as_deref(), indexed_at))
        .bind(indexed_at)
        .execute(executor)
        .await?;

    Ok(())
}

async fn upsert_profile<'e, E>(
    executor: E,
    did: &str,
    cid: &str,
    profile: &ProfileRecord,
    indexed_at: &str,
) -> AppViewResult<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO profile (did, display_name, description, avatar_cid, banner_cid, record_cid, indexed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(did) DO UPDATE SET
            display_name = excluded.display_name,
            description = excluded.description,
            avatar_cid = excluded.avatar_cid,
            banner_cid = excluded.banner_cid,
            indexed_at = CASE WHEN profile.record_cid IS excluded.record_cid
                              THEN profile.indexed_at ELSE excluded.indexed_at END,
            record_cid = excluded.record_cid
        "#,
    )
    .bind(did)
    .bind(profile.display_name.as_deref())
    .bind(profile.description.as_deref())
    .bind(profile.avatar.as_ref().and_then(|b| b.cid()))
    .bind(profile.banner.as_ref().and_then(|b| b.cid()))
    .bind(cid)
    .bind(indexed_at)
    .execute(executor)
    .await?;

    Ok(())
}
