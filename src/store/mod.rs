/// Relational index of posts, likes, reposts, follows, blocks and profiles
///
/// Writes are single-row upserts keyed by the record's AT-URI (or DID for
/// profiles). Nothing here maintains derived counters.
pub mod models;
pub mod reads;
pub mod thread;
pub mod writes;

pub use models::*;
pub use thread::{PostThread, ThreadNode, ThreadParent};

use crate::{
    error::AppViewResult,
    records::{now_timestamp, Collection},
};
use sqlx::SqlitePool;
use std::collections::HashSet;

#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Upsert one record in its own implicit transaction
    pub async fn put_record(&self, write: &RecordWrite) -> AppViewResult<bool> {
        writes::put_record(&self.db, write).await
    }

    pub async fn delete_record(
        &self,
        did: &str,
        collection: Collection,
        rkey: &str,
    ) -> AppViewResult<u64> {
        writes::delete_record(&self.db, did, collection, rkey).await
    }

    pub async fn set_handle(&self, did: &str, handle: &str) -> AppViewResult<()> {
        writes::set_handle(&self.db, did, handle).await
    }

    /// Upsert many records inside one explicit transaction
    ///
    /// A failing record is logged and counted; the rest of the batch still commits.
    pub async fn apply_batch(&self, batch: &[RecordWrite]) -> AppViewResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        let mut tx = self.db.begin().await?;

        for write in batch {
            match writes::put_record(&mut *tx, write).await {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.skipped += 1,
                Err(e) => {
                    outcome.failed += 1;
                    tracing::error!(
                        did = %write.did,
                        collection = write.record.collection().label(),
                        rkey = %write.rkey,
                        error = %e,
                        "failed to index record"
                    );
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn sync_state(&self) -> AppViewResult<SyncState> {
        let state = sqlx::query_as::<_, SyncState>(
            "SELECT pds_cursor, pds_seq, last_sync, backfill_completed_at FROM sync_state WHERE id = 1",
        )
        .fetch_optional(&self.db)
        .await?;

        Ok(state.unwrap_or_default())
    }

    /// Persist the stream position after a frame has been fully handled
    ///
    /// `rev` is only present for commits; other frames advance the sequence alone.
    pub async fn save_checkpoint(&self, seq: Option<i64>, rev: Option<&str>) -> AppViewResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_state
            SET pds_seq = COALESCE(?, pds_seq),
                pds_cursor = COALESCE(?, pds_cursor),
                last_sync = ?
            WHERE id = 1
            "#,
        )
        .bind(seq)
        .bind(rev)
        .bind(now_timestamp())
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// True until a backfill has completed or any live frame has been applied
    pub async fn needs_backfill(&self) -> AppViewResult<bool> {
        let state = self.sync_state().await?;
        Ok(state.backfill_completed_at.is_none()
            && state.pds_seq.is_none()
            && state.pds_cursor.is_none())
    }

    /// Repos a backfill has already walked to the end
    pub async fn backfilled_repos(&self) -> AppViewResult<HashSet<String>> {
        let dids: Vec<String> = sqlx::query_scalar("SELECT did FROM backfill_repo")
            .fetch_all(&self.db)
            .await?;
        Ok(dids.into_iter().collect())
    }

    pub async fn mark_repo_backfilled(&self, did: &str) -> AppViewResult<()> {
        sqlx::query(
            "INSERT INTO backfill_repo (did, completed_at) VALUES (?, ?) \
             ON CONFLICT(did) DO UPDATE SET completed_at = excluded.completed_at",
        )
        .bind(did)
        .bind(now_timestamp())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    pub async fn mark_backfill_complete(&self) -> AppViewResult<()> {
        sqlx::query("UPDATE sync_state SET backfill_completed_at = ? WHERE id = 1")
            .bind(now_timestamp())
            .execute(&self.db)
            .await?;
        Ok(())
    }
}
