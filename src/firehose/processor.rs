/// Applies decoded firehose frames to the store
///
/// Ops inside one commit are isolated from each other: a failing op is
/// logged and counted, and its siblings still run. The stream position is
/// persisted only after every op of a frame has been attempted.
use crate::{
    error::AppViewResult,
    firehose::frame::{CommitBody, Frame, IdentityBody, OpAction, RepoOp},
    metrics,
    records::{split_path, Collection, Record},
    store::{RecordWrite, Store},
};
use libipld::{Cid, Ipld};
use tracing::{debug, error, info, warn};

/// Per-op tallies for one commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum OpResult {
    Applied,
    Skipped,
    Failed,
}

impl OpResult {
    fn label(&self) -> &'static str {
        match self {
            OpResult::Applied => "applied",
            OpResult::Skipped => "skipped",
            OpResult::Failed => "failed",
        }
    }
}

/// Reduce the wire forms of an op CID to its string form
///
/// Accepts a DAG-CBOR link, a plain string, a `{"$link": ...}` map, or raw
/// CID bytes (optionally carrying the identity multibase prefix `0x00`).
pub fn normalize_cid(raw: &Ipld) -> Option<String> {
    match raw {
        Ipld::Link(cid) => Some(cid.to_string()),
        Ipld::String(s) if !s.is_empty() => Some(s.clone()),
        Ipld::Map(map) => match map.get("$link") {
            Some(Ipld::String(s)) => Some(s.clone()),
            _ => None,
        },
        Ipld::Bytes(bytes) => {
            let bytes = bytes.strip_prefix(&[0u8]).unwrap_or(bytes);
            Cid::try_from(bytes).ok().map(|cid| cid.to_string())
        }
        _ => None,
    }
}

#[derive(Clone)]
pub struct CommitProcessor {
    store: Store,
}

impl CommitProcessor {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Handle one frame and then persist its stream position
    ///
    /// Returns the commit tallies for `#commit` frames.
    pub async fn apply_frame(&self, frame: &Frame) -> AppViewResult<Option<CommitOutcome>> {
        metrics::record_frame(frame.kind());

        let (outcome, rev) = match frame {
            Frame::Commit(commit) => (Some(self.process_commit(commit).await), Some(commit.rev.as_str())),
            Frame::Identity(identity) => {
                self.process_identity(identity).await;
                (None, None)
            }
            Frame::Error { error, message } => {
                error!(
                    error = %error,
                    message = message.as_deref().unwrap_or(""),
                    "upstream sent error frame"
                );
                (None, None)
            }
            Frame::Other { kind, seq } => {
                debug!(kind = %kind, seq = ?seq, "ignoring frame");
                (None, None)
            }
        };

        if let Some(seq) = frame.seq() {
            self.store.save_checkpoint(Some(seq), rev).await?;
            metrics::set_last_seq(seq);
        }

        Ok(outcome)
    }

    /// Apply every op of a commit against its block map
    pub async fn process_commit(&self, commit: &CommitBody) -> CommitOutcome {
        let mut outcome = CommitOutcome::default();

        if commit.blocks.skipped > 0 {
            metrics::record_blocks_skipped(commit.blocks.skipped);
        }
        if commit.too_big {
            warn!(seq = commit.seq, repo = %commit.repo, "commit marked tooBig; blocks may be missing");
        }

        for op in &commit.ops {
            let (collection_label, result) = self.process_op(commit, op).await;
            metrics::record_op(collection_label, op.action.as_str(), result.label());
            match result {
                OpResult::Applied => outcome.applied += 1,
                OpResult::Skipped => outcome.skipped += 1,
                OpResult::Failed => outcome.failed += 1,
            }
        }

        debug!(
            seq = commit.seq,
            repo = %commit.repo,
            rev = %commit.rev,
            applied = outcome.applied,
            skipped = outcome.skipped,
            failed = outcome.failed,
            "applied commit"
        );
        outcome
    }

    async fn process_op(&self, commit: &CommitBody, op: &RepoOp) -> (&'static str, OpResult) {
        let Some((nsid, rkey)) = split_path(&op.path) else {
            warn!(seq = commit.seq, path = %op.path, "malformed op path");
            return ("unknown", OpResult::Skipped);
        };
        let Some(collection) = Collection::from_nsid(nsid) else {
            return ("other", OpResult::Skipped);
        };
        let label = collection.label();

        if op.action == OpAction::Delete {
            return match self.store.delete_record(&commit.repo, collection, rkey).await {
                Ok(_) => (label, OpResult::Applied),
                Err(e) => {
                    error!(repo = %commit.repo, path = %op.path, error = %e, "failed to delete record");
                    (label, OpResult::Failed)
                }
            };
        }

        let Some(cid) = op.cid.as_ref().and_then(normalize_cid) else {
            warn!(seq = commit.seq, path = %op.path, "op has no usable cid");
            return (label, OpResult::Skipped);
        };
        let Some(value) = commit.blocks.get(&cid) else {
            // Block not shipped with this message
            debug!(seq = commit.seq, path = %op.path, cid = %cid, "op block not in archive");
            return (label, OpResult::Skipped);
        };

        let record = match Record::from_value(collection, value.clone()) {
            Ok(record) => record,
            Err(e) => {
                error!(repo = %commit.repo, path = %op.path, error = %e, "rejecting record");
                return (label, OpResult::Failed);
            }
        };

        let write = RecordWrite {
            did: commit.repo.clone(),
            rkey: rkey.to_string(),
            cid,
            record,
        };
        match self.store.put_record(&write).await {
            Ok(true) => (label, OpResult::Applied),
            Ok(false) => (label, OpResult::Skipped),
            Err(e) => {
                error!(repo = %commit.repo, path = %op.path, error = %e, "failed to index record");
                (label, OpResult::Failed)
            }
        }
    }

    async fn process_identity(&self, identity: &IdentityBody) {
        let Some(handle) = identity.handle.as_deref() else {
            return;
        };
        match self.store.set_handle(&identity.did, handle).await {
            Ok(()) => info!(did = %identity.did, handle = %handle, "handle updated"),
            Err(e) => error!(did = %identity.did, error = %e, "failed to update handle"),
        }
    }
}
