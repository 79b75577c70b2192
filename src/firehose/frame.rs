/// Firehose frame decoding
///
/// A `subscribeRepos` message is a DAG-CBOR header followed by a DAG-CBOR
/// body with no enclosing array. Some producers wrap both in a two-element
/// array instead, so splitting is attempted with each [`FrameStrategy`] in
/// turn.
use crate::car::{decode_exact, decode_value, read_car, CarBlocks, DecodeError, DecodeResult};
use libipld::Ipld;
use std::collections::BTreeMap;

/// Ways of splitting a message into `(header, body)`, in the order they are tried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStrategy {
    /// The whole message is a single `[header, body]` value
    Combined,
    /// Header value immediately followed by body value
    Sequential,
}

impl FrameStrategy {
    pub const ORDER: [FrameStrategy; 2] = [FrameStrategy::Combined, FrameStrategy::Sequential];

    fn split(self, bytes: &[u8]) -> DecodeResult<(Ipld, Ipld)> {
        match self {
            FrameStrategy::Combined => match decode_exact(bytes)? {
                Ipld::List(mut items) if items.len() == 2 => {
                    let body = items.pop().unwrap_or(Ipld::Null);
                    let header = items.pop().unwrap_or(Ipld::Null);
                    Ok((header, body))
                }
                _ => Err(DecodeError::InvalidFrame(
                    "combined frame is not a two-element array".to_string(),
                )),
            },
            FrameStrategy::Sequential => {
                let (header, consumed) = decode_value(bytes, 0)?;
                let body = decode_exact(&bytes[consumed..])?;
                Ok((header, body))
            }
        }
    }
}

/// Split a message into header and body using the first strategy that succeeds
pub fn split_frame(bytes: &[u8]) -> DecodeResult<(FrameStrategy, Ipld, Ipld)> {
    let mut last_error = DecodeError::InvalidFrame("empty frame".to_string());
    for strategy in FrameStrategy::ORDER {
        match strategy.split(bytes) {
            Ok((header, body)) => return Ok((strategy, header, body)),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    Create,
    Update,
    Delete,
}

impl OpAction {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(OpAction::Create),
            "update" => Some(OpAction::Update),
            "delete" => Some(OpAction::Delete),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

/// One repository operation; `cid` is kept in its raw wire form
#[derive(Debug, Clone, PartialEq)]
pub struct RepoOp {
    pub action: OpAction,
    pub path: String,
    pub cid: Option<Ipld>,
}

#[derive(Debug, Clone)]
pub struct CommitBody {
    pub seq: i64,
    pub repo: String,
    pub rev: String,
    pub ops: Vec<RepoOp>,
    pub blocks: CarBlocks,
    pub too_big: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityBody {
    pub seq: i64,
    pub did: String,
    pub handle: Option<String>,
}

/// A decoded firehose message
#[derive(Debug, Clone)]
pub enum Frame {
    Commit(CommitBody),
    Identity(IdentityBody),
    /// `op: -1` frames
    Error {
        error: String,
        message: Option<String>,
    },
    /// Any other message type (`#account`, `#info`, ...)
    Other { kind: String, seq: Option<i64> },
}

impl Frame {
    /// Stream sequence number, when the frame carries one
    pub fn seq(&self) -> Option<i64> {
        match self {
            Frame::Commit(commit) => Some(commit.seq),
            Frame::Identity(identity) => Some(identity.seq),
            Frame::Error { .. } => None,
            Frame::Other { seq, .. } => *seq,
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Frame::Commit(_) => "#commit",
            Frame::Identity(_) => "#identity",
            Frame::Error { .. } => "error",
            Frame::Other { kind, .. } => kind,
        }
    }
}

/// Decode one binary WebSocket message
pub fn decode_frame(bytes: &[u8]) -> DecodeResult<Frame> {
    let (strategy, header, body) = split_frame(bytes)?;
    tracing::trace!(?strategy, len = bytes.len(), "split frame");

    let header = as_map(&header).ok_or_else(|| invalid("header is not a map"))?;
    let body = as_map(&body).ok_or_else(|| invalid("body is not a map"))?;

    let op = field(header, "op")
        .and_then(as_i64)
        .ok_or_else(|| invalid("header missing op"))?;

    if op == -1 {
        return Ok(Frame::Error {
            error: field(body, "error")
                .and_then(as_str)
                .unwrap_or("Unknown")
                .to_string(),
            message: field(body, "message").and_then(as_str).map(str::to_string),
        });
    }
    if op != 1 {
        return Err(invalid(&format!("unknown header op {}", op)));
    }

    let kind = field(header, "t")
        .and_then(as_str)
        .ok_or_else(|| invalid("header missing t"))?;

    match kind {
        "#commit" => decode_commit(body).map(Frame::Commit),
        "#identity" => Ok(Frame::Identity(IdentityBody {
            seq: required_i64(body, "seq")?,
            did: required_str(body, "did")?,
            handle: field(body, "handle").and_then(as_str).map(str::to_string),
        })),
        other => Ok(Frame::Other {
            kind: other.to_string(),
            seq: field(body, "seq").and_then(as_i64),
        }),
    }
}

fn decode_commit(body: &BTreeMap<String, Ipld>) -> DecodeResult<CommitBody> {
    let seq = required_i64(body, "seq")?;
    let repo = required_str(body, "repo")?;
    let rev = required_str(body, "rev")?;

    let ops = match field(body, "ops") {
        Some(Ipld::List(items)) => items
            .iter()
            .filter_map(|item| {
                let op = parse_op(item);
                if op.is_none() {
                    tracing::warn!(seq, repo = %repo, "dropping malformed repo op");
                }
                op
            })
            .collect(),
        _ => Vec::new(),
    };

    let blocks = match field(body, "blocks") {
        Some(Ipld::Bytes(bytes)) if !bytes.is_empty() => match read_car(bytes) {
            Ok(blocks) => blocks,
            Err(e) => {
                // Deletes need no blocks, so the commit is still worth applying
                tracing::warn!(seq, repo = %repo, error = %e, "unreadable block archive");
                CarBlocks::default()
            }
        },
        _ => CarBlocks::default(),
    };

    Ok(CommitBody {
        seq,
        repo,
        rev,
        ops,
        blocks,
        too_big: matches!(field(body, "tooBig"), Some(Ipld::Bool(true))),
    })
}

fn parse_op(item: &Ipld) -> Option<RepoOp> {
    let map = as_map(item)?;
    let action = OpAction::parse(field(map, "action").and_then(as_str)?)?;
    let path = field(map, "path").and_then(as_str)?.to_string();
    let cid = field(map, "cid").filter(|c| !matches!(c, Ipld::Null)).cloned();
    Some(RepoOp { action, path, cid })
}

fn invalid(reason: &str) -> DecodeError {
    DecodeError::InvalidFrame(reason.to_string())
}

fn as_map(value: &Ipld) -> Option<&BTreeMap<String, Ipld>> {
    match value {
        Ipld::Map(map) => Some(map),
        _ => None,
    }
}

fn field<'a>(map: &'a BTreeMap<String, Ipld>, key: &str) -> Option<&'a Ipld> {
    map.get(key)
}

fn as_str(value: &Ipld) -> Option<&str> {
    match value {
        Ipld::String(s) => Some(s),
        _ => None,
    }
}

fn as_i64(value: &Ipld) -> Option<i64> {
    match value {
        Ipld::Integer(i) => i64::try_from(*i).ok(),
        _ => None,
    }
}

fn required_str(map: &BTreeMap<String, Ipld>, key: &str) -> DecodeResult<String> {
    field(map, key)
        .and_then(as_str)
        .map(str::to_string)
        .ok_or_else(|| invalid(&format!("missing {}", key)))
}

fn required_i64(map: &BTreeMap<String, Ipld>, key: &str) -> DecodeResult<i64> {
    field(map, key)
        .and_then(as_i64)
        .ok_or_else(|| invalid(&format!("missing {}", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::testing::{
        commit_body, commit_frame, encode, frame_bytes, identity_frame, map, post_record, text,
        TestBlock, TestOp,
    };

    const ALICE: &str = "did:plc:alice";

    #[test]
    fn test_sequential_commit_frame() {
        let block = TestBlock::new(&post_record("hi", "2024-05-01T12:00:00Z"));
        let bytes = commit_frame(
            7,
            ALICE,
            "rev7",
            &[TestOp::create("app.bsky.feed.post/p1", block.cid)],
            &[&block],
        );

        let (strategy, _, _) = split_frame(&bytes).unwrap();
        assert_eq!(strategy, FrameStrategy::Sequential);

        let Frame::Commit(commit) = decode_frame(&bytes).unwrap() else {
            panic!("expected commit");
        };
        assert_eq!(commit.seq, 7);
        assert_eq!(commit.repo, ALICE);
        assert_eq!(commit.rev, "rev7");
        assert_eq!(commit.ops.len(), 1);
        assert_eq!(commit.ops[0].action, OpAction::Create);
        assert_eq!(commit.ops[0].cid, Some(Ipld::Link(block.cid)));
        assert_eq!(
            commit.blocks.get(&block.cid.to_string()).unwrap()["text"],
            "hi"
        );
    }

    #[test]
    fn test_combined_frame() {
        let header = map([("op", Ipld::Integer(1)), ("t", text("#commit"))]);
        let body = commit_body(3, ALICE, "rev3", &[TestOp::delete("app.bsky.feed.like/l1")], vec![]);
        let bytes = encode(&Ipld::List(vec![header, body]));

        let (strategy, _, _) = split_frame(&bytes).unwrap();
        assert_eq!(strategy, FrameStrategy::Combined);

        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.seq(), Some(3));
        let Frame::Commit(commit) = frame else {
            panic!("expected commit");
        };
        assert_eq!(commit.ops[0].action, OpAction::Delete);
        assert_eq!(commit.ops[0].cid, None);
        assert!(commit.blocks.is_empty());
    }

    #[test]
    fn test_identity_frame() {
        let frame = decode_frame(&identity_frame(9, ALICE, "alice.test")).unwrap();
        let Frame::Identity(identity) = frame else {
            panic!("expected identity");
        };
        assert_eq!(
            identity,
            IdentityBody {
                seq: 9,
                did: ALICE.to_string(),
                handle: Some("alice.test".to_string()),
            }
        );
    }

    #[test]
    fn test_error_frame() {
        let mut bytes = encode(&map([("op", Ipld::Integer(-1))]));
        bytes.extend(encode(&map([
            ("error", text("FutureCursor")),
            ("message", text("cursor in the future")),
        ])));

        match decode_frame(&bytes).unwrap() {
            Frame::Error { error, message } => {
                assert_eq!(error, "FutureCursor");
                assert_eq!(message.as_deref(), Some("cursor in the future"));
            }
            other => panic!("expected error frame, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_keeps_seq() {
        let bytes = frame_bytes(
            "#account",
            &map([("seq", Ipld::Integer(12)), ("did", text(ALICE))]),
        );
        let frame = decode_frame(&bytes).unwrap();
        assert_eq!(frame.kind(), "#account");
        assert_eq!(frame.seq(), Some(12));
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_frame(&[0xff, 0x00, 0x13]).is_err());
        assert!(decode_frame(&[]).is_err());

        // Header alone, no body
        let header_only = encode(&map([("op", Ipld::Integer(1)), ("t", text("#commit"))]));
        assert!(decode_frame(&header_only).is_err());
    }

    #[test]
    fn test_unreadable_archive_keeps_ops() {
        let body = commit_body(
            4,
            ALICE,
            "rev4",
            &[TestOp::delete("app.bsky.feed.post/p1")],
            vec![0x50, 0x01],
        );
        let Frame::Commit(commit) = decode_frame(&frame_bytes("#commit", &body)).unwrap() else {
            panic!("expected commit");
        };
        assert_eq!(commit.ops.len(), 1);
        assert!(commit.blocks.is_empty());
    }
}
