//! Builders for DAG-CBOR values, block archives and firehose frames used by tests

use crate::car::varint::write_varint;
use libipld::{cbor::DagCborCodec, codec::Codec, Cid, Ipld};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Encode an IPLD value as DAG-CBOR
pub fn encode(value: &Ipld) -> Vec<u8> {
    DagCborCodec.encode(value).unwrap()
}

/// Build an IPLD map from string keys
pub fn map<const N: usize>(entries: [(&str, Ipld); N]) -> Ipld {
    Ipld::Map(
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect::<BTreeMap<_, _>>(),
    )
}

pub fn text(s: &str) -> Ipld {
    Ipld::String(s.to_string())
}

/// CIDv1, dag-cbor codec, sha2-256 digest of `payload`
pub fn cid_for(payload: &[u8]) -> Cid {
    let mut bytes = vec![0x01, 0x71, 0x12, 0x20];
    bytes.extend_from_slice(&Sha256::digest(payload));
    Cid::try_from(bytes.as_slice()).unwrap()
}

/// CARv1 archive builder
pub struct CarBuilder {
    buffer: Vec<u8>,
}

impl CarBuilder {
    /// Start an archive with the given root CID
    pub fn new(root: &Cid) -> Self {
        let header = map([
            ("version", Ipld::Integer(1)),
            ("roots", Ipld::List(vec![Ipld::Link(*root)])),
        ]);
        let header_bytes = encode(&header);

        let mut buffer = Vec::new();
        write_varint(&mut buffer, header_bytes.len() as u64);
        buffer.extend_from_slice(&header_bytes);
        Self { buffer }
    }

    /// Add a block to the archive
    pub fn add_block(&mut self, cid: &Cid, data: &[u8]) {
        let cid_bytes = cid.to_bytes();
        write_varint(&mut self.buffer, (cid_bytes.len() + data.len()) as u64);
        self.buffer.extend_from_slice(&cid_bytes);
        self.buffer.extend_from_slice(data);
    }

    /// Add an arbitrary length-prefixed section
    pub fn add_raw_section(&mut self, section: &[u8]) {
        write_varint(&mut self.buffer, section.len() as u64);
        self.buffer.extend_from_slice(section);
    }

    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }
}

/// A record encoded as a block, ready to be placed in an archive
pub struct TestBlock {
    pub cid: Cid,
    pub bytes: Vec<u8>,
}

impl TestBlock {
    pub fn new(record: &Ipld) -> Self {
        let bytes = encode(record);
        Self {
            cid: cid_for(&bytes),
            bytes,
        }
    }
}

pub fn post_record(body: &str, created_at: &str) -> Ipld {
    map([
        ("$type", text("app.bsky.feed.post")),
        ("text", text(body)),
        ("createdAt", text(created_at)),
    ])
}

pub fn reply_record(body: &str, created_at: &str, root: &str, parent: &str) -> Ipld {
    let strong_ref = |uri: &str| map([("uri", text(uri)), ("cid", text("bafyreiplaceholder"))]);
    map([
        ("$type", text("app.bsky.feed.post")),
        ("text", text(body)),
        ("createdAt", text(created_at)),
        (
            "reply",
            map([("root", strong_ref(root)), ("parent", strong_ref(parent))]),
        ),
    ])
}

pub fn like_record(subject_uri: &str, created_at: &str) -> Ipld {
    map([
        ("$type", text("app.bsky.feed.like")),
        (
            "subject",
            map([("uri", text(subject_uri)), ("cid", text("bafyreiplaceholder"))]),
        ),
        ("createdAt", text(created_at)),
    ])
}

pub fn follow_record(subject_did: &str, created_at: &str) -> Ipld {
    map([
        ("$type", text("app.bsky.graph.follow")),
        ("subject", text(subject_did)),
        ("createdAt", text(created_at)),
    ])
}

/// One op in a test commit; `cid` is omitted for deletes
pub struct TestOp<'a> {
    pub action: &'a str,
    pub path: String,
    pub cid: Option<Cid>,
}

impl<'a> TestOp<'a> {
    pub fn create(path: impl Into<String>, cid: Cid) -> Self {
        Self {
            action: "create",
            path: path.into(),
            cid: Some(cid),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            action: "delete",
            path: path.into(),
            cid: None,
        }
    }
}

/// Commit body as emitted by `com.atproto.sync.subscribeRepos`
pub fn commit_body(seq: i64, repo: &str, rev: &str, ops: &[TestOp<'_>], blocks: Vec<u8>) -> Ipld {
    let ops = ops
        .iter()
        .map(|op| {
            map([
                ("action", text(op.action)),
                ("path", text(&op.path)),
                ("cid", op.cid.map(Ipld::Link).unwrap_or(Ipld::Null)),
            ])
        })
        .collect();

    map([
        ("seq", Ipld::Integer(seq as i128)),
        ("repo", text(repo)),
        ("rev", text(rev)),
        ("commit", Ipld::Link(cid_for(rev.as_bytes()))),
        ("rebase", Ipld::Bool(false)),
        ("tooBig", Ipld::Bool(false)),
        ("ops", Ipld::List(ops)),
        ("blocks", Ipld::Bytes(blocks)),
        ("blobs", Ipld::List(vec![])),
        ("time", text("2024-05-01T12:00:00.000Z")),
    ])
}

/// Header and body concatenated, as sent on the wire
pub fn frame_bytes(kind: &str, body: &Ipld) -> Vec<u8> {
    let mut bytes = encode(&map([("op", Ipld::Integer(1)), ("t", text(kind))]));
    bytes.extend(encode(body));
    bytes
}

/// Full `#commit` frame whose archive holds `blocks`
pub fn commit_frame(seq: i64, repo: &str, rev: &str, ops: &[TestOp<'_>], blocks: &[&TestBlock]) -> Vec<u8> {
    let root = cid_for(rev.as_bytes());
    let mut car = CarBuilder::new(&root);
    for block in blocks {
        car.add_block(&block.cid, &block.bytes);
    }
    frame_bytes("#commit", &commit_body(seq, repo, rev, ops, car.finalize()))
}

pub fn identity_frame(seq: i64, did: &str, handle: &str) -> Vec<u8> {
    frame_bytes(
        "#identity",
        &map([
            ("seq", Ipld::Integer(seq as i128)),
            ("did", text(did)),
            ("handle", text(handle)),
            ("time", text("2024-05-01T12:00:00.000Z")),
        ]),
    )
}
