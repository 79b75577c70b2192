use crate::car::{
    cid::read_cid,
    dagcbor::decode_record,
    varint::read_varint,
    DecodeError, DecodeResult,
};
use libipld::Cid;
use serde_json::Value;
use std::collections::HashMap;

/// One `(CID, payload)` pair from a block archive
#[derive(Debug, Clone, PartialEq)]
pub struct Block<'a> {
    pub cid: Cid,
    pub payload: &'a [u8],
}

/// Records resolved from a block archive, keyed by stringified CID
#[derive(Debug, Clone, Default)]
pub struct CarBlocks {
    pub records: HashMap<String, Value>,
    /// Blocks that could not be framed or decoded
    pub skipped: usize,
}

impl CarBlocks {
    pub fn get(&self, cid: &str) -> Option<&Value> {
        self.records.get(cid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read a length-prefixed section starting at `offset`
///
/// Returns the section contents and the total bytes consumed (prefix included).
fn read_section(buf: &[u8], offset: usize) -> DecodeResult<(&[u8], usize)> {
    let (len, prefix) = read_varint(buf, offset)?;
    let start = offset + prefix;
    let available = buf.len() - start;

    match usize::try_from(len) {
        Ok(len) if len <= available => Ok((&buf[start..start + len], prefix + len)),
        _ => Err(DecodeError::Truncated {
            offset,
            len,
            available,
        }),
    }
}

/// Read one block (`varint(len) | CID | payload`) starting at `offset`
pub fn read_block(buf: &[u8], offset: usize) -> DecodeResult<(Block<'_>, usize)> {
    let (section, consumed) = read_section(buf, offset)?;
    let (cid, cid_len) = read_cid(section, 0)?;

    Ok((
        Block {
            cid,
            payload: &section[cid_len..],
        },
        consumed,
    ))
}

/// Decode a CARv1 archive into a map of CID to generic record
///
/// Only a malformed archive header fails the whole call. A block that cannot
/// be read or decoded is logged and skipped; when its length prefix is intact
/// decoding resumes at the next block.
pub fn read_car(buf: &[u8]) -> DecodeResult<CarBlocks> {
    let (_header, mut offset) = read_section(buf, 0)?;
    let mut blocks = CarBlocks::default();

    while offset < buf.len() {
        match read_block(buf, offset) {
            Ok((block, consumed)) => {
                offset += consumed;
                match decode_record(block.payload) {
                    Ok(record) => {
                        blocks.records.insert(block.cid.to_string(), record);
                    }
                    Err(e) => {
                        blocks.skipped += 1;
                        tracing::warn!(
                            cid = %block.cid,
                            error = %e,
                            "skipping undecodable block"
                        );
                    }
                }
            }
            Err(e) => {
                blocks.skipped += 1;
                let preview_end = (offset + 8).min(buf.len());
                tracing::warn!(
                    offset,
                    error = %e,
                    head = %hex::encode(&buf[offset..preview_end]),
                    "skipping malformed block"
                );

                match read_section(buf, offset) {
                    Ok((_, consumed)) => offset += consumed,
                    // Without a usable length prefix nothing after this point can be framed
                    Err(_) => break,
                }
            }
        }
    }

    Ok(blocks)
}
