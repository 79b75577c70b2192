/// DAG-CBOR value decoding
use crate::car::{DecodeError, DecodeResult};
use base64::{engine::general_purpose, Engine as _};
use libipld::{cbor::DagCborCodec, codec::Decode, Ipld};
use serde_json::{json, Map, Value};
use std::io::Cursor;

/// Decode one DAG-CBOR value starting at `offset`
///
/// Bytes after the value are left untouched; the second element of the
/// result says how many were consumed.
pub fn decode_value(buf: &[u8], offset: usize) -> DecodeResult<(Ipld, usize)> {
    let slice = match buf.get(offset..) {
        Some(slice) if !slice.is_empty() => slice,
        _ => return Err(DecodeError::UnexpectedEof { offset }),
    };

    check_nesting(slice)?;

    let mut cursor = Cursor::new(slice);
    let value = Ipld::decode(DagCborCodec, &mut cursor)
        .map_err(|e| DecodeError::Cbor(e.to_string()))?;

    Ok((value, cursor.position() as usize))
}

/// Deepest array/map/tag nesting accepted from the wire
pub const MAX_NESTING: usize = 64;

/// Walk the item headers of the first value without recursing
///
/// The decoder recurses once per nesting level, so a short run of nested
/// arrays would otherwise exhaust the stack before any other check runs.
fn check_nesting(buf: &[u8]) -> DecodeResult<()> {
    let mut pos = 0;
    // Items still owed by each enclosing container, innermost last
    let mut open: Vec<u64> = Vec::new();
    let mut remaining: u64 = 1;

    loop {
        if remaining == 0 {
            match open.pop() {
                Some(outer) => {
                    remaining = outer;
                    continue;
                }
                None => return Ok(()),
            }
        }
        remaining -= 1;

        let (major, arg) = read_header(buf, &mut pos)?;
        let items = match major {
            // Byte and text strings carry their payload inline
            2 | 3 => {
                let end = usize::try_from(arg)
                    .ok()
                    .and_then(|len| pos.checked_add(len))
                    .filter(|end| *end <= buf.len())
                    .ok_or(DecodeError::UnexpectedEof { offset: pos })?;
                pos = end;
                0
            }
            4 => arg,
            5 => arg.saturating_mul(2),
            6 => 1,
            _ => 0,
        };

        if items > 0 {
            if open.len() >= MAX_NESTING {
                return Err(DecodeError::Cbor(format!(
                    "value nested deeper than {} levels",
                    MAX_NESTING
                )));
            }
            open.push(remaining);
            remaining = items;
        }
    }
}

/// Read one item header, returning its major type and argument
fn read_header(buf: &[u8], pos: &mut usize) -> DecodeResult<(u8, u64)> {
    let initial = *buf.get(*pos).ok_or(DecodeError::UnexpectedEof { offset: *pos })?;
    *pos += 1;

    let major = initial >> 5;
    let width = match initial & 0x1f {
        info @ 0..=23 => return Ok((major, u64::from(info))),
        24 => 1,
        25 => 2,
        26 => 4,
        27 => 8,
        31 => {
            return Err(DecodeError::Cbor(
                "indefinite-length items are not allowed".to_string(),
            ))
        }
        info => {
            return Err(DecodeError::Cbor(format!(
                "reserved additional info {} at offset {}",
                info,
                *pos - 1
            )))
        }
    };

    let bytes = buf
        .get(*pos..*pos + width)
        .ok_or(DecodeError::UnexpectedEof { offset: *pos })?;
    *pos += width;
    let arg = bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
    Ok((major, arg))
}

/// Decode a buffer that must hold exactly one DAG-CBOR value
pub fn decode_exact(buf: &[u8]) -> DecodeResult<Ipld> {
    let (value, consumed) = decode_value(buf, 0)?;
    if consumed != buf.len() {
        return Err(DecodeError::Cbor(format!(
            "{} trailing bytes after value",
            buf.len() - consumed
        )));
    }
    Ok(value)
}

/// Decode a block payload into a generic record
pub fn decode_record(payload: &[u8]) -> DecodeResult<Value> {
    decode_exact(payload).map(|value| ipld_to_json(&value))
}

/// Render an IPLD value in the ATProto JSON data model
///
/// Links become `{"$link": cid}` and byte strings `{"$bytes": base64}`.
pub fn ipld_to_json(value: &Ipld) -> Value {
    match value {
        Ipld::Null => Value::Null,
        Ipld::Bool(b) => Value::Bool(*b),
        Ipld::Integer(i) => i64::try_from(*i)
            .map(Value::from)
            .or_else(|_| u64::try_from(*i).map(Value::from))
            .unwrap_or_else(|_| Value::String(i.to_string())),
        Ipld::Float(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Ipld::String(s) => Value::String(s.clone()),
        Ipld::Bytes(bytes) => json!({ "$bytes": general_purpose::STANDARD_NO_PAD.encode(bytes) }),
        Ipld::List(items) => Value::Array(items.iter().map(ipld_to_json).collect()),
        Ipld::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), ipld_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        Ipld::Link(cid) => json!({ "$link": cid.to_string() }),
    }
}
