/// CID boundary detection
///
/// Block archives store each CID immediately followed by its payload with no
/// separate length, so the boundary is found by walking the CID grammar:
///
/// - CIDv0: a bare sha2-256 multihash, always `0x12 0x20` + 32 digest bytes
/// - CIDv1: `version varint | codec varint | hash code varint | digest length varint | digest`
use crate::car::{varint::read_varint, DecodeError, DecodeResult};
use libipld::Cid;

/// Encoded length of a CIDv0
pub const CID_V0_LEN: usize = 34;

const SHA2_256: u8 = 0x12;
const SHA2_256_LEN: u8 = 0x20;

/// Compute the byte length of the CID starting at `offset`
pub fn read_cid_len(buf: &[u8], offset: usize) -> DecodeResult<usize> {
    let first = *buf
        .get(offset)
        .ok_or(DecodeError::UnexpectedEof { offset })?;

    if first == SHA2_256 {
        let second = *buf
            .get(offset + 1)
            .ok_or(DecodeError::UnexpectedEof { offset: offset + 1 })?;
        if second != SHA2_256_LEN {
            return Err(DecodeError::InvalidCid(format!(
                "CIDv0 digest length {:#04x} at offset {}",
                second, offset
            )));
        }
        return ensure_available(buf, offset, CID_V0_LEN);
    }

    let mut pos = offset;

    let (version, n) = read_varint(buf, pos)?;
    if version != 1 {
        return Err(DecodeError::UnsupportedCidVersion { offset, version });
    }
    pos += n;

    // Codec and hash function only need to be stepped over
    let (_codec, n) = read_varint(buf, pos)?;
    pos += n;
    let (_hash_code, n) = read_varint(buf, pos)?;
    pos += n;

    let (digest_len, n) = read_varint(buf, pos)?;
    pos += n;

    let digest_len = usize::try_from(digest_len).map_err(|_| DecodeError::Truncated {
        offset: pos,
        len: digest_len,
        available: buf.len().saturating_sub(pos),
    })?;

    let header_len = pos - offset;
    ensure_available(buf, offset, header_len.saturating_add(digest_len))
}

/// Read the CID starting at `offset`
pub fn read_cid(buf: &[u8], offset: usize) -> DecodeResult<(Cid, usize)> {
    let len = read_cid_len(buf, offset)?;
    let cid = Cid::try_from(&buf[offset..offset + len])
        .map_err(|e| DecodeError::InvalidCid(e.to_string()))?;
    Ok((cid, len))
}

fn ensure_available(buf: &[u8], offset: usize, len: usize) -> DecodeResult<usize> {
    let available = buf.len().saturating_sub(offset);
    if len > available {
        return Err(DecodeError::Truncated {
            offset,
            len: len as u64,
            available,
        });
    }
    Ok(len)
}
