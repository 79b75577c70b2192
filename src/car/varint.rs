use crate::car::{DecodeError, DecodeResult};

/// Longest encoding of a u64 as an unsigned LEB128 varint
pub const MAX_VARINT_LEN: usize = 10;

/// Read an unsigned varint starting at `offset`
///
/// Returns the decoded value and the number of bytes it occupied.
pub fn read_varint(buf: &[u8], offset: usize) -> DecodeResult<(u64, usize)> {
    let mut value: u64 = 0;

    for i in 0..MAX_VARINT_LEN {
        let pos = offset + i;
        let byte = *buf.get(pos).ok_or(DecodeError::UnexpectedEof { offset: pos })?;

        // The tenth byte may only carry the single remaining bit of a u64
        if i == MAX_VARINT_LEN - 1 && byte > 0x01 {
            return Err(DecodeError::VarintOverflow { offset });
        }

        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }

    Err(DecodeError::VarintOverflow { offset })
}

/// Write an unsigned varint to a buffer
#[cfg(test)]
pub fn write_varint(buffer: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buffer.push((value as u8) | 0x80);
        value >>= 7;
    }
    buffer.push(value as u8);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_single_byte() {
        assert_eq!(read_varint(&[0x00], 0).unwrap(), (0, 1));
        assert_eq!(read_varint(&[0x7f], 0).unwrap(), (127, 1));
    }

    #[test]
    fn test_read_multi_byte() {
        assert_eq!(read_varint(&[0x80, 0x01], 0).unwrap(), (128, 2));
        assert_eq!(read_varint(&[0xAC, 0x02], 0).unwrap(), (300, 2));
        // blake2b-256 multihash code
        assert_eq!(read_varint(&[0xa0, 0xe4, 0x02], 0).unwrap(), (0xb220, 3));
    }

    #[test]
    fn test_read_at_offset_ignores_surrounding_bytes() {
        let buf = [0xff, 0xff, 0xAC, 0x02, 0x99];
        assert_eq!(read_varint(&buf, 2).unwrap(), (300, 2));
    }

    #[test]
    fn test_roundtrip_boundaries() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, value);
            assert_eq!(read_varint(&buf, 0).unwrap(), (value, buf.len()));
        }
    }

    #[test]
    fn test_truncated_varint() {
        assert_eq!(
            read_varint(&[0x80, 0x80], 0),
            Err(DecodeError::UnexpectedEof { offset: 2 })
        );
        assert_eq!(
            read_varint(&[], 0),
            Err(DecodeError::UnexpectedEof { offset: 0 })
        );
    }

    #[test]
    fn test_overlong_varint() {
        let buf = [0xff; 11];
        assert_eq!(
            read_varint(&buf, 0),
            Err(DecodeError::VarintOverflow { offset: 0 })
        );
    }
}
