/// Low-level decoding of firehose payloads
///
/// Every primitive here is pure and follows a `(buffer, offset) -> (value, consumed)`
/// contract, so callers never share cursor state between calls:
///
/// - [`varint`]: unsigned LEB128 varints
/// - [`cid`]: CID boundary detection by walking the CID grammar
/// - [`dagcbor`]: single DAG-CBOR values and their JSON rendering
/// - [`reader`]: CARv1 block archives as shipped in `#commit` frames

pub mod cid;
pub mod dagcbor;
pub mod reader;
pub mod varint;

#[cfg(test)]
pub mod testing;

pub use dagcbor::{decode_exact, decode_value};
pub use reader::{read_car, CarBlocks};

use thiserror::Error;

/// Errors raised while decoding binary input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("varint at offset {offset} exceeds 64 bits")]
    VarintOverflow { offset: usize },

    #[error("unsupported CID version {version} at offset {offset}")]
    UnsupportedCidVersion { offset: usize, version: u64 },

    #[error("invalid CID: {0}")]
    InvalidCid(String),

    #[error("CBOR error: {0}")]
    Cbor(String),

    #[error("{len} byte section at offset {offset} overruns {available} available bytes")]
    Truncated {
        offset: usize,
        len: u64,
        available: usize,
    },

    #[error("invalid frame: {0}")]
    InvalidFrame(String),
}

/// Result type alias for decoder primitives
pub type DecodeResult<T> = Result<T, DecodeError>;
