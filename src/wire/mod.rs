//! Wire codec for one-shot data batches
//!
//! Frame layout on the TCP stream:
//!
//! ```text
//! [2 bytes: header length N, big-endian]
//! [N bytes: JSON header {"byteorder", "content-length", "sent-ts"}]
//! [content-length bytes: tagged binary payload]
//! ```
//!
//! The payload is a self-describing map of variable name to [`Value`], plus
//! the sender's [`Credentials`](crate::types::Credentials) under
//! [`RESERVED_CREDENTIALS_KEY`].

mod frame;
mod payload;
mod value;

pub use frame::*;
pub use payload::*;
pub use value::*;

use thiserror::Error;

/// Key under which the sender's credentials travel in every payload
pub const RESERVED_CREDENTIALS_KEY: &str = "__sender__";

/// Errors produced while encoding or decoding frames
#[derive(Debug, Error)]
pub enum WireError {
    #[error("payload truncated while reading {0}")]
    Truncated(&'static str),

    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown value tag 0x{0:02x}")]
    UnknownTag(u8),

    #[error("unknown array dtype {0}")]
    UnknownDType(u8),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("duplicate variable '{0}'")]
    DuplicateKey(String),

    #[error("'{0}' is reserved for sender credentials")]
    ReservedKey(String),

    #[error("payload carries no sender credentials")]
    MissingCredentials,

    #[error("array data is {actual} bytes, shape {shape:?} needs {expected}")]
    ArrayLength {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("{what} too long: {len} bytes")]
    TooLong { what: &'static str, len: usize },

    #[error("frame of {declared} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { declared: usize, limit: usize },

    #[error("invalid frame header: {0}")]
    Header(#[from] serde_json::Error),

    #[error("empty frame header")]
    EmptyHeader,

    #[error("unsupported JSON value for '{key}': {reason}")]
    UnsupportedJson { key: String, reason: String },
}
