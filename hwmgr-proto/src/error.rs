use std::io;

use thiserror::Error;

/// Wire protocol errors.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("incomplete frame")]
    Incomplete,

    #[error("unknown message type {0}")]
    UnknownType(u32),

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("frame length {len} out of bounds for type {msg_type}")]
    BadLength { msg_type: u32, len: usize },
}

impl From<ProtoError> for io::Error {
    fn from(err: ProtoError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
