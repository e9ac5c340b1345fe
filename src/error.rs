//! Error type for the engine and its component layers.

use std::fmt;

/// Everything that can go wrong operating on a volume.
///
/// One variant per abstract error kind in the design; each carries whatever
/// context it needs to render a useful message without the caller having to
/// re-derive it from the path or block ID involved.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum YfsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("invalid block id {0}")]
    InvalidBlockId(u32),

    #[error("allocator capacity exhausted requesting {requested} block(s)")]
    CapacityExhausted { requested: u32 },

    #[error("checksum mismatch in {context}")]
    ChecksumMismatch { context: String },

    #[error("corrupt index chain: {0}")]
    CorruptChain(String),

    #[error("payload of {len} bytes exceeds per-block capacity of {max} bytes")]
    OversizedPayload { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl YfsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        YfsError::NotFound(path.into())
    }

    pub fn checksum_mismatch(context: impl Into<String>) -> Self {
        YfsError::ChecksumMismatch {
            context: context.into(),
        }
    }
}

/// Shorthand used throughout the crate's public and internal APIs.
pub type Result<T> = std::result::Result<T, YfsError>;

/// A lightweight cursor-overrun error used by the binary encoders in
/// [`crate::serialize`]; always converted into [`YfsError::CorruptChain`] or
/// a dedicated decode error message by its caller before crossing a public
/// API boundary.
#[derive(Debug)]
pub struct DecodeError(pub String);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "decode error: {}", self.0)
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for YfsError {
    fn from(e: DecodeError) -> Self {
        YfsError::CorruptChain(e.0)
    }
}
