//! Error types for the gzip middleware.

use std::io;

/// Result type alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while configuring or running the middleware.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The compression level is outside `-1..=9`.
    #[error("invalid gzip compression level {0}, expected -1 (default) or 0..=9")]
    InvalidLevel(i32),

    /// An excluded path pattern failed to compile.
    #[error("invalid excluded path pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    /// The compressor was reclaimed by cancellation cleanup while the body was
    /// still being written.
    #[error("compressor was reclaimed before the response finished")]
    CompressorReclaimed,
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        io::Error::other(err)
    }
}
