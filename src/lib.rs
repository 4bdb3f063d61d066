//! Selective gzip compression middleware for Tower.
//!
//! This crate provides a Tower layer that gzip-compresses HTTP response bodies
//! when the client accepts gzip, and can decode gzip-encoded request bodies.
//!
//! # Example
//!
//! ```ignore
//! use http_gzip_gate::{CompressionLayer, Options};
//! use tower::ServiceBuilder;
//!
//! let options = Options::builder()
//!     .excluded_extensions([".png", ".jpg", ".woff2"])
//!     .excluded_path_patterns([r"^/downloads/"])
//!     .level(6)
//!     .build()?;
//!
//! let service = ServiceBuilder::new()
//!     .layer(CompressionLayer::new(options))
//!     .service(my_service);
//! ```
//!
//! # Compression Rules
//!
//! The request decides, checked in order:
//! - `Accept-Encoding` must list `gzip` with a non-zero quality
//! - `Connection: Upgrade` requests are skipped
//! - Requests accepting `text/event-stream` are skipped
//! - An override predicate returning `Some(verdict)` is final
//! - Otherwise the path must not match an excluded extension, path, or pattern
//!
//! A response that already has `Content-Encoding`, or a status without a body,
//! passes through untouched.
//!
//! # Request Decompression
//!
//! A hook installed with [`OptionsBuilder::decompress_with`] runs for every
//! request whose `Content-Encoding` is gzip, before the inner service. It may
//! edit the request head and returns a [`RequestDecoding`]. With `Gunzip` the
//! body is decoded and `Content-Encoding`/`Content-Length` are removed.
//! [`OptionsBuilder::decompress_requests`] installs [`gunzip_requests`].
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding: gzip` is set before any body byte
//! - `Vary` includes `Accept-Encoding`
//! - `Accept-Ranges` header is removed
//! - Bodies with a known size up to the buffering limit are compressed first and
//!   `Content-Length` is set to the compressed length; other bodies stream and
//!   lose `Content-Length`
//!
//! # Compressor Lifecycle
//!
//! Compressors come from a [`CompressorPool`]. Each request holds one
//! [`CompressorHandle`] that is returned exactly once, on completion, on drop, or
//! when the request's [`CancellationToken`](tokio_util::sync::CancellationToken)
//! fires or the cleanup wait elapses.

#![deny(missing_docs)]

mod body;
mod codec;
mod decompress;
mod error;
mod future;
mod gate;
mod layer;
mod options;
mod pool;
mod service;

pub use body::CompressionBody;
pub use codec::{DEFAULT_LEVEL, accepts_gzip};
pub use decompress::DecompressionBody;
pub use error::{Error, Result};
pub use future::ResponseFuture;
pub use gate::CompressionGate;
pub use layer::CompressionLayer;
pub use options::{
    DEFAULT_CLEANUP_TIMEOUT, DEFAULT_EXCLUDED_EXTENSIONS, DEFAULT_MAX_BUFFERED_SIZE,
    DEFAULT_MAX_IDLE, DecompressFn, Options, OptionsBuilder, OverrideFn, PoolMode,
    RequestDecoding, gunzip_requests,
};
pub use pool::{CompressorHandle, CompressorPool};
pub use service::CompressionService;
