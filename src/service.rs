use crate::decompress::DecompressionBody;
use crate::future::ResponseFuture;
use crate::gate::CompressionGate;
use crate::options::{Options, RequestDecoding};
use crate::pool::{CompressorHandle, CompressorPool};
use bytes::Buf;
use http::request::Parts;
use http::{Request, header};
use http_body::Body;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower::Service;

/// A Tower service that gzip-compresses HTTP response bodies.
///
/// Requests reach the inner service with a [`DecompressionBody`], which decodes
/// gzip request bodies when request decompression is enabled.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    gate: CompressionGate,
    pool: CompressorPool,
}

impl<S> CompressionService<S> {
    /// Creates a new compression service wrapping the given inner service.
    pub fn new(inner: S, options: Options) -> Self {
        let pool = CompressorPool::from_options(&options);
        Self::from_parts(inner, CompressionGate::new(Arc::new(options)), pool)
    }

    pub(crate) fn from_parts(inner: S, gate: CompressionGate, pool: CompressorPool) -> Self {
        Self { inner, gate, pool }
    }

    /// Returns the eligibility gate.
    pub fn gate(&self) -> &CompressionGate {
        &self.gate
    }

    /// Returns the compressor pool shared by clones of this service.
    pub fn pool(&self) -> &CompressorPool {
        &self.pool
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Checks out a compressor and arms its cleanup watcher.
    fn checkout(&self, parts: &Parts) -> CompressorHandle {
        let mut handle = self.pool.acquire();
        if self.pool.is_pooled() {
            if let Some(timeout) = self.gate.options().cleanup_timeout {
                // Servers may expose request cancellation as a token in the extensions
                let cancelled = parts.extensions.get::<CancellationToken>();
                if handle.arm_cleanup(cancelled, timeout).is_none() {
                    tracing::trace!("no tokio runtime, compressor cleanup relies on drop");
                }
            }
        }
        handle
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<DecompressionBody<ReqBody>>, Response = http::Response<ResBody>>,
    ResBody: Body,
    ResBody::Data: Buf,
    ResBody::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Response = http::Response<crate::body::CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (mut parts, body) = req.into_parts();

        let body = match self.gate.request_decoding(&mut parts) {
            Some(RequestDecoding::Gunzip) => {
                // The inner service sees the decoded body
                parts.headers.remove(header::CONTENT_ENCODING);
                parts.headers.remove(header::CONTENT_LENGTH);
                DecompressionBody::gzip(body)
            }
            Some(RequestDecoding::Keep) | None => DecompressionBody::passthrough(body),
        };

        let handle = self.gate.decide(&parts).then(|| self.checkout(&parts));
        let max_buffered_size = self.gate.options().max_buffered_size;

        let inner = self.inner.call(Request::from_parts(parts, body));

        ResponseFuture::new(inner, handle, max_buffered_size)
    }
}
