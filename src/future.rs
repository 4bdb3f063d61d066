use crate::body::{CompressedBody, CompressionBody};
use crate::codec::GZIP;
use crate::pool::CompressorHandle;
use bytes::{Buf, BytesMut};
use http::response::Parts;
use http::{HeaderMap, Response, StatusCode, header};
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pin_project! {
    /// Future for compression service responses.
    pub struct ResponseFuture<F, B> {
        #[pin]
        inner: F,
        handle: Option<CompressorHandle>,
        max_buffered_size: usize,
        buffering: Option<Buffering<B>>,
    }
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(
        inner: F,
        handle: Option<CompressorHandle>,
        max_buffered_size: usize,
    ) -> Self {
        Self {
            inner,
            handle,
            max_buffered_size,
            buffering: None,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // Resume a response that is still being compressed up front
        let mut buffering = match this.buffering.take() {
            Some(buffering) => buffering,
            None => {
                let response = ready!(this.inner.poll(cx))?;
                match wrap_response(response, this.handle.take(), *this.max_buffered_size) {
                    Wrapped::Ready(response) => return Poll::Ready(Ok(response)),
                    Wrapped::Buffer(buffering) => buffering,
                }
            }
        };

        match buffering.poll_to_end(cx) {
            Poll::Pending => {
                *this.buffering = Some(buffering);
                Poll::Pending
            }
            Poll::Ready(result) => Poll::Ready(Ok(buffering.into_response(result))),
        }
    }
}

/// What `wrap_response` decided for the inner response.
enum Wrapped<B> {
    Ready(Response<CompressionBody<B>>),
    Buffer(Buffering<B>),
}

/// A response whose body is compressed completely before the headers go out.
struct Buffering<B> {
    parts: Parts,
    body: Pin<Box<B>>,
    state: CompressedBody,
    out: BytesMut,
    trailers: Option<HeaderMap>,
}

impl<B> Buffering<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    fn poll_to_end(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match ready!(self.state.poll_compressed(cx, self.body.as_mut())) {
                None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(e)),
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => self.out.extend_from_slice(&data),
                    Err(frame) => self.trailers = frame.into_trailers().ok(),
                },
            }
        }
    }

    /// Sets `Content-Length` now that the compressor is closed.
    fn into_response(self, result: io::Result<()>) -> Response<CompressionBody<B>> {
        let Buffering {
            mut parts,
            out,
            trailers,
            ..
        } = self;

        let body = match result {
            Ok(()) => {
                parts
                    .headers
                    .insert(header::CONTENT_LENGTH, header::HeaderValue::from(out.len()));
                CompressionBody::buffered(out.freeze(), trailers)
            }
            Err(e) => CompressionBody::errored(e),
        };

        Response::from_parts(parts, body)
    }
}

/// Wraps the response body with compression if a compressor was checked out.
fn wrap_response<B: Body>(
    response: Response<B>,
    handle: Option<CompressorHandle>,
    max_buffered_size: usize,
) -> Wrapped<B> {
    let (mut parts, body) = response.into_parts();

    // Dropping the handle here returns it to the pool
    let handle = handle.filter(|_| {
        !has_content_encoding(&parts.headers) && !is_bodiless_status(parts.status)
    });
    let Some(handle) = handle else {
        // Nothing to compress, pass the body through untouched
        return Wrapped::Ready(Response::from_parts(
            parts,
            CompressionBody::passthrough(body),
        ));
    };

    // Streaming responses flush every chunk
    let always_flush = parts
        .headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"))
        || is_streaming_content_type(&parts.headers);

    // Add Content-Encoding header
    parts.headers.insert(
        header::CONTENT_ENCODING,
        header::HeaderValue::from_static(GZIP),
    );

    // Known again only after the compressor is closed
    parts.headers.remove(header::CONTENT_LENGTH);

    // Remove Accept-Ranges since we can't support ranges on compressed content
    parts.headers.remove(header::ACCEPT_RANGES);

    // Caches must key on Accept-Encoding
    add_vary_accept_encoding(&mut parts.headers);

    // Exact-size bodies within the limit are compressed before headers go out
    let state = CompressedBody::new(handle, always_flush);
    let buffer = !always_flush
        && body
            .size_hint()
            .exact()
            .is_some_and(|len| len <= max_buffered_size as u64);

    if buffer {
        Wrapped::Buffer(Buffering {
            parts,
            body: Box::pin(body),
            state,
            out: BytesMut::new(),
            trailers: None,
        })
    } else {
        Wrapped::Ready(Response::from_parts(
            parts,
            CompressionBody::compressed(body, state),
        ))
    }
}

/// Checks if Content-Encoding header is already present.
fn has_content_encoding(headers: &header::HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_ENCODING)
}

/// Statuses that never carry a body.
fn is_bodiless_status(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("*") || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        header::HeaderValue::from_static("accept-encoding"),
    );
}

/// Checks if the content type requires always flushing (e.g., streaming).
fn is_streaming_content_type(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::CompressState;
    use crate::body::tests::TestBody;
    use crate::codec::gunzip;
    use crate::options::PoolMode;
    use crate::pool::CompressorPool;
    use bytes::Bytes;
    use http_body::Frame;
    use http_body_util::{BodyExt, Full};

    fn pool() -> CompressorPool {
        CompressorPool::new(6, PoolMode::default()).unwrap()
    }

    fn make_response<I>(body: &'static str, headers: I) -> Response<TestBody>
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        let frames = vec![Frame::data(Bytes::from(body))];
        let mut response = Response::new(TestBody::new(frames));
        for (name, value) in headers {
            response
                .headers_mut()
                .insert(name, header::HeaderValue::from_static(value));
        }
        response
    }

    fn expect_ready<B>(wrapped: Wrapped<B>) -> Response<CompressionBody<B>> {
        match wrapped {
            Wrapped::Ready(response) => response,
            Wrapped::Buffer(_) => panic!("Expected a ready response"),
        }
    }

    #[test]
    fn test_compress_with_handle() {
        let response = make_response("hello", []);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));

        match wrapped.body() {
            CompressionBody::Compressed { state, .. } => {
                assert_eq!(state.state(), CompressState::Reading);
            }
            _ => panic!("Expected compressed body"),
        }
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[test]
    fn test_no_compress_without_handle() {
        let response = make_response("hello", []);
        let wrapped = expect_ready(wrap_response(response, None, 0));

        assert!(!wrapped.body().is_compressed());
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert!(wrapped.headers().get(header::VARY).is_none());
    }

    #[test]
    fn test_content_encoding_present_releases_handle() {
        let pool = pool();
        let response = make_response("already", [("content-encoding", "br")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool.acquire()), 0));

        assert!(!wrapped.body().is_compressed());
        assert_eq!(wrapped.headers().get(header::CONTENT_ENCODING).unwrap(), "br");
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_no_content_passthrough() {
        let mut response = make_response("", []);
        *response.status_mut() = StatusCode::NO_CONTENT;
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));
        assert!(!wrapped.body().is_compressed());
    }

    #[test]
    fn test_streaming_removes_content_length() {
        let response = make_response("large enough content", [("content-length", "20")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 1024));

        // TestBody reports no exact size, so it streams
        assert!(wrapped.body().is_compressed());
        assert!(wrapped.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    fn test_exact_size_body_is_buffered() {
        let response = Response::new(Full::new(Bytes::from_static(b"hello world")));
        match wrap_response(response, Some(pool().acquire()), 1024) {
            Wrapped::Buffer(_) => {}
            Wrapped::Ready(_) => panic!("Expected buffering"),
        }
    }

    #[test]
    fn test_body_over_limit_streams() {
        let response = Response::new(Full::new(Bytes::from(vec![b'x'; 2048])));
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 1024));
        assert!(matches!(wrapped.body(), CompressionBody::Compressed { .. }));
    }

    #[test]
    fn test_always_flush_when_x_accel_buffering_no() {
        let response = make_response("streaming data", [("x-accel-buffering", "NO")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));

        match wrapped.body() {
            CompressionBody::Compressed { state, .. } => assert!(state.always_flush()),
            _ => panic!("Expected compressed body"),
        }
    }

    #[test]
    fn test_event_stream_is_never_buffered() {
        let mut response = Response::new(Full::new(Bytes::from_static(b"data: x\n\n")));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/event-stream; charset=utf-8"),
        );
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 1024));

        match wrapped.body() {
            CompressionBody::Compressed { state, .. } => assert!(state.always_flush()),
            _ => panic!("Expected streaming compressed body"),
        }
    }

    #[test]
    fn test_no_always_flush_by_default() {
        let response = make_response("normal", []);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));

        match wrapped.body() {
            CompressionBody::Compressed { state, .. } => assert!(!state.always_flush()),
            _ => panic!("Expected compressed body"),
        }
    }

    #[test]
    fn test_vary_header_added() {
        let response = make_response("hello", []);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));
        assert_eq!(
            wrapped.headers().get(header::VARY).unwrap(),
            "accept-encoding"
        );
    }

    #[test]
    fn test_vary_header_appended() {
        let response = make_response("hello world", [("vary", "origin")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));

        let vary_values: Vec<_> = wrapped
            .headers()
            .get_all(header::VARY)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vary_values, vec!["origin", "accept-encoding"]);
    }

    #[test]
    fn test_vary_header_not_duplicated() {
        let response = make_response("hello world", [("vary", "Accept-Encoding")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));
        assert_eq!(wrapped.headers().get_all(header::VARY).iter().count(), 1);
    }

    #[test]
    fn test_vary_header_star_not_modified() {
        let response = make_response("hello world", [("vary", "*")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));
        assert_eq!(wrapped.headers().get(header::VARY).unwrap(), "*");
    }

    #[test]
    fn test_accept_ranges_removed() {
        let response = make_response("hello world", [("accept-ranges", "bytes")]);
        let wrapped = expect_ready(wrap_response(response, Some(pool().acquire()), 0));
        assert!(wrapped.headers().get(header::ACCEPT_RANGES).is_none());
    }

    #[test]
    fn test_accept_ranges_kept_when_not_compressing() {
        let response = make_response("hello world", [("accept-ranges", "bytes")]);
        let wrapped = expect_ready(wrap_response(response, None, 0));
        assert_eq!(
            wrapped.headers().get(header::ACCEPT_RANGES).unwrap(),
            "bytes"
        );
    }

    #[tokio::test]
    async fn test_buffered_response_sets_compressed_length() {
        let pool = pool();
        let payload = "compress me ".repeat(100);
        let inner = async {
            Ok::<_, std::convert::Infallible>(Response::new(Full::new(Bytes::from(
                payload.clone(),
            ))))
        };

        let response = ResponseFuture::new(inner, Some(pool.acquire()), 4096)
            .await
            .unwrap();
        let length: usize = response.headers()[header::CONTENT_LENGTH]
            .to_str()
            .unwrap()
            .parse()
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(length, body.len());
        assert!(length < payload.len());
        assert_eq!(gunzip(&body), payload.as_bytes());
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_buffered_response_keeps_trailers() {
        let mut trailers = HeaderMap::new();
        trailers.insert("x-checksum", "abc123".parse().unwrap());
        let body = Full::new(Bytes::from_static(b"hello"))
            .with_trailers(std::future::ready(Some(Ok(trailers))));
        let inner = async { Ok::<_, std::convert::Infallible>(Response::new(body)) };
        let response = ResponseFuture::new(inner, Some(pool().acquire()), 1024)
            .await
            .unwrap();

        let collected = response.into_body().collect().await.unwrap();
        assert_eq!(collected.trailers().unwrap()["x-checksum"], "abc123");
        assert_eq!(gunzip(&collected.to_bytes()), b"hello");
    }
}
