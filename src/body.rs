use crate::pool::CompressorHandle;
use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// A response body that may be gzip-compressed.
    ///
    /// Compressed bodies either stream through the compressor frame by frame or,
    /// when finalized before the headers were sent, carry the complete compressed
    /// payload.
    #[project = CompressionBodyProj]
    #[allow(missing_docs)]
    pub enum CompressionBody<B> {
        /// Streaming compression through a checked-out compressor.
        Compressed {
            #[pin]
            inner: B,
            state: CompressedBody,
        },
        /// Fully compressed payload with its trailers.
        Buffered {
            data: Option<Bytes>,
            trailers: Option<HeaderMap>,
            error: Option<io::Error>,
            len: u64,
        },
        /// Passthrough body without compression.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// State and counters for an actively compressed body.
pub(crate) struct CompressedBody {
    handle: CompressorHandle,
    always_flush: bool,
    state: CompressState,
    pending_trailers: Option<HeaderMap>,
    bytes_in: u64,
    bytes_out: u64,
}

/// State machine for compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressState {
    /// Reading data from inner body and compressing.
    Reading,
    /// Finishing compression after inner body is done.
    Finishing,
    /// Emitting buffered trailers.
    Trailers,
    /// Compression is complete.
    Done,
}

impl CompressedBody {
    pub(crate) fn new(handle: CompressorHandle, always_flush: bool) -> Self {
        Self {
            handle,
            always_flush,
            state: CompressState::Reading,
            pending_trailers: None,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub(crate) fn state(&self) -> CompressState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn always_flush(&self) -> bool {
        self.always_flush
    }

    /// Uncompressed bytes read from the inner body so far.
    pub(crate) fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Compressed bytes emitted so far.
    pub(crate) fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Ends the stream after an error; the compressor goes back to the pool.
    fn fail(&mut self, err: io::Error) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.state = CompressState::Done;
        self.handle.release();
        Poll::Ready(Some(Err(err)))
    }

    fn emit(&mut self, out: BytesMut) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        self.bytes_out += out.len() as u64;
        Poll::Ready(Some(Ok(Frame::data(out.freeze()))))
    }

    /// Polls the inner body and compresses data.
    pub(crate) fn poll_compressed<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Data: Buf,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            match self.state {
                CompressState::Done => return Poll::Ready(None),

                CompressState::Trailers => {
                    self.state = CompressState::Done;
                    if let Some(trailers) = self.pending_trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                    return Poll::Ready(None);
                }

                CompressState::Finishing => {
                    let mut out = BytesMut::new();
                    if let Err(e) = self.handle.with_compressor(|c| c.finish(&mut out)) {
                        return self.fail(e);
                    }
                    // Stream is closed, hand the compressor back before the last bytes leave
                    self.handle.release();
                    self.state = if self.pending_trailers.is_some() {
                        CompressState::Trailers
                    } else {
                        CompressState::Done
                    };
                    if !out.is_empty() {
                        return self.emit(out);
                    }
                }

                CompressState::Reading => match inner.as_mut().poll_frame(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        self.state = CompressState::Finishing;
                    }
                    Poll::Ready(Some(Err(e))) => {
                        return self.fail(io::Error::other(e.into()));
                    }
                    Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                        Ok(data) => {
                            self.bytes_in += data.remaining() as u64;
                            match self.compress_chunk(data) {
                                Ok(out) if out.is_empty() => {}
                                Ok(out) => return self.emit(out),
                                Err(e) => return self.fail(e),
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                // Buffer trailers and finish compression first
                                self.pending_trailers = Some(trailers);
                                self.state = CompressState::Finishing;
                            }
                        }
                    },
                },
            }
        }
    }

    /// Compresses one data frame, returning whatever the encoder produced.
    fn compress_chunk<D: Buf>(&mut self, mut data: D) -> io::Result<BytesMut> {
        let always_flush = self.always_flush;
        let mut out = BytesMut::new();
        self.handle.with_compressor(|c| {
            while data.has_remaining() {
                let chunk = data.chunk();
                let len = chunk.len();
                c.compress(chunk, &mut out)?;
                data.advance(len);
            }
            if always_flush {
                c.flush(&mut out)?;
            }
            Ok(())
        })?;
        Ok(out)
    }
}

impl<B> CompressionBody<B> {
    pub(crate) fn compressed(inner: B, state: CompressedBody) -> Self {
        Self::Compressed { inner, state }
    }

    pub(crate) fn buffered(data: Bytes, trailers: Option<HeaderMap>) -> Self {
        Self::Buffered {
            len: data.len() as u64,
            data: Some(data),
            trailers,
            error: None,
        }
    }

    pub(crate) fn errored(error: io::Error) -> Self {
        Self::Buffered {
            data: None,
            trailers: None,
            error: Some(error),
            len: 0,
        }
    }

    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    /// Returns true if the body is gzip-encoded.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, CompressionBody::Passthrough { .. })
    }

    /// Compressed bytes produced so far, or `None` for passthrough bodies.
    pub fn compressed_len(&self) -> Option<u64> {
        match self {
            CompressionBody::Compressed { state, .. } => Some(state.bytes_out()),
            CompressionBody::Buffered { len, .. } => Some(*len),
            CompressionBody::Passthrough { .. } => None,
        }
    }

    /// Uncompressed bytes read so far; only tracked while streaming.
    pub fn uncompressed_len(&self) -> Option<u64> {
        match self {
            CompressionBody::Compressed { state, .. } => Some(state.bytes_in()),
            _ => None,
        }
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            CompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => {
                    Poll::Ready(Some(Ok(frame.map_data(|mut data| {
                        data.copy_to_bytes(data.remaining())
                    }))))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
            },
            CompressionBodyProj::Buffered {
                data,
                trailers,
                error,
                ..
            } => {
                if let Some(error) = error.take() {
                    return Poll::Ready(Some(Err(error)));
                }
                if let Some(data) = data.take().filter(|d| !d.is_empty()) {
                    return Poll::Ready(Some(Ok(Frame::data(data))));
                }
                Poll::Ready(trailers.take().map(|t| Ok(Frame::trailers(t))))
            }
            CompressionBodyProj::Compressed { inner, state } => state.poll_compressed(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CompressionBody::Passthrough { inner } => inner.is_end_stream(),
            CompressionBody::Compressed { state, .. } => state.state() == CompressState::Done,
            CompressionBody::Buffered {
                data,
                trailers,
                error,
                ..
            } => data.as_ref().is_none_or(Bytes::is_empty) && trailers.is_none() && error.is_none(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            CompressionBody::Passthrough { inner } => inner.size_hint(),
            CompressionBody::Buffered { data, .. } => {
                SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64))
            }
            // Compressed size is unknown while streaming
            CompressionBody::Compressed { .. } => SizeHint::default(),
        }
    }
}
