use bytes::{Buf, Bytes, BytesMut};
use compression_codecs::{DecodeV2, gzip::GzipDecoder};
use compression_core::util::{PartialBuffer, WriteBuffer};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024;

pin_project! {
    /// A request body that may be gzip-decoded before reaching the inner service.
    #[project = DecompressionBodyProj]
    #[allow(missing_docs)]
    pub enum DecompressionBody<B> {
        /// Gzip-encoded request body being decoded.
        Gzip {
            #[pin]
            inner: B,
            state: DecodeState,
        },
        /// Request body passed through unchanged.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// Decoder and buffers for a gzip request body.
pub(crate) struct DecodeState {
    decoder: GzipDecoder,
    output_buffer: Vec<u8>,
    // Set once a gzip member ended; more input starts a new member
    member_done: bool,
    pending_trailers: Option<HeaderMap>,
    finished: bool,
}

impl DecodeState {
    fn new() -> Self {
        Self {
            decoder: GzipDecoder::new(),
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            member_done: false,
            pending_trailers: None,
            finished: false,
        }
    }

    fn decode_chunk(&mut self, input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        let mut input_buf = PartialBuffer::new(input);

        loop {
            if self.member_done {
                if input_buf.written_len() >= input.len() {
                    return Ok(());
                }
                self.decoder.reinit().map_err(io::Error::other)?;
                self.member_done = false;
            }

            let consumed_before = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self
                .decoder
                .decode(&mut input_buf, &mut output)
                .map_err(io::Error::other)?;
            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&self.output_buffer[..written]);
            }

            if done {
                self.member_done = true;
                continue;
            }

            // A full output buffer may leave decoded bytes behind, go around again
            let consumed_all = input_buf.written_len() >= input.len();
            if consumed_all && written < self.output_buffer.len() {
                return Ok(());
            }
            if written == 0 && input_buf.written_len() == consumed_before {
                return Ok(());
            }
        }
    }

    fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        if self.member_done {
            return Ok(());
        }
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.decoder.finish(&mut output).map_err(io::Error::other)?;
            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&self.output_buffer[..written]);
            }
            if done {
                return Ok(());
            }
            if written == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "gzip request body ended mid-stream",
                ));
            }
        }
    }

    fn poll_decoded<B>(
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
            if self.finished {
                return Poll::Ready(self.pending_trailers.take().map(|t| Ok(Frame::trailers(t))));
            }

            let frame = match inner.as_mut().poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(io::Error::other(e.into()))));
                }
                Poll::Ready(Some(Ok(frame))) => frame,
                Poll::Ready(None) => {
                    self.finished = true;
                    let mut out = BytesMut::new();
                    if let Err(e) = self.finish(&mut out) {
                        return Poll::Ready(Some(Err(e)));
                    }
                    if out.is_empty() {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(Frame::data(out.freeze()))));
                }
            };

            match frame.into_data() {
                Ok(mut data) => {
                    let mut out = BytesMut::new();
                    while data.has_remaining() {
                        let chunk = data.chunk();
                        let len = chunk.len();
                        if let Err(e) = self.decode_chunk(chunk, &mut out) {
                            self.finished = true;
                            return Poll::Ready(Some(Err(e)));
                        }
                        data.advance(len);
                    }
                    if !out.is_empty() {
                        return Poll::Ready(Some(Ok(Frame::data(out.freeze()))));
                    }
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        self.pending_trailers = Some(trailers);
                    }
                }
            }
        }
    }
}

impl fmt::Debug for DecodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeState")
            .field("member_done", &self.member_done)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<B> DecompressionBody<B> {
    /// Wraps a gzip-encoded body for decoding.
    pub fn gzip(inner: B) -> Self {
        Self::Gzip {
            inner,
            state: DecodeState::new(),
        }
    }

    /// Wraps a body without decoding.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    /// Returns true if the body is being gzip-decoded.
    pub fn is_decoding(&self) -> bool {
        matches!(self, DecompressionBody::Gzip { .. })
    }
}

impl<B> Body for DecompressionBody<B>
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
            DecompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => {
                    Poll::Ready(Some(Ok(frame.map_data(|mut data| {
                        data.copy_to_bytes(data.remaining())
                    }))))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
            },
            DecompressionBodyProj::Gzip { inner, state } => state.poll_decoded(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            DecompressionBody::Passthrough { inner } => inner.is_end_stream(),
            DecompressionBody::Gzip { state, .. } => {
                state.finished && state.pending_trailers.is_none()
            }
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            DecompressionBody::Passthrough { inner } => inner.size_hint(),
            // Decoded size is unknown
            DecompressionBody::Gzip { .. } => SizeHint::default(),
        }
    }
}
