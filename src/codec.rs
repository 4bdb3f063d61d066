use crate::error::{Error, Result};
use bytes::BytesMut;
use compression_codecs::{EncodeV2, gzip::GzipEncoder};
use compression_core::Level;
use compression_core::util::{PartialBuffer, WriteBuffer};
use std::fmt;
use std::io;

/// Content-Encoding value produced and accepted by the middleware.
pub const GZIP: &str = "gzip";

/// Level meaning "let the codec pick", mirroring zlib's `Z_DEFAULT_COMPRESSION`.
pub const DEFAULT_LEVEL: i32 = -1;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

/// Checks that `level` is `-1` or within `0..=9`.
pub(crate) fn validate_level(level: i32) -> Result<i32> {
    match level {
        DEFAULT_LEVEL | 0..=9 => Ok(level),
        other => Err(Error::InvalidLevel(other)),
    }
}

fn codec_level(level: i32) -> Level {
    if level == DEFAULT_LEVEL {
        Level::Default
    } else {
        Level::Precise(level)
    }
}

/// Returns true if the Accept-Encoding header lists gzip with a non-zero quality.
///
/// The header value is expected to be comma-separated encodings with optional
/// quality values (e.g., "gzip, br;q=1.0, zstd;q=0.8").
pub fn accepts_gzip(header: &str) -> bool {
    header.split(',').any(|part| {
        let (encoding, quality) = parse_encoding_with_quality(part.trim());
        quality > 0.0
            && (encoding.eq_ignore_ascii_case("gzip") || encoding.eq_ignore_ascii_case("x-gzip"))
    })
}

/// Returns true if a Content-Encoding header value names gzip.
pub(crate) fn is_gzip_encoding(value: &str) -> bool {
    let value = value.trim();
    value.eq_ignore_ascii_case("gzip") || value.eq_ignore_ascii_case("x-gzip")
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            if q.starts_with("q=") || q.starts_with("Q=") {
                q[2..].trim().parse::<f32>().ok()
            } else {
                None
            }
        })
        .unwrap_or(1.0);

    (encoding, quality)
}

/// A reusable gzip compressor at a fixed level.
pub(crate) struct Compressor {
    encoder: GzipEncoder,
    level: i32,
    output_buffer: Vec<u8>,
}

impl Compressor {
    /// Creates a compressor; `level` must already be validated.
    pub(crate) fn new(level: i32) -> Self {
        Self {
            encoder: GzipEncoder::new(codec_level(level).into()),
            level,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
        }
    }

    /// Drops all encoder state so the next stream starts with a fresh gzip header.
    ///
    /// The codec exposes no in-place reinit for encoders, so the deflate state is
    /// rebuilt while the output buffer is kept.
    pub(crate) fn reset(&mut self) {
        self.encoder = GzipEncoder::new(codec_level(self.level).into());
    }

    /// Compresses `input`, appending any produced bytes to `out`.
    pub(crate) fn compress(&mut self, input: &[u8], out: &mut BytesMut) -> io::Result<()> {
        // The encoder rejects an empty input buffer
        if input.is_empty() {
            return Ok(());
        }

        let mut input_buf = PartialBuffer::new(input);

        // Keep encoding until all input is consumed
        loop {
            let consumed_before = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.encoder
                .encode(&mut input_buf, &mut output)
                .map_err(io::Error::other)?;

            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&self.output_buffer[..written]);
            }

            if input_buf.written_len() >= input.len() {
                return Ok(());
            }

            // No progress in either direction, bail out instead of spinning
            if written == 0 && input_buf.written_len() == consumed_before {
                return Ok(());
            }
        }
    }

    /// Emits everything buffered so far as a sync flush block.
    pub(crate) fn flush(&mut self, out: &mut BytesMut) -> io::Result<()> {
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.flush(&mut output).map_err(io::Error::other)?;
            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&self.output_buffer[..written]);
            }
            if done {
                return Ok(());
            }
        }
    }

    /// Writes the deflate tail and gzip trailer to `out`.
    pub(crate) fn finish(&mut self, out: &mut BytesMut) -> io::Result<()> {
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.finish(&mut output).map_err(io::Error::other)?;
            let written = output.written_len();
            if written > 0 {
                out.extend_from_slice(&self.output_buffer[..written]);
            }
            if done {
                return Ok(());
            }
        }
    }
}

impl fmt::Debug for Compressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Compressor").field("level", &self.level).finish()
    }
}

#[cfg(test)]
pub(crate) fn gunzip(data: &[u8]) -> Vec<u8> {
    use std::io::Read;

    let mut decoded = Vec::new();
    flate2::read::MultiGzDecoder::new(data)
        .read_to_end(&mut decoded)
        .unwrap();
    decoded
}
