use crate::codec::{accepts_gzip, is_gzip_encoding};
use crate::options::{Options, RequestDecoding};
use http::HeaderMap;
use http::header::{self, HeaderName};
use http::request::Parts;
use std::sync::Arc;

/// Per-request compression eligibility.
#[derive(Debug, Clone)]
pub struct CompressionGate {
    options: Arc<Options>,
}

impl CompressionGate {
    /// Creates a gate over shared options.
    pub fn new(options: Arc<Options>) -> Self {
        Self { options }
    }

    /// Returns the options this gate evaluates.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Decides whether the response to this request should be gzip-compressed.
    pub fn decide(&self, parts: &Parts) -> bool {
        let headers = &parts.headers;

        if !headers
            .get_all(header::ACCEPT_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(accepts_gzip)
        {
            tracing::trace!(path = parts.uri.path(), "client does not accept gzip");
            return false;
        }

        // Compressing would break the upgrade handshake
        if header_contains(headers, header::CONNECTION, "upgrade") {
            tracing::trace!(path = parts.uri.path(), "skipping upgrade request");
            return false;
        }

        // Event streams must not sit in the encoder's buffer
        if header_contains(headers, header::ACCEPT, "text/event-stream") {
            tracing::trace!(path = parts.uri.path(), "skipping event-stream request");
            return false;
        }

        if let Some(predicate) = &self.options.override_fn {
            if let Some(verdict) = predicate(parts) {
                tracing::trace!(path = parts.uri.path(), verdict, "override matched");
                return verdict;
            }
        }

        let excluded = self.options.is_path_excluded(parts.uri.path());
        if excluded {
            tracing::trace!(path = parts.uri.path(), "path excluded from compression");
        }
        !excluded
    }

    /// Returns true if a decompression hook is configured and the body is gzip-encoded.
    pub fn should_decompress(&self, headers: &HeaderMap) -> bool {
        self.options.decompress_fn.is_some()
            && headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .is_some_and(is_gzip_encoding)
    }

    /// Runs the decompression hook for a gzip-encoded request.
    ///
    /// Returns `None` when no hook applies; the request head is left untouched then.
    pub fn request_decoding(&self, parts: &mut Parts) -> Option<RequestDecoding> {
        if !self.should_decompress(&parts.headers) {
            return None;
        }
        let hook = self.options.decompress_fn.as_ref()?;
        let decoding = hook(parts);
        tracing::trace!(path = parts.uri.path(), ?decoding, "decompression hook ran");
        Some(decoding)
    }
}

/// Checks every value of `name` for a case-insensitive substring.
fn header_contains(headers: &HeaderMap, name: HeaderName, needle: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.to_ascii_lowercase().contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn gate(options: Options) -> CompressionGate {
        CompressionGate::new(Arc::new(options))
    }

    fn parts<I>(path: &str, headers: I) -> Parts
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        let mut builder = Request::builder().uri(path);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_requires_gzip_in_accept_encoding() {
        let gate = gate(Options::default());
        assert!(!gate.decide(&parts("/", [])));
        assert!(!gate.decide(&parts("/", [("accept-encoding", "br, zstd")])));
        assert!(gate.decide(&parts("/", [("accept-encoding", "br, gzip")])));
    }

    #[test]
    fn test_skips_connection_upgrade() {
        let gate = gate(Options::default());
        let req = parts(
            "/ws",
            [("accept-encoding", "gzip"), ("connection", "keep-alive, Upgrade")],
        );
        assert!(!gate.decide(&req));
    }

    #[test]
    fn test_skips_event_stream() {
        let gate = gate(Options::default());
        let req = parts(
            "/events",
            [("accept-encoding", "gzip"), ("accept", "text/event-stream")],
        );
        assert!(!gate.decide(&req));
    }

    #[test]
    fn test_skips_excluded_extension() {
        let options = Options::builder()
            .excluded_extensions([".png"])
            .build()
            .unwrap();
        let gate = gate(options);
        assert!(!gate.decide(&parts("/logo.png", [("accept-encoding", "gzip")])));
        assert!(gate.decide(&parts("/logo.svg", [("accept-encoding", "gzip")])));
    }

    #[test]
    fn test_override_can_exclude() {
        let options = Options::builder()
            .override_with(|parts| (parts.uri.path() == "/report").then_some(false))
            .build()
            .unwrap();
        let gate = gate(options);
        assert!(!gate.decide(&parts("/report", [("accept-encoding", "gzip")])));
        assert!(gate.decide(&parts("/other", [("accept-encoding", "gzip")])));
    }

    #[test]
    fn test_override_beats_exclusions() {
        let options = Options::builder()
            .excluded_paths(["/big.json"])
            .override_with(|parts| parts.uri.path().ends_with(".json").then_some(true))
            .build()
            .unwrap();
        let gate = gate(options);
        assert!(gate.decide(&parts("/big.json", [("accept-encoding", "gzip")])));
    }

    #[test]
    fn test_override_does_not_beat_header_checks() {
        let options = Options::builder()
            .override_with(|_| Some(true))
            .build()
            .unwrap();
        let gate = gate(options);
        assert!(!gate.decide(&parts("/", [("accept-encoding", "identity")])));
    }

    #[test]
    fn test_should_decompress() {
        let enabled = gate(Options::builder().decompress_requests(true).build().unwrap());
        let disabled = gate(Options::default());

        let gzipped = parts("/upload", [("content-encoding", "gzip")]);
        let plain = parts("/upload", []);

        assert!(enabled.should_decompress(&gzipped.headers));
        assert!(!enabled.should_decompress(&plain.headers));
        assert!(!disabled.should_decompress(&gzipped.headers));
    }

    #[test]
    fn test_custom_decompression_hook() {
        let options = Options::builder()
            .decompress_with(|parts| {
                parts.headers.insert("x-inflated-by", "hook".parse().unwrap());
                if parts.uri.path() == "/raw" {
                    RequestDecoding::Keep
                } else {
                    RequestDecoding::Gunzip
                }
            })
            .build()
            .unwrap();
        let gate = gate(options);

        let mut upload = parts("/upload", [("content-encoding", "gzip")]);
        assert_eq!(gate.request_decoding(&mut upload), Some(RequestDecoding::Gunzip));
        assert_eq!(upload.headers["x-inflated-by"], "hook");

        let mut raw = parts("/raw", [("content-encoding", "gzip")]);
        assert_eq!(gate.request_decoding(&mut raw), Some(RequestDecoding::Keep));

        // Not gzip, so the hook never sees the request
        let mut plain = parts("/upload", []);
        assert_eq!(gate.request_decoding(&mut plain), None);
        assert!(!plain.headers.contains_key("x-inflated-by"));
    }
}
