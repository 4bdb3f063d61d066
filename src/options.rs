//! Middleware configuration.

use crate::codec::{DEFAULT_LEVEL, validate_level};
use crate::error::Result;
use http::request::Parts;
use regex::RegexSet;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// How long a pooled compressor may stay checked out before cleanup reclaims it.
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Largest exact-size body that is compressed up front so `Content-Length` can be set.
pub const DEFAULT_MAX_BUFFERED_SIZE: usize = 1024 * 1024;

/// Idle compressors kept by the pool.
pub const DEFAULT_MAX_IDLE: usize = 1024;

/// Extensions excluded unless configured otherwise; these formats are already compressed.
pub const DEFAULT_EXCLUDED_EXTENSIONS: [&str; 4] = [".png", ".gif", ".jpeg", ".jpg"];

/// Predicate that can force a compression verdict for a request.
///
/// Returning `None` means the predicate does not apply; `Some(verdict)` wins over
/// every exclusion list.
pub type OverrideFn = Arc<dyn Fn(&Parts) -> Option<bool> + Send + Sync>;

/// What happens to a gzip-encoded request body after the decompression hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecoding {
    /// Decode the body before the inner service reads it.
    Gunzip,
    /// Hand the body to the inner service as received.
    Keep,
}

/// Hook invoked for every request whose body is gzip-encoded.
///
/// It may rewrite the request head and picks how the body is decoded.
pub type DecompressFn = Arc<dyn Fn(&mut Parts) -> RequestDecoding + Send + Sync>;

/// Hook installed by [`OptionsBuilder::decompress_requests`]: always decodes.
pub fn gunzip_requests(_parts: &mut Parts) -> RequestDecoding {
    RequestDecoding::Gunzip
}

/// How compressors are provisioned per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Reuse compressors through a shared pool holding at most `max_idle` idle instances.
    Pooled {
        /// Upper bound on idle compressors kept for reuse.
        max_idle: usize,
    },
    /// Build a fresh compressor per request and drop it afterwards.
    Fresh,
}

impl Default for PoolMode {
    fn default() -> Self {
        PoolMode::Pooled {
            max_idle: DEFAULT_MAX_IDLE,
        }
    }
}

/// Immutable middleware configuration.
///
/// Built with [`Options::builder`] and shared read-only by every request.
#[derive(Clone)]
pub struct Options {
    pub(crate) excluded_extensions: HashSet<String>,
    pub(crate) excluded_paths: HashSet<String>,
    pub(crate) excluded_path_patterns: RegexSet,
    pub(crate) decompress_fn: Option<DecompressFn>,
    pub(crate) override_fn: Option<OverrideFn>,
    pub(crate) level: i32,
    pub(crate) pool_mode: PoolMode,
    pub(crate) cleanup_timeout: Option<Duration>,
    pub(crate) max_buffered_size: usize,
}

impl Options {
    /// Starts a builder populated with the defaults.
    pub fn builder() -> OptionsBuilder {
        OptionsBuilder::default()
    }

    /// Returns the gzip level compressors are built with.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Returns the configured pool mode.
    pub fn pool_mode(&self) -> PoolMode {
        self.pool_mode
    }

    /// Returns true if `path` is excluded by extension, exact match, or pattern.
    pub fn is_path_excluded(&self, path: &str) -> bool {
        extension(path).is_some_and(|ext| self.excluded_extensions.contains(ext))
            || self.excluded_paths.contains(path)
            || self.excluded_path_patterns.is_match(path)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            excluded_extensions: DEFAULT_EXCLUDED_EXTENSIONS
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            excluded_paths: HashSet::new(),
            excluded_path_patterns: RegexSet::empty(),
            decompress_fn: None,
            override_fn: None,
            level: DEFAULT_LEVEL,
            pool_mode: PoolMode::default(),
            cleanup_timeout: Some(DEFAULT_CLEANUP_TIMEOUT),
            max_buffered_size: DEFAULT_MAX_BUFFERED_SIZE,
        }
    }
}

impl fmt::Debug for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Options")
            .field("excluded_extensions", &self.excluded_extensions)
            .field("excluded_paths", &self.excluded_paths)
            .field(
                "excluded_path_patterns",
                &self.excluded_path_patterns.patterns(),
            )
            .field("decompress_fn", &self.decompress_fn.is_some())
            .field("override_fn", &self.override_fn.is_some())
            .field("level", &self.level)
            .field("pool_mode", &self.pool_mode)
            .field("cleanup_timeout", &self.cleanup_timeout)
            .field("max_buffered_size", &self.max_buffered_size)
            .finish()
    }
}

/// Builder for [`Options`].
///
/// Validation (level range, pattern syntax) happens in [`OptionsBuilder::build`].
#[derive(Clone)]
pub struct OptionsBuilder {
    excluded_extensions: HashSet<String>,
    excluded_paths: HashSet<String>,
    excluded_path_patterns: Vec<String>,
    decompress_fn: Option<DecompressFn>,
    override_fn: Option<OverrideFn>,
    level: i32,
    pool_mode: PoolMode,
    cleanup_timeout: Option<Duration>,
    max_buffered_size: usize,
}

impl Default for OptionsBuilder {
    fn default() -> Self {
        let defaults = Options::default();
        Self {
            excluded_extensions: defaults.excluded_extensions,
            excluded_paths: defaults.excluded_paths,
            excluded_path_patterns: Vec::new(),
            decompress_fn: None,
            override_fn: None,
            level: defaults.level,
            pool_mode: defaults.pool_mode,
            cleanup_timeout: defaults.cleanup_timeout,
            max_buffered_size: defaults.max_buffered_size,
        }
    }
}

impl OptionsBuilder {
    /// Replaces the excluded extensions (including the leading dot, e.g. `.png`).
    pub fn excluded_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the excluded exact request paths.
    pub fn excluded_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Replaces the excluded path patterns. Patterns match anywhere in the path
    /// unless anchored.
    pub fn excluded_path_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_path_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Decodes gzip-encoded request bodies before they reach the inner service.
    ///
    /// Enabling installs [`gunzip_requests`] as the hook; disabling removes any hook.
    pub fn decompress_requests(mut self, enabled: bool) -> Self {
        self.decompress_fn = enabled.then(|| Arc::new(gunzip_requests) as DecompressFn);
        self
    }

    /// Installs a hook run for every gzip-encoded request before the inner service.
    pub fn decompress_with<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut Parts) -> RequestDecoding + Send + Sync + 'static,
    {
        self.decompress_fn = Some(Arc::new(hook));
        self
    }

    /// Installs an override predicate.
    pub fn override_with<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Parts) -> Option<bool> + Send + Sync + 'static,
    {
        self.override_fn = Some(Arc::new(predicate));
        self
    }

    /// Sets the gzip level: `-1` for the codec default or `0..=9`.
    pub fn level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    /// Chooses between pooled and fresh-per-request compressors.
    pub fn pool_mode(mut self, mode: PoolMode) -> Self {
        self.pool_mode = mode;
        self
    }

    /// Sets the bounded wait after which a checked-out compressor is reclaimed.
    /// `None` disables the cleanup watcher.
    pub fn cleanup_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.cleanup_timeout = timeout;
        self
    }

    /// Sets the largest exact-size body compressed before headers are sent.
    /// Zero always streams.
    pub fn max_buffered_size(mut self, size: usize) -> Self {
        self.max_buffered_size = size;
        self
    }

    /// Validates the configuration and freezes it.
    pub fn build(self) -> Result<Options> {
        let level = validate_level(self.level)?;
        let excluded_path_patterns = RegexSet::new(&self.excluded_path_patterns)?;

        Ok(Options {
            excluded_extensions: self.excluded_extensions,
            excluded_paths: self.excluded_paths,
            excluded_path_patterns,
            decompress_fn: self.decompress_fn,
            override_fn: self.override_fn,
            level,
            pool_mode: self.pool_mode,
            cleanup_timeout: self.cleanup_timeout,
            max_buffered_size: self.max_buffered_size,
        })
    }
}

impl fmt::Debug for OptionsBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsBuilder")
            .field("excluded_extensions", &self.excluded_extensions)
            .field("excluded_paths", &self.excluded_paths)
            .field("excluded_path_patterns", &self.excluded_path_patterns)
            .field("level", &self.level)
            .field("pool_mode", &self.pool_mode)
            .finish_non_exhaustive()
    }
}

/// Returns the extension of the last path segment, dot included.
fn extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next().unwrap_or(path);
    name.rfind('.').map(|idx| &name[idx..])
}
