use crate::gate::CompressionGate;
use crate::options::Options;
use crate::pool::CompressorPool;
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that gzip-compresses HTTP response bodies.
///
/// Every service produced by one layer shares its options and compressor pool.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    gate: CompressionGate,
    pool: CompressorPool,
}

impl CompressionLayer {
    /// Creates a compression layer from validated options.
    pub fn new(options: Options) -> Self {
        let pool = CompressorPool::from_options(&options);
        Self {
            gate: CompressionGate::new(Arc::new(options)),
            pool,
        }
    }

    /// Returns the options services of this layer apply.
    pub fn options(&self) -> &Options {
        self.gate.options()
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new(Options::default())
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::from_parts(inner, self.gate.clone(), self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_share_pool() {
        let layer = CompressionLayer::default();
        let first = layer.layer(());
        let second = layer.layer(());

        drop(first.pool().acquire());
        assert_eq!(second.pool().idle_count(), 1);
    }

    #[test]
    fn test_layer_keeps_options() {
        let options = Options::builder().level(9).build().unwrap();
        let layer = CompressionLayer::new(options);
        assert_eq!(layer.options().level(), 9);
    }
}
