use super::{consts::*, function::*};

/// Configuration for `Tlsf`. All fields have sensible defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsfConfig {
    /// Size of the pool created at construction and the minimum size of every grown pool.
    /// Must be a multiple of `LINE_SIZE`. Zero starts the allocator without any pool.
    /// Default: 1 MB.
    pub default_pool_size: usize,

    /// Report pools grown from inside `allocate` through the growth hook. Default: true.
    pub warn_on_growth: bool,

    /// Largest single request made to the backing allocator. Pools above this size are carved
    /// from several equally sized regions. The effective limit is the smaller of this and the
    /// backing allocator's own limit. Default: `usize::MAX`.
    pub max_backing_allocation: usize,
}

impl Default for TlsfConfig {
    fn default() -> Self {
        Self {
            default_pool_size: megabytes_of(1),
            warn_on_growth: true,
            max_backing_allocation: usize::MAX,
        }
    }
}

impl TlsfConfig {
    pub fn with_default_pool_size(mut self, size: usize) -> Self {
        self.default_pool_size = size;
        self
    }

    pub fn with_warn_on_growth(mut self, warn: bool) -> Self {
        self.warn_on_growth = warn;
        self
    }

    pub fn with_max_backing_allocation(mut self, size: usize) -> Self {
        self.max_backing_allocation = size;
        self
    }

    pub(crate) fn is_valid(&self) -> bool {
        is_aligned(self.default_pool_size) && self.max_backing_allocation >= MINIMUM_SPLIT_SIZE
    }
}

/// Pool growth triggered by an allocation that no free block could serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrowthEvent {
    /// Line aligned payload size of the request that triggered growth.
    pub requested: usize,
    /// Bytes added to the allocator.
    pub pool_size: usize,
    /// Number of backing allocations the pool was carved from.
    pub regions: usize,
    /// Bytes managed by the allocator after growth.
    pub bytes_total: usize,
}

/// Diagnostic callback invoked on pool growth.
pub type GrowthHook = Box<dyn FnMut(&GrowthEvent) + Send>;

/// Default growth hook: a warning through the `log` facade.
pub fn log_growth(event: &GrowthEvent) {
    log::warn!(
        "tlsf pool growth: {} byte request added {} bytes in {} region(s), {} bytes total",
        event.requested,
        event.pool_size,
        event.regions,
        event.bytes_total
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = TlsfConfig::default();
        assert_eq!(config.default_pool_size, 1024 * 1024);
        assert!(config.warn_on_growth);
        assert_eq!(config.max_backing_allocation, usize::MAX);
        assert!(config.is_valid());
    }

    #[test]
    fn builder_and_validation() {
        let config = TlsfConfig::default()
            .with_default_pool_size(6400)
            .with_warn_on_growth(false)
            .with_max_backing_allocation(65536);
        assert_eq!(config.default_pool_size, 6400);
        assert!(!config.warn_on_growth);
        assert_eq!(config.max_backing_allocation, 65536);
        assert!(config.is_valid());

        assert!(!TlsfConfig::default().with_default_pool_size(100).is_valid());
        assert!(!TlsfConfig::default().with_max_backing_allocation(64).is_valid());
    }
}
