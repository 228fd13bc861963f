//! Heap configuration and the collection policy.

use crate::layout::DEFAULT_CHUNK_BYTES;

/// Heap state handed to a [`CollectCondition`].
#[derive(Debug, Clone, Copy)]
pub struct CollectInfo {
    pub(crate) usage: usize,
    pub(crate) threshold: usize,
    pub(crate) collections: usize,
    pub(crate) request_bytes: usize,
}

impl CollectInfo {
    /// Bytes currently allocated.
    #[must_use]
    pub const fn usage(&self) -> usize {
        self.usage
    }

    /// Usage level above which allocation triggers a collection.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Collections run so far.
    #[must_use]
    pub const fn collections(&self) -> usize {
        self.collections
    }

    /// Size of the pending allocation, zero when asked outside allocation.
    #[must_use]
    pub const fn request_bytes(&self) -> usize {
        self.request_bytes
    }
}

/// Decides whether `maybe_collect` runs a collection.
pub type CollectCondition = fn(&CollectInfo) -> bool;

/// Always collect.
#[must_use]
pub const fn default_collect_condition(_info: &CollectInfo) -> bool {
    true
}

/// Collect once usage (plus the pending request) passes the threshold.
#[must_use]
pub const fn threshold_collect_condition(info: &CollectInfo) -> bool {
    info.usage + info.request_bytes > info.threshold
}

/// Heap configuration.
///
/// # Example
///
/// ```
/// use plasma_gc::Options;
///
/// let options = Options::new()
///     .bop_chunk_bytes(1 << 20)
///     .initial_threshold(256 * 1024)
///     .zealous(false);
/// assert_eq!(options.get_initial_threshold(), 256 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    bop_chunk_bytes: usize,
    fit_chunk_bytes: usize,
    initial_threshold: usize,
    threshold_growth: usize,
    zealous: bool,
    collect_condition: CollectCondition,
}

impl Options {
    /// Defaults: 4 MiB per chunk, 1 MiB initial threshold, growth factor 2.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bop_chunk_bytes: DEFAULT_CHUNK_BYTES,
            fit_chunk_bytes: DEFAULT_CHUNK_BYTES,
            initial_threshold: 1024 * 1024,
            threshold_growth: 2,
            zealous: false,
            collect_condition: default_collect_condition,
        }
    }

    /// Bytes reserved for the small-object chunk.
    #[must_use]
    pub const fn bop_chunk_bytes(mut self, bytes: usize) -> Self {
        self.bop_chunk_bytes = bytes;
        self
    }

    /// Bytes reserved for the medium-object chunk.
    #[must_use]
    pub const fn fit_chunk_bytes(mut self, bytes: usize) -> Self {
        self.fit_chunk_bytes = bytes;
        self
    }

    /// Usage that triggers the first collection.
    #[must_use]
    pub const fn initial_threshold(mut self, bytes: usize) -> Self {
        self.initial_threshold = bytes;
        self
    }

    /// After a collection the threshold becomes surviving usage times this.
    #[must_use]
    pub const fn threshold_growth(mut self, factor: usize) -> Self {
        self.threshold_growth = factor;
        self
    }

    /// Collect on every allocation that is allowed to collect.
    #[must_use]
    pub const fn zealous(mut self, zealous: bool) -> Self {
        self.zealous = zealous;
        self
    }

    /// Policy used by `maybe_collect`.
    #[must_use]
    pub const fn collect_condition(mut self, condition: CollectCondition) -> Self {
        self.collect_condition = condition;
        self
    }

    /// Configured small-object chunk size.
    #[must_use]
    pub const fn get_bop_chunk_bytes(&self) -> usize {
        self.bop_chunk_bytes
    }

    /// Configured medium-object chunk size.
    #[must_use]
    pub const fn get_fit_chunk_bytes(&self) -> usize {
        self.fit_chunk_bytes
    }

    /// Configured initial threshold.
    #[must_use]
    pub const fn get_initial_threshold(&self) -> usize {
        self.initial_threshold
    }

    /// Whether zealous collection is on.
    #[must_use]
    pub const fn is_zealous(&self) -> bool {
        self.zealous
    }

    pub(crate) const fn condition(&self) -> CollectCondition {
        self.collect_condition
    }

    /// The threshold to use after a collection left `surviving` bytes.
    pub(crate) fn next_threshold(&self, surviving: usize) -> usize {
        surviving
            .saturating_mul(self.threshold_growth)
            .max(self.initial_threshold)
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
