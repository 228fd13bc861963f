//! GC metrics and statistics.

use std::time::{Duration, Instant};

/// What caused a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectReason {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// `Heap::collect` was called.
    Explicit = 1,
    /// `Heap::maybe_collect` decided to collect.
    Policy = 2,
    /// Usage passed the threshold during allocation.
    Threshold = 3,
    /// Zealous mode collects on every allocation.
    Zealous = 4,
    /// An allocation failed and is being retried.
    AllocFailure = 5,
}

impl CollectReason {
    /// Short name for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Explicit => "explicit",
            Self::Policy => "policy",
            Self::Threshold => "threshold",
            Self::Zealous => "zealous",
            Self::AllocFailure => "alloc_failure",
        }
    }
}

/// Statistics from the most recent collection.
#[derive(Debug, Clone, Copy)]
pub struct GcMetrics {
    /// Duration of the whole collection.
    pub duration: Duration,
    /// Duration of the mark phase.
    pub mark_duration: Duration,
    /// Duration of the sweep phase.
    pub sweep_duration: Duration,
    /// Cells reached from the roots.
    pub cells_marked: usize,
    /// Cells freed.
    pub cells_reclaimed: usize,
    /// Usage bytes freed.
    pub bytes_reclaimed: usize,
    /// Usage bytes left after the sweep.
    pub bytes_surviving: usize,
    /// Why the collection ran.
    pub reason: CollectReason,
    /// 1 for the first collection of the heap, and so on.
    pub collection_number: usize,
}

impl Default for GcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GcMetrics {
    /// All fields zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            sweep_duration: Duration::ZERO,
            cells_marked: 0,
            cells_reclaimed: 0,
            bytes_reclaimed: 0,
            bytes_surviving: 0,
            reason: CollectReason::None,
            collection_number: 0,
        }
    }
}

/// Times the mark and sweep phases of one collection.
///
/// ```
/// use plasma_gc::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark ...
/// timer.end_mark();
/// timer.start();
/// // ... sweep ...
/// timer.end_sweep();
/// assert!(timer.total() >= timer.mark);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseTimer {
    /// Mark phase time.
    pub mark: Duration,
    /// Sweep phase time.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a timer with both durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.mark = start.elapsed();
        }
    }

    /// End the sweep phase and record its duration.
    pub fn end_sweep(&mut self) {
        if let Some(start) = self.current_start.take() {
            self.sweep = start.elapsed();
        }
    }

    /// Sum of both phases.
    #[must_use]
    pub fn total(&self) -> Duration {
        self.mark + self.sweep
    }
}
