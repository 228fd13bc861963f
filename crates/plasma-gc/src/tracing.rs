//! GC tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! tracing spans and events for collections, block reuse and allocation
//! failures. Without the feature every hook compiles to nothing.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Collection phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Trace live cells from the roots.
        Mark,
        /// Reclaim unmarked cells.
        Sweep,
    }

    /// Identifier correlating all events of one collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Span covering a whole collection.
    pub fn trace_gc_collection(reason: &str, gc_id: GcId) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", reason = reason, gc_id = gc_id.0).entered()
    }

    /// Span covering one phase.
    pub fn trace_phase(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: GcPhase, usage: usize) {
        tracing::debug!(phase = ?phase, usage, "phase_start");
    }

    /// Log the end of the mark phase.
    pub fn log_mark_end(cells_marked: usize) {
        tracing::debug!(phase = ?GcPhase::Mark, cells_marked, "phase_end");
    }

    /// Log the end of the sweep phase.
    pub fn log_sweep_end(bytes_reclaimed: usize, usage: usize) {
        tracing::debug!(phase = ?GcPhase::Sweep, bytes_reclaimed, usage, "phase_end");
    }

    /// A block was given a size class.
    pub fn log_block_assigned(block: usize, cell_words: usize) {
        tracing::trace!(block = format_args!("{block:#x}"), cell_words, "block_assigned");
    }

    /// A block was emptied by a sweep and returned to the pool.
    pub fn log_block_released(block: usize) {
        tracing::trace!(block = format_args!("{block:#x}"), "block_released");
    }

    /// An allocation could not be satisfied.
    pub fn log_out_of_memory(requested_bytes: usize, usage: usize, can_gc: bool) {
        tracing::warn!(requested_bytes, usage, can_gc, "out_of_memory");
    }
}

#[cfg(not(feature = "tracing"))]
#[allow(clippy::missing_const_for_fn)]
pub mod internal {
    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_block_assigned(_block: usize, _cell_words: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_block_released(_block: usize) {}

    /// Stub function when tracing is disabled.
    #[inline]
    pub fn log_out_of_memory(_requested_bytes: usize, _usage: usize, _can_gc: bool) {}
}
