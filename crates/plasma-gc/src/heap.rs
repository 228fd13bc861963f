//! The heap: two chunks, allocation dispatch and accounting.
//!
//! Small ordinary allocations (up to [`MAX_BOP_CELL_WORDS`] words) come from
//! the size-class blocks of a [`ChunkBop`]. Larger ones, and any allocation
//! that needs a meta-info slot, come from the best-fit [`ChunkFit`].
//!
//! Usage counts the bytes a cell occupies: the cell itself for size-class
//! cells, header included for fit cells.

use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::cell::{CellPtr, CellPtrFit};
use crate::chunk::{ChunkBop, ChunkFit};
use crate::error::{AllocError, HeapError};
use crate::gc;
use crate::layout::{bytes_to_words, cell_words_for, MAX_BOP_CELL_WORDS, WORD_SIZE};
use crate::metrics::{CollectReason, GcMetrics};
use crate::options::{CollectInfo, Options};
use crate::scope::GcCapability;
use crate::trace::Tracer;
use crate::tracing::internal::log_out_of_memory;

/// Kind of allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AllocOpts {
    /// An ordinary object.
    #[default]
    Normal,
    /// An object that carries a meta-info word, see
    /// [`Heap::set_meta_info`]. Always served by the fit chunk.
    Meta,
}

/// A garbage-collected heap.
///
/// The heap is single threaded. Allocation through [`alloc`](Self::alloc)
/// with a collecting [`GcCapability`] is the only place a collection can
/// start on its own.
pub struct Heap {
    options: Options,
    pub(crate) bop: ChunkBop,
    pub(crate) fit: ChunkFit,
    pub(crate) usage: usize,
    pub(crate) threshold: usize,
    pub(crate) collections: usize,
    no_gc_depth: usize,
    pub(crate) global_roots: Rc<dyn Tracer>,
    pub(crate) last_metrics: GcMetrics,
}

impl Heap {
    /// Reserve the chunks described by `options`. `global_roots` is traced
    /// by every collection.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Map`] if the OS refuses the reservation.
    pub fn new(options: Options, global_roots: Rc<dyn Tracer>) -> Result<Self, HeapError> {
        let bop = ChunkBop::new(options.get_bop_chunk_bytes())?;
        let fit = ChunkFit::new(options.get_fit_chunk_bytes())?;
        Ok(Self {
            threshold: options.get_initial_threshold(),
            options,
            bop,
            fit,
            usage: 0,
            collections: 0,
            no_gc_depth: 0,
            global_roots,
            last_metrics: GcMetrics::new(),
        })
    }

    /// The configuration this heap was built with.
    #[must_use]
    pub const fn options(&self) -> &Options {
        &self.options
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a zeroed cell of at least `size_in_words` words.
    ///
    /// With a collecting `cap` the heap collects first when zealous or when
    /// the request would push usage past the threshold, and collects once
    /// more and retries if the chunk has no room.
    ///
    /// # Errors
    ///
    /// * [`AllocError::ZeroSize`] for a zero-word request.
    /// * [`AllocError::TooLarge`] if no cell can be that large.
    /// * [`AllocError::OutOfMemory`] if there is no room left.
    pub fn alloc(
        &mut self,
        size_in_words: usize,
        cap: GcCapability<'_>,
        opts: AllocOpts,
    ) -> Result<NonNull<u8>, AllocError> {
        if size_in_words == 0 {
            return Err(AllocError::ZeroSize);
        }
        let limit = self.fit.max_cell_words();
        if size_in_words > limit {
            return Err(AllocError::TooLarge {
                requested_bytes: size_in_words.saturating_mul(WORD_SIZE),
                limit: limit * WORD_SIZE,
            });
        }
        let request_bytes = size_in_words * WORD_SIZE;

        if cap.may_collect() {
            if self.options.is_zealous() {
                gc::collect(self, cap.thread_tracer(), CollectReason::Zealous);
            } else if self.usage + request_bytes > self.threshold {
                gc::collect(self, cap.thread_tracer(), CollectReason::Threshold);
            }
        }

        if let Some(cell) = self.try_alloc(size_in_words, opts) {
            return Ok(cell.ptr());
        }

        if cap.may_collect() {
            gc::collect(self, cap.thread_tracer(), CollectReason::AllocFailure);
            if let Some(cell) = self.try_alloc(size_in_words, opts) {
                return Ok(cell.ptr());
            }
        }

        log_out_of_memory(request_bytes, self.usage, cap.may_collect());
        Err(AllocError::OutOfMemory {
            requested_bytes: request_bytes,
        })
    }

    /// Allocate a zeroed cell of at least `size_in_bytes` bytes.
    ///
    /// # Errors
    ///
    /// As [`alloc`](Self::alloc).
    pub fn alloc_bytes(
        &mut self,
        size_in_bytes: usize,
        cap: GcCapability<'_>,
        opts: AllocOpts,
    ) -> Result<NonNull<u8>, AllocError> {
        self.alloc(bytes_to_words(size_in_bytes), cap, opts)
    }

    fn try_alloc(&mut self, size_in_words: usize, opts: AllocOpts) -> Option<CellPtr> {
        let cell = if opts == AllocOpts::Normal && size_in_words <= MAX_BOP_CELL_WORDS {
            CellPtr::Bop(self.bop.allocate_cell(cell_words_for(size_in_words))?)
        } else {
            CellPtr::Fit(self.fit.allocate_cell(size_in_words)?)
        };
        self.usage += cell.footprint_bytes();
        Some(cell)
    }

    // ------------------------------------------------------------------
    // Collection
    // ------------------------------------------------------------------

    /// Run a collection now.
    ///
    /// # Panics
    ///
    /// Panics if a [`NoGcScope`](crate::NoGcScope) is open.
    pub fn collect(&mut self, thread_tracer: Option<&dyn Tracer>) {
        gc::collect(self, thread_tracer, CollectReason::Explicit);
    }

    /// Collect if the configured [`CollectCondition`](crate::CollectCondition)
    /// says so. Returns whether a collection ran.
    ///
    /// Never collects while a [`NoGcScope`](crate::NoGcScope) is open.
    pub fn maybe_collect(&mut self, thread_tracer: Option<&dyn Tracer>) -> bool {
        if self.no_gc_depth > 0 {
            return false;
        }
        let info = CollectInfo {
            usage: self.usage,
            threshold: self.threshold,
            collections: self.collections,
            request_bytes: 0,
        };
        if !(self.options.condition())(&info) {
            return false;
        }
        gc::collect(self, thread_tracer, CollectReason::Policy);
        true
    }

    pub(crate) fn enter_no_gc(&mut self) {
        self.no_gc_depth += 1;
    }

    pub(crate) fn leave_no_gc(&mut self) {
        debug_assert!(self.no_gc_depth > 0, "unbalanced NoGcScope");
        self.no_gc_depth -= 1;
    }

    /// Number of open [`NoGcScope`](crate::NoGcScope)s.
    #[must_use]
    pub const fn no_gc_depth(&self) -> usize {
        self.no_gc_depth
    }

    // ------------------------------------------------------------------
    // Meta info
    // ------------------------------------------------------------------

    fn meta_cell(&self, obj: NonNull<u8>) -> CellPtrFit {
        match self.fit.ptr_to_cell(obj.as_ptr() as usize) {
            Some(cell) if cell.is_allocated() => cell,
            _ => panic!("{obj:p} is not an allocated cell with a meta-info slot"),
        }
    }

    /// Attach `meta` to `obj`. The meta word is traced like a field.
    ///
    /// # Panics
    ///
    /// Panics unless `obj` is an allocated fit cell; allocate with
    /// [`AllocOpts::Meta`] to be sure of one.
    pub fn set_meta_info(&mut self, obj: NonNull<u8>, meta: *mut u8) {
        self.meta_cell(obj).set_meta(meta);
    }

    /// The meta word of `obj`, null if never set.
    ///
    /// # Panics
    ///
    /// As [`set_meta_info`](Self::set_meta_info).
    #[must_use]
    pub fn meta_info(&self, obj: NonNull<u8>) -> *mut u8 {
        self.meta_cell(obj).meta()
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    /// Bytes in allocated cells.
    #[must_use]
    pub const fn usage(&self) -> usize {
        self.usage
    }

    /// Usage above which a collecting allocation collects first.
    #[must_use]
    pub const fn threshold(&self) -> usize {
        self.threshold
    }

    /// Collections run so far.
    #[must_use]
    pub const fn collections(&self) -> usize {
        self.collections
    }

    /// Metrics of the most recent collection.
    #[must_use]
    pub const fn last_gc_metrics(&self) -> GcMetrics {
        self.last_metrics
    }

    /// Size-class blocks currently in use.
    #[must_use]
    pub const fn blocks_in_use(&self) -> usize {
        self.bop.blocks_in_use()
    }

    // ------------------------------------------------------------------
    // Address queries
    // ------------------------------------------------------------------

    /// The cell starting exactly at `ptr`, allocated or not. `None` if
    /// `ptr` is not a cell address.
    #[must_use]
    pub fn ptr_to_cell(&self, ptr: *const u8) -> Option<CellPtr> {
        let addr = ptr as usize;
        if let Some(cell) = self.bop.ptr_to_cell(addr) {
            return Some(CellPtr::Bop(cell));
        }
        self.fit.ptr_to_cell(addr).map(CellPtr::Fit)
    }

    /// The allocated cell whose payload contains `addr`.
    pub(crate) fn allocated_cell_containing(&self, addr: usize) -> Option<CellPtr> {
        let cell = if self.bop.contains_pointer(addr) {
            CellPtr::Bop(self.bop.ptr_to_cell_interior(addr)?)
        } else {
            CellPtr::Fit(self.fit.ptr_to_cell_interior(addr)?)
        };
        cell.is_allocated().then_some(cell)
    }

    /// Whether `ptr` lies in the payload of an in-use block or the used part
    /// of the fit chunk. Block headers and bitmaps are not heap addresses.
    #[must_use]
    pub fn is_heap_address(&self, ptr: *const u8) -> bool {
        let addr = ptr as usize;
        self.bop
            .block_in_use_for(addr)
            .is_some_and(|block| block.is_in_payload(addr))
            || self.fit.contains_pointer(addr)
    }

    /// Whether `ptr` is the start of a cell.
    #[must_use]
    pub fn is_valid_cell(&self, ptr: *const u8) -> bool {
        self.ptr_to_cell(ptr).is_some()
    }

    /// Whether `ptr` is the start of an allocated cell.
    #[must_use]
    pub fn is_allocated(&self, ptr: *const u8) -> bool {
        self.ptr_to_cell(ptr).is_some_and(|cell| cell.is_allocated())
    }

    /// Resolve an interior or tagged pointer to the start of its allocated
    /// cell.
    #[must_use]
    pub fn interior_ptr_to_ptr(&self, ptr: *const u8) -> Option<NonNull<u8>> {
        self.allocated_cell_containing(ptr as usize)
            .map(|cell| cell.ptr())
    }

    // ------------------------------------------------------------------
    // Consistency
    // ------------------------------------------------------------------

    /// Check every block bitmap, the fit chunk tiling and the usage count.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::Corrupt`] describing the first violation found.
    pub fn verify(&self) -> Result<(), HeapError> {
        let allocated = self.bop.verify()? + self.fit.verify()?;
        if allocated != self.usage {
            return Err(HeapError::corrupt(format!(
                "usage is {} bytes but allocated cells hold {allocated}",
                self.usage
            )));
        }
        Ok(())
    }

    #[cfg(any(debug_assertions, feature = "paranoid-checks"))]
    pub(crate) fn debug_verify(&self) {
        if let Err(err) = self.verify() {
            panic!("{err}");
        }
    }

    #[cfg(not(any(debug_assertions, feature = "paranoid-checks")))]
    #[allow(clippy::unused_self)]
    #[inline]
    pub(crate) const fn debug_verify(&self) {}
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("usage", &self.usage)
            .field("threshold", &self.threshold)
            .field("collections", &self.collections)
            .field("blocks_in_use", &self.bop.blocks_in_use())
            .field("fit_used_words", &self.fit.used_words())
            .field("no_gc_depth", &self.no_gc_depth)
            .finish_non_exhaustive()
    }
}
