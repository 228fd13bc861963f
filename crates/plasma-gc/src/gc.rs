//! Mark-sweep collection.
//!
//! Marking starts from the heap's global roots and the optional thread
//! tracer, then drains a worklist: every payload word of a marked cell that
//! resolves to an allocated cell (exactly, through an interior pointer, or
//! through a tagged pointer) marks that cell too. Fit cells also mark their
//! meta word. The sweep frees everything left unmarked and clears the marks.

use std::rc::Rc;
use std::time::Instant;

use crate::cell::{CellPtr, CellPtrFit};
use crate::chunk::SweepStats;
use crate::heap::Heap;
use crate::layout::WORD_SIZE;
use crate::metrics::{CollectReason, GcMetrics, PhaseTimer};
use crate::trace::Tracer;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_mark_end, log_phase_start, log_sweep_end, next_gc_id, trace_gc_collection, trace_phase,
    GcPhase,
};

// ============================================================================
// HeapMarkState - the mark phase
// ============================================================================

/// Marking state handed to each [`Tracer`].
pub struct HeapMarkState<'h> {
    heap: &'h Heap,
    worklist: Vec<CellPtr>,
    cells_marked: usize,
}

impl<'h> HeapMarkState<'h> {
    pub(crate) const fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            worklist: Vec::new(),
            cells_marked: 0,
        }
    }

    /// Mark the cell `ptr` points into, and later everything it reaches.
    ///
    /// `ptr` may point at the cell start, inside its payload, or carry tag
    /// bits. Null and addresses outside the heap are ignored.
    pub fn mark_root(&mut self, ptr: *const u8) {
        self.mark_word(ptr as usize);
    }

    /// [`mark_root`](Self::mark_root) for a raw word.
    pub fn mark_word(&mut self, word: usize) {
        if word == 0 {
            return;
        }
        if let Some(cell) = self.heap.allocated_cell_containing(word) {
            self.mark_cell(cell);
        }
    }

    /// Cells marked so far.
    #[must_use]
    pub const fn cells_marked(&self) -> usize {
        self.cells_marked
    }

    fn mark_cell(&mut self, cell: CellPtr) {
        if cell.is_marked() {
            return;
        }
        cell.mark();
        self.cells_marked += 1;
        self.worklist.push(cell);
    }

    /// Scan marked cells until nothing new is reached.
    pub(crate) fn drain(&mut self) {
        while let Some(cell) = self.worklist.pop() {
            self.scan_fields(cell);
            if let CellPtr::Fit(fit) = cell {
                self.do_mark_special_field(fit);
            }
        }
    }

    fn scan_fields(&mut self, cell: CellPtr) {
        for word in cell.fields() {
            self.mark_word(word);
        }
    }

    fn do_mark_special_field(&mut self, cell: CellPtrFit) {
        self.mark_word(cell.meta() as usize);
    }
}

// ============================================================================
// Collection
// ============================================================================

/// Run one collection over `heap`.
///
/// # Panics
///
/// Panics if a no-GC scope is open.
pub(crate) fn collect(heap: &mut Heap, thread_tracer: Option<&dyn Tracer>, reason: CollectReason) {
    assert_eq!(
        heap.no_gc_depth(),
        0,
        "collection requested while a NoGcScope is open"
    );
    heap.debug_verify();

    #[cfg(feature = "tracing")]
    let _gc_span = trace_gc_collection(reason.as_str(), next_gc_id());

    let start = Instant::now();
    let mut timer = PhaseTimer::new();

    timer.start();
    let cells_marked = mark(heap, thread_tracer);
    timer.end_mark();

    timer.start();
    let stats = sweep(heap);
    timer.end_sweep();

    heap.collections += 1;
    heap.threshold = heap.options().next_threshold(heap.usage);
    heap.last_metrics = GcMetrics {
        duration: start.elapsed(),
        mark_duration: timer.mark,
        sweep_duration: timer.sweep,
        cells_marked,
        cells_reclaimed: stats.cells,
        bytes_reclaimed: stats.bytes,
        bytes_surviving: heap.usage,
        reason,
        collection_number: heap.collections,
    };

    heap.debug_verify();
}

fn mark(heap: &Heap, thread_tracer: Option<&dyn Tracer>) -> usize {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(GcPhase::Mark);
    #[cfg(feature = "tracing")]
    log_phase_start(GcPhase::Mark, heap.usage);

    let global_roots = Rc::clone(&heap.global_roots);
    let mut marker = HeapMarkState::new(heap);
    global_roots.do_trace(&mut marker);
    marker.drain();
    if let Some(tracer) = thread_tracer {
        tracer.do_trace(&mut marker);
        marker.drain();
    }

    #[cfg(feature = "tracing")]
    log_mark_end(marker.cells_marked());

    marker.cells_marked()
}

fn sweep(heap: &mut Heap) -> SweepStats {
    #[cfg(feature = "tracing")]
    let _span = trace_phase(GcPhase::Sweep);
    #[cfg(feature = "tracing")]
    log_phase_start(GcPhase::Sweep, heap.usage);

    let bop = heap.bop.sweep();
    let fit = heap.fit.sweep();
    let stats = SweepStats {
        cells: bop.cells + fit.cells,
        bytes: bop.bytes + fit.bytes,
    };
    debug_assert!(stats.bytes <= heap.usage);
    debug_assert_eq!(stats.bytes % WORD_SIZE, 0);
    heap.usage -= stats.bytes;

    #[cfg(feature = "tracing")]
    log_sweep_end(stats.bytes, heap.usage);

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::AllocOpts;
    use crate::options::Options;
    use crate::roots::RootStack;
    use crate::scope::GcCapability;
    use crate::tag::make_tag;
    use crate::trace::NoRoots;
    use std::cell::RefCell;
    use std::ptr::NonNull;

    fn heap_with_roots() -> (Heap, Rc<RefCell<RootStack>>) {
        let roots = Rc::new(RefCell::new(RootStack::new()));
        let heap = Heap::new(
            Options::new().bop_chunk_bytes(64 * 1024).fit_chunk_bytes(64 * 1024),
            roots.clone(),
        )
        .unwrap();
        (heap, roots)
    }

    fn alloc(heap: &mut Heap, words: usize) -> NonNull<u8> {
        heap.alloc(words, GcCapability::can_gc(), AllocOpts::Normal)
            .unwrap()
    }

    fn store(obj: NonNull<u8>, field: usize, word: usize) {
        unsafe { obj.cast::<usize>().as_ptr().add(field).write(word) };
    }

    #[test]
    fn test_unrooted_cells_are_freed() {
        let (mut heap, _roots) = heap_with_roots();
        let a = alloc(&mut heap, 3);
        let b = alloc(&mut heap, 30);
        heap.collect(None);
        assert!(!heap.is_allocated(a.as_ptr()));
        assert!(!heap.is_allocated(b.as_ptr()));
        assert_eq!(heap.usage(), 0);
        assert_eq!(heap.last_gc_metrics().cells_reclaimed, 2);
    }

    #[test]
    fn test_marking_follows_fields() {
        let (mut heap, roots) = heap_with_roots();
        let head = alloc(&mut heap, 2);
        let middle = alloc(&mut heap, 24);
        let tail = alloc(&mut heap, 4);
        let garbage = alloc(&mut heap, 4);
        store(head, 1, middle.as_ptr() as usize);
        store(middle, 23, tail.as_ptr() as usize);
        roots.borrow_mut().push_ptr(head);

        heap.collect(None);

        assert!(heap.is_allocated(head.as_ptr()));
        assert!(heap.is_allocated(middle.as_ptr()));
        assert!(heap.is_allocated(tail.as_ptr()));
        assert!(!heap.is_allocated(garbage.as_ptr()));
        assert_eq!(heap.last_gc_metrics().cells_marked, 3);
    }

    #[test]
    fn test_tagged_and_interior_pointers_keep_cells_alive() {
        let (mut heap, roots) = heap_with_roots();
        let holder = alloc(&mut heap, 2);
        let tagged = alloc(&mut heap, 2);
        let interior = alloc(&mut heap, 8);
        store(holder, 0, make_tag(tagged.as_ptr() as usize, 3));
        roots.borrow_mut().push_ptr(holder);
        roots
            .borrow_mut()
            .push(interior.as_ptr() as usize + 5 * WORD_SIZE);

        heap.collect(None);

        assert!(heap.is_allocated(tagged.as_ptr()));
        assert!(heap.is_allocated(interior.as_ptr()));
    }

    #[test]
    fn test_cycles_terminate() {
        let (mut heap, roots) = heap_with_roots();
        let a = alloc(&mut heap, 2);
        let b = alloc(&mut heap, 2);
        store(a, 0, b.as_ptr() as usize);
        store(b, 0, a.as_ptr() as usize);
        roots.borrow_mut().push_ptr(a);

        heap.collect(None);
        assert_eq!(heap.last_gc_metrics().cells_marked, 2);

        roots.borrow_mut().clear();
        heap.collect(None);
        assert!(!heap.is_allocated(a.as_ptr()));
        assert!(!heap.is_allocated(b.as_ptr()));
    }

    #[test]
    fn test_meta_word_is_traced() {
        let (mut heap, roots) = heap_with_roots();
        let obj = heap
            .alloc(2, GcCapability::can_gc(), AllocOpts::Meta)
            .unwrap();
        let descriptor = alloc(&mut heap, 6);
        heap.set_meta_info(obj, descriptor.as_ptr());
        roots.borrow_mut().push_ptr(obj);

        heap.collect(None);
        assert!(heap.is_allocated(descriptor.as_ptr()));
        assert_eq!(heap.meta_info(obj), descriptor.as_ptr());
    }

    #[test]
    fn test_thread_tracer_is_consulted() {
        let (mut heap, _roots) = heap_with_roots();
        let obj = alloc(&mut heap, 5);
        let mut stack = RootStack::new();
        stack.push_ptr(obj);

        heap.collect(Some(&stack));
        assert!(heap.is_allocated(obj.as_ptr()));
        heap.collect(Some(&NoRoots));
        assert!(!heap.is_allocated(obj.as_ptr()));
    }

    #[test]
    fn test_threshold_grows_with_survivors() {
        let roots = Rc::new(RefCell::new(RootStack::new()));
        let mut heap = Heap::new(
            Options::new().initial_threshold(256).threshold_growth(2),
            roots.clone(),
        )
        .unwrap();
        for _ in 0..10 {
            let obj = alloc(&mut heap, 8);
            roots.borrow_mut().push_ptr(obj);
        }
        heap.collect(None);
        assert_eq!(heap.usage(), 10 * 8 * WORD_SIZE);
        assert_eq!(heap.threshold(), 2 * heap.usage());
    }

    #[test]
    #[should_panic(expected = "NoGcScope")]
    fn test_collect_inside_scope_panics() {
        let (mut heap, _roots) = heap_with_roots();
        heap.enter_no_gc();
        collect(&mut heap, None, CollectReason::Explicit);
    }
}
