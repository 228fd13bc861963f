//! GC capabilities and no-GC scopes.
//!
//! Every allocation names whether it may collect. Code that builds several
//! objects before any of them is reachable from a root opens a
//! [`NoGcScope`]; while the scope lives the heap is mutably borrowed by it,
//! so nothing else can allocate or collect, and its own allocations never
//! collect.

use std::fmt;
use std::process;
use std::ptr::NonNull;

use crate::error::AllocError;
use crate::heap::{AllocOpts, Heap};
use crate::trace::Tracer;

// ============================================================================
// GcCapability
// ============================================================================

#[derive(Clone, Copy)]
enum Capability<'a> {
    CanGc(Option<&'a dyn Tracer>),
    NoGc,
}

/// Token passed to [`Heap::alloc`] saying whether the call may collect.
///
/// The collecting variants are public. The non-collecting one is only
/// handed out by [`NoGcScope`].
#[derive(Clone, Copy)]
pub struct GcCapability<'a> {
    inner: Capability<'a>,
}

impl<'a> GcCapability<'a> {
    /// May collect, tracing the heap's global roots only.
    #[must_use]
    pub const fn can_gc() -> Self {
        Self {
            inner: Capability::CanGc(None),
        }
    }

    /// May collect, tracing `tracer` in addition to the global roots.
    #[must_use]
    pub const fn with_tracer(tracer: &'a dyn Tracer) -> Self {
        Self {
            inner: Capability::CanGc(Some(tracer)),
        }
    }

    pub(crate) const fn no_gc() -> Self {
        Self {
            inner: Capability::NoGc,
        }
    }

    /// Whether an allocation with this token is allowed to collect.
    #[must_use]
    pub const fn may_collect(&self) -> bool {
        matches!(self.inner, Capability::CanGc(_))
    }

    pub(crate) const fn thread_tracer(&self) -> Option<&'a dyn Tracer> {
        match self.inner {
            Capability::CanGc(tracer) => tracer,
            Capability::NoGc => None,
        }
    }
}

impl fmt::Debug for GcCapability<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner {
            Capability::CanGc(tracer) => f
                .debug_struct("CanGc")
                .field("thread_tracer", &tracer.is_some())
                .finish(),
            Capability::NoGc => f.write_str("NoGc"),
        }
    }
}

// ============================================================================
// NoGcScope
// ============================================================================

/// A span during which the heap must not collect.
///
/// Opening a scope bumps the heap's scope depth and dropping it restores it,
/// on every exit path. Allocation failures inside a scope are fatal: the
/// caller is holding objects no root can see yet, so there is nothing safe to
/// return. The process prints a diagnostic naming the scope and aborts.
///
/// ```
/// use std::rc::Rc;
/// use plasma_gc::{AllocOpts, Heap, NoGcScope, NoRoots, Options};
///
/// let mut heap = Heap::new(Options::new(), Rc::new(NoRoots)).unwrap();
/// let mut scope = NoGcScope::new(&mut heap, "building a closure");
/// let code = scope.alloc(2, AllocOpts::Normal);
/// let closure = scope.alloc(2, AllocOpts::Normal);
/// unsafe { closure.cast::<usize>().write(code.as_ptr() as usize) };
/// assert!(scope.heap().is_valid_cell(closure.as_ptr()));
/// ```
pub struct NoGcScope<'h> {
    heap: &'h mut Heap,
    context: &'static str,
}

impl<'h> NoGcScope<'h> {
    /// Open a scope. `context` describes the work for the abort message.
    pub fn new(heap: &'h mut Heap, context: &'static str) -> Self {
        heap.debug_verify();
        heap.enter_no_gc();
        Self { heap, context }
    }

    /// What this scope is doing.
    #[must_use]
    pub const fn context(&self) -> &'static str {
        self.context
    }

    /// Open an inner scope.
    pub fn nested(&mut self, context: &'static str) -> NoGcScope<'_> {
        NoGcScope::new(self.heap, context)
    }

    /// Read access to the heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Allocate without collecting. Aborts the process on failure.
    pub fn alloc(&mut self, size_in_words: usize, opts: AllocOpts) -> NonNull<u8> {
        match self.heap.alloc(size_in_words, GcCapability::no_gc(), opts) {
            Ok(ptr) => ptr,
            Err(err) => fatal(self.context, &err),
        }
    }

    /// Allocate `size_in_bytes` without collecting. Aborts the process on
    /// failure.
    pub fn alloc_bytes(&mut self, size_in_bytes: usize, opts: AllocOpts) -> NonNull<u8> {
        match self
            .heap
            .alloc_bytes(size_in_bytes, GcCapability::no_gc(), opts)
        {
            Ok(ptr) => ptr,
            Err(err) => fatal(self.context, &err),
        }
    }

    /// See [`Heap::set_meta_info`].
    pub fn set_meta_info(&mut self, obj: NonNull<u8>, meta: *mut u8) {
        self.heap.set_meta_info(obj, meta);
    }
}

impl Drop for NoGcScope<'_> {
    fn drop(&mut self) {
        self.heap.leave_no_gc();
        // A failed check while unwinding would abort and hide the panic.
        if !std::thread::panicking() {
            self.heap.debug_verify();
        }
    }
}

impl fmt::Debug for NoGcScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoGcScope")
            .field("context", &self.context)
            .field("depth", &self.heap.no_gc_depth())
            .finish()
    }
}

#[cold]
fn fatal(context: &str, err: &AllocError) -> ! {
    eprintln!("plasma-gc: fatal: {err} while {context}");
    process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::Options;
    use crate::trace::NoRoots;
    use std::rc::Rc;

    fn heap() -> Heap {
        Heap::new(
            Options::new().bop_chunk_bytes(64 * 1024).fit_chunk_bytes(64 * 1024),
            Rc::new(NoRoots),
        )
        .unwrap()
    }

    #[test]
    fn test_capability_kinds() {
        let roots = NoRoots;
        assert!(GcCapability::can_gc().may_collect());
        assert!(GcCapability::with_tracer(&roots).may_collect());
        assert!(GcCapability::with_tracer(&roots).thread_tracer().is_some());
        assert!(!GcCapability::no_gc().may_collect());
        assert!(GcCapability::no_gc().thread_tracer().is_none());
    }

    #[test]
    fn test_depth_restored_on_drop() {
        let mut heap = heap();
        {
            let mut outer = NoGcScope::new(&mut heap, "outer");
            assert_eq!(outer.heap().no_gc_depth(), 1);
            {
                let inner = outer.nested("inner");
                assert_eq!(inner.heap().no_gc_depth(), 2);
            }
            assert_eq!(outer.heap().no_gc_depth(), 1);
        }
        assert_eq!(heap.no_gc_depth(), 0);
    }

    #[test]
    fn test_depth_restored_on_early_return() {
        fn build(heap: &mut Heap, fail: bool) -> Result<NonNull<u8>, &'static str> {
            let mut scope = NoGcScope::new(heap, "early return");
            let ptr = scope.alloc(4, AllocOpts::Normal);
            if fail {
                return Err("bail");
            }
            Ok(ptr)
        }

        let mut heap = heap();
        assert!(build(&mut heap, true).is_err());
        assert_eq!(heap.no_gc_depth(), 0);
        assert!(build(&mut heap, false).is_ok());
        assert_eq!(heap.no_gc_depth(), 0);
    }

    #[test]
    fn test_scope_alloc_does_not_collect() {
        let mut heap = Heap::new(Options::new().zealous(true), Rc::new(NoRoots)).unwrap();
        let mut scope = NoGcScope::new(&mut heap, "zealous heap");
        let a = scope.alloc(3, AllocOpts::Normal);
        let b = scope.alloc_bytes(40, AllocOpts::Meta);
        assert!(scope.heap().is_allocated(a.as_ptr()));
        assert!(scope.heap().is_allocated(b.as_ptr()));
        assert_eq!(scope.heap().collections(), 0);
    }

    #[test]
    fn test_unwinding_scope_keeps_original_panic() {
        let mut heap = heap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let mut scope = NoGcScope::new(&mut heap, "unwinding");
            scope.alloc(2, AllocOpts::Normal);
            scope.heap.usage += crate::layout::WORD_SIZE;
            panic!("construction failed");
        }));
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"construction failed"));
        assert_eq!(heap.no_gc_depth(), 0);
    }
}
