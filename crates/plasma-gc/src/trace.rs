//! The root tracing contract.
//!
//! Anything outside the heap that holds references into it (a module being
//! loaded, a finished module's symbol table, an interpreter's call stack)
//! implements [`Tracer`]. During the mark phase the collector hands each
//! tracer a [`HeapMarkState`] and the tracer reports every reference it
//! holds with [`HeapMarkState::mark_root`], including references to objects
//! that are still under construction.
//!
//! A tracer that misses a reference gets that object freed under it.

use std::cell::RefCell;
use std::rc::Rc;

pub use crate::gc::HeapMarkState;

/// A source of roots.
pub trait Tracer {
    /// Report every heap reference held by `self` to `marker`.
    fn do_trace(&self, marker: &mut HeapMarkState<'_>);
}

/// A tracer with no roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRoots;

impl Tracer for NoRoots {
    fn do_trace(&self, _marker: &mut HeapMarkState<'_>) {}
}

/// Shared, mutable root holders.
///
/// # Panics
///
/// Tracing panics if the value is mutably borrowed while a collection runs.
impl<T: Tracer + ?Sized> Tracer for RefCell<T> {
    fn do_trace(&self, marker: &mut HeapMarkState<'_>) {
        self.borrow().do_trace(marker);
    }
}

impl<T: Tracer + ?Sized> Tracer for Rc<T> {
    fn do_trace(&self, marker: &mut HeapMarkState<'_>) {
        (**self).do_trace(marker);
    }
}

impl<T: Tracer> Tracer for [T] {
    fn do_trace(&self, marker: &mut HeapMarkState<'_>) {
        for tracer in self {
            tracer.do_trace(marker);
        }
    }
}

impl<T: Tracer> Tracer for Vec<T> {
    fn do_trace(&self, marker: &mut HeapMarkState<'_>) {
        self.as_slice().do_trace(marker);
    }
}

impl<T: Tracer> Tracer for Option<T> {
    fn do_trace(&self, marker: &mut HeapMarkState<'_>) {
        if let Some(tracer) = self {
            tracer.do_trace(marker);
        }
    }
}
