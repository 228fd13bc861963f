//! Memory management core for a bytecode VM.
//!
//! `plasma-gc` is a precise, non-moving **mark-sweep** collector over two
//! arenas:
//!
//! - a **BOP chunk** (big bag of pages): 4 KiB aligned blocks, each serving
//!   one small size class, with a one-byte-per-cell bitmap in the block
//!   header. The owning block of any address is found by masking.
//! - a **Fit chunk**: variable-size cells with a two-word header, handed out
//!   best-fit, split on allocation and coalesced on sweep.
//!
//! Liveness is discovered through [`Tracer`]s: the heap's global roots plus
//! an optional per-call tracer. Objects under construction are protected by
//! a [`NoGcScope`], inside which allocation never collects and running out
//! of memory aborts the process.
//!
//! # Quick Start
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use plasma_gc::{AllocOpts, GcCapability, Heap, Options, RootStack};
//!
//! let roots = Rc::new(RefCell::new(RootStack::new()));
//! let mut heap = Heap::new(Options::new(), roots.clone()).unwrap();
//!
//! let kept = heap.alloc(4, GcCapability::can_gc(), AllocOpts::Normal).unwrap();
//! let dropped = heap.alloc(4, GcCapability::can_gc(), AllocOpts::Normal).unwrap();
//! roots.borrow_mut().push_ptr(kept);
//!
//! heap.collect(None);
//! assert!(heap.is_allocated(kept.as_ptr()));
//! assert!(!heap.is_allocated(dropped.as_ptr()));
//! ```
//!
//! # Thread Safety
//!
//! A [`Heap`] is `!Send` and `!Sync`. Collection is stop-the-world with
//! respect to the one thread that owns the heap.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
pub mod builtins;
pub mod cell;
pub mod chunk;
mod error;
mod gc;
mod heap;
pub mod layout;
mod metrics;
mod options;
mod roots;
mod scope;
pub mod tag;
mod trace;
mod tracing;

// Re-export public API
pub use builtins::{install_tag_builtins, SymbolTable, TagBuiltin};
pub use error::{AllocError, HeapError, StackUnderflow};
pub use heap::{AllocOpts, Heap};
pub use metrics::{CollectReason, GcMetrics, PhaseTimer};
pub use options::{
    default_collect_condition, threshold_collect_condition, CollectCondition, CollectInfo, Options,
};
pub use roots::RootStack;
pub use scope::{GcCapability, NoGcScope};
pub use tag::{break_shift_tag, break_tag, make_tag, shift_make_tag, unshift_value};
pub use trace::{HeapMarkState, NoRoots, Tracer};
