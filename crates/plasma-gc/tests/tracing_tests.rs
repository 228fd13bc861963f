//! Integration tests for the `tracing` feature.
//!
//! These check that collections run under a subscriber and that the events
//! they emit reach it.

#![cfg(feature = "tracing")]

use std::io::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use plasma_gc::{AllocError, AllocOpts, GcCapability, Heap, NoRoots, Options};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Captured {
    type Writer = Self;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

fn with_capture(f: impl FnOnce()) -> String {
    let captured = Captured::default();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(captured.clone())
        .with_ansi(false)
        .finish();
    {
        let _guard = subscriber.set_default();
        f();
    }
    captured.text()
}

#[test]
fn test_collection_emits_phase_events() {
    let output = with_capture(|| {
        let mut heap = Heap::new(Options::new(), Rc::new(NoRoots)).unwrap();
        heap.alloc(4, GcCapability::can_gc(), AllocOpts::Normal)
            .unwrap();
        heap.collect(None);
    });
    assert!(output.contains("gc_collect"), "{output}");
    assert!(output.contains("phase_start"), "{output}");
    assert!(output.contains("phase_end"), "{output}");
    assert!(output.contains("explicit"), "{output}");
}

#[test]
fn test_block_events() {
    let output = with_capture(|| {
        let mut heap = Heap::new(Options::new(), Rc::new(NoRoots)).unwrap();
        heap.alloc(4, GcCapability::can_gc(), AllocOpts::Normal)
            .unwrap();
        heap.collect(None);
    });
    assert!(output.contains("block_assigned"), "{output}");
    assert!(output.contains("block_released"), "{output}");
}

#[test]
fn test_out_of_memory_warning() {
    let output = with_capture(|| {
        let mut heap = Heap::new(
            Options::new().fit_chunk_bytes(64 * 1024),
            Rc::new(NoRoots),
        )
        .unwrap();
        let mut kept = plasma_gc::RootStack::new();
        let err = loop {
            match heap.alloc(1000, GcCapability::with_tracer(&kept), AllocOpts::Normal) {
                Ok(ptr) => kept.push_ptr(ptr),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
    });
    assert!(output.contains("out_of_memory"), "{output}");
    assert!(output.contains("WARN"), "{output}");
}

#[test]
fn test_multiple_collections_with_tracing() {
    let output = with_capture(|| {
        let mut heap = Heap::new(Options::new().zealous(true), Rc::new(NoRoots)).unwrap();
        for _ in 0..5 {
            heap.alloc(2, GcCapability::can_gc(), AllocOpts::Normal)
                .unwrap();
        }
        assert_eq!(heap.collections(), 5);
    });
    assert!(output.matches("zealous").count() >= 5, "{output}");
}
