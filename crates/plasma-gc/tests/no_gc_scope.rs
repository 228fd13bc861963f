//! No-GC scopes: nothing is collected inside one, and running out of memory
//! inside one ends the process.

use std::cell::RefCell;
use std::env;
use std::process::Command;
use std::rc::Rc;

use plasma_gc::{AllocOpts, GcCapability, Heap, NoGcScope, NoRoots, Options, RootStack};

const CHILD_ENV: &str = "PLASMA_GC_NO_GC_SCOPE_CHILD";

#[test]
fn test_objects_under_construction_survive_until_rooted() {
    let roots = Rc::new(RefCell::new(RootStack::new()));
    let mut heap = Heap::new(Options::new().zealous(true), roots.clone()).unwrap();

    let (code, closure) = {
        let mut scope = NoGcScope::new(&mut heap, "building a closure");
        let code = scope.alloc(4, AllocOpts::Normal);
        let closure = scope.alloc(2, AllocOpts::Normal);
        unsafe { closure.cast::<usize>().as_ptr().write(code.as_ptr() as usize) };
        roots.borrow_mut().push_ptr(closure);
        (code, closure)
    };
    assert_eq!(heap.collections(), 0);

    // A collecting allocation now traces through the closure to the code.
    heap.alloc(2, GcCapability::can_gc(), AllocOpts::Normal)
        .unwrap();
    assert_eq!(heap.collections(), 1);
    assert!(heap.is_allocated(code.as_ptr()));
    assert!(heap.is_allocated(closure.as_ptr()));
}

#[test]
fn test_nested_scopes_and_meta_info() {
    let mut heap = Heap::new(Options::new(), Rc::new(NoRoots)).unwrap();
    {
        let mut outer = NoGcScope::new(&mut heap, "loading a module");
        let record = outer.alloc(3, AllocOpts::Meta);
        {
            let mut inner = outer.nested("building a type descriptor");
            let descriptor = inner.alloc_bytes(24, AllocOpts::Normal);
            inner.set_meta_info(record, descriptor.as_ptr());
            assert_eq!(inner.heap().no_gc_depth(), 2);
            assert_eq!(inner.context(), "building a type descriptor");
        }
        assert_eq!(outer.heap().no_gc_depth(), 1);
        assert!(!outer.heap().meta_info(record).is_null());
    }
    assert_eq!(heap.no_gc_depth(), 0);
    assert!(heap.maybe_collect(None));
}

/// Runs only in the child process started by
/// `test_out_of_memory_in_scope_aborts`.
#[test]
#[ignore = "run as a child process"]
fn child_exhausts_fit_chunk_inside_scope() {
    if env::var_os(CHILD_ENV).is_none() {
        return;
    }
    let mut heap = Heap::new(
        Options::new().fit_chunk_bytes(64 * 1024),
        Rc::new(NoRoots),
    )
    .unwrap();
    let mut scope = NoGcScope::new(&mut heap, "filling the heap");
    for _ in 0..1000 {
        scope.alloc(1000, AllocOpts::Normal);
    }
    // Unreachable: the loop above must abort.
    std::process::exit(0);
}

#[test]
fn test_out_of_memory_in_scope_aborts() {
    let exe = env::current_exe().unwrap();
    let output = Command::new(exe)
        .args([
            "--exact",
            "child_exhausts_fit_chunk_inside_scope",
            "--ignored",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CHILD_ENV, "1")
        .output()
        .unwrap();

    assert!(
        !output.status.success(),
        "child exited cleanly: {}",
        String::from_utf8_lossy(&output.stdout)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("while filling the heap"),
        "unexpected stderr: {stderr}"
    );
}
