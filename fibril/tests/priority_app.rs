//! End-to-end PRIORITY run: u-threads across several groups, including
//! voluntarily yielding ones, all complete, the library drains, and a
//! counting allocator confirms every u-thread object and stack was
//! returned.

use std::alloc::{GlobalAlloc, Layout, System};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use fibril::{
    app_exit, app_init, live_uthreads, total_uthreads, uthread_create, uthread_yield,
    SchedPolicy,
};

/// Byte-counting allocator. `allocated - freed` gives the live heap at
/// any instant; if u-thread stacks (128 KiB each) leaked, the delta
/// across the run would show megabytes.
struct CountingAlloc;

static ALLOCATED: AtomicUsize = AtomicUsize::new(0);
static FREED: AtomicUsize = AtomicUsize::new(0);

unsafe impl GlobalAlloc for CountingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let p = System.alloc(layout);
        if !p.is_null() {
            ALLOCATED.fetch_add(layout.size(), Ordering::SeqCst);
        }
        p
    }

    unsafe fn dealloc(&self, p: *mut u8, layout: Layout) {
        FREED.fetch_add(layout.size(), Ordering::SeqCst);
        System.dealloc(p, layout);
    }
}

#[global_allocator]
static ALLOC: CountingAlloc = CountingAlloc;

fn live_heap_bytes() -> isize {
    ALLOCATED.load(Ordering::SeqCst) as isize - FREED.load(Ordering::SeqCst) as isize
}

static FINISHED: AtomicUsize = AtomicUsize::new(0);

fn quick(_arg: *mut u8) {
    FINISHED.fetch_add(1, Ordering::SeqCst);
}

fn yielding(_arg: *mut u8) {
    for _ in 0..3 {
        uthread_yield();
    }
    FINISHED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn priority_run_completes_and_drains() {
    app_init(SchedPolicy::Priority);

    // Everything allocated from here on — 16 u-thread objects and
    // their stacks, about 2 MiB — must be gone again after the drain.
    let heap_before = live_heap_bytes();

    let mut tids = Vec::new();
    for i in 0..12u32 {
        tids.push(uthread_create(quick, ptr::null_mut(), i % 4, 0));
    }
    for _ in 0..4 {
        tids.push(uthread_create(yielding, ptr::null_mut(), 0, 0));
    }

    app_exit();

    assert_eq!(FINISHED.load(Ordering::SeqCst), 16);
    assert_eq!(total_uthreads(), 16);
    assert_eq!(live_uthreads(), 0);

    let mut unique = tids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), tids.len(), "u-thread ids must be unique");

    // `app_exit` also releases the worker join handles and their
    // thread-runtime allocations from `app_init`, so the delta can go
    // negative; anything persistently positive beyond the `tids`
    // bookkeeping above is a leak.
    let growth = live_heap_bytes() - heap_before;
    assert!(
        growth < 16 * 1024,
        "heap grew by {} bytes across the run; u-thread stacks leaked",
        growth
    );
}
