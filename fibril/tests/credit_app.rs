//! End-to-end CREDIT run: CPU-burning u-threads with mixed allotments
//! are preempted by the virtual timer, cycle through UNDER/OVER, and
//! all complete.

use std::hint::black_box;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use fibril::{app_exit, app_init, live_uthreads, ticks, uthread_create, SchedPolicy};

static FINISHED: AtomicUsize = AtomicUsize::new(0);

fn spin(_arg: *mut u8) {
    // Burn enough CPU to see several timer ticks while running.
    let mut acc = 0u64;
    for i in 0..40_000_000u64 {
        acc = acc.wrapping_add(black_box(i));
    }
    black_box(acc);
    FINISHED.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn credit_run_completes_under_preemption() {
    app_init(SchedPolicy::Credit);

    for i in 0..8u32 {
        let credits = 25 * (1 + (i % 4) as i32);
        uthread_create(spin, ptr::null_mut(), 0, credits);
    }

    app_exit();

    assert_eq!(FINISHED.load(Ordering::SeqCst), 8);
    assert_eq!(live_uthreads(), 0);
    // The run burned hundreds of milliseconds of CPU; the virtual
    // timer must have fired.
    assert!(ticks() >= 1);
}
