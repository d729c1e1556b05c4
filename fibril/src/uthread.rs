//! U-threads
//!
//! A u-thread is the unit of execution: a dedicated stack, a saved
//! context, an entry function, and scheduling state (group, credit
//! class, credit balance). U-threads are created by [`uthread_create`],
//! placed on some k-thread's runqueue, dispatched by that k-thread
//! until their entry function returns, and freed by the hosting
//! k-thread afterwards. A dispatched u-thread never migrates.
//!
//! The first dispatch of a u-thread "returns" into
//! [`uthread_trampoline`] on the u-thread's own stack (the initial
//! context is synthesized by `arch::prime_stack`). The trampoline runs
//! the entry function and, when it returns, parks the u-thread on its
//! k-thread's zombie list and re-enters the k-thread's scheduler loop
//! through the saved anchor context. The u-thread's stack is dead from
//! that jump on; the scheduler loop frees it from ordinary context.

use core::ptr;

use log::debug;

use crate::arch;
use crate::constants::{MAX_GROUPS, UTHREAD_DEFAULT_CREDITS, UTHREAD_STACK_SIZE};
use crate::kthread::{self, KthreadContext};
use crate::list::ListEntry;
use crate::runqueue::CreditClass;
use crate::sched;
use crate::signal;

/// U-thread entry point. The argument pointer is carried through
/// verbatim; the application owns whatever it points at.
pub type UthreadFunc = fn(*mut u8);

/// U-thread life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UthreadState {
    /// Allocated, not yet placed on a runqueue.
    Init,
    /// Sitting in exactly one runqueue bucket.
    Runnable,
    /// Executing on its k-thread's CPU.
    Running,
    /// Entry function returned; awaiting reclamation.
    Done,
    /// Abandoned before completion.
    Cancelled,
}

/// The u-thread object. Owned by a `Box` whose raw pointer travels
/// from the creator, through one runqueue, to the hosting k-thread,
/// which frees it after completion.
pub struct Uthread {
    /// Saved execution context (stack pointer into `stack`).
    pub ctx: arch::Context,
    pub state: UthreadState,
    /// Priority class; mirrors the sign of `credits` under CREDIT.
    pub class: CreditClass,
    /// Remaining credit balance. Untouched under PRIORITY.
    pub credits: i32,
    /// Allotment restored by replenishment.
    pub credits_total: i32,
    pub tid: u32,
    pub gid: u32,
    /// Home CPU chosen at placement.
    pub cpu_id: i32,
    /// CPU of the most recent dispatch.
    pub last_cpu_id: i32,
    pub entry: UthreadFunc,
    pub arg: *mut u8,
    /// Accumulated execution time, monotonic nanoseconds.
    pub run_ns: u64,
    /// Times this u-thread has been switched in.
    pub dispatches: u32,
    /// Link in a runqueue bucket while RUNNABLE, or in the zombie list
    /// once DONE.
    pub runq_link: ListEntry,
    /// Owned stack region; kept alive for as long as the u-thread is.
    _stack: Box<[u8]>,
}

/// Allocate and prime a u-thread object. The allocator lock serializes
/// this against frees happening on other k-threads.
pub(crate) fn alloc_raw(
    entry: UthreadFunc,
    arg: *mut u8,
    gid: u32,
    credits: i32,
) -> *mut Uthread {
    let _alloc = sched::alloc_lock();

    let mut stack = vec![0u8; UTHREAD_STACK_SIZE].into_boxed_slice();
    let ctx = unsafe { arch::prime_stack(stack.as_mut_ptr(), stack.len(), uthread_trampoline) };
    let credits_total = if credits > 0 {
        credits
    } else {
        UTHREAD_DEFAULT_CREDITS
    };

    Box::into_raw(Box::new(Uthread {
        ctx,
        state: UthreadState::Init,
        class: CreditClass::Under,
        credits: credits_total,
        credits_total,
        tid: sched::next_tid(),
        gid,
        cpu_id: -1,
        last_cpu_id: -1,
        entry,
        arg,
        run_ns: 0,
        dispatches: 0,
        runq_link: ListEntry::new(),
        _stack: stack,
    }))
}

/// Create a u-thread and enqueue it on the k-thread chosen by the
/// placement cursor for its group. Returns once the u-thread is
/// runnable; it may already be executing on another CPU by then.
///
/// `credits` is the CREDIT-policy allotment; non-positive values (and
/// the PRIORITY policy) fall back to the default. Placement failure —
/// no live k-thread, which cannot happen between `app_init` and
/// `app_exit` — is fatal.
///
/// # Panics
/// If `group_id` is out of range or no live k-thread exists.
pub fn uthread_create(entry: UthreadFunc, arg: *mut u8, group_id: u32, credits: i32) -> u32 {
    assert!(
        (group_id as usize) < MAX_GROUPS,
        "u-thread group id {} out of range (max {})",
        group_id,
        MAX_GROUPS
    );

    // Masks both scheduling signals for the whole creation and
    // serializes creation against the teardown check.
    let _init = sched::init_lock();

    let u = alloc_raw(entry, arg, group_id, credits);
    unsafe {
        let k = sched::find_target(u);
        let tid = (*u).tid;
        let cpu = (*u).cpu_id;

        (*u).state = UthreadState::Runnable;
        let rq = &mut (*k).runq;
        rq.lock.acquire();
        rq.active().enqueue(u);
        rq.lock.release();
        // `u` may be dispatched (and even freed) by its k-thread from
        // here on; only the copies taken above may be used.
        sched::note_uthread_created();

        debug!("uthread {} (group {}) placed on cpu {}", tid, group_id, cpu);
        tid
    }
}

/// Voluntarily give up the CPU: re-insert the calling u-thread
/// according to policy and dispatch the best candidate. A no-op when
/// the caller is not a dispatched u-thread. Must not be called while
/// holding a fibril lock.
pub fn uthread_yield() {
    unsafe {
        let k = kthread::current_kthread();
        if k.is_null()
            || (*k).tid != signal::gettid()
            || (*k).cur_uthread.is_null()
        {
            return;
        }
        sched::uthread_schedule(k, sched::pick_for(sched::policy()));
    }
}

/// CPU time accumulated by the calling u-thread, monotonic nanoseconds,
/// including the slice currently running. Returns `None` when the
/// caller is not a dispatched u-thread.
///
/// The bookkeeping pair (accumulated total, dispatch timestamp) is
/// read with the scheduling signals masked so a preemption cannot
/// slide between the two reads.
pub fn uthread_runtime_ns() -> Option<u64> {
    unsafe {
        let k = kthread::current_kthread();
        if k.is_null() || (*k).tid != signal::gettid() {
            return None;
        }

        let was_blocked = signal::block_sched_signals();
        let u = (*k).cur_uthread;
        let total = if u.is_null() {
            None
        } else {
            Some((*u).run_ns + signal::monotonic_ns().saturating_sub((*k).dispatch_ns))
        };
        signal::restore_sched_signals(was_blocked);
        total
    }
}

/// First frame on every u-thread stack. Entered via the primed context
/// with the scheduling signals still masked from the dispatching
/// switch.
pub(crate) extern "C" fn uthread_trampoline() {
    unsafe {
        let k = kthread::current_kthread();
        debug_assert!(!k.is_null());
        let u = (*k).cur_uthread;
        debug_assert!(!u.is_null());

        signal::unblock_sched_signals();
        ((*u).entry)((*u).arg);

        uthread_finish(k)
    }
}

/// Retire the current u-thread and jump back to the k-thread's
/// scheduler loop. The u-thread's stack is not used past the jump.
unsafe fn uthread_finish(k: *mut KthreadContext) -> ! {
    signal::block_sched_signals();

    let u = (*k).cur_uthread;
    (*u).run_ns += signal::monotonic_ns().saturating_sub((*k).dispatch_ns);
    (*u).state = UthreadState::Done;
    (*k).cur_uthread = ptr::null_mut();
    (*k).zombies.insert_tail(&mut (*u).runq_link);

    sched::note_uthread_done();

    arch::load_context(&(*k).sched_ctx)
}

/// Trivial entry used by data-structure tests.
#[cfg(test)]
pub(crate) fn noop_entry(_arg: *mut u8) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_primes_a_fresh_uthread() {
        let u = alloc_raw(noop_entry, ptr::null_mut(), 3, 40);
        unsafe {
            assert_eq!((*u).state, UthreadState::Init);
            assert_eq!((*u).class, CreditClass::Under);
            assert_eq!((*u).gid, 3);
            assert_eq!((*u).credits, 40);
            assert_eq!((*u).credits_total, 40);
            assert_eq!((*u).cpu_id, -1);
            assert_eq!((*u).dispatches, 0);
            drop(Box::from_raw(u));
        }
    }

    #[test]
    fn default_credits_replace_non_positive_allotments() {
        let u = alloc_raw(noop_entry, ptr::null_mut(), 0, 0);
        unsafe {
            assert_eq!((*u).credits, UTHREAD_DEFAULT_CREDITS);
            assert_eq!((*u).credits_total, UTHREAD_DEFAULT_CREDITS);
            drop(Box::from_raw(u));
        }
    }

    #[test]
    fn tids_are_unique() {
        let a = alloc_raw(noop_entry, ptr::null_mut(), 0, 0);
        let b = alloc_raw(noop_entry, ptr::null_mut(), 0, 0);
        unsafe {
            assert_ne!((*a).tid, (*b).tid);
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn yield_outside_a_uthread_is_a_noop() {
        uthread_yield();
    }

    #[test]
    fn runtime_outside_a_uthread_is_none() {
        assert_eq!(uthread_runtime_ns(), None);
    }
}
