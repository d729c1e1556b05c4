//! Scheduling core
//!
//! Shared scheduler state, u-thread placement, the two policies, the
//! `uthread_schedule` dispatch path, credit replenishment, and the two
//! signal handlers that drive preemption.
//!
//! # Preemption protocol
//!
//! Exactly one k-thread receives `SIGVTALRM` per tick — whichever one
//! the kernel delivers the virtual timer to — and acts as master:
//!
//! 1. under CREDIT, every [`CREDIT_REPLENISH_TICKS`]th tick replenishes
//!    every expired u-thread on every k-thread's runqueue;
//! 2. it relays `SIGUSR1` to every other live k-thread via a directed
//!    `tkill`;
//! 3. it performs its own pick.
//!
//! Peers do step 3 when the relay lands. Handler bodies run with both
//! signals unblocked (`SA_NODEFER`); every runqueue critical section
//! masks them locally instead.
//!
//! # Dispatch
//!
//! [`uthread_schedule`] is the single dispatch path, entered from a
//! handler (on the interrupted u-thread's stack), from the scheduler
//! loop (eager PRIORITY pick), or from `uthread_yield`. Under the
//! runqueue lock it re-inserts the preempted u-thread according to
//! policy, picks the best candidate, and context-switches into it. The
//! signals stay masked from before the lock until the switched-to side
//! unmasks them, so pick and switch are atomic with respect to the
//! local handlers.

use core::ptr;
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use libc::c_int;

use crate::arch;
use crate::constants::{
    CREDIT_REPLENISH_TICKS, CREDIT_TICK_COST, MAX_CORES, MAX_GROUPS,
};
use crate::kthread::{self, KthreadContext, KthreadFlags};
use crate::runqueue::{CreditClass, Runqueue};
use crate::signal;
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::uthread::{Uthread, UthreadState};

/// Scheduling policy selected at `app_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedPolicy {
    /// Static priority: group id is the priority bias, lower id first.
    Priority,
    /// Proportional share with UNDER/OVER credit states.
    Credit,
}

/// Per-group placement cursor: the last k-thread CPU that received a
/// u-thread of each group.
struct Placement {
    last_kthread: [u32; MAX_GROUPS],
}

/// Process-wide scheduler info.
struct KschedShared {
    /// Active policy, 1 + `SchedPolicy` discriminant; 0 before init.
    policy: AtomicU8,
    /// Scheduler lock: guards the placement cursors.
    placement: spin::Mutex<Placement>,
    /// Serializes u-thread creation against the teardown check.
    uthread_init_lock: SpinLock<()>,
    /// Serializes u-thread allocation and free across k-threads.
    alloc_lock: SpinLock<()>,
    total_uthreads: AtomicU64,
    cur_uthreads: AtomicU64,
    next_tid: AtomicU32,
    ticks: AtomicU64,
}

static KSCHED: KschedShared = KschedShared {
    policy: AtomicU8::new(0),
    placement: spin::Mutex::new(Placement {
        last_kthread: [0; MAX_GROUPS],
    }),
    uthread_init_lock: SpinLock::new(()),
    alloc_lock: SpinLock::new(()),
    total_uthreads: AtomicU64::new(0),
    cur_uthreads: AtomicU64::new(0),
    next_tid: AtomicU32::new(1),
    ticks: AtomicU64::new(0),
};

pub(crate) fn init_shared(policy: SchedPolicy) {
    KSCHED.policy.store(policy as u8 + 1, Ordering::SeqCst);
}

/// The active policy. Defaults to PRIORITY before `app_init`.
pub(crate) fn policy() -> SchedPolicy {
    match KSCHED.policy.load(Ordering::Relaxed) {
        2 => SchedPolicy::Credit,
        _ => SchedPolicy::Priority,
    }
}

pub(crate) fn init_lock() -> SpinLockGuard<'static, ()> {
    KSCHED.uthread_init_lock.lock()
}

pub(crate) fn alloc_lock() -> SpinLockGuard<'static, ()> {
    KSCHED.alloc_lock.lock()
}

pub(crate) fn next_tid() -> u32 {
    KSCHED.next_tid.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn note_uthread_created() {
    KSCHED.total_uthreads.fetch_add(1, Ordering::SeqCst);
    KSCHED.cur_uthreads.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn note_uthread_done() {
    KSCHED.cur_uthreads.fetch_sub(1, Ordering::SeqCst);
}

/// U-threads created since `app_init`.
pub fn total_uthreads() -> u64 {
    KSCHED.total_uthreads.load(Ordering::SeqCst)
}

/// U-threads created and not yet completed.
pub fn live_uthreads() -> u64 {
    KSCHED.cur_uthreads.load(Ordering::SeqCst)
}

/// Timer ticks observed since `app_init`.
pub fn ticks() -> u64 {
    KSCHED.ticks.load(Ordering::Relaxed)
}

/// A k-thread's work is over once at least one u-thread was created and
/// none remain.
pub(crate) fn all_uthreads_done() -> bool {
    total_uthreads() > 0 && live_uthreads() == 0
}

/// Pick the k-thread to host a new u-thread: round-robin over live
/// k-threads, biased by the per-group cursor. Stores the chosen CPU
/// into the u-thread.
///
/// # Panics
/// When no k-thread is live. Between `app_init` and `app_exit` this
/// cannot happen — init blocks until every k-thread has published
/// itself — so it is treated as fatal.
///
/// # Safety
/// `u` must be valid and not yet enqueued.
pub(crate) unsafe fn find_target(u: *mut Uthread) -> *mut KthreadContext {
    let gid = (*u).gid as usize;

    let mut placement = KSCHED.placement.lock();
    let mut target = placement.last_kthread[gid] as usize;
    let mut k = ptr::null_mut();
    for _ in 0..MAX_CORES {
        target = (target + 1) % MAX_CORES;
        let cand = kthread::kthread_at_cpu(target);
        if !cand.is_null() {
            k = cand;
            break;
        }
    }
    assert!(!k.is_null(), "no live k-thread to place a u-thread on");
    placement.last_kthread[gid] = target as u32;
    drop(placement);

    (*u).cpu_id = (*k).cpuid as i32;
    (*u).last_cpu_id = (*k).cpuid as i32;
    k
}

/// Candidate selection given a runqueue. Runs under the runqueue lock.
pub(crate) type PickFn = unsafe fn(&mut Runqueue) -> *mut Uthread;

/// PRIORITY pick: best (class, lowest group) from the active array.
/// PRIORITY keeps everything UNDER and never populates `expired`.
pub(crate) unsafe fn priority_pick(rq: &mut Runqueue) -> *mut Uthread {
    debug_assert!(rq.expired().is_empty());
    rq.active().pick_best()
}

/// CREDIT pick: best from active UNDER, else active OVER; when the
/// active array is drained, exchange it with the expired array and
/// retry once.
pub(crate) unsafe fn credit_pick(rq: &mut Runqueue) -> *mut Uthread {
    let u = rq.active().pick_best();
    if !u.is_null() {
        return u;
    }
    if !rq.expired().is_empty() {
        rq.swap_active_expired();
        return rq.active().pick_best();
    }
    ptr::null_mut()
}

pub(crate) fn pick_for(policy: SchedPolicy) -> PickFn {
    match policy {
        SchedPolicy::Priority => priority_pick,
        SchedPolicy::Credit => credit_pick,
    }
}

/// Re-insert a preempted, still-runnable u-thread. Under CREDIT this is
/// where the tick cost is charged: the balance drops, and a u-thread
/// that reaches zero or below turns OVER and lands in the expired
/// array; otherwise it goes to the tail of its active bucket.
///
/// # Safety
/// Runqueue lock held; `u` RUNNING on the calling k-thread.
pub(crate) unsafe fn requeue_preempted(rq: &mut Runqueue, u: *mut Uthread, policy: SchedPolicy) {
    if policy == SchedPolicy::Credit {
        (*u).credits -= CREDIT_TICK_COST;
        (*u).class = if (*u).credits > 0 {
            CreditClass::Under
        } else {
            CreditClass::Over
        };
    }

    debug_assert_eq!((*u).state, UthreadState::Running);
    (*u).state = UthreadState::Runnable;
    match (*u).class {
        CreditClass::Under => rq.active().enqueue(u),
        CreditClass::Over => rq.expired().enqueue(u),
    }
}

/// The dispatch path.
///
/// With the scheduling signals masked and the runqueue lock held:
/// re-insert the previously RUNNING u-thread (if any), pick the best
/// candidate, and context-switch into it. With no previous u-thread the
/// switch saves the scheduler-loop anchor, which a finishing u-thread
/// re-enters. With nothing to pick (only possible from the scheduler
/// stack — a re-inserted u-thread is always found again) it simply
/// returns to the spinning loop.
///
/// # Safety
/// `k` must be the live k-thread context of the calling thread.
pub(crate) unsafe fn uthread_schedule(k: *mut KthreadContext, pick: PickFn) {
    signal::block_sched_signals();

    let policy = (*k).policy;
    let rq = &mut (*k).runq;
    rq.lock.acquire();

    let prev = (*k).cur_uthread;
    if !prev.is_null() {
        (*prev).run_ns += signal::monotonic_ns().saturating_sub((*k).dispatch_ns);
        requeue_preempted(rq, prev, policy);
        (*k).cur_uthread = ptr::null_mut();
    }

    let next = pick(rq);
    if next.is_null() {
        debug_assert!(prev.is_null());
        rq.lock.release();
        signal::unblock_sched_signals();
        return;
    }

    (*next).state = UthreadState::Running;
    (*next).last_cpu_id = (*k).cpuid as i32;
    (*next).dispatches += 1;
    (*k).cur_uthread = next;
    (*k).dispatch_ns = signal::monotonic_ns();
    (*k).context_switches += 1;
    rq.lock.release();

    if next == prev {
        // Preempted and immediately re-elected; keep running.
        signal::unblock_sched_signals();
        return;
    }

    if prev.is_null() {
        arch::switch_context(&mut (*k).sched_ctx, &(*next).ctx);
    } else {
        arch::switch_context(&mut (*prev).ctx, &(*next).ctx);
    }

    // Resumed: either `prev` was dispatched again, or a finished
    // u-thread re-entered the scheduler anchor.
    signal::unblock_sched_signals();
}

/// Give every OVER u-thread in `rq`'s expired array a fresh allotment,
/// reclassify it UNDER, and move it back to the active array. Returns
/// the number of u-threads moved.
///
/// # Safety
/// Runqueue lock held.
pub(crate) unsafe fn replenish_runqueue(rq: &mut Runqueue) -> u32 {
    let mut moved = 0;
    loop {
        let u = rq.expired().pick_best_in_class(CreditClass::Over);
        if u.is_null() {
            break;
        }
        (*u).credits = (*u).credits_total;
        (*u).class = CreditClass::Under;
        rq.active().enqueue(u);
        moved += 1;
    }
    // Nothing UNDER ever lands in an expired array.
    debug_assert!(rq.expired().is_empty());
    moved
}

/// Replenish across all live k-threads' runqueues. Takes one runqueue
/// lock at a time, never two, so no lock-order cycle with the peers'
/// own dispatch paths exists.
unsafe fn replenish_all() {
    for cpu in 0..MAX_CORES {
        let k = kthread::kthread_at_cpu(cpu);
        if k.is_null() {
            continue;
        }
        let was_blocked = signal::block_sched_signals();
        let rq = &mut (*k).runq;
        rq.lock.acquire();
        replenish_runqueue(rq);
        rq.lock.release();
        signal::restore_sched_signals(was_blocked);
    }
}

/// `SIGVTALRM` handler: the master tick.
pub(crate) extern "C" fn master_tick(_signo: c_int) {
    unsafe {
        let tick = KSCHED.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        let policy = policy();

        if policy == SchedPolicy::Credit && tick % CREDIT_REPLENISH_TICKS == 0 {
            replenish_all();
        }

        // Relay to every other live k-thread before the local pick; a
        // master that masked itself first could stall its peers.
        let my_tid = signal::gettid();
        for cpu in 0..MAX_CORES {
            let k = kthread::kthread_at_cpu(cpu);
            if k.is_null() || (*k).tid == my_tid {
                continue;
            }
            if (*k).flags().contains(KthreadFlags::DONE) {
                continue;
            }
            signal::direct_signal((*k).tid, libc::SIGUSR1);
        }

        // The virtual timer is process-directed, so the kernel may hand
        // the tick to a host thread that is not a k-thread; such a
        // thread relays (above) but never dispatches.
        let me = kthread::current_kthread();
        if !me.is_null() && (*me).tid == my_tid {
            schedule_on(me, policy);
        }
    }
}

/// `SIGUSR1` handler: a relayed reschedule request on a peer.
pub(crate) extern "C" fn relay_tick(_signo: c_int) {
    unsafe {
        let me = kthread::current_kthread();
        if me.is_null() || (*me).tid != signal::gettid() {
            return;
        }
        schedule_on(me, policy());
    }
}

/// Dispatch on `k` if it can accept one: either a u-thread is current
/// (preempt it) or the scheduler-loop anchor is armed (dispatch from
/// the loop's stack). Outside both — e.g. CPU 0 between `app_init` and
/// `app_exit` — the tick is ignored.
unsafe fn schedule_on(k: *mut KthreadContext, policy: SchedPolicy) {
    if (*k).cur_uthread.is_null() && !(*k).anchor_armed.load(Ordering::Relaxed) {
        return;
    }
    uthread_schedule(k, pick_for(policy));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::UTHREAD_DEFAULT_CREDITS;
    use crate::uthread;

    fn boxed_runqueue() -> Box<Runqueue> {
        let mut rq = Box::new(Runqueue::new());
        rq.init();
        rq
    }

    fn running_uthread(gid: u32, credits: i32) -> *mut Uthread {
        let u = uthread::alloc_raw(uthread::noop_entry, ptr::null_mut(), gid, credits);
        unsafe {
            (*u).state = UthreadState::Running;
        }
        u
    }

    unsafe fn free_all(us: &[*mut Uthread]) {
        for &u in us {
            drop(Box::from_raw(u));
        }
    }

    #[test]
    fn priority_requeue_leaves_credits_alone() {
        let mut rq = boxed_runqueue();
        let u = running_uthread(2, 0);
        unsafe {
            requeue_preempted(&mut rq, u, SchedPolicy::Priority);
            assert_eq!((*u).credits, UTHREAD_DEFAULT_CREDITS);
            assert_eq!((*u).class, CreditClass::Under);
            assert_eq!((*u).state, UthreadState::Runnable);
            assert_eq!(rq.active().len(), 1);
            assert!(rq.expired().is_empty());
            assert_eq!(rq.active().pick_best(), u);
            free_all(&[u]);
        }
    }

    #[test]
    fn credit_requeue_charges_the_tick_cost() {
        let mut rq = boxed_runqueue();
        let u = running_uthread(0, CREDIT_TICK_COST * 2);
        unsafe {
            requeue_preempted(&mut rq, u, SchedPolicy::Credit);
            assert_eq!((*u).credits, CREDIT_TICK_COST);
            assert_eq!((*u).class, CreditClass::Under);
            assert_eq!(rq.active().len(), 1);

            // Second preemption exhausts the balance: UNDER -> OVER,
            // expired array.
            rq.active().dequeue(u);
            (*u).state = UthreadState::Running;
            requeue_preempted(&mut rq, u, SchedPolicy::Credit);
            assert_eq!((*u).credits, 0);
            assert_eq!((*u).class, CreditClass::Over);
            assert!(rq.active().is_empty());
            assert_eq!(rq.expired().len(), 1);
            free_all(&[u]);
        }
    }

    #[test]
    fn credit_pick_swaps_into_the_expired_array() {
        let mut rq = boxed_runqueue();
        let u = running_uthread(0, CREDIT_TICK_COST);
        unsafe {
            // One preemption drives it OVER, into expired.
            requeue_preempted(&mut rq, u, SchedPolicy::Credit);
            assert_eq!((*u).class, CreditClass::Over);
            assert!(rq.active().is_empty());

            // Pick must swap and still find it.
            let picked = credit_pick(&mut rq);
            assert_eq!(picked, u);
            assert!(rq.active().is_empty());
            assert!(rq.expired().is_empty());
            free_all(&[u]);
        }
    }

    #[test]
    fn credit_pick_prefers_under_over_over() {
        let mut rq = boxed_runqueue();
        let over = running_uthread(0, CREDIT_TICK_COST);
        let under = running_uthread(1, CREDIT_TICK_COST * 4);
        unsafe {
            requeue_preempted(&mut rq, over, SchedPolicy::Credit);
            requeue_preempted(&mut rq, under, SchedPolicy::Credit);
            // `over` expired; `under` stayed active. Active UNDER wins.
            assert_eq!(credit_pick(&mut rq), under);
            assert_eq!(credit_pick(&mut rq), over);
            free_all(&[over, under]);
        }
    }

    #[test]
    fn replenishment_restores_each_allotment() {
        let mut rq = boxed_runqueue();
        let small = running_uthread(0, CREDIT_TICK_COST);
        let large = running_uthread(0, CREDIT_TICK_COST * 8);
        unsafe {
            // One preemption exhausts the small allotment.
            requeue_preempted(&mut rq, small, SchedPolicy::Credit);
            assert_eq!((*small).class, CreditClass::Over);

            // The large one needs eight preemption cycles; it stays the
            // only active UNDER u-thread until then.
            for _ in 0..8 {
                requeue_preempted(&mut rq, large, SchedPolicy::Credit);
                if (*large).class == CreditClass::Over {
                    break;
                }
                let picked = credit_pick(&mut rq);
                assert_eq!(picked, large);
                (*picked).state = UthreadState::Running;
            }
            assert_eq!((*large).class, CreditClass::Over);
            assert_eq!(rq.expired().len(), 2);

            let moved = replenish_runqueue(&mut rq);
            assert_eq!(moved, 2);
            assert!(rq.expired().is_empty());
            assert_eq!(rq.active().len(), 2);
            assert_eq!((*small).credits, CREDIT_TICK_COST);
            assert_eq!((*large).credits, CREDIT_TICK_COST * 8);
            assert_eq!((*small).class, CreditClass::Under);
            assert_eq!((*large).class, CreditClass::Under);
            free_all(&[small, large]);
        }
    }

    #[test]
    fn exhaustion_cycle_dispatches_between_replenishments() {
        // UNDER -> OVER -> replenished -> UNDER again, picked each time.
        let mut rq = boxed_runqueue();
        let u = running_uthread(0, CREDIT_TICK_COST);
        unsafe {
            let mut dispatches = 0;
            for _ in 0..3 {
                requeue_preempted(&mut rq, u, SchedPolicy::Credit);
                assert_eq!((*u).class, CreditClass::Over);
                replenish_runqueue(&mut rq);
                assert_eq!((*u).class, CreditClass::Under);
                let picked = credit_pick(&mut rq);
                assert_eq!(picked, u);
                dispatches += 1;
                (*picked).state = UthreadState::Running;
            }
            assert!(dispatches >= 3);
            free_all(&[u]);
        }
    }

    #[test]
    fn placement_round_robins_within_a_group() {
        // Two fabricated live k-threads on cpus 0 and 1; consecutive
        // placements of one group must alternate between them.
        let k0 = Box::into_raw(Box::new(KthreadContext::new(0, 0, SchedPolicy::Priority)));
        let k1 = Box::into_raw(Box::new(KthreadContext::new(1, 1, SchedPolicy::Priority)));
        kthread::test_register_kthread(0, k0);
        kthread::test_register_kthread(1, k1);

        let gid = 7;
        let u = uthread::alloc_raw(uthread::noop_entry, ptr::null_mut(), gid, 0);
        unsafe {
            let mut cpus = Vec::new();
            for _ in 0..6 {
                let k = find_target(u);
                cpus.push((*k).cpuid);
                assert_eq!((*u).cpu_id, (*k).cpuid as i32);
            }
            assert_eq!(cpus, vec![1, 0, 1, 0, 1, 0]);

            kthread::test_register_kthread(0, ptr::null_mut());
            kthread::test_register_kthread(1, ptr::null_mut());
            free_all(&[u]);
            drop(Box::from_raw(k0));
            drop(Box::from_raw(k1));
        }
    }
}
