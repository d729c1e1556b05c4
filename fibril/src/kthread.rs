//! K-threads and the application lifecycle
//!
//! A k-thread is an OS thread hard-pinned to one logical CPU, owning
//! that CPU's runqueue and running the scheduler loop. CPU 0's k-thread
//! is the thread that calls [`app_init`]; the rest are spawned, one per
//! remaining CPU. Right after start a k-thread records its kernel
//! thread id, pins itself, yields so the kernel actually moves it, then
//! reads the APIC id of the CPU it landed on and publishes itself in
//! the CPU maps. `app_init` blocks until every k-thread has published.
//!
//! The scheduler loop spins on a pause hint until its k-thread is
//! released: workers run until `app_exit` has observed a fully drained
//! u-thread population and requested shutdown, CPU 0 until the drain
//! itself. Each pass reaps u-threads retired onto the zombie list and,
//! under PRIORITY, eagerly dispatches. Under CREDIT the loop never
//! picks on its own — every dispatch is driven by the timer master or
//! a relayed `SIGUSR1`. Re-entry into the loop from a finishing
//! u-thread goes through the per-k-thread anchor context saved by the
//! dispatching switch.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::io;
use std::thread::{self, JoinHandle};

use log::{debug, info};

use crate::arch;
use crate::constants::{KTHREAD_STACK_SIZE, MAX_CORES, MAX_KTHREADS, TIMESLICE_USEC};
use crate::containing_record;
use crate::list::ListEntry;
use crate::runqueue::Runqueue;
use crate::sched::{self, SchedPolicy};
use crate::signal;
use crate::uthread::{Uthread, UthreadState};

bitflags::bitflags! {
    /// K-thread state bits, polled across threads.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct KthreadFlags: u32 {
        /// Scheduler loop exited; nothing left to run here.
        const DONE = 1 << 0;
    }
}

/// Per-k-thread context. Allocated at init, published in the CPU maps,
/// and alive until process exit.
pub struct KthreadContext {
    /// Logical CPU slot (0..n); index into the per-CPU map, placement
    /// target, and the id u-threads see.
    pub cpuid: u32,
    /// OS CPU this k-thread pins to — the `cpuid`-th entry of the
    /// process affinity mask, which differs from `cpuid` on
    /// cpuset-restricted hosts.
    pub os_cpu: u32,
    pub pid: libc::pid_t,
    /// Kernel thread id; target of directed relay signals.
    pub tid: libc::pid_t,
    /// APIC id of the pinned CPU; key into the CPU map.
    pub apic_id: u32,
    pub policy: SchedPolicy,
    flags: AtomicU32,
    /// The runqueue this k-thread owns.
    pub runq: Runqueue,
    /// Master-tick handler, installed for `SIGVTALRM`.
    pub sched_timer: signal::HandlerFn,
    /// Relay handler, installed for `SIGUSR1`.
    pub sched_relay: signal::HandlerFn,
    /// Scheduler-loop anchor: the context a finishing u-thread loads to
    /// get back onto this k-thread's own stack.
    pub sched_ctx: arch::Context,
    /// True while this k-thread is inside a scheduler loop, i.e. while
    /// `sched_ctx` may be saved to and re-entered.
    pub anchor_armed: AtomicBool,
    /// U-thread currently RUNNING on this CPU, or null.
    pub cur_uthread: *mut Uthread,
    /// Monotonic timestamp of the latest dispatch.
    pub dispatch_ns: u64,
    pub context_switches: u64,
    /// Retired u-threads awaiting reclamation by the loop.
    pub zombies: ListEntry,
}

impl KthreadContext {
    pub(crate) fn new(cpuid: u32, os_cpu: u32, policy: SchedPolicy) -> Self {
        Self {
            cpuid,
            os_cpu,
            pid: 0,
            tid: 0,
            apic_id: 0,
            policy,
            flags: AtomicU32::new(0),
            runq: Runqueue::new(),
            sched_timer: sched::master_tick,
            sched_relay: sched::relay_tick,
            sched_ctx: arch::Context::new(),
            anchor_armed: AtomicBool::new(false),
            cur_uthread: ptr::null_mut(),
            dispatch_ns: 0,
            context_switches: 0,
            zombies: ListEntry::new(),
        }
    }

    pub fn flags(&self) -> KthreadFlags {
        KthreadFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flags(&self, flags: KthreadFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::Release);
    }

    pub fn clear_flags(&self, flags: KthreadFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::Release);
    }
}

/// APIC id -> k-thread context. Sparse; signal handlers key into it
/// with the APIC id of the CPU they were delivered on.
static CPU_MAP: [AtomicPtr<KthreadContext>; MAX_KTHREADS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_KTHREADS];

/// Logical CPU id -> k-thread context; dense, drives placement and the
/// relay sweep.
static KTHREAD_BY_CPU: [AtomicPtr<KthreadContext>; MAX_CORES] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CORES];

/// Join handles of the spawned (non-CPU-0) k-threads.
static WORKERS: spin::Mutex<Vec<JoinHandle<()>>> = spin::Mutex::new(Vec::new());

static APP_RUNNING: AtomicBool = AtomicBool::new(false);

/// Raised by `app_exit` once the u-thread population has drained.
/// Workers keep their loops (and their runqueues serviceable) until
/// then: exiting on a momentarily-zero live count would strand
/// u-threads created just after on a dead runqueue.
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);

/// K-thread context of the CPU the caller is executing on, or null.
/// The caller is not necessarily that k-thread — handlers check `tid`.
#[inline]
pub(crate) fn current_kthread() -> *mut KthreadContext {
    let apic = arch::apic_id() as usize;
    if apic >= MAX_KTHREADS {
        return ptr::null_mut();
    }
    CPU_MAP[apic].load(Ordering::Acquire)
}

/// K-thread context pinned to logical CPU `cpu`, or null.
#[inline]
pub(crate) fn kthread_at_cpu(cpu: usize) -> *mut KthreadContext {
    if cpu >= MAX_CORES {
        return ptr::null_mut();
    }
    KTHREAD_BY_CPU[cpu].load(Ordering::Acquire)
}

#[cfg(test)]
pub(crate) fn test_register_kthread(cpu: usize, k: *mut KthreadContext) {
    KTHREAD_BY_CPU[cpu].store(k, Ordering::Release);
}

/// Bring a k-thread up on the calling OS thread: record ids, initialize
/// the runqueue, pin, and publish under the observed APIC id.
unsafe fn kthread_init(k: *mut KthreadContext) -> io::Result<()> {
    (*k).pid = signal::getpid();
    (*k).tid = signal::gettid();
    (*k).runq.init();
    (*k).zombies.init_head();

    signal::pin_to_cpu((*k).tid, (*k).os_cpu as usize)?;
    signal::cpu_yield();

    // Now actually scheduled on the target CPU.
    let apic = arch::apic_id();
    assert!(
        (apic as usize) < MAX_KTHREADS,
        "APIC id {} exceeds the CPU map",
        apic
    );
    (*k).apic_id = apic;

    CPU_MAP[apic as usize].store(k, Ordering::Release);
    KTHREAD_BY_CPU[(*k).cpuid as usize].store(k, Ordering::Release);

    debug!(
        "kthread ready (tid {}, cpu {}, os cpu {}, apic {})",
        (*k).tid,
        (*k).cpuid,
        (*k).os_cpu,
        apic
    );
    Ok(())
}

/// Free everything parked on the zombie list. Runs on the owning
/// k-thread in ordinary (non-handler) context; the allocator lock
/// guard also masks the scheduling signals across the frees.
unsafe fn reap_zombies(k: *mut KthreadContext) {
    if (*k).zombies.is_empty() {
        return;
    }
    let _alloc = sched::alloc_lock();
    while !(*k).zombies.is_empty() {
        let entry = (*k).zombies.remove_head();
        let u = containing_record!(entry, Uthread, runq_link);
        debug_assert_eq!((*u).state, UthreadState::Done);
        debug!(
            "uthread {} done on cpu {} ({} dispatches, {} us)",
            (*u).tid,
            (*k).cpuid,
            (*u).dispatches,
            (*u).run_ns / 1_000
        );
        drop(Box::from_raw(u));
    }
}

/// The scheduler loop. Spins until `done()`, reaping retired u-threads
/// and — under PRIORITY — eagerly dispatching. Dispatches re-enter the
/// loop through the anchor context when their u-thread chain drains.
unsafe fn scheduler_loop(k: *mut KthreadContext, done: fn() -> bool) {
    (*k).anchor_armed.store(true, Ordering::Relaxed);
    while !done() {
        core::hint::spin_loop();
        reap_zombies(k);
        if (*k).policy == SchedPolicy::Priority {
            sched::uthread_schedule(k, sched::priority_pick);
        }
    }
    (*k).anchor_armed.store(false, Ordering::Relaxed);
    reap_zombies(k);
}

/// Raw-pointer handoff into a spawned k-thread.
struct KthreadPtr(*mut KthreadContext);
unsafe impl Send for KthreadPtr {}

/// Entry of every spawned k-thread: init, loop, mark DONE.
fn kthread_worker(k: KthreadPtr) {
    let k = k.0;
    unsafe {
        if let Err(e) = kthread_init(k) {
            // Fatal by design: a k-thread that cannot pin leaves a CPU
            // silently unserved.
            eprintln!(
                "fibril: fatal: cannot bring up k-thread for cpu {}: {}",
                (*k).cpuid,
                e
            );
            std::process::abort();
        }

        scheduler_loop(k, worker_loop_done);

        (*k).set_flags(KthreadFlags::DONE);
        debug!(
            "kthread exiting (cpu {}, {} context switches)",
            (*k).cpuid,
            (*k).context_switches
        );
    }
}

/// A worker's loop ends once shutdown has been requested and nothing
/// is left to run anywhere.
fn worker_loop_done() -> bool {
    SHUTTING_DOWN.load(Ordering::Acquire) && sched::all_uthreads_done()
}

/// All spawned (non-CPU-0) k-threads have finished their loops.
fn peers_done() -> bool {
    for cpu in 1..MAX_CORES {
        let k = kthread_at_cpu(cpu);
        if k.is_null() {
            continue;
        }
        if !unsafe { (*k).flags() }.contains(KthreadFlags::DONE) {
            return false;
        }
    }
    true
}

/// Bring the library up: one k-thread per logical CPU, CPU 0 on the
/// calling thread, signal handlers installed, virtual interval timer
/// armed. Returns once every k-thread has published itself, so
/// placement can never observe an empty CPU map afterwards.
///
/// # Panics
/// On any init failure (cannot pin, cannot install a handler, cannot
/// arm the timer, cannot spawn) — all fatal by design — and when called
/// twice in one process.
pub fn app_init(policy: SchedPolicy) {
    assert!(
        !APP_RUNNING.swap(true, Ordering::SeqCst),
        "app_init called twice in one process"
    );

    let cpus = signal::allowed_cpus();
    let ncpus = cpus.len().min(MAX_CORES);
    sched::init_shared(policy);
    info!("fibril starting: {} cpus, {:?} policy", ncpus, policy);

    // CPU 0's k-thread is this thread.
    let main = Box::into_raw(Box::new(KthreadContext::new(0, cpus[0] as u32, policy)));
    unsafe {
        kthread_init(main)
            .unwrap_or_else(|e| panic!("cannot bring up the cpu 0 k-thread: {}", e));

        signal::install_handler(libc::SIGVTALRM, (*main).sched_timer)
            .unwrap_or_else(|e| panic!("cannot install the timer handler: {}", e));
        signal::install_handler(libc::SIGUSR1, (*main).sched_relay)
            .unwrap_or_else(|e| panic!("cannot install the relay handler: {}", e));
        signal::arm_timeslice_timer(TIMESLICE_USEC)
            .unwrap_or_else(|e| panic!("cannot arm the virtual interval timer: {}", e));
    }

    {
        let mut workers = WORKERS.lock();
        for cpu in 1..ncpus {
            let k = KthreadPtr(Box::into_raw(Box::new(KthreadContext::new(
                cpu as u32,
                cpus[cpu] as u32,
                policy,
            ))));
            let handle = thread::Builder::new()
                .name(format!("kthread-{}", cpu))
                .stack_size(KTHREAD_STACK_SIZE)
                .spawn(move || kthread_worker(k))
                .unwrap_or_else(|e| panic!("cannot spawn the k-thread for cpu {}: {}", cpu, e));
            workers.push(handle);
        }
    }

    // Yield until every k-thread has published itself.
    loop {
        signal::cpu_yield();
        let live = (0..ncpus).filter(|&cpu| !kthread_at_cpu(cpu).is_null()).count();
        debug_assert!(live <= ncpus);
        if live == ncpus {
            break;
        }
    }
}

/// Drain and shut down: the calling thread (CPU 0's k-thread) re-enters
/// the scheduler loop until no u-thread remains, requests shutdown and
/// waits for every spawned k-thread to set DONE, then masks the
/// scheduling signals, disarms the timer, and joins the workers.
///
/// Must be called from the thread that called [`app_init`], after at
/// least one `uthread_create` (the drain predicate reads "some were
/// created and none remain").
pub fn app_exit() {
    unsafe {
        let k = current_kthread();
        assert!(
            !k.is_null() && (*k).tid == signal::gettid(),
            "app_exit must run on the thread that called app_init"
        );

        (*k).clear_flags(KthreadFlags::DONE);
        scheduler_loop(k, sched::all_uthreads_done);

        // Drained everywhere; now let the workers wind down.
        SHUTTING_DOWN.store(true, Ordering::Release);
        while !peers_done() {
            core::hint::spin_loop();
        }

        signal::block_sched_signals();
        debug_assert_eq!(sched::live_uthreads(), 0);
        reap_zombies(k);
        (*k).set_flags(KthreadFlags::DONE);

        signal::disarm_timeslice_timer();

        let mut workers = core::mem::take(&mut *WORKERS.lock());
        for handle in workers.drain(..) {
            let _ = handle.join();
        }

        info!(
            "fibril drained: {} u-threads, {} ticks",
            sched::total_uthreads(),
            sched::ticks()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_set_and_clear() {
        let k = KthreadContext::new(0, 0, SchedPolicy::Priority);
        assert!(!k.flags().contains(KthreadFlags::DONE));
        k.set_flags(KthreadFlags::DONE);
        assert!(k.flags().contains(KthreadFlags::DONE));
        k.clear_flags(KthreadFlags::DONE);
        assert!(!k.flags().contains(KthreadFlags::DONE));
    }

    #[test]
    fn fresh_context_defaults() {
        let k = KthreadContext::new(3, 3, SchedPolicy::Credit);
        assert_eq!(k.cpuid, 3);
        assert_eq!(k.policy, SchedPolicy::Credit);
        assert!(k.cur_uthread.is_null());
        assert_eq!(k.context_switches, 0);
        assert!(!k.anchor_armed.load(Ordering::Relaxed));
    }

    #[test]
    fn out_of_range_lookups_are_null() {
        assert!(kthread_at_cpu(MAX_CORES).is_null());
        assert!(kthread_at_cpu(usize::MAX).is_null());
    }
}
