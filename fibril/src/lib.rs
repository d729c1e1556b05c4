//! Fibril — a user-level M:N threading library
//!
//! Many lightweight u-threads are multiplexed over a fixed pool of
//! kernel threads (k-threads), one hard-pinned per logical CPU. The
//! major pieces:
//!
//! - **runqueue** — per-CPU two-level priority arrays (`active` /
//!   `expired`), per-group FIFO buckets with occupancy bitmaps for
//!   O(1) selection
//! - **uthread** — the execution unit: dedicated stack, saved context,
//!   state machine, credit balance
//! - **kthread** — pinned workers, the scheduler loop, app lifecycle
//! - **sched** — placement, the dispatch path, the PRIORITY and CREDIT
//!   policies, credit replenishment, and the signal protocol (one
//!   timer master per tick relaying `SIGUSR1` to its peers)
//! - **arch** — register save/restore, stack synthesis, APIC id
//!
//! Preemption is asynchronous: a virtual interval timer elects a master
//! k-thread each tick, the master relays a reschedule signal to every
//! peer, and each handler re-enters the dispatch path on its own CPU.
//! There is no cooperative requirement on u-threads — they may simply
//! burn CPU until their entry function returns — though
//! [`uthread_yield`] is available.
//!
//! # Example
//!
//! ```no_run
//! use fibril::{app_exit, app_init, uthread_create, SchedPolicy};
//!
//! fn work(_arg: *mut u8) {
//!     // plain computation; preempted transparently
//! }
//!
//! app_init(SchedPolicy::Credit);
//! for i in 0..8 {
//!     uthread_create(work, core::ptr::null_mut(), i % 4, 25 * (1 + i as i32 % 4));
//! }
//! app_exit();
//! ```
//!
//! A u-thread that blocks in the kernel blocks its k-thread; the
//! library targets CPU-bound workloads.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("fibril supports Linux on x86_64 only");

pub mod arch;
pub mod kthread;
pub mod list;
pub mod runqueue;
pub mod sched;
pub mod signal;
pub mod spinlock;
pub mod uthread;

/// Tunables. All scheduling magnitudes live here.
pub mod constants {
    /// Size of the APIC-id-keyed CPU map. APIC ids at or above this
    /// are rejected at k-thread bring-up.
    pub const MAX_KTHREADS: usize = 256;
    /// Upper bound on logical CPUs driven by the library.
    pub const MAX_CORES: usize = 64;
    /// Upper bound (exclusive) on u-thread group ids; one bitmap word
    /// per class.
    pub const MAX_GROUPS: usize = 32;
    /// Stack size of spawned k-threads.
    pub const KTHREAD_STACK_SIZE: usize = 256 * 1024;
    /// Stack size of every u-thread. Signal handlers nest on these
    /// stacks, so keep generous headroom.
    pub const UTHREAD_STACK_SIZE: usize = 128 * 1024;
    /// Virtual interval timer period, microseconds of consumed CPU
    /// time per tick.
    pub const TIMESLICE_USEC: i64 = 10_000;
    /// Credit allotment used when a u-thread is created with a
    /// non-positive one.
    pub const UTHREAD_DEFAULT_CREDITS: i32 = 100;
    /// Credits charged to the running u-thread at each preemption.
    pub const CREDIT_TICK_COST: i32 = 25;
    /// Replenish every this-many timer ticks.
    pub const CREDIT_REPLENISH_TICKS: u64 = 10;
}

pub use kthread::{app_exit, app_init};
pub use sched::{live_uthreads, ticks, total_uthreads, SchedPolicy};
pub use uthread::{uthread_create, uthread_runtime_ns, uthread_yield, UthreadFunc};
