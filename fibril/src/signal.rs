//! Signal plumbing and platform calls
//!
//! The preemption protocol rides on two signals: `SIGVTALRM`, delivered
//! by the virtual interval timer to whichever k-thread the kernel picks
//! (the master for that tick), and `SIGUSR1`, relayed by the master to
//! every other live k-thread via a directed `tkill`.
//!
//! Both handlers are installed with `SA_NODEFER`: neither signal is
//! blocked while a handler body runs. The master would otherwise mask
//! itself before relaying and peers could stall waiting on a tick.
//! Mutual exclusion against handler re-entry is provided instead by
//! masking both signals around every runqueue critical section
//! ([`block_sched_signals`] / [`unblock_sched_signals`]).

use std::io;
use std::mem;

use libc::{c_int, pid_t};

/// Handler signature shared by the master-tick and relay handlers.
/// Stored as plain function pointers in each k-thread context.
pub type HandlerFn = extern "C" fn(c_int);

/// The signal set {SIGVTALRM, SIGUSR1}.
fn sched_sigset() -> libc::sigset_t {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGVTALRM);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        set
    }
}

/// Mask both scheduling signals on the calling thread.
///
/// Returns whether they were already blocked, for guard-style restore
/// via [`restore_sched_signals`]. Async-signal-safe.
pub fn block_sched_signals() -> bool {
    let set = sched_sigset();
    unsafe {
        let mut old: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
        libc::sigismember(&old, libc::SIGVTALRM) == 1
    }
}

/// Unmask both scheduling signals on the calling thread.
pub fn unblock_sched_signals() {
    let set = sched_sigset();
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, core::ptr::null_mut());
    }
}

/// Undo a [`block_sched_signals`], honoring the prior mask state.
pub fn restore_sched_signals(was_blocked: bool) {
    if !was_blocked {
        unblock_sched_signals();
    }
}

/// Install `handler` for `signo` with `SA_RESTART | SA_NODEFER` and an
/// empty handler mask.
pub fn install_handler(signo: c_int, handler: HandlerFn) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_RESTART | libc::SA_NODEFER;
        libc::sigemptyset(&mut sa.sa_mask);
        if libc::sigaction(signo, &sa, core::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Arm the process-wide virtual interval timer: `SIGVTALRM` every
/// `interval_usec` microseconds of consumed CPU time.
pub fn arm_timeslice_timer(interval_usec: i64) -> io::Result<()> {
    let slice = libc::timeval {
        tv_sec: interval_usec / 1_000_000,
        tv_usec: (interval_usec % 1_000_000) as libc::suseconds_t,
    };
    let timer = libc::itimerval {
        it_interval: slice,
        it_value: slice,
    };
    unsafe {
        if libc::setitimer(libc::ITIMER_VIRTUAL, &timer, core::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Stop the virtual interval timer.
pub fn disarm_timeslice_timer() {
    let timer: libc::itimerval = unsafe { mem::zeroed() };
    unsafe {
        libc::setitimer(libc::ITIMER_VIRTUAL, &timer, core::ptr::null_mut());
    }
}

/// Send `signo` to one specific kernel thread. Delivery to a thread
/// that has already exited (ESRCH) is ignored.
pub fn direct_signal(tid: pid_t, signo: c_int) {
    unsafe {
        libc::syscall(libc::SYS_tkill, tid as libc::c_long, signo as libc::c_long);
    }
}

/// Kernel thread id of the caller.
#[inline]
pub fn gettid() -> pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as pid_t }
}

/// Process id of the caller.
#[inline]
pub fn getpid() -> pid_t {
    unsafe { libc::getpid() }
}

/// Give up the rest of this k-thread's OS timeslice.
#[inline]
pub fn cpu_yield() {
    unsafe {
        libc::sched_yield();
    }
}

/// Pin the kernel thread `tid` to the single logical CPU `cpu`.
pub fn pin_to_cpu(tid: pid_t, cpu: usize) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(tid, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// CPUs the process is allowed to run on, in ascending order. Pinning
/// outside this set fails (cpuset-restricted hosts), so k-thread
/// placement is drawn from it rather than from the raw CPU count.
pub fn allowed_cpus() -> Vec<usize> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            let n = libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize;
            return (0..n).collect();
        }
        (0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect()
    }
}

/// Monotonic clock in nanoseconds. Safe to call from handler context
/// (`clock_gettime` is async-signal-safe).
#[inline]
pub fn monotonic_ns() -> u64 {
    unsafe {
        let mut ts: libc::timespec = mem::zeroed();
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_roundtrip() {
        let was_blocked = block_sched_signals();
        // Nested block reports the outer one.
        assert!(block_sched_signals());
        restore_sched_signals(was_blocked);
        if !was_blocked {
            // A fresh block must again observe the unblocked state.
            assert!(!block_sched_signals());
            unblock_sched_signals();
        }
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn tid_is_stable() {
        assert_eq!(gettid(), gettid());
    }

    #[test]
    fn allowed_cpus_is_non_empty() {
        let cpus = allowed_cpus();
        assert!(!cpus.is_empty());
        // Ascending, no duplicates.
        assert!(cpus.windows(2).all(|w| w[0] < w[1]));
    }
}
