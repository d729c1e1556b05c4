//! CPU identification
//!
//! The CPU map is keyed by APIC id: after a k-thread pins itself and
//! yields, it reads the APIC id of the CPU it landed on and publishes
//! itself under that key. Signal handlers repeat the read to find the
//! k-thread context for the CPU they were delivered on.

/// APIC id of the CPU currently executing the caller.
///
/// CPUID leaf 1, EBX bits 24..31. A single instruction, so it is safe
/// to use from signal-handler context. Only stable as long as the
/// caller is pinned — which is exactly how k-threads use it.
#[inline]
pub fn apic_id() -> u32 {
    unsafe { core::arch::x86_64::__cpuid(1).ebx >> 24 }
}
