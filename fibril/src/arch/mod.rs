//! Architecture-specific code
//!
//! Saved-context layout, the register save/restore pair behind every
//! u-thread switch, initial-stack synthesis, and the APIC id read used
//! to key the CPU map.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

#[cfg(target_arch = "x86_64")]
pub use x86_64::*;
