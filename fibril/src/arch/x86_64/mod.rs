//! x86_64 architecture support
//!
//! - Context switching (callee-saved register save/restore, stack swap)
//! - Initial stack synthesis for first dispatch
//! - APIC id via CPUID

pub mod context;
pub mod cpu;

pub use context::{load_context, prime_stack, switch_context, Context};
pub use cpu::apic_id;
