//! Context switching for x86_64
//!
//! A u-thread switch saves the outgoing side's callee-saved registers
//! (RBX, RBP, R12-R15, RFLAGS) plus the return address on the outgoing
//! stack, stores RSP into the outgoing [`Context`], then loads the
//! incoming side's RSP and pops the mirror image. Everything else is
//! either caller-saved (dead across the `switch_context` call per the
//! SysV ABI) or, for a preempted u-thread, parked in the kernel signal
//! frame that the handler returns through after being resumed.
//!
//! [`load_context`] is the one-way form: it abandons the current stack
//! and resumes a saved context without saving anything. A finishing
//! u-thread uses it to re-enter its k-thread's scheduler loop; the
//! abandoned stack is freed afterwards by that loop, never touched
//! again from here.

use core::arch::naked_asm;

/// Saved execution context: the stack pointer under which the frame of
/// saved registers lives. Must stay at offset 0 — the switch routines
/// address it as `[rdi]` / `[rsi]`.
#[repr(C)]
pub struct Context {
    sp: *mut u8,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            sp: core::ptr::null_mut(),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Switch from the context owning the current stack to `load`.
///
/// Returns (to its caller, on the original stack) when some later
/// switch or [`load_context`] resumes `save`.
///
/// # Safety
/// - `save` must be valid for writes and `load` for reads.
/// - `load` must hold a context produced by a previous save or by
///   [`prime_stack`], resumed at most once since.
/// - The scheduling signals must be masked across the call; the resumed
///   side is responsible for unmasking.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut Context, _load: *const Context) {
    naked_asm!(
        // Save callee-saved state on the outgoing stack.
        "push rbx",
        "push rbp",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "pushfq",
        // Publish the outgoing stack pointer, adopt the incoming one.
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        // Restore the incoming side and return into it.
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    )
}

/// Resume `load` without saving the current context. The current stack
/// is abandoned.
///
/// # Safety
/// Same requirements on `load` as [`switch_context`].
#[unsafe(naked)]
pub unsafe extern "C" fn load_context(_load: *const Context) -> ! {
    naked_asm!(
        "mov rsp, [rdi]",
        "popfq",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbp",
        "pop rbx",
        "ret",
    )
}

/// Synthesize the initial context for a never-run u-thread so that the
/// first switch into it "returns" into `entry` on its own stack.
///
/// Layout placed at the top of the stack (downward):
///
/// ```text
/// [top - 16]  entry address        <- popped by `ret`
/// [.. - 56]   rbx..r15 = 0
/// [.. -  8]   rflags = 0x202
///             ^ saved stack pointer
/// ```
///
/// The entry slot sits at a 16-byte boundary, so `entry` observes the
/// ABI's `rsp % 16 == 8` call alignment.
///
/// # Safety
/// `stack_base..stack_base + stack_size` must be a valid, unused stack
/// region that outlives the returned context.
pub unsafe fn prime_stack(
    stack_base: *mut u8,
    stack_size: usize,
    entry: extern "C" fn(),
) -> Context {
    let top = (stack_base as usize + stack_size) & !0xf;

    let mut sp = (top - 16) as *mut u64;
    *sp = entry as usize as u64;

    // rbx, rbp, r12, r13, r14, r15
    for _ in 0..6 {
        sp = sp.sub(1);
        *sp = 0;
    }

    // rflags: IF set, reserved bit 1 set
    sp = sp.sub(1);
    *sp = 0x202;

    Context { sp: sp as *mut u8 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primed_stack_is_aligned() {
        let mut stack = vec![0u8; 4096];
        let ctx = unsafe { prime_stack(stack.as_mut_ptr(), stack.len(), dummy_entry) };
        // 7 saved slots below the 16-byte-aligned entry slot.
        assert_eq!((ctx.sp as usize + 7 * 8) % 16, 0);
        let top = (stack.as_ptr() as usize + stack.len()) & !0xf;
        assert_eq!(ctx.sp as usize, top - 16 - 7 * 8);
    }

    extern "C" fn dummy_entry() {}

    #[test]
    fn primed_stack_points_at_entry() {
        let mut stack = vec![0u8; 4096];
        let ctx = unsafe { prime_stack(stack.as_mut_ptr(), stack.len(), dummy_entry) };
        unsafe {
            let rip = (ctx.sp as *const u64).add(7);
            assert_eq!(*rip, dummy_entry as usize as u64);
            // All callee-saved slots start zeroed except rflags.
            assert_eq!(*(ctx.sp as *const u64), 0x202);
            for i in 1..7 {
                assert_eq!(*(ctx.sp as *const u64).add(i), 0);
            }
        }
    }
}
