//! Machine-context save/restore and fresh-stack setup.
//!
//! A [`MachineContext`] holds the callee-saved register state of a paused
//! execution: enough to resume it exactly where it left off, per the target
//! ABI. [`switch_context`] stores the current state into one context and
//! resumes another; [`init_context`] fabricates a context that, when first
//! resumed, enters a given function at the top of a fresh stack.
//!
//! Only callee-saved registers travel through a switch. Both sides of every
//! switch are ordinary `extern "C"` call boundaries, so caller-saved state is
//! already on the stack being switched away from.

use crate::stack::FiberStack;

#[cfg(not(all(unix, any(target_arch = "x86_64", target_arch = "aarch64"))))]
compile_error!("filament supports only unix targets on x86_64 and aarch64");

/// Saved callee-saved register state for one paused execution.
///
/// A zeroed context is inert; it must be prepared by [`init_context`] or
/// filled by [`switch_context`] before it can be resumed.
#[cfg(target_arch = "x86_64")]
#[repr(C)]
#[derive(Debug, Clone, Default)]
#[allow(dead_code)] // fields are read only by the switch assembly
pub struct MachineContext {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
}

/// Saved callee-saved register state for one paused execution.
///
/// A zeroed context is inert; it must be prepared by [`init_context`] or
/// filled by [`switch_context`] before it can be resumed.
#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Debug, Clone, Default)]
#[allow(dead_code)] // fields are read only by the switch assembly
pub struct MachineContext {
    sp: u64,
    lr: u64,
    fp: u64,
    x: [u64; 10], // x19..x28
    d: [u64; 8],  // d8..d15
}

/// Saves the current execution state into `save` and resumes `resume`.
///
/// Returns when some later switch resumes `save`. For a context prepared by
/// [`init_context`] the "resume" enters the entry function instead.
///
/// # Safety
///
/// Both pointers must be valid and distinct. `resume` must have been filled
/// by a previous `switch_context` or prepared by [`init_context`], and the
/// stack it points into must still be live. The caller must not hold any
/// borrow that the resumed execution could also acquire.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut MachineContext, _resume: *const MachineContext) {
    core::arch::naked_asm!(
        // Save callee-saved registers into `save` (rdi). rsp still points at
        // our caller's return address, so resuming continues after this call.
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        // Restore from `resume` (rsi).
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        // Pops either the resumed caller's return address or a fresh
        // context's entry slot.
        "ret",
    );
}

/// Saves the current execution state into `save` and resumes `resume`.
///
/// Returns when some later switch resumes `save`. For a context prepared by
/// [`init_context`] the "resume" enters the entry function instead.
///
/// # Safety
///
/// Both pointers must be valid and distinct. `resume` must have been filled
/// by a previous `switch_context` or prepared by [`init_context`], and the
/// stack it points into must still be live. The caller must not hold any
/// borrow that the resumed execution could also acquire.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_save: *mut MachineContext, _resume: *const MachineContext) {
    core::arch::naked_asm!(
        // Save callee-saved registers into `save` (x0).
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "stp x30, x29, [x0, #0x08]",
        "stp x19, x20, [x0, #0x18]",
        "stp x21, x22, [x0, #0x28]",
        "stp x23, x24, [x0, #0x38]",
        "stp x25, x26, [x0, #0x48]",
        "stp x27, x28, [x0, #0x58]",
        "stp d8, d9, [x0, #0x68]",
        "stp d10, d11, [x0, #0x78]",
        "stp d12, d13, [x0, #0x88]",
        "stp d14, d15, [x0, #0x98]",
        // Restore from `resume` (x1).
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldp x30, x29, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x18]",
        "ldp x21, x22, [x1, #0x28]",
        "ldp x23, x24, [x1, #0x38]",
        "ldp x25, x26, [x1, #0x48]",
        "ldp x27, x28, [x1, #0x58]",
        "ldp d8, d9, [x1, #0x68]",
        "ldp d10, d11, [x1, #0x78]",
        "ldp d12, d13, [x1, #0x88]",
        "ldp d14, d15, [x1, #0x98]",
        // Jumps to either the resumed link register or a fresh context's
        // entry function.
        "ret",
    );
}

/// Prepares a context that enters `entry` at the top of `stack` when first
/// resumed.
///
/// The frame chain is terminated (zero frame pointer) so backtraces stop at
/// the entry function. `entry` must never return; there is nothing beneath
/// it to return to.
#[must_use]
pub fn init_context(stack: &FiberStack, entry: extern "C" fn() -> !) -> MachineContext {
    let top = (stack.top() as usize) & !15;

    #[cfg(target_arch = "x86_64")]
    {
        // Lay the stack out as if `entry` had just been called: `ret` in
        // switch_context pops the entry address, leaving rsp ≡ 8 (mod 16)
        // as the ABI requires at function entry.
        let sp = top - 16;
        unsafe {
            *(sp as *mut usize) = entry as usize;
            *((sp + 8) as *mut usize) = 0;
        }
        MachineContext {
            rsp: sp as u64,
            ..MachineContext::default()
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        // `ret` transfers through the link register; nothing is read from
        // the stack itself.
        MachineContext {
            sp: top as u64,
            lr: entry as usize as u64,
            ..MachineContext::default()
        }
    }
}
