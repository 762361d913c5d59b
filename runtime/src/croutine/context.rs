//! Routine context and context switch.
//!
//! This module provides the low-level machinery for stackful coroutines:
//! a guard-paged stack, `make_context` to prepare a fresh stack so that
//! the first switch lands in the routine entry, and `swap_context` to
//! save the current execution onto one stack and resume another.
//!
//! Only callee-saved registers and the stack pointer are switched; the
//! calling convention already handles caller-saved registers. The saved
//! stack pointer lives in a one-word slot per context (and one per
//! worker thread for its own stack), and `swap_context` takes pointers
//! to those slots.

use std::cell::UnsafeCell;
use std::ffi::c_void;
use std::io;
use std::ptr;

use crate::config::STACK_SIZE;
use crate::croutine::pool::{self, PooledStack};
use crate::error::RuntimeError;

/// Saved stack pointer of a suspended execution.
pub type StackPtr = *mut u8;

/// Entry signature for a routine body trampoline.
pub type RoutineEntry = extern "C" fn(*mut c_void);

/// Size of the callee-saved register frame that `swap_context` places on
/// the stack.
#[cfg(target_arch = "x86_64")]
pub const REGISTERS_SIZE: usize = 7 * 8; // rdi, r12-r15, rbx, rbp

#[cfg(target_arch = "aarch64")]
pub const REGISTERS_SIZE: usize = 20 * 8; // x19-x28, x29, x30, d8-d15

/// A routine's execution context: its stack plus the saved stack
/// pointer while the routine is suspended.
///
/// The stack comes from the context pool when a slot is free, and from
/// a direct allocation otherwise.
pub struct RoutineContext {
    stack: PooledStack,
    sp: UnsafeCell<StackPtr>,
}

// The saved stack pointer is read and written only by the thread that
// currently holds the owning routine's scheduling lock, and by
// `make_context` before the routine is published. The stack memory
// itself is touched only by the routine running on it.
unsafe impl Send for RoutineContext {}
unsafe impl Sync for RoutineContext {}

impl RoutineContext {
    /// Allocate a context backed by a pooled (or, past capacity, direct)
    /// stack. The stack pointer is meaningless until `make_context` ran.
    pub fn new() -> Result<RoutineContext, RuntimeError> {
        let stack = pool::acquire_stack()?;
        Ok(RoutineContext {
            stack,
            sp: UnsafeCell::new(ptr::null_mut()),
        })
    }

    /// Slot holding the saved stack pointer, as passed to `swap_context`.
    pub fn sp_slot(&self) -> *mut StackPtr {
        self.sp.get()
    }

    /// Highest usable stack address, 16-byte aligned.
    pub fn stack_top(&self) -> *mut u8 {
        self.stack.top()
    }
}

/// A `mmap`ed stack with a `PROT_NONE` guard page at the low end, so a
/// stack overflow faults instead of corrupting neighboring memory.
pub struct GuardedStack {
    base: *mut u8,
    len: usize,
    page_size: usize,
}

unsafe impl Send for GuardedStack {}

impl GuardedStack {
    pub fn new() -> Result<GuardedStack, RuntimeError> {
        let page_size = page_size();
        let len = STACK_SIZE + page_size;
        // SAFETY: plain anonymous mapping; failure is reported, not used.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(RuntimeError::StackAlloc(io::Error::last_os_error()));
        }
        // SAFETY: `base` is a valid page-aligned mapping of `len` bytes.
        let rc = unsafe { libc::mprotect(base, page_size, libc::PROT_NONE) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: unmapping the region we just mapped.
            unsafe { libc::munmap(base, len) };
            return Err(RuntimeError::StackAlloc(err));
        }
        Ok(GuardedStack {
            base: base as *mut u8,
            len,
            page_size,
        })
    }

    /// Highest usable address. Mappings are page-aligned, so this is
    /// 16-byte aligned as the ABIs require.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: base + len is one past the end of the mapping, a valid
        // provenance-carrying address for the stack top.
        unsafe { self.base.add(self.len) }
    }

    /// Usable bytes between the guard page and the top.
    pub fn usable_len(&self) -> usize {
        self.len - self.page_size
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        // Suspended frames on this stack are discarded without
        // unwinding; values owned by them leak.
        // SAFETY: base/len describe the mapping created in `new`.
        unsafe {
            libc::munmap(self.base as *mut c_void, self.len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 { 4096 } else { sz as usize }
}

/// Initialize a freshly allocated stack so that the first
/// `swap_context` restoring from `ctx` lands in `entry(arg)`.
///
/// # Safety
///
/// `ctx` must own a valid, unused stack, and `arg` must stay valid for
/// as long as the context can be resumed.
#[cfg(target_arch = "x86_64")]
pub unsafe fn make_context(entry: RoutineEntry, arg: *mut c_void, ctx: &RoutineContext) {
    // The stack layout after this call, from the top down:
    //
    //   top-8    reserved
    //   top-16   entry address        <- popped by the final `ret`
    //   top-24   arg (rdi slot)       <- first-popped register
    //   ...      r12..r15, rbx, rbp   <- zeroed
    //   top-16-REGISTERS_SIZE         <- saved sp
    //
    // `ret` leaves rsp at top-8, which is the 16n+8 alignment the ABI
    // guarantees at function entry.
    let top = ctx.stack_top();
    unsafe {
        let sp = top.sub(2 * 8 + REGISTERS_SIZE);
        ptr::write_bytes(sp, 0, REGISTERS_SIZE);
        *(top.sub(2 * 8) as *mut usize) = entry as usize;
        *(top.sub(3 * 8) as *mut usize) = arg as usize;
        *ctx.sp_slot() = sp;
    }
}

/// Initialize a freshly allocated stack so that the first
/// `swap_context` restoring from `ctx` lands in `entry(arg)`.
///
/// The restored frame carries `arg` in the x19 slot, `entry` in the x20
/// slot and the `routine_start` thunk in the x30 slot; the thunk moves
/// x19 into the argument register and branches to x20.
///
/// # Safety
///
/// `ctx` must own a valid, unused stack, and `arg` must stay valid for
/// as long as the context can be resumed.
#[cfg(target_arch = "aarch64")]
pub unsafe fn make_context(entry: RoutineEntry, arg: *mut c_void, ctx: &RoutineContext) {
    let top = ctx.stack_top();
    unsafe {
        let sp = top.sub(REGISTERS_SIZE);
        ptr::write_bytes(sp, 0, REGISTERS_SIZE);
        *(sp as *mut usize) = arg as usize; // x19
        *(sp.add(8) as *mut usize) = entry as usize; // x20
        *(sp.add(88) as *mut usize) = routine_start as *const () as usize; // x30
        *ctx.sp_slot() = sp;
    }
}

/// Save the current execution's callee-saved registers and stack
/// pointer into `*save`, then restore from `*restore` and continue
/// there.
///
/// For a context prepared by `make_context` the restore path falls
/// through into the routine entry; for a previously saved context it
/// returns from the `swap_context` call that suspended it.
///
/// # Safety
///
/// Both slots must be valid; `*restore` must hold a stack pointer
/// written by `make_context` or a previous save through this function.
#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(_save: *mut StackPtr, _restore: *const StackPtr) {
    // rdi = save slot, rsi = restore slot.
    //
    // rdi doubles as the first-argument slot: on a first run the final
    // `pop rdi` loads the routine argument and `ret` enters the
    // trampoline.
    core::arch::naked_asm!(
        "push rdi",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "push rbx",
        "push rbp",
        "mov [rdi], rsp",
        "mov rsp, [rsi]",
        "pop rbp",
        "pop rbx",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rdi",
        "ret",
    );
}

/// Save the current execution's callee-saved registers and stack
/// pointer into `*save`, then restore from `*restore` and continue
/// there.
///
/// # Safety
///
/// Both slots must be valid; `*restore` must hold a stack pointer
/// written by `make_context` or a previous save through this function.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
pub unsafe extern "C" fn swap_context(_save: *mut StackPtr, _restore: *const StackPtr) {
    // x0 = save slot, x1 = restore slot. The 160-byte frame holds
    // x19-x28, the frame pointer, the link register and d8-d15; `ret`
    // continues at the restored x30.
    core::arch::naked_asm!(
        "sub sp, sp, #160",
        "stp x19, x20, [sp, #0]",
        "stp x21, x22, [sp, #16]",
        "stp x23, x24, [sp, #32]",
        "stp x25, x26, [sp, #48]",
        "stp x27, x28, [sp, #64]",
        "stp x29, x30, [sp, #80]",
        "stp d8, d9, [sp, #96]",
        "stp d10, d11, [sp, #112]",
        "stp d12, d13, [sp, #128]",
        "stp d14, d15, [sp, #144]",
        "mov x2, sp",
        "str x2, [x0]",
        "ldr x2, [x1]",
        "mov sp, x2",
        "ldp x19, x20, [sp, #0]",
        "ldp x21, x22, [sp, #16]",
        "ldp x23, x24, [sp, #32]",
        "ldp x25, x26, [sp, #48]",
        "ldp x27, x28, [sp, #64]",
        "ldp x29, x30, [sp, #80]",
        "ldp d8, d9, [sp, #96]",
        "ldp d10, d11, [sp, #112]",
        "ldp d12, d13, [sp, #128]",
        "ldp d14, d15, [sp, #144]",
        "add sp, sp, #160",
        "ret",
    );
}

/// First-run thunk: the initial `ret` of `swap_context` lands here with
/// the routine argument in x19 and the entry in x20.
#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
extern "C" fn routine_start() {
    core::arch::naked_asm!("mov x0, x19", "br x20");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_stack_alignment() {
        let stack = GuardedStack::new().unwrap();
        assert_eq!(stack.top() as usize % 16, 0);
        assert_eq!(stack.usable_len(), STACK_SIZE);
    }

    #[test]
    fn test_guarded_stack_is_writable_at_top() {
        let stack = GuardedStack::new().unwrap();
        unsafe {
            let slot = stack.top().sub(8) as *mut u64;
            slot.write(0xDEAD_BEEF);
            assert_eq!(slot.read(), 0xDEAD_BEEF);
        }
    }
}
