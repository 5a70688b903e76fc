//! The takeover trampoline.
//!
//! Entry contract: assume nothing. The asm stub captures the full integer
//! register file before touching anything, calls back into the runtime's
//! setup routine to locate this thread's takeover record, and finally
//! transfers to the stored continuation. The Rust halves of both
//! transitions live here so tests can drive them without the asm.

use crate::nt::Kernel;
use crate::takeover::table::TakeoverTable;

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
std::arch::global_asm!(
    r#"
.globl wrest_takeover_trampoline
wrest_takeover_trampoline:
    # Continuation slot, filled after setup.
    push 0
    pushfq
    push rax
    push rcx
    push rdx
    push rbx
    push rbp
    push rsi
    push rdi
    push r8
    push r9
    push r10
    push r11
    push r12
    push r13
    push r14
    push r15
    sub rsp, 0x28
    call wrest_thread_attach_setup
    add rsp, 0x28
    mov [rsp + 0x80], rax       # 15 regs + flags above the slot
    pop r15
    pop r14
    pop r13
    pop r12
    pop r11
    pop r10
    pop r9
    pop r8
    pop rdi
    pop rsi
    pop rbp
    pop rbx
    pop rdx
    pop rcx
    pop rax
    popfq
    ret                          # continuation slot

.globl wrest_debug_halt
wrest_debug_halt:
    jmp wrest_debug_halt

.globl wrest_sysenter_ret
wrest_sysenter_ret:
    ret
"#
);

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
extern "C" {
    fn wrest_takeover_trampoline();
    fn wrest_debug_halt();
    fn wrest_sysenter_ret();
}

/// Address threads are redirected to.
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub fn trampoline_entry() -> usize {
    wrest_takeover_trampoline as usize
}

/// A halt loop for return paths that must never be taken; the terminate
/// tombstone's fake return address points here.
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub fn debug_halt_address() -> usize {
    wrest_debug_halt as usize
}

/// Where a sysenter-dispatched syscall returns inside the runtime.
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub fn sysenter_return_address() -> usize {
    wrest_sysenter_ret as usize
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
mod placeholder {
    // Host-independent builds still need stable, distinct addresses for
    // these labels; private functions serve.
    pub extern "C" fn trampoline_placeholder() {}
    pub extern "C" fn halt_placeholder() {}
    pub extern "C" fn sysenter_ret_placeholder() {}
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
pub fn trampoline_entry() -> usize {
    placeholder::trampoline_placeholder as usize
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
pub fn debug_halt_address() -> usize {
    placeholder::halt_placeholder as usize
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
pub fn sysenter_return_address() -> usize {
    placeholder::sysenter_ret_placeholder as usize
}

/// First half of the trampoline contract: the thread claims its own
/// record. False means no record or a concurrent claim already happened,
/// and the caller backs out to native execution.
pub fn enter(table: &TakeoverTable, tid: u32) -> bool {
    table.mark_in_progress(tid)
}

/// Second half: per-thread initialization is done, control goes to the
/// code cache. The record leaves the table here; the duplicated handle
/// dies with it. Returns the continuation.
pub fn complete(kernel: &dyn Kernel, table: &TakeoverTable, tid: u32) -> Option<usize> {
    let record = table.remove(tid)?;
    let _ = kernel.close_handle(record.thread_handle);
    Some(record.continuation_pc)
}

/// Both halves, as the asm stub runs them.
pub fn attach_finish(kernel: &dyn Kernel, table: &TakeoverTable, tid: u32) -> Option<usize> {
    if !enter(table, tid) {
        return None;
    }
    complete(kernel, table, tid)
}

/// The setup routine the asm stub calls. Resolves the current thread's
/// record against the global table through the production kernel and
/// returns the continuation, or the halt loop when the record vanished
/// (which means a concurrent detach won; halting is the conservative
/// answer, the detacher will restore and resume us).
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
#[no_mangle]
pub extern "C" fn wrest_thread_attach_setup() -> usize {
    use crate::nt::direct::DirectKernel;
    static KERNEL: DirectKernel = DirectKernel::new();
    let tid = KERNEL.current_thread_id();
    attach_finish(&KERNEL, TakeoverTable::global(), tid).unwrap_or_else(debug_halt_address)
}
