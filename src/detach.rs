//! Detach: restore threads whose takeover never ran.
//!
//! A taken-over thread that has not yet been scheduled still has the
//! trampoline as its instruction pointer (or a rewritten transition word
//! in the 32-on-64 case). Detach walks the takeover table and puts every
//! such thread back exactly where attach found it. Threads that already
//! entered the trampoline own their records and are left alone; they
//! finish registering and the runtime releases them through the normal
//! path.

use crate::app_ptr::AppPtr;
use crate::log::LogLevel;
use crate::nt::Kernel;
use crate::safe_mem;
use crate::takeover::table::{TakeoverRecord, TakeoverTable};
use crate::takeover::thread::is_terminating_status;
use std::sync::atomic::{AtomicBool, Ordering};

/// At most one detach at a time, enforced by a single swap.
pub struct DetachControl {
    in_flight: AtomicBool,
}

impl DetachControl {
    pub const fn new() -> DetachControl {
        DetachControl {
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn try_begin(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    pub fn finish(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Drain the table. False when another detach is already running.
    pub fn detach_all(&self, kernel: &dyn Kernel, table: &TakeoverTable) -> bool {
        if !self.try_begin() {
            return false;
        }
        for tid in table.active_tids() {
            revert_one(kernel, table, tid);
        }
        self.finish();
        true
    }
}

static GLOBAL_DETACH: DetachControl = DetachControl::new();

/// Process-wide detach entry point.
pub fn detach_all(kernel: &dyn Kernel, table: &TakeoverTable) -> bool {
    GLOBAL_DETACH.detach_all(kernel, table)
}

fn revert_one(kernel: &dyn Kernel, table: &TakeoverTable, tid: u32) {
    if table.is_in_progress(tid) {
        // The thread beat us into the trampoline; the record is its now.
        return;
    }
    let handle = match table.with_record(tid, |r| r.thread_handle) {
        Some(h) => h,
        None => return,
    };
    // Freeze the thread before deciding; it may be racing toward the
    // trampoline right now.
    match kernel.suspend_thread(handle) {
        Ok(_) => {}
        Err(status) => {
            if is_terminating_status(status) {
                // Nothing left to restore.
                if let Some(record) = table.remove(tid) {
                    let _ = kernel.close_handle(record.thread_handle);
                }
            }
            return;
        }
    }
    if table.is_in_progress(tid) {
        let _ = kernel.resume_thread(handle);
        return;
    }
    let record = match table.remove(tid) {
        Some(r) => r,
        None => {
            let _ = kernel.resume_thread(handle);
            return;
        }
    };
    restore_thread(kernel, &record);
    let _ = kernel.resume_thread(handle);
    let _ = kernel.close_handle(record.thread_handle);
    log!(
        LogLevel::LogDebug,
        "reverted never-run takeover of thread {} to {:#x}",
        tid,
        record.continuation_pc
    );
}

/// Undo exactly what attach did: rewritten memory words first, then the
/// register file.
fn restore_thread(kernel: &dyn Kernel, record: &TakeoverRecord) {
    for word in [record.saved_stack_word, record.saved_r14_word].iter().flatten() {
        let _ = safe_mem::safe_write(
            kernel,
            AppPtr::new(word.addr),
            &word.original.to_le_bytes(),
        );
    }
    if let Some(wide) = &record.x64_context {
        let _ = kernel.set_context_x64(record.thread_handle, wide);
    } else {
        let arch = if kernel.user_is_64bit() {
            crate::registers::SupportedArch::X64
        } else {
            crate::registers::SupportedArch::X86
        };
        let mut ctx = crate::registers::Context::new(arch);
        if kernel.get_context(record.thread_handle, &mut ctx).is_ok() {
            ctx.set_ip(record.continuation_pc);
            let _ = kernel.set_context(record.thread_handle, &ctx);
        }
    }
}
