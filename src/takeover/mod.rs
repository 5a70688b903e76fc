//! Thread takeover.
//!
//! Attach enumerates the process's threads, suspends each one not yet
//! under runtime control, rewrites its instruction pointer to the
//! trampoline, and records enough state to revert the rewrite. New
//! threads can appear while a pass runs, so enumeration repeats until a
//! pass finds nothing new, bounded by an option.
//!
//! Inside a 32-on-64 process the suspended narrow context is not always
//! authoritative; see `wow64` for the transition-window handling.

pub mod table;
pub mod thread;
pub mod trampoline;
pub mod wow64;

use crate::app_ptr::AppPtr;
use crate::log::{LogLevel, SyslogCode};
use crate::nt::types::NT_CURRENT_THREAD;
use crate::nt::{Handle, Kernel};
use crate::options::Options;
use crate::os_version::OsInfo;
use crate::registers::SupportedArch;
use crate::safe_mem;
use crate::syscall_numbers::SyscallName;
use crate::takeover::table::{SavedWord, TakeoverRecord, TakeoverTable};
use crate::takeover::thread::{
    is_terminating_status, TargetThread, ThreadListEntry, ThreadListState,
};
use crate::takeover::wow64::{classify, wow64_cases, Wow64Rewrite, WOW64_CALL_GATE};
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;

enum Wow64Outcome {
    /// Redirected through the transition window.
    Done,
    /// Unsafe to touch (deep in 64-bit code, or the window failed its
    /// sanity check); left native for the interception path.
    SkipThread,
    /// Not in a transition window; the narrow path applies.
    NotInWindow,
    /// Kernel refused something; counts as an attach failure.
    Error,
}

pub struct Takeover<'a> {
    kernel: &'a dyn Kernel,
    table: &'a TakeoverTable,
    os: &'a OsInfo,
    options: &'a Options,
    trampoline: usize,
    /// The loader's thread-init stub: a thread parked there will register
    /// itself, so it is never redirected.
    init_stub: Option<usize>,
    /// Bounds of the runtime's own image, snapshot at construction.
    runtime_image: (usize, usize),
    seen: HashMap<u32, ThreadListEntry>,
}

impl<'a> Takeover<'a> {
    pub fn new(
        kernel: &'a dyn Kernel,
        table: &'a TakeoverTable,
        os: &'a OsInfo,
        options: &'a Options,
    ) -> Takeover<'a> {
        Takeover {
            kernel,
            table,
            os,
            options,
            trampoline: trampoline::trampoline_entry(),
            init_stub: None,
            runtime_image: crate::runtime_image_bounds(),
            seen: HashMap::new(),
        }
    }

    pub fn with_runtime_image(mut self, base: usize, end: usize) -> Takeover<'a> {
        self.runtime_image = (base, end);
        self
    }

    pub fn with_trampoline(mut self, trampoline: usize) -> Takeover<'a> {
        self.trampoline = trampoline;
        self
    }

    pub fn with_init_stub(mut self, stub: usize) -> Takeover<'a> {
        self.init_stub = Some(stub);
        self
    }

    /// Attach to every thread in the process. Returns false when at least
    /// one thread stayed native (takeover-partial); the runtime remains
    /// usable and those threads are caught at their next kernel
    /// transition.
    pub fn take_over_all_threads(&mut self) -> bool {
        // Holding a runtime lock while suspending peers invites deadlock
        // with whatever those peers hold.
        debug_assert_eq!(crate::sync::locks_held_by_current_thread(), 0);

        let mut all_ok = true;
        let self_tid = self.kernel.current_thread_id();
        let passes = self.options.takeover_passes.max(1);
        for pass in 0..passes {
            let found = self.enumerate_threads();
            let mut new_threads = 0;
            for (tid, handle) in found {
                if self.seen.contains_key(&tid) {
                    if let Some(h) = handle {
                        let _ = self.kernel.close_handle(h);
                    }
                    continue;
                }
                new_threads += 1;
                if tid == self_tid {
                    if let Some(h) = handle {
                        let _ = self.kernel.close_handle(h);
                    }
                    self.seen.insert(
                        tid,
                        ThreadListEntry {
                            handle: NT_CURRENT_THREAD,
                            tid,
                            state: ThreadListState::Success,
                            suspended: false,
                        },
                    );
                    continue;
                }
                let target = match handle {
                    Some(h) => TargetThread::from_handle(self.kernel, h),
                    None => TargetThread::open(self.kernel, tid),
                };
                let target = match target {
                    Ok(t) => t,
                    Err(status) => {
                        // Gone between enumeration and open: ignore.
                        log!(
                            LogLevel::LogDebug,
                            "thread {} vanished before open: {:?}",
                            tid,
                            status
                        );
                        self.seen.insert(
                            tid,
                            ThreadListEntry {
                                handle: Handle(0),
                                tid,
                                state: ThreadListState::Success,
                                suspended: false,
                            },
                        );
                        continue;
                    }
                };
                let (state, suspended) = self.attach_one(&target);
                if state == ThreadListState::Tried {
                    all_ok = false;
                }
                self.seen.insert(
                    tid,
                    ThreadListEntry {
                        handle: target.handle,
                        tid,
                        state,
                        suspended,
                    },
                );
            }
            if new_threads == 0 {
                break;
            }
            if pass + 1 == passes {
                syslog_once!(
                    LogLevel::LogWarn,
                    SyslogCode::TakeoverPassCap,
                    "threads kept appearing for {} attach passes",
                    passes
                );
            }
        }

        // Release everything this attach suspended, and drop the
        // pass-scoped handles; records keep their own duplicates.
        for entry in self.seen.values_mut() {
            if entry.suspended && entry.tid != self_tid {
                let _ = self.kernel.resume_thread(entry.handle);
            }
            if entry.handle != NT_CURRENT_THREAD && entry.handle.0 != 0 {
                let _ = self.kernel.close_handle(entry.handle);
                entry.handle = Handle(0);
            }
        }
        all_ok
    }

    /// Pass-scoped view of the thread list entries, for the caller's
    /// diagnostics.
    pub fn entries(&self) -> Vec<ThreadListEntry> {
        let mut v: Vec<ThreadListEntry> = self.seen.values().copied().collect();
        v.sort_by_key(|e| e.tid);
        v
    }

    /// Two enumeration back-ends: the keyed iterator on kernels that have
    /// it, the system-wide snapshot everywhere else.
    fn enumerate_threads(&self) -> Vec<(u32, Option<Handle>)> {
        if self
            .os
            .syscalls
            .number(SyscallName::GetNextThread)
            .is_ok()
        {
            let mut out: Vec<(u32, Option<Handle>)> = Vec::new();
            let mut prev: Option<Handle> = None;
            loop {
                match self.kernel.next_thread(prev) {
                    Ok(h) => match self.kernel.thread_id_of(h) {
                        Ok(tid) => {
                            out.push((tid, Some(h)));
                            prev = Some(h);
                        }
                        Err(_) => {
                            let _ = self.kernel.close_handle(h);
                            break;
                        }
                    },
                    // NO_MORE_ENTRIES ends the walk; anything else on the
                    // first call means the iterator is unusable on this
                    // kernel and the snapshot below takes over.
                    Err(_) => break,
                }
            }
            if !out.is_empty() {
                return out;
            }
        }
        match self.kernel.system_thread_ids() {
            Ok(tids) => tids.into_iter().map(|tid| (tid, None)).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn in_runtime_image(&self, pc: usize) -> bool {
        let (base, end) = self.runtime_image;
        base != 0 && pc >= base && pc < end
    }

    fn at_init_stub(&self, pc: usize) -> bool {
        match self.init_stub {
            Some(stub) => pc == stub,
            None => false,
        }
    }

    /// Suspend and redirect one thread. Returns its list state and
    /// whether it is still suspended (owed a resume at loop end).
    fn attach_one(&self, target: &TargetThread) -> (ThreadListState, bool) {
        match target.suspend() {
            Ok(_) => {}
            Err(status) if is_terminating_status(status) => {
                // Died between enumeration and suspension: not a failure.
                log!(
                    LogLevel::LogDebug,
                    "thread {} is terminating; ignored",
                    target.tid
                );
                return (ThreadListState::Success, false);
            }
            Err(status) => {
                log!(
                    LogLevel::LogDebug,
                    "cannot suspend thread {}: {:?}",
                    target.tid,
                    status
                );
                return (ThreadListState::Tried, false);
            }
        }

        let arch = if self.os.user_64bit {
            SupportedArch::X64
        } else {
            SupportedArch::X86
        };
        let mut ctx = match target.context(arch) {
            Ok(c) => c,
            Err(_) => {
                let _ = target.resume();
                return (ThreadListState::Tried, false);
            }
        };
        let pc = ctx.ip();

        if self.in_runtime_image(pc) || self.at_init_stub(pc) {
            // Already ours, or a brand-new thread parked at the init stub
            // that will register itself.
            return (ThreadListState::Success, true);
        }

        if self.table.contains(target.tid) {
            // A previous attempt exists. If the redirect stuck (the thread
            // sits at the trampoline, or it already claimed its record)
            // there is nothing to redo; otherwise the old context write
            // never landed and the attach is retried from scratch.
            if pc == self.trampoline || self.table.is_in_progress(target.tid) {
                return (ThreadListState::Success, true);
            }
            if let Some(old) = self.table.remove(target.tid) {
                let _ = self.kernel.close_handle(old.thread_handle);
            }
        }

        if self.os.wow64 {
            match self.attach_wow64(target) {
                Wow64Outcome::Done => return (ThreadListState::Success, true),
                Wow64Outcome::SkipThread => {
                    let _ = target.resume();
                    return (ThreadListState::Tried, false);
                }
                Wow64Outcome::Error => {
                    let _ = target.resume();
                    return (ThreadListState::Tried, false);
                }
                Wow64Outcome::NotInWindow => {}
            }
        }

        // Plain path: reserve, redirect, publish.
        if !self.table.reserve(target.tid) {
            // Another attacher claimed this tid first.
            return (ThreadListState::Success, true);
        }
        let dup = match target.duplicate_handle() {
            Ok(h) => h,
            Err(_) => {
                self.table.unreserve(target.tid);
                let _ = target.resume();
                return (ThreadListState::Tried, false);
            }
        };
        ctx.set_ip(self.trampoline);
        match target.set_context(&ctx) {
            Ok(()) => {
                self.table.install(Box::new(TakeoverRecord {
                    tid: target.tid,
                    continuation_pc: pc,
                    in_progress: AtomicBool::new(false),
                    saved_stack_word: None,
                    saved_r14_word: None,
                    thread_handle: dup,
                    x64_context: None,
                }));
                log!(
                    LogLevel::LogDebug,
                    "took over thread {} at {:#x}",
                    target.tid,
                    pc
                );
                (ThreadListState::Success, true)
            }
            Err(status) => {
                // Leave it native; the syscall interception path will
                // pick it up at its next kernel transition.
                log!(
                    LogLevel::LogDebug,
                    "set-context on thread {} failed: {:?}",
                    target.tid,
                    status
                );
                self.table.unreserve(target.tid);
                let _ = self.kernel.close_handle(dup);
                let _ = target.resume();
                (ThreadListState::Tried, false)
            }
        }
    }

    /// Handle the 32-on-64 transition windows: when the wide instruction
    /// pointer sits inside the emulation stub's save or restore sequence,
    /// redirect by replacing the in-flight 32-bit return address wherever
    /// it currently lives.
    fn attach_wow64(&self, target: &TargetThread) -> Wow64Outcome {
        let wide = match target.wide_context() {
            Ok(w) => w,
            Err(_) => return Wow64Outcome::Error,
        };
        if wide.rip > u32::max_value() as u64 {
            // Deep inside 64-bit kernel-adjacent code; no rewrite is
            // possible or safe.
            log!(
                LogLevel::LogDebug,
                "thread {} wide ip {:#x} above the 32-bit range; skipped",
                target.tid,
                wide.rip
            );
            return Wow64Outcome::SkipThread;
        }
        let mut code = [0u8; 16];
        let n = safe_mem::safe_read(self.kernel, AppPtr::new(wide.rip as usize), &mut code);
        let case = match classify(wow64_cases(self.os.version.generation()), &code[..n]) {
            Some(c) => c,
            None => return Wow64Outcome::NotInWindow,
        };

        // Locate the in-flight return address.
        let (slot_addr, original) = match case.rewrite {
            Wow64Rewrite::StackSlot => {
                let addr = wide.rsp as usize;
                match safe_read_u32(self.kernel, addr) {
                    Some(v) => (Some(addr), v),
                    None => return Wow64Outcome::Error,
                }
            }
            Wow64Rewrite::R14Slot => {
                let addr = wide.r14 as usize;
                match safe_read_u32(self.kernel, addr) {
                    Some(v) => (Some(addr), v),
                    None => return Wow64Outcome::Error,
                }
            }
            Wow64Rewrite::R8Reg => (None, wide.r8d()),
            Wow64Rewrite::R9Reg => (None, wide.r9d()),
        };

        // The continuation must sit right after the 32-bit call gate; a
        // mismatch means this is not the transition we think it is.
        if !call_gate_precedes(self.kernel, original as usize) {
            log!(
                LogLevel::LogDebug,
                "thread {}: no call gate before {:#x}; window rejected",
                target.tid,
                original
            );
            return Wow64Outcome::SkipThread;
        }

        if !self.table.reserve(target.tid) {
            return Wow64Outcome::Done;
        }
        let dup = match target.duplicate_handle() {
            Ok(h) => h,
            Err(_) => {
                self.table.unreserve(target.tid);
                return Wow64Outcome::Error;
            }
        };

        let mut saved_stack_word = None;
        let mut saved_r14_word = None;
        match case.rewrite {
            Wow64Rewrite::StackSlot | Wow64Rewrite::R14Slot => {
                let addr = match slot_addr {
                    Some(a) => a,
                    None => unreachable!(),
                };
                if !safe_write_u32(self.kernel, addr, self.trampoline as u32) {
                    self.table.unreserve(target.tid);
                    let _ = self.kernel.close_handle(dup);
                    return Wow64Outcome::Error;
                }
                let word = SavedWord {
                    addr,
                    original,
                };
                if case.rewrite == Wow64Rewrite::StackSlot {
                    saved_stack_word = Some(word);
                } else {
                    saved_r14_word = Some(word);
                }
            }
            Wow64Rewrite::R8Reg | Wow64Rewrite::R9Reg => {
                let mut modified = wide;
                if case.rewrite == Wow64Rewrite::R8Reg {
                    modified.set_r8d(self.trampoline as u32);
                } else {
                    modified.set_r9d(self.trampoline as u32);
                }
                if target.set_wide_context(&modified).is_err() {
                    self.table.unreserve(target.tid);
                    let _ = self.kernel.close_handle(dup);
                    return Wow64Outcome::Error;
                }
            }
        }

        self.table.install(Box::new(TakeoverRecord {
            tid: target.tid,
            continuation_pc: original as usize,
            in_progress: AtomicBool::new(false),
            saved_stack_word,
            saved_r14_word,
            thread_handle: dup,
            // The full wide file, so revert can reconstruct the original
            // state exactly.
            x64_context: Some(Box::new(wide)),
        }));
        log!(
            LogLevel::LogDebug,
            "took over thread {} in the {:?} window via {:?}",
            target.tid,
            case.window,
            case.rewrite
        );
        Wow64Outcome::Done
    }
}

fn safe_read_u32(kernel: &dyn Kernel, addr: usize) -> Option<u32> {
    let mut buf = [0u8; 4];
    if safe_mem::safe_read_exact(kernel, AppPtr::new(addr), &mut buf) {
        Some(u32::from_le_bytes(buf))
    } else {
        None
    }
}

fn safe_write_u32(kernel: &dyn Kernel, addr: usize, value: u32) -> bool {
    safe_mem::safe_write(kernel, AppPtr::new(addr), &value.to_le_bytes())
}

fn call_gate_precedes(kernel: &dyn Kernel, continuation: usize) -> bool {
    if continuation < WOW64_CALL_GATE.len() {
        return false;
    }
    let mut buf = [0u8; 7];
    if !safe_mem::safe_read_exact(
        kernel,
        AppPtr::new(continuation - WOW64_CALL_GATE.len()),
        &mut buf,
    ) {
        return false;
    }
    buf == WOW64_CALL_GATE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nt::types::{OsNumbers, PAGE_EXECUTE_READ, PAGE_READWRITE, PAGE_SIZE};
    use crate::os_version::{OsInfo, WindowsVersion};
    use crate::syscall_numbers::{latest_known, table_for, TableColumn, TableFamily};
    use crate::testing::FakeKernel;

    const TRAMPOLINE: usize = 0x0070_0000;

    fn os_native_x64() -> OsInfo {
        OsInfo {
            version: WindowsVersion::Win10_1803,
            family: TableFamily::X64,
            syscalls: latest_known(TableFamily::X64),
            numbers: OsNumbers {
                major: 10,
                minor: 0,
                sp_major: 0,
                sp_minor: 0,
                build: 17134,
            },
            edition: String::new(),
            release: String::new(),
            user_64bit: true,
            wow64: false,
        }
    }

    fn os_wow64(version: WindowsVersion) -> OsInfo {
        let mut os = os_native_x64();
        os.version = version;
        os.user_64bit = false;
        os.wow64 = true;
        os
    }

    #[test]
    fn attach_self_plus_one() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0040_1234);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());

        assert_eq!(table.active_tids(), vec![2]);
        table
            .with_record(2, |r| {
                assert_eq!(r.continuation_pc, 0x0040_1234);
                assert!(r.saved_stack_word.is_none());
            })
            .unwrap();
        assert_eq!(kernel.thread_context(2).ip(), TRAMPOLINE);
    }

    #[test]
    fn taken_over_thread_resumes_at_the_trampoline_and_continues() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0040_1234);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());

        // The thread is runnable again and its first instruction under
        // runtime control is the trampoline entry.
        assert_eq!(kernel.thread_suspend_count(2), 0);
        assert_eq!(kernel.thread_context(2).ip(), TRAMPOLINE);
        // When it runs, the trampoline hands back the continuation.
        let continuation = trampoline::attach_finish(&kernel, &table, 2).unwrap();
        assert_eq!(continuation, 0x0040_1234);
        assert!(table.is_empty());
    }

    #[test]
    fn suspend_failure_is_partial_not_fatal() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0040_0000);
        kernel.add_thread(3, 0x0041_0000);
        kernel.fail_suspend_of(2);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(!takeover.take_over_all_threads(), "partial attach");
        // The healthy thread is still taken over.
        assert_eq!(table.active_tids(), vec![3]);
        let entries = takeover.entries();
        let e2 = entries.iter().find(|e| e.tid == 2).unwrap();
        assert_eq!(e2.state, ThreadListState::Tried);
    }

    #[test]
    fn set_context_failure_leaves_thread_native() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0040_0000);
        kernel.fail_set_context_of(2);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(!takeover.take_over_all_threads());
        assert!(table.is_empty(), "no record, no sentinel");
        assert_eq!(kernel.thread_context(2).ip(), 0x0040_0000);
        assert_eq!(kernel.thread_suspend_count(2), 0, "resumed and native");
    }

    #[test]
    fn terminating_thread_is_ignored_without_failing_attach() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0040_0000);
        kernel.kill_thread(2);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());
        assert!(table.is_empty());
    }

    #[test]
    fn late_appearing_threads_are_caught_by_a_later_pass() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0040_0000);
        // Visible only from the second enumeration onward.
        kernel.add_thread_visible_after(9, 0x0042_0000, 2);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());
        assert_eq!(table.active_tids(), vec![2, 9]);
    }

    #[test]
    fn threads_inside_the_runtime_image_are_not_redirected() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x7F70_1234);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover = Takeover::new(&kernel, &table, &os, &options)
            .with_trampoline(TRAMPOLINE)
            .with_runtime_image(0x7F70_0000, 0x7F71_0000);
        assert!(takeover.take_over_all_threads());
        assert!(table.is_empty());
        assert_eq!(kernel.thread_context(2).ip(), 0x7F70_1234);
    }

    #[test]
    fn init_stub_threads_are_left_to_register_themselves() {
        let kernel = FakeKernel::new();
        kernel.add_thread(2, 0x0077_0000);
        let table = TakeoverTable::new();
        let os = os_native_x64();
        let options = Options::default();
        let mut takeover = Takeover::new(&kernel, &table, &os, &options)
            .with_trampoline(TRAMPOLINE)
            .with_init_stub(0x0077_0000);
        assert!(takeover.take_over_all_threads());
        assert!(table.is_empty());
    }

    #[test]
    fn snapshot_backend_is_used_when_the_iterator_is_missing() {
        let kernel = FakeKernel::new();
        kernel.set_supports_next_thread(false);
        kernel.add_thread(2, 0x0040_0000);
        let table = TakeoverTable::new();
        // A table without the iterator syscall forces the snapshot.
        let mut os = os_native_x64();
        os.syscalls = table_for(TableFamily::X64, TableColumn::Ws03);
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());
        assert_eq!(table.active_tids(), vec![2]);
    }

    // --- 32-on-64 cases ---

    fn setup_wow64_save_window(kernel: &FakeKernel, tid: u32) -> (usize, usize) {
        // Stub code page with the Win10 save-entry sequence.
        let stub = 0x0066_0000;
        kernel.commit(stub, PAGE_SIZE, PAGE_EXECUTE_READ);
        kernel.poke_bytes(stub, &[0x4C, 0x87, 0xF4, 0x45, 0x8B, 0x06, 0x90, 0x90]);
        // 32-bit stack carrying the in-flight return address.
        let stack = 0x0012_F000;
        kernel.commit(0x0012_F000, PAGE_SIZE, PAGE_READWRITE);
        let continuation: u32 = 0x0040_1234;
        kernel.poke_bytes(stack, &continuation.to_le_bytes());
        // The call gate right before the continuation.
        kernel.commit(0x0040_1000, PAGE_SIZE, PAGE_EXECUTE_READ);
        kernel.poke_bytes(0x0040_1234 - WOW64_CALL_GATE.len(), &WOW64_CALL_GATE);

        kernel.set_wow64(true);
        kernel.add_thread(tid, 0x0040_9999);
        let mut wide = crate::registers::Context64::default();
        wide.rip = stub as u64;
        wide.rsp = stack as u64;
        wide.r14 = 0x0013_0000;
        kernel.set_thread_wide_context(tid, wide);
        (stub, stack)
    }

    #[test]
    fn wow64_save_window_rewrites_the_stack_slot() {
        let kernel = FakeKernel::new();
        let (_stub, stack) = setup_wow64_save_window(&kernel, 2);
        let table = TakeoverTable::new();
        let os = os_wow64(WindowsVersion::Win10_1803);
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());

        // The stack word now routes to the trampoline.
        assert_eq!(
            kernel.peek_bytes(stack, 4),
            (TRAMPOLINE as u32).to_le_bytes()
        );
        table
            .with_record(2, |r| {
                assert_eq!(r.continuation_pc, 0x0040_1234);
                assert_eq!(
                    r.saved_stack_word,
                    Some(SavedWord {
                        addr: stack,
                        original: 0x0040_1234,
                    })
                );
                assert!(r.saved_r14_word.is_none());
                let wide = r.x64_context.as_ref().unwrap();
                assert_eq!(wide.rsp, stack as u64);
            })
            .unwrap();
        // The narrow context was never touched.
        assert_eq!(kernel.thread_context(2).ip(), 0x0040_9999);
    }

    #[test]
    fn wow64_register_case_sets_r8d_in_the_wide_context() {
        let kernel = FakeKernel::new();
        kernel.set_wow64(true);
        // Win8 second save instruction: return address about to enter r8d.
        let stub = 0x0066_0000;
        kernel.commit(stub, PAGE_SIZE, PAGE_EXECUTE_READ);
        kernel.poke_bytes(stub, &[0x45, 0x8B, 0x06, 0x90]);
        kernel.commit(0x0040_1000, PAGE_SIZE, PAGE_EXECUTE_READ);
        kernel.poke_bytes(0x0040_1234 - WOW64_CALL_GATE.len(), &WOW64_CALL_GATE);
        kernel.add_thread(2, 0x0040_9999);
        let mut wide = crate::registers::Context64::default();
        wide.rip = stub as u64;
        wide.r8 = 0x0040_1234;
        kernel.set_thread_wide_context(2, wide);

        let table = TakeoverTable::new();
        let os = os_wow64(WindowsVersion::Win81);
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());

        assert_eq!(kernel.thread_wide_context(2).r8d(), TRAMPOLINE as u32);
        table
            .with_record(2, |r| {
                assert_eq!(r.continuation_pc, 0x0040_1234);
                // Original register file kept for revert.
                assert_eq!(r.x64_context.as_ref().unwrap().r8d(), 0x0040_1234);
            })
            .unwrap();
    }

    #[test]
    fn wow64_thread_above_the_32bit_range_is_skipped() {
        let kernel = FakeKernel::new();
        kernel.set_wow64(true);
        kernel.add_thread(2, 0x0040_9999);
        let mut wide = crate::registers::Context64::default();
        wide.rip = 0x7FFE_0001_0000;
        kernel.set_thread_wide_context(2, wide);

        let table = TakeoverTable::new();
        let os = os_wow64(WindowsVersion::Win10_1803);
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(!takeover.take_over_all_threads(), "skipped thread is partial");
        assert!(table.is_empty());
        assert_eq!(kernel.thread_context(2).ip(), 0x0040_9999, "left native");
    }

    #[test]
    fn wow64_outside_any_window_takes_the_narrow_path() {
        let kernel = FakeKernel::new();
        kernel.set_wow64(true);
        // Ordinary 32-bit user code at the wide ip too.
        let code = 0x0041_0000;
        kernel.commit(code, PAGE_SIZE, PAGE_EXECUTE_READ);
        kernel.poke_bytes(code, &[0x55, 0x8B, 0xEC]);
        kernel.add_thread(2, code);
        let mut wide = crate::registers::Context64::default();
        wide.rip = code as u64;
        kernel.set_thread_wide_context(2, wide);

        let table = TakeoverTable::new();
        let os = os_wow64(WindowsVersion::Win10_1803);
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(takeover.take_over_all_threads());
        assert_eq!(kernel.thread_context(2).ip(), TRAMPOLINE);
        table
            .with_record(2, |r| {
                assert_eq!(r.continuation_pc, code);
                assert!(r.x64_context.is_none());
            })
            .unwrap();
    }

    #[test]
    fn wow64_window_without_call_gate_is_rejected() {
        let kernel = FakeKernel::new();
        let (_stub, stack) = setup_wow64_save_window(&kernel, 2);
        // Clobber the gate bytes.
        kernel.poke_bytes(0x0040_1234 - WOW64_CALL_GATE.len(), &[0x90; 7]);
        let table = TakeoverTable::new();
        let os = os_wow64(WindowsVersion::Win10_1803);
        let options = Options::default();
        let mut takeover =
            Takeover::new(&kernel, &table, &os, &options).with_trampoline(TRAMPOLINE);
        assert!(!takeover.take_over_all_threads());
        assert!(table.is_empty());
        // The stack word is untouched.
        assert_eq!(kernel.peek_bytes(stack, 4), 0x0040_1234u32.to_le_bytes());
    }
}
