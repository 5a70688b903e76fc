//! The final terminate syscall.
//!
//! Three constraints shape this module. The argument block must live in
//! runtime-owned read-only memory, never on the app stack, so a hostile
//! stack cannot redirect the exit (the tombstones). On dispatch
//! conventions that write to the stack while executing the syscall
//! wrapper, the call must run on a dedicated stack that is never unmapped
//! and needs no lock to use (the termination stack). And on the graceful
//! path every runtime lock must be released strictly before the final
//! syscall, which the lock-counting layer lets us assert structurally.

use crate::log::{LogLevel, SyslogCode};
use crate::nt::types::*;
use crate::nt::Kernel;
use crate::os_version::OsInfo;
use crate::sync::{DataSectionGuard, Mutex};
use crate::syscall_numbers::SyscallName;
use crate::takeover::trampoline;
use std::cell::UnsafeCell;
use std::mem;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TerminateKind {
    Process,
    Thread,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CleanupKind {
    /// Release locks, let the code cache clean up, then exit.
    Graceful,
    /// Straight to the kernel.
    Abrupt,
}

/// How this process reaches the kernel.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallMethod {
    /// Legacy gate; the raw stub falls back to it when sysenter is
    /// unavailable.
    Int2e,
    Sysenter,
    Syscall,
    /// Through the 32-on-64 gate.
    Wow64,
}

pub fn syscall_method(os: &OsInfo) -> SyscallMethod {
    if os.wow64 {
        SyscallMethod::Wow64
    } else if os.user_64bit {
        SyscallMethod::Syscall
    } else {
        // Every supported native 32-bit kernel dispatches via sysenter.
        SyscallMethod::Sysenter
    }
}

/// Offset of the argument struct from the tombstone base, mandated by the
/// dispatch convention: one return-address slot.
pub const SYSCALL_PARAM_OFFSET: usize = mem::size_of::<usize>();

/// The immutable argument block for the final syscall. The fields are
/// atomics only so the two patched words (fake return address at init,
/// exit code for the custom variant) can be written under the
/// data-section guard without tearing; after init the block is read-only
/// in every practical sense.
#[repr(C)]
pub struct Tombstone {
    /// Slot the kernel's exit path returns through if the terminate call
    /// itself fails; points at a halt loop.
    pub fake_ret: AtomicUsize,
    /// Current-process or current-thread sentinel.
    pub handle: AtomicUsize,
    /// Exit code passed to the kernel.
    pub exit_code: AtomicU32,
    _pad: u32,
}

const_assert_eq!(mem::size_of::<Tombstone>(), 2 * mem::size_of::<usize>() + 8);

impl Tombstone {
    const fn new(handle: usize, exit_code: u32) -> Tombstone {
        Tombstone {
            fake_ret: AtomicUsize::new(0),
            handle: AtomicUsize::new(handle),
            exit_code: AtomicU32::new(exit_code),
            _pad: 0,
        }
    }
}

/// Normal process exit, code 0.
pub static PROCESS_TOMBSTONE: Tombstone = Tombstone::new(usize::max_value(), 0);
/// Normal thread exit, code 0.
pub static THREAD_TOMBSTONE: Tombstone = Tombstone::new(usize::max_value() - 1, 0);
/// Variant whose exit code is patched per call.
pub static CUSTOM_CODE_TOMBSTONE: Tombstone = Tombstone::new(usize::max_value(), 0);
/// Sysenter-dispatch variant: its fake return address points at the
/// runtime-internal sysenter return label instead of the halt loop.
pub static SYSENTER_TOMBSTONE: Tombstone = Tombstone::new(usize::max_value(), 0);

/// Resolve the label-dependent slots. Runs once during startup, under the
/// data-section guard like every tombstone mutation.
pub fn init_tombstones() {
    let _unprot = DataSectionGuard::enter();
    let halt = trampoline::debug_halt_address();
    PROCESS_TOMBSTONE.fake_ret.store(halt, Ordering::Release);
    THREAD_TOMBSTONE.fake_ret.store(halt, Ordering::Release);
    CUSTOM_CODE_TOMBSTONE.fake_ret.store(halt, Ordering::Release);
    SYSENTER_TOMBSTONE
        .fake_ret
        .store(trampoline::sysenter_return_address(), Ordering::Release);
}

/// The single-entry stack the final syscall runs on when the dispatch
/// convention writes to the stack mid-call. Reserved at module load,
/// never unmapped, always writable.
#[repr(align(16))]
struct TerminationStack(UnsafeCell<[u8; TERMINATION_STACK_SIZE]>);

// One writer by construction: abrupt exit is reached by a single thread,
// and graceful exit uses the per-thread TEB slot instead.
unsafe impl Sync for TerminationStack {}

const TERMINATION_STACK_SIZE: usize = 64;

static GLOBAL_TERMINATION_STACK: TerminationStack =
    TerminationStack(UnsafeCell::new([0; TERMINATION_STACK_SIZE]));

pub fn global_termination_stack_base() -> usize {
    GLOBAL_TERMINATION_STACK.0.get() as usize
}

/// The code-cache collaborator: given the resolved syscall number and
/// arguments, it tears down the cache and issues the call (not returning
/// on success).
pub trait CodeCache: Sync {
    fn cleanup_and_terminate(
        &self,
        syscall_number: u32,
        arg0: usize,
        arg1: usize,
        exit_process: bool,
    );
}

lazy_static! {
    static ref CODE_CACHE: RwLock<Option<&'static dyn CodeCache>> = RwLock::new(None);
    /// Serializes concurrent fatal paths so two aborts cannot interleave
    /// their tombstone writes.
    static ref TERMINATE_LOCK: Mutex<()> = Mutex::new(());
}

pub fn install_code_cache(cache: &'static dyn CodeCache) {
    if let Ok(mut c) = CODE_CACHE.write() {
        *c = Some(cache);
    }
}

pub struct Terminator<'a> {
    kernel: &'a dyn Kernel,
    os: &'a OsInfo,
}

impl<'a> Terminator<'a> {
    pub fn new(kernel: &'a dyn Kernel, os: &'a OsInfo) -> Terminator<'a> {
        Terminator { kernel, os }
    }

    /// Issue the final terminate. Does not return on success against a
    /// real kernel; the returned status is the failure (or the test
    /// kernel's answer).
    pub fn terminate(
        &self,
        kind: TerminateKind,
        cleanup: CleanupKind,
        custom_code: bool,
        exit_code: u32,
    ) -> NtStatus {
        // A thread exit that would leave the process empty is a process
        // exit.
        let kind = self.promote_if_last(kind);

        let (name, handle_word) = match kind {
            TerminateKind::Process => (SyscallName::TerminateProcess, NT_CURRENT_PROCESS),
            TerminateKind::Thread => (SyscallName::TerminateThread, NT_CURRENT_THREAD),
        };
        // Missing table entries fail here, cleanly, instead of issuing a
        // wrong syscall.
        let number = match self.os.syscalls.number(name) {
            Ok(n) => n,
            Err(status) => return status,
        };

        let tombstone: &'static Tombstone = {
            // Two concurrent fatal paths must not interleave their
            // tombstone writes.
            let _serialize = TERMINATE_LOCK.lock();
            let tombstone = self.select_tombstone(kind, custom_code);
            if custom_code {
                let _unprot = DataSectionGuard::enter();
                // Single word, release order: no reader ever sees a torn
                // code.
                tombstone.exit_code.store(exit_code, Ordering::Release);
            }
            if self.os.wow64 {
                self.stage_wow64_args(cleanup, tombstone);
            }
            tombstone
            // Serialization lock drops here, strictly before the final
            // syscall.
        };
        debug_assert_eq!(
            crate::sync::locks_held_by_current_thread(),
            0,
            "no runtime lock may be held across the final syscall"
        );

        let code = tombstone.exit_code.load(Ordering::Acquire);
        match cleanup {
            CleanupKind::Graceful => {
                let cache: Option<&'static dyn CodeCache> =
                    CODE_CACHE.read().ok().and_then(|c| *c);
                if let Some(cache) = cache {
                    cache.cleanup_and_terminate(
                        number,
                        tombstone.handle.load(Ordering::Acquire),
                        code as usize,
                        kind == TerminateKind::Process,
                    );
                }
            }
            CleanupKind::Abrupt => {
                crate::log::syslog(
                    LogLevel::LogError,
                    SyslogCode::AbruptExit,
                    &format!("abrupt {:?} exit, code {}", kind, code),
                );
            }
        }

        match kind {
            TerminateKind::Process => self.kernel.terminate_process(handle_word, code),
            TerminateKind::Thread => self.kernel.terminate_thread(handle_word, code),
        }
    }

    fn promote_if_last(&self, kind: TerminateKind) -> TerminateKind {
        if kind == TerminateKind::Thread {
            let alive = self
                .kernel
                .system_thread_ids()
                .map(|tids| tids.len())
                .unwrap_or(2);
            if alive <= 1 {
                return TerminateKind::Process;
            }
        }
        kind
    }

    fn select_tombstone(&self, kind: TerminateKind, custom_code: bool) -> &'static Tombstone {
        if custom_code {
            // The custom variant carries the process sentinel; a custom
            // thread exit patches the same block's handle word.
            let _unprot = DataSectionGuard::enter();
            let handle = match kind {
                TerminateKind::Process => NT_CURRENT_PROCESS,
                TerminateKind::Thread => NT_CURRENT_THREAD,
            };
            CUSTOM_CODE_TOMBSTONE
                .handle
                .store(handle.0, Ordering::Release);
            return &CUSTOM_CODE_TOMBSTONE;
        }
        match (syscall_method(self.os), kind) {
            (SyscallMethod::Sysenter, TerminateKind::Process) => &SYSENTER_TOMBSTONE,
            (_, TerminateKind::Process) => &PROCESS_TOMBSTONE,
            (_, TerminateKind::Thread) => &THREAD_TOMBSTONE,
        }
    }

    /// The 32-on-64 final syscall writes to the stack while executing;
    /// stage the tombstone-derived arguments on the dedicated slot. For
    /// cleanup exits the per-thread TEB slot avoids sharing; the global
    /// single-entry stack is the fallback and the abrupt path, which only
    /// one thread can reach.
    fn stage_wow64_args(&self, cleanup: CleanupKind, tombstone: &Tombstone) -> usize {
        let slot = match cleanup {
            CleanupKind::Graceful => self.kernel.teb_scratch_slot(None),
            CleanupKind::Abrupt => None,
        };
        let base = match slot {
            Some(addr) => addr,
            None => global_termination_stack_base(),
        };
        let mut staged = [0u8; 3 * mem::size_of::<usize>()];
        let words = [
            tombstone.fake_ret.load(Ordering::Acquire),
            tombstone.handle.load(Ordering::Acquire),
            tombstone.exit_code.load(Ordering::Acquire) as usize,
        ];
        for (i, w) in words.iter().enumerate() {
            staged[i * mem::size_of::<usize>()..(i + 1) * mem::size_of::<usize>()]
                .copy_from_slice(&w.to_le_bytes());
        }
        if base == global_termination_stack_base() {
            // Our own static; a direct write, no kernel round trip.
            unsafe {
                let dst = GLOBAL_TERMINATION_STACK.0.get() as *mut u8;
                std::ptr::copy_nonoverlapping(staged.as_ptr(), dst, staged.len());
            }
        } else {
            let _ = crate::safe_mem::safe_write(
                self.kernel,
                crate::app_ptr::AppPtr::new(base),
                &staged,
            );
        }
        base
    }
}
