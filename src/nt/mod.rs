//! The kernel seam.
//!
//! Every native capability the core consumes is a method here; nothing
//! above this module issues a syscall directly. The production backend
//! (`direct`, Windows targets only) invokes the kernel by ordinal from the
//! frozen syscall table; tests supply an in-memory kernel.

pub mod pe;
pub mod types;

#[cfg(all(target_os = "windows", any(target_arch = "x86", target_arch = "x86_64")))]
pub mod direct;

use crate::registers::{Context, Context64};
pub use types::{Handle, MemoryBasicInformation, NtStatus, OsNumbers};
pub use types::{NT_CURRENT_PROCESS, NT_CURRENT_THREAD};

/// Entries of the per-process device map: drive letter and the native
/// target it is a symbolic link to (e.g. `('C', "\Device\HarddiskVolume2")`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveEntry {
    pub letter: u8,
    pub target: String,
}

/// The narrow capability surface the core needs from the kernel.
///
/// All memory operations are explicit about the process handle because the
/// takeover path occasionally works on another process's view (duplicated
/// handles); almost every caller passes [`NT_CURRENT_PROCESS`].
///
/// Methods return the raw status verbatim; classification into the error
/// taxonomy happens in the subsystem that knows what the failure means.
pub trait Kernel: Sync {
    // --- virtual memory ---

    fn query_virtual_memory(
        &self,
        process: Handle,
        addr: usize,
    ) -> Result<MemoryBasicInformation, NtStatus>;

    /// Reserve and/or commit. Returns `(base, actual_size)`.
    fn allocate_virtual_memory(
        &self,
        process: Handle,
        preferred: usize,
        size: usize,
        alloc_type: u32,
        protect: u32,
    ) -> Result<(usize, usize), NtStatus>;

    fn free_virtual_memory(
        &self,
        process: Handle,
        base: usize,
        size: usize,
        free_type: u32,
    ) -> Result<(), NtStatus>;

    /// Returns the previous protection of the first page in the range.
    fn protect_virtual_memory(
        &self,
        process: Handle,
        base: usize,
        size: usize,
        protect: u32,
    ) -> Result<u32, NtStatus>;

    /// Foreign-memory read. Returns bytes copied; partial copies come back
    /// as `Ok(n < buf.len())` with the kernel's partial-copy status folded
    /// in.
    fn read_virtual_memory(
        &self,
        process: Handle,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<usize, NtStatus>;

    /// Foreign-memory write. `Ok(None)` means the kernel performed the
    /// write but did not report a count (newest kernels).
    fn write_virtual_memory(
        &self,
        process: Handle,
        addr: usize,
        buf: &[u8],
    ) -> Result<Option<usize>, NtStatus>;

    fn flush_instruction_cache(
        &self,
        process: Handle,
        addr: usize,
        size: usize,
    ) -> Result<(), NtStatus>;

    /// Ceiling of user-mode addresses; anything above is kernel space.
    fn highest_user_address(&self) -> usize;

    // --- threads ---

    fn current_thread_id(&self) -> u32;

    fn open_thread(&self, tid: u32) -> Result<Handle, NtStatus>;

    fn duplicate_thread_handle(&self, thread: Handle) -> Result<Handle, NtStatus>;

    fn close_handle(&self, handle: Handle) -> Result<(), NtStatus>;

    /// Returns the previous suspend count.
    fn suspend_thread(&self, thread: Handle) -> Result<u32, NtStatus>;

    fn resume_thread(&self, thread: Handle) -> Result<u32, NtStatus>;

    fn get_context(&self, thread: Handle, ctx: &mut Context) -> Result<(), NtStatus>;

    fn set_context(&self, thread: Handle, ctx: &Context) -> Result<(), NtStatus>;

    /// Wide-context query: the authoritative 64-bit register file of a
    /// thread in a 32-on-64 process.
    fn get_context_x64(&self, thread: Handle, ctx: &mut Context64) -> Result<(), NtStatus>;

    fn set_context_x64(&self, thread: Handle, ctx: &Context64) -> Result<(), NtStatus>;

    /// Newer-kernel thread iterator. `None` for `prev` starts the walk;
    /// `Err(STATUS_NO_MORE_ENTRIES)` ends it. Returned handles are owned by
    /// the caller.
    fn next_thread(&self, prev: Option<Handle>) -> Result<Handle, NtStatus>;

    /// Legacy enumeration back-end: a system-wide snapshot filtered to the
    /// current process, as thread ids.
    fn system_thread_ids(&self) -> Result<Vec<u32>, NtStatus>;

    fn thread_id_of(&self, thread: Handle) -> Result<u32, NtStatus>;

    fn thread_start_address(&self, thread: Handle) -> Result<usize, NtStatus>;

    /// Only returns on failure (when aimed at the calling thread).
    fn terminate_thread(&self, thread: Handle, exit_code: u32) -> NtStatus;

    /// Only returns on failure (when aimed at the calling process).
    fn terminate_process(&self, process: Handle, exit_code: u32) -> NtStatus;

    // --- events ---

    fn create_event(&self) -> Result<Handle, NtStatus>;

    fn set_event(&self, event: Handle) -> Result<(), NtStatus>;

    fn reset_event(&self, event: Handle) -> Result<(), NtStatus>;

    /// `timeout_ms == 0` means wait forever, by the runtime's convention.
    /// Returns `STATUS_TIMEOUT` on expiry.
    fn wait_event(&self, event: Handle, timeout_ms: u32) -> NtStatus;

    // --- identification ---

    fn os_numbers(&self) -> OsNumbers;

    /// Whether the current process runs 32-bit code under a 64-bit kernel.
    fn is_wow64_process(&self) -> bool;

    /// Whether user mode in this process is 64-bit.
    fn user_is_64bit(&self) -> bool;

    /// Base address and mapped bytes of the loaded system DLL.
    fn system_dll_base(&self) -> usize;

    fn system_dll_image(&self) -> Vec<u8>;

    /// Optional edition/release strings. The single registry consumer in
    /// the core.
    fn registry_string(&self, key_path: &str, value_name: &str) -> Option<String>;

    // --- paths ---

    fn device_map(&self) -> Result<Vec<DriveEntry>, NtStatus>;

    /// Resolve one symbolic-link object to its target.
    fn query_symbolic_link(&self, path: &str) -> Result<String, NtStatus>;

    // --- per-thread scratch ---

    /// Address of the per-thread termination scratch slot inside the TEB,
    /// for the given thread or the caller. `None` when the kernel offers no
    /// such slot (pre-Win8 emulation layers); callers fall back to the
    /// global slot. Never cache the result across a suspension.
    fn teb_scratch_slot(&self, thread: Option<Handle>) -> Option<usize>;
}
