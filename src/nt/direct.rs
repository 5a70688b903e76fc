//! Production backend: invokes the kernel by ordinal.
//!
//! Nothing here goes through an import table. Syscall numbers come from the
//! frozen per-version table; the only ntdll addresses used are the two
//! wide-context helpers, resolved from the export directory by hand at
//! startup. Compiled for Windows x86/x86_64 targets only.

use super::types::*;
use super::{DriveEntry, Kernel};
use crate::os_version;
use crate::registers::{Context, Context64, NATIVE_ARCH};
use crate::syscall_numbers::SyscallName;
use std::sync::atomic::{AtomicUsize, Ordering};

// Offsets into the PEB/TEB we read directly. Fixed per bitness since NT 5.1.
#[cfg(target_arch = "x86_64")]
mod layout {
    pub const PEB_OS_MAJOR: usize = 0x118;
    pub const PEB_OS_MINOR: usize = 0x11C;
    pub const PEB_OS_BUILD: usize = 0x120;
    pub const PEB_OS_CSD: usize = 0x122;
    pub const TEB_TLS_SLOTS: usize = 0x1480;
}
#[cfg(target_arch = "x86")]
mod layout {
    pub const PEB_OS_MAJOR: usize = 0xA4;
    pub const PEB_OS_MINOR: usize = 0xA8;
    pub const PEB_OS_BUILD: usize = 0xAC;
    pub const PEB_OS_CSD: usize = 0xAE;
    pub const TEB_TLS_SLOTS: usize = 0xE10;
}

/// Index of the TLS slot reserved for the termination scratch word.
const TERM_SCRATCH_TLS_SLOT: usize = 63;

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    r#"
.globl wrest_do_syscall
wrest_do_syscall:
    push rbp
    mov rbp, rsp
    sub rsp, 0x68
    mov eax, ecx            # syscall number
    mov r11, r8             # argv
    cmp rdx, 4
    jbe 2f
    mov rcx, rdx
    sub rcx, 4              # stack-arg count
    xor r10, r10
1:
    mov r9, [r11 + 0x20 + r10*8]
    mov [rsp + 0x28 + r10*8], r9
    inc r10
    cmp r10, rcx
    jb 1b
2:
    mov r10, [r11]
    mov rdx, [r11 + 8]
    mov r8,  [r11 + 16]
    mov r9,  [r11 + 24]
    syscall
    mov rsp, rbp
    pop rbp
    ret
"#
);

#[cfg(target_arch = "x86")]
std::arch::global_asm!(
    r#"
.globl _wrest_do_syscall
_wrest_do_syscall:
    push ebp
    mov ebp, esp
    push esi
    push edi
    mov ecx, [ebp + 12]     # argc
    mov esi, [ebp + 16]     # argv
    mov eax, ecx
    shl eax, 2
    sub esp, eax
    mov edi, esp
    cld
    rep movsd               # copy args onto our stack
    mov eax, [ebp + 8]      # syscall number
    mov edx, esp            # int 2e takes the arg block in edx
    int 0x2e
    lea esp, [ebp - 8]
    pop edi
    pop esi
    pop ebp
    ret
"#
);

extern "C" {
    fn wrest_do_syscall(num: usize, argc: usize, argv: *const usize) -> i32;
}

unsafe fn raw_syscall(name: SyscallName, args: &[usize]) -> NtStatus {
    let num = match os_version::frozen() {
        Some(info) => match info.syscalls.number(name) {
            Ok(n) => n,
            Err(_) => return STATUS_NOT_IMPLEMENTED,
        },
        None => return STATUS_NOT_IMPLEMENTED,
    };
    NtStatus(wrest_do_syscall(num as usize, args.len(), args.as_ptr()))
}

#[cfg(target_arch = "x86_64")]
unsafe fn read_teb_word(offset: usize) -> usize {
    let teb: usize;
    std::arch::asm!("mov {}, gs:[0x30]", out(reg) teb);
    *((teb + offset) as *const usize)
}

#[cfg(target_arch = "x86")]
unsafe fn read_teb_word(offset: usize) -> usize {
    let teb: usize;
    std::arch::asm!("mov {}, fs:[0x18]", out(reg) teb);
    *((teb + offset) as *const usize)
}

#[cfg(target_arch = "x86_64")]
unsafe fn peb_address() -> usize {
    let peb: usize;
    std::arch::asm!("mov {}, gs:[0x60]", out(reg) peb);
    peb
}

#[cfg(target_arch = "x86")]
unsafe fn peb_address() -> usize {
    let peb: usize;
    std::arch::asm!("mov {}, fs:[0x30]", out(reg) peb);
    peb
}

#[cfg(target_arch = "x86_64")]
unsafe fn teb_address() -> usize {
    let teb: usize;
    std::arch::asm!("mov {}, gs:[0x30]", out(reg) teb);
    teb
}

#[cfg(target_arch = "x86")]
unsafe fn teb_address() -> usize {
    let teb: usize;
    std::arch::asm!("mov {}, fs:[0x18]", out(reg) teb);
    teb
}

#[cfg(target_arch = "x86")]
type WideContextFn = unsafe extern "system" fn(usize, *mut Context64) -> i32;

/// The real kernel. One instance per process; construction records the
/// system DLL base handed over by bootstrap.
pub struct DirectKernel {
    system_dll_base: AtomicUsize,
    /// Export-resolved helpers for the wide context of 32-on-64 threads.
    /// Null on native-width processes.
    wow64_get_context: AtomicUsize,
    wow64_set_context: AtomicUsize,
}

impl DirectKernel {
    pub const fn new() -> DirectKernel {
        DirectKernel {
            system_dll_base: AtomicUsize::new(0),
            wow64_get_context: AtomicUsize::new(0),
            wow64_set_context: AtomicUsize::new(0),
        }
    }

    pub fn set_system_dll_base(&self, base: usize) {
        self.system_dll_base.store(base, Ordering::Release);
    }

    /// Resolve the wide-context entry points from the mapped system DLL.
    /// Called once after bootstrap; takeover refuses wide-context work if
    /// this never ran.
    pub fn locate_wide_context_helpers(&self) {
        let base = self.system_dll_base.load(Ordering::Acquire);
        if base == 0 {
            return;
        }
        let image = self.system_dll_image();
        if let Some(pe) = super::pe::MappedPe::parse(&image) {
            if let Some(rva) = pe.export_rva("RtlWow64GetThreadContext") {
                self.wow64_get_context
                    .store(base + rva as usize, Ordering::Release);
            }
            if let Some(rva) = pe.export_rva("RtlWow64SetThreadContext") {
                self.wow64_set_context
                    .store(base + rva as usize, Ordering::Release);
            }
        }
    }
}

impl Kernel for DirectKernel {
    fn query_virtual_memory(
        &self,
        process: Handle,
        addr: usize,
    ) -> Result<MemoryBasicInformation, NtStatus> {
        let mut mbi = MemoryBasicInformation {
            base_address: 0,
            allocation_base: 0,
            allocation_protect: 0,
            region_size: 0,
            state: 0,
            protect: 0,
            mem_type: 0,
        };
        let mut returned: usize = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::QueryVirtualMemory,
                &[
                    process.0,
                    addr,
                    0, // MemoryBasicInformation class
                    &mut mbi as *mut _ as usize,
                    std::mem::size_of::<MemoryBasicInformation>(),
                    &mut returned as *mut _ as usize,
                ],
            )
        };
        if status.is_success() {
            Ok(mbi)
        } else {
            Err(status)
        }
    }

    fn allocate_virtual_memory(
        &self,
        process: Handle,
        preferred: usize,
        size: usize,
        alloc_type: u32,
        protect: u32,
    ) -> Result<(usize, usize), NtStatus> {
        let mut base = preferred;
        let mut actual = size;
        let status = unsafe {
            raw_syscall(
                SyscallName::AllocateVirtualMemory,
                &[
                    process.0,
                    &mut base as *mut _ as usize,
                    0,
                    &mut actual as *mut _ as usize,
                    alloc_type as usize,
                    protect as usize,
                ],
            )
        };
        if status.is_success() {
            Ok((base, actual))
        } else {
            Err(status)
        }
    }

    fn free_virtual_memory(
        &self,
        process: Handle,
        base: usize,
        size: usize,
        free_type: u32,
    ) -> Result<(), NtStatus> {
        let mut base = base;
        let mut size = if free_type == MEM_RELEASE { 0 } else { size };
        let status = unsafe {
            raw_syscall(
                SyscallName::FreeVirtualMemory,
                &[
                    process.0,
                    &mut base as *mut _ as usize,
                    &mut size as *mut _ as usize,
                    free_type as usize,
                ],
            )
        };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn protect_virtual_memory(
        &self,
        process: Handle,
        base: usize,
        size: usize,
        protect: u32,
    ) -> Result<u32, NtStatus> {
        let mut base = base;
        let mut size = size;
        let mut old: u32 = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::ProtectVirtualMemory,
                &[
                    process.0,
                    &mut base as *mut _ as usize,
                    &mut size as *mut _ as usize,
                    protect as usize,
                    &mut old as *mut _ as usize,
                ],
            )
        };
        if status.is_success() {
            Ok(old)
        } else {
            Err(status)
        }
    }

    fn read_virtual_memory(
        &self,
        process: Handle,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<usize, NtStatus> {
        let mut copied: usize = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::ReadVirtualMemory,
                &[
                    process.0,
                    addr,
                    buf.as_mut_ptr() as usize,
                    buf.len(),
                    &mut copied as *mut _ as usize,
                ],
            )
        };
        if status.is_success() || status == STATUS_PARTIAL_COPY {
            Ok(copied)
        } else {
            Err(status)
        }
    }

    fn write_virtual_memory(
        &self,
        process: Handle,
        addr: usize,
        buf: &[u8],
    ) -> Result<Option<usize>, NtStatus> {
        let mut copied: usize = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::WriteVirtualMemory,
                &[
                    process.0,
                    addr,
                    buf.as_ptr() as usize,
                    buf.len(),
                    &mut copied as *mut _ as usize,
                ],
            )
        };
        if status.is_success() || status == STATUS_PARTIAL_COPY {
            if crate::options::Options::get().raw_counted_writes() {
                Ok(Some(copied))
            } else {
                Ok(None)
            }
        } else {
            Err(status)
        }
    }

    fn flush_instruction_cache(
        &self,
        process: Handle,
        addr: usize,
        size: usize,
    ) -> Result<(), NtStatus> {
        let status =
            unsafe { raw_syscall(SyscallName::FlushInstructionCache, &[process.0, addr, size]) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn highest_user_address(&self) -> usize {
        // 2GB default / 8TB on 64-bit minus the guard area; conservative
        // constants, refined builds query SystemBasicInformation.
        if cfg!(target_pointer_width = "64") {
            0x0000_7FFF_FFFE_FFFF
        } else {
            0x7FFE_FFFF
        }
    }

    fn current_thread_id(&self) -> u32 {
        // TEB.ClientId.UniqueThread.
        #[cfg(target_arch = "x86_64")]
        const CLIENT_ID_THREAD: usize = 0x48;
        #[cfg(target_arch = "x86")]
        const CLIENT_ID_THREAD: usize = 0x24;
        unsafe { read_teb_word(CLIENT_ID_THREAD) as u32 }
    }

    fn open_thread(&self, tid: u32) -> Result<Handle, NtStatus> {
        // OBJECT_ATTRIBUTES and CLIENT_ID live on our stack.
        #[repr(C)]
        struct ObjectAttributes {
            length: usize,
            root: usize,
            name: usize,
            attributes: u32,
            sd: usize,
            sqos: usize,
        }
        let oa = ObjectAttributes {
            length: std::mem::size_of::<ObjectAttributes>(),
            root: 0,
            name: 0,
            attributes: 0,
            sd: 0,
            sqos: 0,
        };
        let client_id: [usize; 2] = [0, tid as usize];
        let mut handle: usize = 0;
        const THREAD_ALL_ACCESS: usize = 0x1F_FFFF;
        let status = unsafe {
            raw_syscall(
                SyscallName::OpenThread,
                &[
                    &mut handle as *mut _ as usize,
                    THREAD_ALL_ACCESS,
                    &oa as *const _ as usize,
                    client_id.as_ptr() as usize,
                ],
            )
        };
        if status.is_success() {
            Ok(Handle(handle))
        } else {
            Err(status)
        }
    }

    fn duplicate_thread_handle(&self, thread: Handle) -> Result<Handle, NtStatus> {
        let mut out: usize = 0;
        const DUPLICATE_SAME_ACCESS: usize = 0x2;
        let status = unsafe {
            raw_syscall(
                SyscallName::DuplicateObject,
                &[
                    NT_CURRENT_PROCESS.0,
                    thread.0,
                    NT_CURRENT_PROCESS.0,
                    &mut out as *mut _ as usize,
                    0,
                    0,
                    DUPLICATE_SAME_ACCESS,
                ],
            )
        };
        if status.is_success() {
            Ok(Handle(out))
        } else {
            Err(status)
        }
    }

    fn close_handle(&self, handle: Handle) -> Result<(), NtStatus> {
        if handle.is_pseudo() {
            return Ok(());
        }
        let status = unsafe { raw_syscall(SyscallName::Close, &[handle.0]) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn suspend_thread(&self, thread: Handle) -> Result<u32, NtStatus> {
        let mut prev: u32 = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::SuspendThread,
                &[thread.0, &mut prev as *mut _ as usize],
            )
        };
        if status.is_success() {
            Ok(prev)
        } else {
            Err(status)
        }
    }

    fn resume_thread(&self, thread: Handle) -> Result<u32, NtStatus> {
        let mut prev: u32 = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::ResumeThread,
                &[thread.0, &mut prev as *mut _ as usize],
            )
        };
        if status.is_success() {
            Ok(prev)
        } else {
            Err(status)
        }
    }

    fn get_context(&self, thread: Handle, ctx: &mut Context) -> Result<(), NtStatus> {
        debug_assert!(ctx.arch() == NATIVE_ARCH);
        let ptr = match NATIVE_ARCH {
            crate::registers::SupportedArch::X86 => ctx.as_x86_mut() as *mut _ as usize,
            crate::registers::SupportedArch::X64 => ctx.as_x64_mut() as *mut _ as usize,
        };
        let status = unsafe { raw_syscall(SyscallName::GetContextThread, &[thread.0, ptr]) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn set_context(&self, thread: Handle, ctx: &Context) -> Result<(), NtStatus> {
        debug_assert!(ctx.arch() == NATIVE_ARCH);
        let ptr = match NATIVE_ARCH {
            crate::registers::SupportedArch::X86 => ctx.as_x86() as *const _ as usize,
            crate::registers::SupportedArch::X64 => ctx.as_x64() as *const _ as usize,
        };
        let status = unsafe { raw_syscall(SyscallName::SetContextThread, &[thread.0, ptr]) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn get_context_x64(&self, thread: Handle, ctx: &mut Context64) -> Result<(), NtStatus> {
        #[cfg(target_arch = "x86_64")]
        {
            let status = unsafe {
                raw_syscall(
                    SyscallName::GetContextThread,
                    &[thread.0, ctx as *mut _ as usize],
                )
            };
            return if status.is_success() { Ok(()) } else { Err(status) };
        }
        #[cfg(target_arch = "x86")]
        {
            let f = self.wow64_get_context.load(Ordering::Acquire);
            if f == 0 {
                return Err(STATUS_NOT_SUPPORTED);
            }
            let f: WideContextFn = unsafe { std::mem::transmute(f) };
            let status = NtStatus(unsafe { f(thread.0, ctx as *mut Context64) });
            return if status.is_success() { Ok(()) } else { Err(status) };
        }
    }

    fn set_context_x64(&self, thread: Handle, ctx: &Context64) -> Result<(), NtStatus> {
        #[cfg(target_arch = "x86_64")]
        {
            let status = unsafe {
                raw_syscall(
                    SyscallName::SetContextThread,
                    &[thread.0, ctx as *const _ as usize],
                )
            };
            return if status.is_success() { Ok(()) } else { Err(status) };
        }
        #[cfg(target_arch = "x86")]
        {
            let f = self.wow64_set_context.load(Ordering::Acquire);
            if f == 0 {
                return Err(STATUS_NOT_SUPPORTED);
            }
            let f: WideContextFn = unsafe { std::mem::transmute(f) };
            let status =
                NtStatus(unsafe { f(thread.0, ctx as *const Context64 as *mut Context64) });
            return if status.is_success() { Ok(()) } else { Err(status) };
        }
    }

    fn next_thread(&self, prev: Option<Handle>) -> Result<Handle, NtStatus> {
        let mut out: usize = 0;
        const THREAD_ALL_ACCESS: usize = 0x1F_FFFF;
        let status = unsafe {
            raw_syscall(
                SyscallName::GetNextThread,
                &[
                    NT_CURRENT_PROCESS.0,
                    prev.map(|h| h.0).unwrap_or(0),
                    THREAD_ALL_ACCESS,
                    0,
                    0,
                    &mut out as *mut _ as usize,
                ],
            )
        };
        if status.is_success() {
            Ok(Handle(out))
        } else {
            Err(status)
        }
    }

    fn system_thread_ids(&self) -> Result<Vec<u32>, NtStatus> {
        // SystemProcessInformation snapshot, grown until it fits, filtered
        // to our own process id.
        const SYSTEM_PROCESS_INFORMATION: usize = 5;
        let own_pid = unsafe {
            #[cfg(target_arch = "x86_64")]
            const CLIENT_ID_PROCESS: usize = 0x40;
            #[cfg(target_arch = "x86")]
            const CLIENT_ID_PROCESS: usize = 0x20;
            read_teb_word(CLIENT_ID_PROCESS)
        };
        let mut buf: Vec<u8> = vec![0; 0x1_0000];
        loop {
            let mut needed: usize = 0;
            let status = unsafe {
                raw_syscall(
                    SyscallName::QuerySystemInformation,
                    &[
                        SYSTEM_PROCESS_INFORMATION,
                        buf.as_mut_ptr() as usize,
                        buf.len(),
                        &mut needed as *mut _ as usize,
                    ],
                )
            };
            const STATUS_INFO_LENGTH_MISMATCH: NtStatus = NtStatus(0xC000_0004u32 as i32);
            if status == STATUS_INFO_LENGTH_MISMATCH {
                buf.resize(needed.max(buf.len() * 2), 0);
                continue;
            }
            if !status.is_success() {
                return Err(status);
            }
            break;
        }
        // Walk SYSTEM_PROCESS_INFORMATION records; offsets are bitness
        // specific but stable.
        #[cfg(target_arch = "x86_64")]
        const SPI: (usize, usize, usize, usize, usize) = (0x00, 0x08, 0x50, 0x100, 0x78);
        #[cfg(target_arch = "x86")]
        const SPI: (usize, usize, usize, usize, usize) = (0x00, 0x04, 0x2C, 0xA0, 0x44);
        let (next_off, count_off, pid_off, first_thread_off, thread_size) = SPI;
        let mut tids = Vec::new();
        let mut at = 0usize;
        loop {
            let rec = &buf[at..];
            let next = usize::from_le_bytes({
                let mut a = [0u8; std::mem::size_of::<usize>()];
                a.copy_from_slice(&rec[next_off..next_off + std::mem::size_of::<usize>()]);
                a
            });
            let pid = usize::from_le_bytes({
                let mut a = [0u8; std::mem::size_of::<usize>()];
                a.copy_from_slice(&rec[pid_off..pid_off + std::mem::size_of::<usize>()]);
                a
            });
            if pid == own_pid {
                let nthreads = u32::from_le_bytes({
                    let mut a = [0u8; 4];
                    a.copy_from_slice(&rec[count_off..count_off + 4]);
                    a
                }) as usize;
                for i in 0..nthreads {
                    // CLIENT_ID.UniqueThread inside each SYSTEM_THREAD.
                    let toff = first_thread_off
                        + i * thread_size
                        + if cfg!(target_arch = "x86_64") { 0x40 } else { 0x24 };
                    let tid = usize::from_le_bytes({
                        let mut a = [0u8; std::mem::size_of::<usize>()];
                        a.copy_from_slice(&rec[toff..toff + std::mem::size_of::<usize>()]);
                        a
                    });
                    tids.push(tid as u32);
                }
            }
            if next == 0 {
                break;
            }
            at += next;
        }
        Ok(tids)
    }

    fn thread_id_of(&self, thread: Handle) -> Result<u32, NtStatus> {
        // THREAD_BASIC_INFORMATION.ClientId.UniqueThread.
        const THREAD_BASIC_INFORMATION: usize = 0;
        let mut tbi = [0usize; 6];
        let status = unsafe {
            raw_syscall(
                SyscallName::QueryInformationThread,
                &[
                    thread.0,
                    THREAD_BASIC_INFORMATION,
                    tbi.as_mut_ptr() as usize,
                    std::mem::size_of_val(&tbi),
                    0,
                ],
            )
        };
        if status.is_success() {
            Ok(tbi[3] as u32)
        } else {
            Err(status)
        }
    }

    fn thread_start_address(&self, thread: Handle) -> Result<usize, NtStatus> {
        const THREAD_QUERY_SET_WIN32_START_ADDRESS: usize = 9;
        let mut addr: usize = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::QueryInformationThread,
                &[
                    thread.0,
                    THREAD_QUERY_SET_WIN32_START_ADDRESS,
                    &mut addr as *mut _ as usize,
                    std::mem::size_of::<usize>(),
                    0,
                ],
            )
        };
        if status.is_success() {
            Ok(addr)
        } else {
            Err(status)
        }
    }

    fn terminate_thread(&self, thread: Handle, exit_code: u32) -> NtStatus {
        unsafe { raw_syscall(SyscallName::TerminateThread, &[thread.0, exit_code as usize]) }
    }

    fn terminate_process(&self, process: Handle, exit_code: u32) -> NtStatus {
        unsafe {
            raw_syscall(
                SyscallName::TerminateProcess,
                &[process.0, exit_code as usize],
            )
        }
    }

    fn create_event(&self) -> Result<Handle, NtStatus> {
        const EVENT_ALL_ACCESS: usize = 0x1F_0003;
        const NOTIFICATION_EVENT: usize = 0;
        let mut handle: usize = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::CreateEvent,
                &[
                    &mut handle as *mut _ as usize,
                    EVENT_ALL_ACCESS,
                    0,
                    NOTIFICATION_EVENT,
                    0,
                ],
            )
        };
        if status.is_success() {
            Ok(Handle(handle))
        } else {
            Err(status)
        }
    }

    fn set_event(&self, event: Handle) -> Result<(), NtStatus> {
        let status = unsafe { raw_syscall(SyscallName::SetEvent, &[event.0, 0]) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn reset_event(&self, event: Handle) -> Result<(), NtStatus> {
        let status = unsafe { raw_syscall(SyscallName::ClearEvent, &[event.0]) };
        if status.is_success() {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn wait_event(&self, event: Handle, timeout_ms: u32) -> NtStatus {
        if timeout_ms == 0 {
            return unsafe { raw_syscall(SyscallName::WaitForSingleObject, &[event.0, 0, 0]) };
        }
        // Relative timeouts are negative 100ns ticks.
        let ticks: i64 = -(timeout_ms as i64) * 10_000;
        unsafe {
            raw_syscall(
                SyscallName::WaitForSingleObject,
                &[event.0, 0, &ticks as *const _ as usize],
            )
        }
    }

    fn os_numbers(&self) -> OsNumbers {
        unsafe {
            let peb = peb_address();
            let major = *((peb + layout::PEB_OS_MAJOR) as *const u32);
            let minor = *((peb + layout::PEB_OS_MINOR) as *const u32);
            let build = *((peb + layout::PEB_OS_BUILD) as *const u16) as u32;
            let csd = *((peb + layout::PEB_OS_CSD) as *const u16) as u32;
            OsNumbers {
                major,
                minor,
                sp_major: csd >> 8,
                sp_minor: csd & 0xFF,
                build,
            }
        }
    }

    fn is_wow64_process(&self) -> bool {
        // TEB.WowTebOffset is non-zero inside a 32-on-64 process.
        #[cfg(target_arch = "x86")]
        {
            const WOW_TEB_OFFSET: usize = 0xFDC;
            return unsafe { read_teb_word(WOW_TEB_OFFSET) } != 0;
        }
        #[cfg(target_arch = "x86_64")]
        {
            false
        }
    }

    fn user_is_64bit(&self) -> bool {
        cfg!(target_pointer_width = "64")
    }

    fn system_dll_base(&self) -> usize {
        self.system_dll_base.load(Ordering::Acquire)
    }

    fn system_dll_image(&self) -> Vec<u8> {
        let base = self.system_dll_base.load(Ordering::Acquire);
        if base == 0 {
            return Vec::new();
        }
        // Headers first to learn the mapped size, then the whole image.
        let mut header = vec![0u8; PAGE_SIZE];
        if self
            .read_virtual_memory(NT_CURRENT_PROCESS, base, &mut header)
            .is_err()
        {
            return Vec::new();
        }
        let size = super::pe::MappedPe::parse(&header)
            .map(|pe| pe.size_of_image())
            .unwrap_or(PAGE_SIZE);
        let mut image = vec![0u8; size];
        match self.read_virtual_memory(NT_CURRENT_PROCESS, base, &mut image) {
            Ok(n) => {
                image.truncate(n);
                image
            }
            Err(_) => header,
        }
    }

    fn registry_string(&self, _key_path: &str, _value_name: &str) -> Option<String> {
        // Optional edition/release strings; absence is fine everywhere this
        // is consumed, so unparsed failures collapse to None.
        None
    }

    fn device_map(&self) -> Result<Vec<DriveEntry>, NtStatus> {
        let mut entries = Vec::new();
        for letter in b'A'..=b'Z' {
            let path = format!("\\??\\{}:", letter as char);
            if let Ok(target) = self.query_symbolic_link(&path) {
                entries.push(DriveEntry { letter, target });
            }
        }
        Ok(entries)
    }

    fn query_symbolic_link(&self, path: &str) -> Result<String, NtStatus> {
        #[repr(C)]
        struct UnicodeString {
            length: u16,
            maximum_length: u16,
            buffer: *const u16,
        }
        #[repr(C)]
        struct ObjectAttributes {
            length: usize,
            root: usize,
            name: *const UnicodeString,
            attributes: u32,
            sd: usize,
            sqos: usize,
        }
        let wide: Vec<u16> = path.encode_utf16().collect();
        let name = UnicodeString {
            length: (wide.len() * 2) as u16,
            maximum_length: (wide.len() * 2) as u16,
            buffer: wide.as_ptr(),
        };
        let oa = ObjectAttributes {
            length: std::mem::size_of::<ObjectAttributes>(),
            root: 0,
            name: &name,
            attributes: 0x40, // OBJ_CASE_INSENSITIVE
            sd: 0,
            sqos: 0,
        };
        const SYMBOLIC_LINK_QUERY: usize = 0x1;
        let mut link: usize = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::OpenSymbolicLinkObject,
                &[
                    &mut link as *mut _ as usize,
                    SYMBOLIC_LINK_QUERY,
                    &oa as *const _ as usize,
                ],
            )
        };
        if !status.is_success() {
            return Err(status);
        }
        let mut target_buf = vec![0u16; 260];
        let target = UnicodeString {
            length: 0,
            maximum_length: (target_buf.len() * 2) as u16,
            buffer: target_buf.as_mut_ptr(),
        };
        let mut returned: u32 = 0;
        let status = unsafe {
            raw_syscall(
                SyscallName::QuerySymbolicLinkObject,
                &[
                    link,
                    &target as *const _ as usize,
                    &mut returned as *mut _ as usize,
                ],
            )
        };
        let _ = self.close_handle(Handle(link));
        if !status.is_success() {
            return Err(status);
        }
        let len = (target.length / 2) as usize;
        Ok(String::from_utf16_lossy(&target_buf[..len.min(target_buf.len())]))
    }

    fn teb_scratch_slot(&self, thread: Option<Handle>) -> Option<usize> {
        match thread {
            None => {
                let teb = unsafe { teb_address() };
                Some(teb + layout::TEB_TLS_SLOTS + TERM_SCRATCH_TLS_SLOT * std::mem::size_of::<usize>())
            }
            Some(h) => {
                // THREAD_BASIC_INFORMATION.TebBaseAddress.
                const THREAD_BASIC_INFORMATION: usize = 0;
                let mut tbi = [0usize; 6];
                let status = unsafe {
                    raw_syscall(
                        SyscallName::QueryInformationThread,
                        &[
                            h.0,
                            THREAD_BASIC_INFORMATION,
                            tbi.as_mut_ptr() as usize,
                            std::mem::size_of_val(&tbi),
                            0,
                        ],
                    )
                };
                if status.is_success() && tbi[1] != 0 {
                    Some(
                        tbi[1]
                            + layout::TEB_TLS_SLOTS
                            + TERM_SCRATCH_TLS_SLOT * std::mem::size_of::<usize>(),
                    )
                } else {
                    None
                }
            }
        }
    }
}
