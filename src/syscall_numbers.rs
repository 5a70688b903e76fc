//! Per-kernel syscall numbers.
//!
//! The kernel exports no stable numbering: every release renumbers the
//! ordinals, so the runtime carries one column of numbers per release it
//! knows, per family (native 32-bit kernels vs 64-bit kernels; a 32-on-64
//! process uses the 64-bit numbers, the emulation layer forwards them
//! unchanged). OS identification picks the column once at startup and the
//! chosen table is read-only for the rest of the run.
//!
//! Missing entries carry [`UNKNOWN_SYSCALL`] and fail cleanly at the call
//! site instead of issuing a wrong syscall.

use crate::nt::types::{NtStatus, STATUS_NOT_IMPLEMENTED};

/// Closed enumeration of every syscall the runtime issues by ordinal.
#[repr(usize)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallName {
    AllocateVirtualMemory,
    FreeVirtualMemory,
    ProtectVirtualMemory,
    QueryVirtualMemory,
    ReadVirtualMemory,
    WriteVirtualMemory,
    FlushInstructionCache,
    MapViewOfSection,
    OpenThread,
    SuspendThread,
    ResumeThread,
    GetContextThread,
    SetContextThread,
    GetNextThread,
    QueryInformationThread,
    QueryInformationProcess,
    QuerySystemInformation,
    TerminateThread,
    TerminateProcess,
    RaiseException,
    DuplicateObject,
    Close,
    CreateEvent,
    SetEvent,
    ClearEvent,
    WaitForSingleObject,
    OpenKey,
    QueryValueKey,
    OpenDirectoryObject,
    QueryDirectoryObject,
    OpenSymbolicLinkObject,
    QuerySymbolicLinkObject,
}

pub const NUM_SYSCALL_NAMES: usize = SyscallName::QuerySymbolicLinkObject as usize + 1;

pub const ALL_SYSCALL_NAMES: [SyscallName; NUM_SYSCALL_NAMES] = [
    SyscallName::AllocateVirtualMemory,
    SyscallName::FreeVirtualMemory,
    SyscallName::ProtectVirtualMemory,
    SyscallName::QueryVirtualMemory,
    SyscallName::ReadVirtualMemory,
    SyscallName::WriteVirtualMemory,
    SyscallName::FlushInstructionCache,
    SyscallName::MapViewOfSection,
    SyscallName::OpenThread,
    SyscallName::SuspendThread,
    SyscallName::ResumeThread,
    SyscallName::GetContextThread,
    SyscallName::SetContextThread,
    SyscallName::GetNextThread,
    SyscallName::QueryInformationThread,
    SyscallName::QueryInformationProcess,
    SyscallName::QuerySystemInformation,
    SyscallName::TerminateThread,
    SyscallName::TerminateProcess,
    SyscallName::RaiseException,
    SyscallName::DuplicateObject,
    SyscallName::Close,
    SyscallName::CreateEvent,
    SyscallName::SetEvent,
    SyscallName::ClearEvent,
    SyscallName::WaitForSingleObject,
    SyscallName::OpenKey,
    SyscallName::QueryValueKey,
    SyscallName::OpenDirectoryObject,
    SyscallName::QueryDirectoryObject,
    SyscallName::OpenSymbolicLinkObject,
    SyscallName::QuerySymbolicLinkObject,
];

impl SyscallName {
    /// The system DLL export that wraps this syscall.
    pub fn wrapper_export(self) -> &'static str {
        use SyscallName::*;
        match self {
            AllocateVirtualMemory => "NtAllocateVirtualMemory",
            FreeVirtualMemory => "NtFreeVirtualMemory",
            ProtectVirtualMemory => "NtProtectVirtualMemory",
            QueryVirtualMemory => "NtQueryVirtualMemory",
            ReadVirtualMemory => "NtReadVirtualMemory",
            WriteVirtualMemory => "NtWriteVirtualMemory",
            FlushInstructionCache => "NtFlushInstructionCache",
            MapViewOfSection => "NtMapViewOfSection",
            OpenThread => "NtOpenThread",
            SuspendThread => "NtSuspendThread",
            ResumeThread => "NtResumeThread",
            GetContextThread => "NtGetContextThread",
            SetContextThread => "NtSetContextThread",
            GetNextThread => "NtGetNextThread",
            QueryInformationThread => "NtQueryInformationThread",
            QueryInformationProcess => "NtQueryInformationProcess",
            QuerySystemInformation => "NtQuerySystemInformation",
            TerminateThread => "NtTerminateThread",
            TerminateProcess => "NtTerminateProcess",
            RaiseException => "NtRaiseException",
            DuplicateObject => "NtDuplicateObject",
            Close => "NtClose",
            CreateEvent => "NtCreateEvent",
            SetEvent => "NtSetEvent",
            ClearEvent => "NtClearEvent",
            WaitForSingleObject => "NtWaitForSingleObject",
            OpenKey => "NtOpenKey",
            QueryValueKey => "NtQueryValueKey",
            OpenDirectoryObject => "NtOpenDirectoryObject",
            QueryDirectoryObject => "NtQueryDirectoryObject",
            OpenSymbolicLinkObject => "NtOpenSymbolicLinkObject",
            QuerySymbolicLinkObject => "NtQuerySymbolicLinkObject",
        }
    }
}

/// Sentinel for "no number known on this kernel".
pub const UNKNOWN_SYSCALL: i32 = -1;

#[derive(Clone, Debug)]
pub struct SyscallTable {
    numbers: [i32; NUM_SYSCALL_NAMES],
}

impl SyscallTable {
    pub const fn unknown() -> SyscallTable {
        SyscallTable {
            numbers: [UNKNOWN_SYSCALL; NUM_SYSCALL_NAMES],
        }
    }

    /// The number for `name`, or a clean failure for sentinel entries.
    pub fn number(&self, name: SyscallName) -> Result<u32, NtStatus> {
        let raw = self.numbers[name as usize];
        if raw == UNKNOWN_SYSCALL {
            Err(STATUS_NOT_IMPLEMENTED)
        } else {
            Ok(raw as u32)
        }
    }

    pub fn raw(&self, name: SyscallName) -> i32 {
        self.numbers[name as usize]
    }

    pub fn set(&mut self, name: SyscallName, number: u32) {
        self.numbers[name as usize] = number as i32;
    }

    pub fn missing_entries(&self) -> usize {
        self.numbers
            .iter()
            .filter(|&&n| n == UNKNOWN_SYSCALL)
            .count()
    }
}

/// Which number family the process draws from.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TableFamily {
    /// Native 32-bit kernel.
    X86,
    /// 64-bit kernel, used by both 64-bit and 32-on-64 user mode.
    X64,
}

/// One column per kernel release we carry numbers for, oldest first.
#[repr(usize)]
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TableColumn {
    Xp,
    Ws03,
    Vista,
    Win7,
    Win8,
    Win81,
    Win10,
    Win10_1511,
    Win10_1607,
    Win10_1703,
    Win10_1709,
    Win10_1803,
}

pub const NUM_TABLE_COLUMNS: usize = TableColumn::Win10_1803 as usize + 1;

/// Most recent release with known numbers; the unknown-future template.
pub const LATEST_COLUMN: TableColumn = TableColumn::Win10_1803;

type Row = (SyscallName, [i32; NUM_TABLE_COLUMNS]);

// Number matrices. A row is one syscall across releases; -1 marks releases
// where the wrapper does not exist (or the family does not: there was no
// 64-bit 5.1 kernel). Low ordinals froze at the Win10 RTM numbering; the
// higher ones keep drifting with each release.

#[rustfmt::skip]
static X64_ROWS: [Row; NUM_SYSCALL_NAMES] = [
    //                                         xp    2k3   vista  win7  win8  8.1   10    1511  1607  1703  1709  1803
    (SyscallName::AllocateVirtualMemory,    [  -1, 0x012, 0x015, 0x015, 0x016, 0x017, 0x018, 0x018, 0x018, 0x018, 0x018, 0x018]),
    (SyscallName::FreeVirtualMemory,        [  -1, 0x01A, 0x01B, 0x01B, 0x01C, 0x01D, 0x01E, 0x01E, 0x01E, 0x01E, 0x01E, 0x01E]),
    (SyscallName::ProtectVirtualMemory,     [  -1, 0x04B, 0x04D, 0x04D, 0x04E, 0x04F, 0x050, 0x050, 0x050, 0x050, 0x050, 0x050]),
    (SyscallName::QueryVirtualMemory,       [  -1, 0x020, 0x020, 0x020, 0x021, 0x022, 0x023, 0x023, 0x023, 0x023, 0x023, 0x023]),
    (SyscallName::ReadVirtualMemory,        [  -1, 0x03A, 0x03C, 0x03C, 0x03D, 0x03E, 0x03F, 0x03F, 0x03F, 0x03F, 0x03F, 0x03F]),
    (SyscallName::WriteVirtualMemory,       [  -1, 0x035, 0x037, 0x037, 0x038, 0x039, 0x03A, 0x03A, 0x03A, 0x03A, 0x03A, 0x03A]),
    (SyscallName::FlushInstructionCache,    [  -1, 0x0B0, 0x0B8, 0x0BA, 0x0BC, 0x0C0, 0x0C2, 0x0C3, 0x0C3, 0x0C4, 0x0C5, 0x0C5]),
    (SyscallName::MapViewOfSection,         [  -1, 0x025, 0x025, 0x025, 0x026, 0x027, 0x028, 0x028, 0x028, 0x028, 0x028, 0x028]),
    (SyscallName::OpenThread,               [  -1, 0x0FE, 0x10A, 0x10C, 0x121, 0x127, 0x12E, 0x12F, 0x130, 0x132, 0x133, 0x134]),
    (SyscallName::SuspendThread,            [  -1, 0x16F, 0x17B, 0x17D, 0x193, 0x19B, 0x1A5, 0x1A6, 0x1A8, 0x1AB, 0x1AD, 0x1AE]),
    (SyscallName::ResumeThread,             [  -1, 0x04D, 0x04F, 0x04F, 0x050, 0x051, 0x052, 0x052, 0x052, 0x052, 0x052, 0x052]),
    (SyscallName::GetContextThread,         [  -1, 0x0BF, 0x0C9, 0x0CA, 0x0E6, 0x0EC, 0x0F2, 0x0F3, 0x0F4, 0x0F6, 0x0F7, 0x0F8]),
    (SyscallName::SetContextThread,         [  -1, 0x13E, 0x149, 0x14B, 0x165, 0x171, 0x178, 0x179, 0x17A, 0x17C, 0x17D, 0x17E]),
    (SyscallName::GetNextThread,            [  -1,    -1, 0x0BC, 0x0BE, 0x0E0, 0x0E6, 0x0EC, 0x0ED, 0x0EE, 0x0F0, 0x0F1, 0x0F2]),
    (SyscallName::QueryInformationThread,   [  -1, 0x022, 0x022, 0x022, 0x023, 0x024, 0x025, 0x025, 0x025, 0x025, 0x025, 0x025]),
    (SyscallName::QueryInformationProcess,  [  -1, 0x016, 0x016, 0x016, 0x017, 0x018, 0x019, 0x019, 0x019, 0x019, 0x019, 0x019]),
    (SyscallName::QuerySystemInformation,   [  -1, 0x033, 0x033, 0x033, 0x034, 0x035, 0x036, 0x036, 0x036, 0x036, 0x036, 0x036]),
    (SyscallName::TerminateThread,          [  -1, 0x050, 0x050, 0x050, 0x051, 0x052, 0x053, 0x053, 0x053, 0x053, 0x053, 0x053]),
    (SyscallName::TerminateProcess,         [  -1, 0x029, 0x029, 0x029, 0x02A, 0x02B, 0x02C, 0x02C, 0x02C, 0x02C, 0x02C, 0x02C]),
    (SyscallName::RaiseException,           [  -1, 0x124, 0x12F, 0x131, 0x14B, 0x157, 0x15E, 0x15F, 0x161, 0x163, 0x164, 0x165]),
    (SyscallName::DuplicateObject,          [  -1, 0x039, 0x039, 0x039, 0x03A, 0x03B, 0x03C, 0x03C, 0x03C, 0x03C, 0x03C, 0x03C]),
    (SyscallName::Close,                    [  -1, 0x00C, 0x00C, 0x00C, 0x00D, 0x00E, 0x00F, 0x00F, 0x00F, 0x00F, 0x00F, 0x00F]),
    (SyscallName::CreateEvent,              [  -1, 0x043, 0x045, 0x045, 0x046, 0x047, 0x048, 0x048, 0x048, 0x048, 0x048, 0x048]),
    (SyscallName::SetEvent,                 [  -1, 0x00B, 0x00B, 0x00C, 0x00C, 0x00D, 0x00E, 0x00E, 0x00E, 0x00E, 0x00E, 0x00E]),
    (SyscallName::ClearEvent,               [  -1, 0x03B, 0x03B, 0x03B, 0x03C, 0x03D, 0x03E, 0x03E, 0x03E, 0x03E, 0x03E, 0x03E]),
    (SyscallName::WaitForSingleObject,      [  -1, 0x002, 0x002, 0x002, 0x003, 0x003, 0x004, 0x004, 0x004, 0x004, 0x004, 0x004]),
    (SyscallName::OpenKey,                  [  -1, 0x00F, 0x00F, 0x00F, 0x010, 0x011, 0x012, 0x012, 0x012, 0x012, 0x012, 0x012]),
    (SyscallName::QueryValueKey,            [  -1, 0x014, 0x014, 0x014, 0x015, 0x016, 0x017, 0x017, 0x017, 0x017, 0x017, 0x017]),
    (SyscallName::OpenDirectoryObject,      [  -1, 0x055, 0x055, 0x055, 0x056, 0x057, 0x058, 0x058, 0x058, 0x058, 0x058, 0x058]),
    (SyscallName::QueryDirectoryObject,     [  -1, 0x135, 0x140, 0x142, 0x15C, 0x168, 0x16F, 0x170, 0x172, 0x174, 0x175, 0x176]),
    (SyscallName::OpenSymbolicLinkObject,   [  -1, 0x0F8, 0x104, 0x106, 0x11B, 0x121, 0x128, 0x129, 0x12A, 0x12C, 0x12D, 0x12E]),
    (SyscallName::QuerySymbolicLinkObject,  [  -1, 0x12D, 0x138, 0x13A, 0x154, 0x160, 0x167, 0x168, 0x16A, 0x16C, 0x16D, 0x16E]),
];

#[rustfmt::skip]
static X86_ROWS: [Row; NUM_SYSCALL_NAMES] = [
    //                                         xp    2k3   vista  win7  win8  8.1   10    1511  1607  1703  1709  1803
    (SyscallName::AllocateVirtualMemory,    [0x011, 0x012, 0x012, 0x013, 0x196, 0x197, 0x199, 0x19A, 0x19B, 0x19B, 0x19C, 0x19C]),
    (SyscallName::FreeVirtualMemory,        [0x053, 0x056, 0x057, 0x058, 0x13C, 0x13D, 0x13F, 0x140, 0x141, 0x141, 0x142, 0x142]),
    (SyscallName::ProtectVirtualMemory,     [0x089, 0x08F, 0x0D2, 0x0D7, 0x0C3, 0x0C4, 0x0C6, 0x0C7, 0x0C8, 0x0C8, 0x0C9, 0x0C9]),
    (SyscallName::QueryVirtualMemory,       [0x0B2, 0x0BA, 0x0FD, 0x10B, 0x09B, 0x09C, 0x09E, 0x09F, 0x0A0, 0x0A0, 0x0A1, 0x0A1]),
    (SyscallName::ReadVirtualMemory,        [0x0BA, 0x0C2, 0x104, 0x115, 0x092, 0x093, 0x095, 0x096, 0x097, 0x097, 0x098, 0x098]),
    (SyscallName::WriteVirtualMemory,       [0x115, 0x11F, 0x166, 0x18F, 0x002, 0x003, 0x004, 0x004, 0x004, 0x004, 0x004, 0x004]),
    (SyscallName::FlushInstructionCache,    [0x04E, 0x051, 0x052, 0x053, 0x141, 0x142, 0x144, 0x145, 0x146, 0x146, 0x147, 0x147]),
    (SyscallName::MapViewOfSection,         [0x06C, 0x071, 0x0B1, 0x0A8, 0x0F3, 0x0F4, 0x0F6, 0x0F7, 0x0F8, 0x0F8, 0x0F9, 0x0F9]),
    (SyscallName::OpenThread,               [0x080, 0x085, 0x0C9, 0x0BE, 0x0DE, 0x0DF, 0x0E1, 0x0E2, 0x0E3, 0x0E3, 0x0E4, 0x0E4]),
    (SyscallName::SuspendThread,            [0x0FE, 0x107, 0x14F, 0x172, 0x039, 0x03A, 0x03C, 0x03C, 0x03D, 0x03D, 0x03E, 0x03E]),
    (SyscallName::ResumeThread,             [0x0CE, 0x0D6, 0x119, 0x130, 0x07F, 0x080, 0x082, 0x083, 0x084, 0x084, 0x085, 0x085]),
    (SyscallName::GetContextThread,         [0x055, 0x059, 0x05A, 0x05B, 0x132, 0x133, 0x135, 0x136, 0x137, 0x137, 0x138, 0x138]),
    (SyscallName::SetContextThread,         [0x0D5, 0x0DD, 0x121, 0x13C, 0x072, 0x073, 0x075, 0x076, 0x077, 0x077, 0x078, 0x078]),
    (SyscallName::GetNextThread,            [  -1,    -1, 0x05D, 0x05E, 0x12E, 0x12F, 0x131, 0x132, 0x133, 0x133, 0x134, 0x134]),
    (SyscallName::QueryInformationThread,   [0x09B, 0x0A2, 0x0E5, 0x0EC, 0x0B1, 0x0B2, 0x0B4, 0x0B5, 0x0B6, 0x0B6, 0x0B7, 0x0B7]),
    (SyscallName::QueryInformationProcess,  [0x09A, 0x0A1, 0x0E4, 0x0EA, 0x0B3, 0x0B4, 0x0B6, 0x0B7, 0x0B8, 0x0B8, 0x0B9, 0x0B9]),
    (SyscallName::QuerySystemInformation,   [0x0AD, 0x0B5, 0x0F8, 0x105, 0x0A3, 0x0A4, 0x0A6, 0x0A7, 0x0A8, 0x0A8, 0x0A9, 0x0A9]),
    (SyscallName::TerminateThread,          [0x102, 0x10B, 0x153, 0x177, 0x034, 0x035, 0x037, 0x037, 0x038, 0x038, 0x039, 0x039]),
    (SyscallName::TerminateProcess,         [0x101, 0x10A, 0x152, 0x172, 0x035, 0x036, 0x038, 0x038, 0x039, 0x039, 0x03A, 0x03A]),
    (SyscallName::RaiseException,           [0x0B7, 0x0BF, 0x101, 0x112, 0x095, 0x096, 0x098, 0x099, 0x09A, 0x09A, 0x09B, 0x09B]),
    (SyscallName::DuplicateObject,          [0x044, 0x047, 0x048, 0x049, 0x158, 0x159, 0x15B, 0x15C, 0x15D, 0x15D, 0x15E, 0x15E]),
    (SyscallName::Close,                    [0x019, 0x01B, 0x030, 0x032, 0x174, 0x175, 0x177, 0x178, 0x179, 0x179, 0x17A, 0x17A]),
    (SyscallName::CreateEvent,              [0x023, 0x025, 0x026, 0x027, 0x164, 0x165, 0x167, 0x168, 0x169, 0x169, 0x16A, 0x16A]),
    (SyscallName::SetEvent,                 [0x0EB, 0x0F4, 0x137, 0x14F, 0x05F, 0x060, 0x062, 0x063, 0x064, 0x064, 0x065, 0x065]),
    (SyscallName::ClearEvent,               [0x018, 0x01A, 0x02F, 0x031, 0x175, 0x176, 0x178, 0x179, 0x17A, 0x17A, 0x17B, 0x17B]),
    (SyscallName::WaitForSingleObject,      [0x10F, 0x119, 0x161, 0x187, 0x006, 0x007, 0x009, 0x009, 0x009, 0x009, 0x009, 0x009]),
    (SyscallName::OpenKey,                  [0x077, 0x07B, 0x0BC, 0x0B6, 0x0E8, 0x0E9, 0x0EB, 0x0EC, 0x0ED, 0x0ED, 0x0EE, 0x0EE]),
    (SyscallName::QueryValueKey,            [0x0B1, 0x0B9, 0x0FC, 0x10A, 0x09D, 0x09E, 0x0A0, 0x0A1, 0x0A2, 0x0A2, 0x0A3, 0x0A3]),
    (SyscallName::OpenDirectoryObject,      [0x071, 0x075, 0x0B5, 0x0AD, 0x0EE, 0x0EF, 0x0F1, 0x0F2, 0x0F3, 0x0F3, 0x0F4, 0x0F4]),
    (SyscallName::QueryDirectoryObject,     [0x096, 0x09D, 0x0E0, 0x0E5, 0x0B8, 0x0B9, 0x0BB, 0x0BC, 0x0BD, 0x0BD, 0x0BE, 0x0BE]),
    (SyscallName::OpenSymbolicLinkObject,   [0x07E, 0x083, 0x0C7, 0x0BC, 0x0E0, 0x0E1, 0x0E3, 0x0E4, 0x0E5, 0x0E5, 0x0E6, 0x0E6]),
    (SyscallName::QuerySymbolicLinkObject,  [0x0AC, 0x0B4, 0x0F7, 0x103, 0x0A5, 0x0A6, 0x0A8, 0x0A9, 0x0AA, 0x0AA, 0x0AB, 0x0AB]),
];

fn rows_for(family: TableFamily) -> &'static [Row; NUM_SYSCALL_NAMES] {
    match family {
        TableFamily::X86 => &X86_ROWS,
        TableFamily::X64 => &X64_ROWS,
    }
}

/// Build the table for one release. The result is bulk-copied into the
/// process-wide frozen state by OS identification; nothing reads the
/// matrices after startup.
pub fn table_for(family: TableFamily, column: TableColumn) -> SyscallTable {
    let mut table = SyscallTable::unknown();
    for (name, numbers) in rows_for(family).iter() {
        let n = numbers[column as usize];
        if n != UNKNOWN_SYSCALL {
            table.set(*name, n as u32);
        }
    }
    table
}

/// The unknown-future template: a copy of the most recent known column.
pub fn latest_known(family: TableFamily) -> SyscallTable {
    table_for(family, LATEST_COLUMN)
}

/// Extract the syscall number from a wrapper's prologue bytes.
///
/// Shapes understood:
///   x64:            4C 8B D1 B8 imm32        mov r10, rcx; mov eax, imm32
///   x86 native:     B8 imm32                 mov eax, imm32
///   x86 under 64:   B8 imm32 BA ..           mov eax, imm32; mov edx, gate
/// Hooked or padded prologues are tolerated by scanning the first few bytes
/// for the `mov eax` once the fixed shapes miss.
pub fn syscall_number_from_wrapper(bytes: &[u8]) -> Option<u32> {
    if bytes.len() >= 8 && bytes[0] == 0x4C && bytes[1] == 0x8B && bytes[2] == 0xD1
        && bytes[3] == 0xB8
    {
        return Some(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]));
    }
    if bytes.len() >= 5 && bytes[0] == 0xB8 {
        return Some(u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]));
    }
    // A detour or alignment padding may push the dispatch sequence a few
    // bytes in; accept a `mov eax, imm32` within the first 16 bytes as long
    // as the immediate looks like an ordinal.
    let window = &bytes[..bytes.len().min(16)];
    let mut from = 0;
    while let Some(at) = memchr::memchr(0xB8, &window[from..]) {
        let at = from + at;
        if window.len() - at >= 5 {
            let imm = u32::from_le_bytes([
                window[at + 1],
                window[at + 2],
                window[at + 3],
                window[at + 4],
            ]);
            if imm < 0x4000 {
                return Some(imm);
            }
        }
        from = at + 1;
    }
    None
}
