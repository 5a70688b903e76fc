//! Kernel identification and syscall-table selection.
//!
//! Runs once at startup. The version comes from the process environment
//! block; 10.0 kernels are subdivided by probing the system DLL for
//! wrapper exports that each update introduced, newest first. The chosen
//! table is cross-checked against numbers extracted straight from the
//! in-memory wrapper prologues; a mismatch demotes the choice to the
//! unknown-future table (a copy of the newest known one, refined
//! best-effort from the prologues).

use crate::log::{LogLevel, SyslogCode};
use crate::nt::pe::MappedPe;
use crate::nt::types::OsNumbers;
use crate::nt::Kernel;
use crate::options::Options;
use crate::syscall_numbers::{
    self, latest_known, syscall_number_from_wrapper, table_for, SyscallName, SyscallTable,
    TableColumn, TableFamily, ALL_SYSCALL_NAMES,
};
use std::sync::atomic::{AtomicPtr, Ordering};

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WindowsVersion {
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
    /// Newer than everything we know; running on copied numbers.
    FutureUnknown,
}

/// Coarse grouping that picks the 32-on-64 transition patterns.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum KernelGeneration {
    PreWin8,
    Win8,
    Win10,
}

impl WindowsVersion {
    pub fn generation(self) -> KernelGeneration {
        use WindowsVersion::*;
        match self {
            Xp | Ws03 | Vista | Win7 => KernelGeneration::PreWin8,
            Win8 | Win81 => KernelGeneration::Win8,
            _ => KernelGeneration::Win10,
        }
    }

    fn column(self) -> Option<TableColumn> {
        use WindowsVersion::*;
        Some(match self {
            Xp => TableColumn::Xp,
            Ws03 => TableColumn::Ws03,
            Vista => TableColumn::Vista,
            Win7 => TableColumn::Win7,
            Win8 => TableColumn::Win8,
            Win81 => TableColumn::Win81,
            Win10 => TableColumn::Win10,
            Win10_1511 => TableColumn::Win10_1511,
            Win10_1607 => TableColumn::Win10_1607,
            Win10_1703 => TableColumn::Win10_1703,
            Win10_1709 => TableColumn::Win10_1709,
            Win10_1803 => TableColumn::Win10_1803,
            FutureUnknown => return None,
        })
    }
}

/// Everything identification learned, frozen for the rest of the run.
#[derive(Debug)]
pub struct OsInfo {
    pub version: WindowsVersion,
    pub family: TableFamily,
    pub syscalls: SyscallTable,
    pub numbers: OsNumbers,
    pub edition: String,
    pub release: String,
    /// 64-bit user mode.
    pub user_64bit: bool,
    /// 32-bit user mode under a 64-bit kernel.
    pub wow64: bool,
}

/// Unsupported-kernel report. Fatal unless running in standalone-library
/// mode, where the caller gets it back instead.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UsageError {
    pub message: String,
}

const VERSION_KEY: &str =
    "\\Registry\\Machine\\Software\\Microsoft\\Windows NT\\CurrentVersion";

/// Win10 update markers, newest first. Presence of the export picks the
/// update; absence of all of them means RTM.
const WIN10_PROBES: [(&str, WindowsVersion); 5] = [
    ("NtAllocateVirtualMemoryEx", WindowsVersion::Win10_1803),
    ("NtCallEnclave", WindowsVersion::Win10_1709),
    ("NtLoadHotPatch", WindowsVersion::Win10_1703),
    ("NtCreateRegistryTransaction", WindowsVersion::Win10_1607),
    ("NtCreateEnclave", WindowsVersion::Win10_1511),
];

fn win10_flavor(dll: Option<&MappedPe>) -> WindowsVersion {
    if let Some(pe) = dll {
        for (export, version) in WIN10_PROBES.iter() {
            if pe.has_export(export) {
                return *version;
            }
        }
    }
    WindowsVersion::Win10
}

/// Extract the number the mapped wrapper actually dispatches.
fn number_from_dll(pe: &MappedPe, image: &[u8], name: SyscallName) -> Option<u32> {
    let rva = pe.export_rva(name.wrapper_export())? as usize;
    let end = image.len().min(rva + 24);
    if rva >= end {
        return None;
    }
    syscall_number_from_wrapper(&image[rva..end])
}

/// The two late-table entries used to validate the chosen column.
const CROSS_CHECK: [SyscallName; 2] = [
    SyscallName::GetContextThread,
    SyscallName::AllocateVirtualMemory,
];

fn cross_check_ok(table: &SyscallTable, pe: &MappedPe, image: &[u8]) -> bool {
    for name in CROSS_CHECK.iter() {
        if let Some(extracted) = number_from_dll(pe, image, *name) {
            match table.number(*name) {
                Ok(n) if n == extracted => {}
                _ => return false,
            }
        }
    }
    true
}

/// Copy the newest known table and refine whatever the wrapper prologues
/// reveal.
fn unknown_future_table(
    family: TableFamily,
    dll: Option<(&MappedPe, &[u8])>,
) -> SyscallTable {
    syslog_once!(
        LogLevel::LogWarn,
        SyslogCode::UnknownFutureOs,
        "kernel is newer than every known syscall table; using {:?} numbers",
        syscall_numbers::LATEST_COLUMN
    );
    let mut table = latest_known(family);
    if let Some((pe, image)) = dll {
        for name in ALL_SYSCALL_NAMES.iter() {
            if let Some(n) = number_from_dll(pe, image, *name) {
                table.set(*name, n);
            }
        }
    }
    table
}

/// Identify the running kernel and choose its syscall table. Pure in the
/// probed environment: identical probes yield an identical result.
pub fn identify(kernel: &dyn Kernel, options: &Options) -> Result<OsInfo, UsageError> {
    let numbers = kernel.os_numbers();
    let user_64bit = kernel.user_is_64bit();
    let wow64 = kernel.is_wow64_process();
    let family = if user_64bit || wow64 {
        TableFamily::X64
    } else {
        TableFamily::X86
    };

    if numbers.major < 5 {
        return Err(UsageError {
            message: format!(
                "kernel {}.{} predates the NT family this build supports",
                numbers.major, numbers.minor
            ),
        });
    }
    if numbers.major > options.max_supported_os_version {
        return Err(UsageError {
            message: format!(
                "kernel major version {} exceeds the supported maximum {}",
                numbers.major, options.max_supported_os_version
            ),
        });
    }

    let image = kernel.system_dll_image();
    let pe = MappedPe::parse(&image);

    let mut version = match (numbers.major, numbers.minor) {
        (5, 1) => WindowsVersion::Xp,
        (5, 2) => WindowsVersion::Ws03,
        (6, 0) => WindowsVersion::Vista,
        (6, 1) => WindowsVersion::Win7,
        (6, 2) => WindowsVersion::Win8,
        (6, 3) => WindowsVersion::Win81,
        (10, 0) => win10_flavor(pe.as_ref()),
        _ => WindowsVersion::FutureUnknown,
    };

    let syscalls = match version.column() {
        Some(column) => {
            let table = table_for(family, column);
            let valid = match pe.as_ref() {
                Some(pe) => cross_check_ok(&table, pe, &image),
                None => true,
            };
            if valid {
                table
            } else {
                version = WindowsVersion::FutureUnknown;
                unknown_future_table(family, pe.as_ref().map(|p| (p, image.as_slice())))
            }
        }
        None => unknown_future_table(family, pe.as_ref().map(|p| (p, image.as_slice()))),
    };

    let edition = kernel
        .registry_string(VERSION_KEY, "EditionID")
        .unwrap_or_default();
    let release = kernel
        .registry_string(VERSION_KEY, "ReleaseId")
        .unwrap_or_default();

    log!(
        LogLevel::LogInfo,
        "kernel {}.{}.{} sp{} identified as {:?} ({:?} numbers)",
        numbers.major,
        numbers.minor,
        numbers.build,
        numbers.sp_major,
        version,
        family
    );

    Ok(OsInfo {
        version,
        family,
        syscalls,
        numbers,
        edition,
        release,
        user_64bit,
        wow64,
    })
}

static FROZEN: AtomicPtr<OsInfo> = AtomicPtr::new(std::ptr::null_mut());

/// Freeze the identification result process-wide. First caller wins; the
/// winning reference is returned either way.
pub fn freeze(info: OsInfo) -> &'static OsInfo {
    let boxed = Box::into_raw(Box::new(info));
    match FROZEN.compare_exchange(
        std::ptr::null_mut(),
        boxed,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => unsafe { &*boxed },
        Err(existing) => {
            // Lost the race; drop ours.
            unsafe {
                drop(Box::from_raw(boxed));
                &*existing
            }
        }
    }
}

pub fn frozen() -> Option<&'static OsInfo> {
    let p = FROZEN.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

/// Kernels whose foreign-write syscall no longer reports a byte count.
/// Counted writes on these must go through the fault-handling backend.
fn write_count_unreliable(version: WindowsVersion) -> bool {
    match version {
        WindowsVersion::Win10_1803 | WindowsVersion::FutureUnknown => true,
        _ => false,
    }
}

/// Identify and freeze, applying the fatal-usage policy: in standalone
/// library mode an unsupported kernel comes back as `None`, otherwise it
/// ends the process.
pub fn initialize(kernel: &dyn Kernel, options: &Options) -> Option<&'static OsInfo> {
    match identify(kernel, options) {
        Ok(info) => {
            if write_count_unreliable(info.version) {
                options.disable_raw_counted_writes();
            }
            Some(freeze(info))
        }
        Err(err) => {
            if options.standalone_library {
                log!(LogLevel::LogError, "{}", err.message);
                None
            } else {
                fatal!(SyslogCode::UnsupportedOsVersion, "{}", err.message);
            }
        }
    }
}
