//! Virtual-memory layer: queries, reservations, protection changes.
//!
//! Stateless over the kernel seam; the kernel serialises its own region
//! table. Every result is a snapshot that concurrent mutation can outdate.

pub mod alloc;
pub mod query;

use crate::nt::types::*;
use crate::nt::Kernel;

bitflags! {
    /// Abstract permission set. The low three bits are the rwx request;
    /// the qualifiers ride along and are preserved by protection changes
    /// that do not explicitly target them.
    pub struct MemProt: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const EXEC = 0x04;
        const COW = 0x08;
        const GUARD = 0x10;
        const NOCACHE = 0x20;
        const WRITECOMBINE = 0x40;
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MemKind {
    Free,
    Reserved,
    Image,
    Data,
    /// The query failed for a user address.
    Error,
    /// The query failed with the kernel-address status.
    KernelError,
}

/// The runtime-visible region description.
#[derive(Copy, Clone, Debug)]
pub struct MemInfo {
    pub base: usize,
    pub size: usize,
    pub prot: MemProt,
    pub kind: MemKind,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum VmError {
    /// Allocation failed despite valid arguments.
    OutOfMemory,
    /// No free hole of the requested size in the allowed window.
    CantReserveInRegion,
    /// Address or size out of range, or the kernel rejected the
    /// protection value.
    Invalid,
}

/// Translate a native protection value into the abstract set, qualifiers
/// included.
pub fn prot_from_native(native: u32) -> MemProt {
    let mut prot = match native & PAGE_PROT_MASK {
        PAGE_READONLY => MemProt::READ,
        PAGE_READWRITE => MemProt::READ | MemProt::WRITE,
        PAGE_WRITECOPY => MemProt::READ | MemProt::WRITE | MemProt::COW,
        PAGE_EXECUTE => MemProt::EXEC,
        PAGE_EXECUTE_READ => MemProt::READ | MemProt::EXEC,
        PAGE_EXECUTE_READWRITE => MemProt::READ | MemProt::WRITE | MemProt::EXEC,
        PAGE_EXECUTE_WRITECOPY => {
            MemProt::READ | MemProt::WRITE | MemProt::EXEC | MemProt::COW
        }
        _ => MemProt::empty(),
    };
    if native & PAGE_GUARD != 0 {
        prot |= MemProt::GUARD;
    }
    if native & PAGE_NOCACHE != 0 {
        prot |= MemProt::NOCACHE;
    }
    if native & PAGE_WRITECOMBINE != 0 {
        prot |= MemProt::WRITECOMBINE;
    }
    prot
}

/// Translate the abstract set to the native value the kernel stores.
/// Requests the kernel cannot express (write-only, exec-write without
/// read) are rounded up to the nearest representable value.
pub fn prot_to_native(prot: MemProt) -> u32 {
    let rwx = prot & (MemProt::READ | MemProt::WRITE | MemProt::EXEC | MemProt::COW);
    let mut native = if rwx.contains(MemProt::EXEC) {
        if rwx.contains(MemProt::WRITE) {
            if rwx.contains(MemProt::COW) {
                PAGE_EXECUTE_WRITECOPY
            } else {
                PAGE_EXECUTE_READWRITE
            }
        } else if rwx.contains(MemProt::READ) {
            PAGE_EXECUTE_READ
        } else {
            PAGE_EXECUTE
        }
    } else if rwx.contains(MemProt::WRITE) {
        if rwx.contains(MemProt::COW) {
            PAGE_WRITECOPY
        } else {
            PAGE_READWRITE
        }
    } else if rwx.contains(MemProt::READ) {
        PAGE_READONLY
    } else {
        PAGE_NOACCESS
    };
    if prot.contains(MemProt::GUARD) {
        native |= PAGE_GUARD;
    }
    if prot.contains(MemProt::NOCACHE) {
        native |= PAGE_NOCACHE;
    }
    if prot.contains(MemProt::WRITECOMBINE) {
        native |= PAGE_WRITECOMBINE;
    }
    native
}

/// Handle to the VM layer. Holds nothing but the kernel seam.
pub struct Vm<'k> {
    pub(crate) kernel: &'k dyn Kernel,
}

impl<'k> Vm<'k> {
    pub fn new(kernel: &'k dyn Kernel) -> Vm<'k> {
        Vm { kernel }
    }
}
