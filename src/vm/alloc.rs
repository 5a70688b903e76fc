//! Reservations, commits and protection changes.

use super::{prot_from_native, prot_to_native, MemProt, Vm, VmError};
use crate::nt::pe::MappedPe;
use crate::nt::types::*;

bitflags! {
    pub struct RawAllocFlags: u32 {
        const RESERVE = 0x1;
        const COMMIT = 0x2;
    }
}

/// How `set_protection` interprets the requested value.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProtMode {
    /// Store exactly the requested rwx set.
    Absolute,
    /// Add write to whatever each subregion has.
    MakeWritable,
    /// Remove write from whatever each subregion has.
    MakeUnwritable,
    /// Add write as copy-on-write.
    MakeWritableCow,
}

/// Retries when a found hole is raced away before the reserve lands.
const RESERVE_RACE_RETRIES: usize = 5;

fn map_status(status: NtStatus) -> VmError {
    match status {
        STATUS_NO_MEMORY => VmError::OutOfMemory,
        STATUS_CONFLICTING_ADDRESSES => VmError::CantReserveInRegion,
        _ => VmError::Invalid,
    }
}

impl<'k> Vm<'k> {
    /// Reserve `size` bytes, at `preferred` when non-zero.
    pub fn reserve(&self, preferred: usize, size: usize) -> Result<usize, VmError> {
        self.kernel
            .allocate_virtual_memory(
                NT_CURRENT_PROCESS,
                preferred,
                size,
                MEM_RESERVE,
                PAGE_NOACCESS,
            )
            .map(|(base, _)| base)
            .map_err(map_status)
    }

    /// Reserve inside `[low, high)`, retrying a few times when another
    /// thread wins the hole.
    pub fn reserve_in_range(
        &self,
        low: usize,
        high: usize,
        size: usize,
    ) -> Result<usize, VmError> {
        for _ in 0..RESERVE_RACE_RETRIES {
            let (start, _end) = match self.find_free_in_range(low, high, size) {
                Some(hole) => hole,
                None => return Err(VmError::CantReserveInRegion),
            };
            match self.reserve(start, size) {
                Ok(base) => return Ok(base),
                // Raced: someone took the hole between the walk and the
                // reserve. Walk again.
                Err(VmError::CantReserveInRegion) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(VmError::CantReserveInRegion)
    }

    pub fn commit(&self, addr: usize, size: usize, prot: MemProt) -> Result<(), VmError> {
        self.kernel
            .allocate_virtual_memory(
                NT_CURRENT_PROCESS,
                addr,
                size,
                MEM_COMMIT,
                prot_to_native(prot),
            )
            .map(|_| ())
            .map_err(map_status)
    }

    pub fn decommit(&self, addr: usize, size: usize) -> Result<(), VmError> {
        self.kernel
            .free_virtual_memory(NT_CURRENT_PROCESS, addr, size, MEM_DECOMMIT)
            .map_err(map_status)
    }

    /// Release the whole allocation that `addr` belongs to.
    pub fn free(&self, addr: usize) -> Result<(), VmError> {
        self.kernel
            .free_virtual_memory(NT_CURRENT_PROCESS, addr, 0, MEM_RELEASE)
            .map_err(map_status)
    }

    /// Combined reserve and/or commit under one call.
    pub fn raw_alloc(
        &self,
        preferred: usize,
        size: usize,
        prot: MemProt,
        flags: RawAllocFlags,
    ) -> Result<usize, VmError> {
        let mut alloc_type = 0;
        if flags.contains(RawAllocFlags::RESERVE) {
            alloc_type |= MEM_RESERVE;
        }
        if flags.contains(RawAllocFlags::COMMIT) {
            alloc_type |= MEM_COMMIT;
        }
        if alloc_type == 0 {
            return Err(VmError::Invalid);
        }
        self.kernel
            .allocate_virtual_memory(
                NT_CURRENT_PROCESS,
                preferred,
                size,
                alloc_type,
                prot_to_native(prot),
            )
            .map(|(base, _)| base)
            .map_err(map_status)
    }

    /// Change protection across `[addr, addr+size)`, one kernel subregion
    /// at a time. The range may span subregions with different current
    /// protections; qualifiers each subregion carries (copy-on-write,
    /// guard, cache) are preserved. Reserved-but-uncommitted pages are
    /// left alone. Returns whether any page actually changed.
    pub fn set_protection(
        &self,
        addr: usize,
        size: usize,
        mode: ProtMode,
        requested: MemProt,
    ) -> Result<bool, VmError> {
        if size == 0 {
            return Ok(false);
        }
        let start = page_start(addr);
        let end = page_align_up(addr + size);
        let mut did_change = false;
        let mut cursor = start;
        while cursor < end {
            let q = self
                .kernel
                .query_virtual_memory(NT_CURRENT_PROCESS, cursor)
                .map_err(|_| VmError::Invalid)?;
            let sub_end = (q.base_address + q.region_size).min(end).max(cursor + PAGE_SIZE);
            if q.state != MEM_COMMIT {
                cursor = sub_end;
                continue;
            }
            let current = prot_from_native(q.protect);
            let rwx_now = current & (MemProt::READ | MemProt::WRITE | MemProt::EXEC);
            let target_rwx = match mode {
                ProtMode::Absolute => {
                    requested & (MemProt::READ | MemProt::WRITE | MemProt::EXEC | MemProt::COW)
                }
                ProtMode::MakeWritable => {
                    // Preserve an existing copy-on-write qualifier.
                    rwx_now
                        | MemProt::READ
                        | MemProt::WRITE
                        | (current & MemProt::COW)
                }
                ProtMode::MakeUnwritable => {
                    (rwx_now | MemProt::READ) - MemProt::WRITE
                }
                ProtMode::MakeWritableCow => {
                    rwx_now | MemProt::READ | MemProt::WRITE | MemProt::COW
                }
            };
            let qualifiers =
                current & (MemProt::GUARD | MemProt::NOCACHE | MemProt::WRITECOMBINE);
            let target = target_rwx | qualifiers;
            if target != current {
                self.kernel
                    .protect_virtual_memory(
                        NT_CURRENT_PROCESS,
                        cursor,
                        sub_end - cursor,
                        prot_to_native(target),
                    )
                    .map_err(map_status)?;
                did_change = true;
            }
            cursor = sub_end;
        }
        Ok(did_change)
    }

    /// Turn `page` into a guard page.
    pub fn mark_guard(&self, page: usize) -> Result<(), VmError> {
        self.kernel
            .protect_virtual_memory(
                NT_CURRENT_PROCESS,
                page_start(page),
                PAGE_SIZE,
                PAGE_READWRITE | PAGE_GUARD,
            )
            .map(|_| ())
            .map_err(map_status)
    }

    /// Clear the guard on `page`. Returns whether the guard had already
    /// fired, which the kernel reports by the old protection no longer
    /// carrying the guard bit.
    pub fn unmark_guard(&self, page: usize) -> Result<bool, VmError> {
        let old = self
            .kernel
            .protect_virtual_memory(
                NT_CURRENT_PROCESS,
                page_start(page),
                PAGE_SIZE,
                PAGE_READWRITE,
            )
            .map_err(map_status)?;
        Ok(old & PAGE_GUARD == 0)
    }

    /// On kernels that map the system DLL above the 32-bit-reachable
    /// range, the only legal place for reach-constrained code is the
    /// trailing in-page padding of its executable segment.
    pub fn find_free_code_in_system_dll(&self) -> Option<(usize, usize)> {
        let base = self.kernel.system_dll_base();
        if (base as u64) < (1u64 << 32) {
            // Reachable normally; use the ordinary allocator instead.
            return None;
        }
        let image = self.kernel.system_dll_image();
        let pe = MappedPe::parse(&image)?;
        let (used_end, page_end) = pe.executable_tail_padding()?;
        Some((base + used_end as usize, base + page_end as usize))
    }
}
