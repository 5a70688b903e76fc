//! Region queries.
//!
//! A "region" is the maximal run of pages sharing allocation base, state
//! and protection. The kernel reports subregions; finding the run's real
//! base by walking forward from the allocation base is O(subregions), and
//! pathological allocations carry tens of thousands of them. So the walk
//! starts from a cheap lower bound found by probing backwards with
//! doubling offsets, and the forward walk is hard-capped.

use super::{MemInfo, MemKind, MemProt, Vm};
use crate::log::{LogLevel, SyslogCode};
use crate::nt::types::*;

/// Backward probes before giving up and walking from the allocation base;
/// the probe offset doubles each step.
const BACKWARD_PROBES: usize = 14;

/// Hard cap on forward steps. Hitting it is a curiosity, not an error.
const MAX_FORWARD_STEPS: usize = 1 << 19;

/// Signature that defines region homogeneity.
#[derive(Copy, Clone, Eq, PartialEq)]
struct RegionSig {
    alloc_base: usize,
    state: u32,
    protect: u32,
}

impl RegionSig {
    fn of(mbi: &MemoryBasicInformation) -> RegionSig {
        RegionSig {
            alloc_base: mbi.allocation_base,
            state: mbi.state,
            protect: mbi.protect,
        }
    }
}

fn kind_of(mbi: &MemoryBasicInformation) -> MemKind {
    match mbi.state {
        MEM_FREE => MemKind::Free,
        MEM_RESERVE => MemKind::Reserved,
        _ => {
            if mbi.mem_type == MEM_IMAGE {
                MemKind::Image
            } else {
                MemKind::Data
            }
        }
    }
}

impl<'k> Vm<'k> {
    fn raw_query(&self, addr: usize) -> Result<MemoryBasicInformation, NtStatus> {
        self.kernel.query_virtual_memory(NT_CURRENT_PROCESS, addr)
    }

    /// Describe the homogeneous region containing `addr`.
    pub fn query(&self, addr: usize) -> MemInfo {
        self.query_ex(addr, true)
    }

    /// `get_real_base = false` trades the region's true base for a single
    /// kernel query: the caller gets the containing page only.
    pub fn query_ex(&self, addr: usize, get_real_base: bool) -> MemInfo {
        let mbi = match self.raw_query(addr) {
            Ok(mbi) => mbi,
            Err(STATUS_INVALID_PARAMETER) => {
                // The kernel-address signature; upstream distinguishes
                // this from transient failures.
                return MemInfo {
                    base: page_start(addr),
                    size: PAGE_SIZE,
                    prot: MemProt::empty(),
                    kind: MemKind::KernelError,
                };
            }
            Err(_) => {
                return MemInfo {
                    base: page_start(addr),
                    size: PAGE_SIZE,
                    prot: MemProt::empty(),
                    kind: MemKind::Error,
                };
            }
        };
        let kind = kind_of(&mbi);
        let prot = super::prot_from_native(mbi.protect);

        if !get_real_base {
            let page = page_start(addr);
            return MemInfo {
                base: page,
                size: (mbi.base_address + mbi.region_size).saturating_sub(page),
                prot,
                kind,
            };
        }

        // Free and reserved runs come back already maximal.
        if mbi.state != MEM_COMMIT {
            return MemInfo {
                base: mbi.base_address,
                size: mbi.region_size,
                prot,
                kind,
            };
        }

        let sig = RegionSig::of(&mbi);
        let walk_from = self.backward_lower_bound(addr, &mbi, sig);
        let (base, size) = self.forward_extent(walk_from, addr, &mbi, sig);
        MemInfo {
            base,
            size,
            prot,
            kind,
        }
    }

    /// Probe backwards with doubling page offsets while the probes still
    /// belong to the same homogeneous run; the last matching probe's
    /// subregion base bounds the run start from below.
    fn backward_lower_bound(
        &self,
        addr: usize,
        mbi: &MemoryBasicInformation,
        sig: RegionSig,
    ) -> usize {
        let mut lower = mbi.base_address;
        let mut offset = PAGE_SIZE;
        for _ in 0..BACKWARD_PROBES {
            let probe = match addr.checked_sub(offset) {
                Some(p) => p,
                None => break,
            };
            if probe < mbi.allocation_base {
                break;
            }
            match self.raw_query(probe) {
                Ok(q) if RegionSig::of(&q) == sig => {
                    lower = q.base_address;
                }
                // Different protection, a free hole, or a foreign
                // allocation: the run starts above this probe.
                _ => break,
            }
            offset *= 2;
        }
        lower
    }

    /// Walk forward from `walk_from` collecting the consecutive run of
    /// matching subregions around `addr`.
    fn forward_extent(
        &self,
        walk_from: usize,
        addr: usize,
        first: &MemoryBasicInformation,
        sig: RegionSig,
    ) -> (usize, usize) {
        let mut run_start: Option<usize> = None;
        let mut cursor = walk_from;
        let mut crossed = false;
        let mut end = first.base_address + first.region_size;
        for step in 0..MAX_FORWARD_STEPS {
            if step == MAX_FORWARD_STEPS - 1 {
                syslog_once!(
                    LogLevel::LogWarn,
                    SyslogCode::QueryWalkCap,
                    "region walk at {:#x} hit the forward-step cap",
                    addr
                );
                break;
            }
            let q = match self.raw_query(cursor) {
                Ok(q) => q,
                Err(_) => break,
            };
            let matches = RegionSig::of(&q) == sig;
            if matches && run_start.is_none() {
                run_start = Some(q.base_address);
            }
            if !matches {
                if crossed {
                    // The run containing addr just ended.
                    break;
                }
                run_start = None;
            }
            let q_end = q.base_address + q.region_size;
            if q.base_address <= addr && addr < q_end {
                crossed = true;
            }
            if matches && crossed {
                end = q_end;
            }
            // Zero-size reports must not wedge the walk.
            cursor = if q_end > cursor { q_end } else { cursor + PAGE_SIZE };
        }
        let base = run_start.unwrap_or(first.base_address);
        (base, end.saturating_sub(base))
    }

    /// Base and total size of the whole allocation containing `addr`:
    /// forward-only walk from the allocation base while the base stays
    /// the same.
    pub fn allocation_size(&self, addr: usize) -> Option<(usize, usize)> {
        let mbi = self.raw_query(addr).ok()?;
        if mbi.state == MEM_FREE {
            return None;
        }
        let alloc_base = mbi.allocation_base;
        let mut cursor = alloc_base;
        let mut end = alloc_base;
        for _ in 0..MAX_FORWARD_STEPS {
            match self.raw_query(cursor) {
                Ok(q) if q.state != MEM_FREE && q.allocation_base == alloc_base => {
                    let q_end = q.base_address + q.region_size;
                    end = q_end.max(end);
                    cursor = if q_end > cursor {
                        q_end
                    } else {
                        cursor + PAGE_SIZE
                    };
                }
                _ => break,
            }
        }
        Some((alloc_base, end - alloc_base))
    }

    /// First free hole of at least `size` bytes in `[low, high)`,
    /// granularity-aligned, never the null page.
    pub fn find_free_in_range(
        &self,
        low: usize,
        high: usize,
        size: usize,
    ) -> Option<(usize, usize)> {
        if size == 0 || low >= high {
            return None;
        }
        let mut cursor = granule_align_up(low);
        if cursor == 0 {
            // Skip the null page's granule entirely.
            cursor = ALLOCATION_GRANULARITY;
        }
        for _ in 0..MAX_FORWARD_STEPS {
            if cursor.saturating_add(size) > high {
                return None;
            }
            let q = match self.raw_query(cursor) {
                Ok(q) => q,
                Err(_) => return None,
            };
            if q.state == MEM_FREE {
                let free_end = q.base_address + q.region_size;
                if cursor + size <= free_end {
                    return Some((cursor, cursor + size));
                }
                cursor = granule_align_up(free_end);
            } else {
                let q_end = q.base_address + q.region_size;
                cursor = granule_align_up(if q_end > cursor {
                    q_end
                } else {
                    cursor + PAGE_SIZE
                });
            }
        }
        None
    }

    /// Page-walk check that `[addr, addr+len)` is committed, readable and
    /// unguarded. Inherently racy; callers needing a guarantee use
    /// `safe_mem` instead.
    pub fn is_readable_without_fault(&self, addr: usize, len: usize) -> bool {
        if len == 0 {
            return true;
        }
        let mut page = page_start(addr);
        let last = page_start(addr + len - 1);
        while page <= last {
            match self.raw_query(page) {
                Ok(q) => {
                    let readable = q.state == MEM_COMMIT
                        && q.protect & PAGE_PROT_MASK != PAGE_NOACCESS
                        && q.protect & PAGE_GUARD == 0;
                    if !readable {
                        return false;
                    }
                }
                Err(_) => return false,
            }
            page += PAGE_SIZE;
        }
        true
    }
}
