//! In-memory kernel and PE fixtures for tests.
//!
//! `FakeKernel` models exactly as much of the kernel as the core consumes:
//! a page map with allocation bases, a byte store, a thread registry with
//! both context widths, handles, events, and a terminate log. Nothing here
//! blocks: waits on unsignaled events report timeout immediately.

use crate::nt::types::*;
use crate::nt::{DriveEntry, Kernel};
use crate::registers::{Context, Context64, SupportedArch};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

#[derive(Copy, Clone, Debug, PartialEq)]
struct Page {
    alloc_base: usize,
    state: u32,
    protect: u32,
    mem_type: u32,
}

struct FakeThread {
    ctx: Context,
    wide: Context64,
    suspend_count: u32,
    alive: bool,
    start_address: usize,
    teb_slot: Option<usize>,
    /// First enumeration pass (1-based) on which this thread is visible.
    visible_after: usize,
}

#[derive(Copy, Clone, Debug)]
enum HandleKind {
    Thread(u32),
    Event(u32),
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TerminateCall {
    pub target: Handle,
    pub exit_code: u32,
    pub is_process: bool,
}

struct FakeState {
    pages: BTreeMap<usize, Page>,
    mem: HashMap<usize, u8>,
    threads: BTreeMap<u32, FakeThread>,
    handles: HashMap<usize, HandleKind>,
    events: HashMap<u32, bool>,
    next_handle: usize,
    next_event: u32,
    enumeration_calls: usize,
    suspend_failures: HashSet<u32>,
    set_context_failures: HashSet<u32>,
    terminations: Vec<TerminateCall>,
    numbers: OsNumbers,
    wow64: bool,
    user64: bool,
    supports_next_thread: bool,
    write_reports_count: bool,
    self_tid: u32,
    highest_user: usize,
    system_dll_base: usize,
    system_dll_image: Vec<u8>,
    registry: HashMap<(String, String), String>,
    drives: Vec<DriveEntry>,
    symlinks: HashMap<String, String>,
}

pub struct FakeKernel {
    state: Mutex<FakeState>,
}

impl FakeKernel {
    pub fn new() -> FakeKernel {
        let mut threads = BTreeMap::new();
        // The calling thread itself.
        threads.insert(
            1,
            FakeThread {
                ctx: Context::new(SupportedArch::X64),
                wide: Context64::default(),
                suspend_count: 0,
                alive: true,
                start_address: 0,
                teb_slot: None,
                visible_after: 0,
            },
        );
        FakeKernel {
            state: Mutex::new(FakeState {
                pages: BTreeMap::new(),
                mem: HashMap::new(),
                threads,
                handles: HashMap::new(),
                events: HashMap::new(),
                next_handle: 0x100,
                next_event: 1,
                enumeration_calls: 0,
                suspend_failures: HashSet::new(),
                set_context_failures: HashSet::new(),
                terminations: Vec::new(),
                numbers: OsNumbers {
                    major: 10,
                    minor: 0,
                    sp_major: 0,
                    sp_minor: 0,
                    build: 17134,
                },
                wow64: false,
                user64: true,
                supports_next_thread: true,
                write_reports_count: true,
                self_tid: 1,
                highest_user: 0x7FFF_0000,
                system_dll_base: 0,
                system_dll_image: Vec::new(),
                registry: HashMap::new(),
                drives: Vec::new(),
                symlinks: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<FakeState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    // --- fixture configuration ---

    pub fn set_os_numbers(&self, numbers: OsNumbers) {
        self.lock().numbers = numbers;
    }

    pub fn set_wow64(&self, wow64: bool) {
        let mut s = self.lock();
        s.wow64 = wow64;
        if wow64 {
            s.user64 = false;
        }
    }

    pub fn set_user_64bit(&self, user64: bool) {
        self.lock().user64 = user64;
    }

    pub fn set_supports_next_thread(&self, yes: bool) {
        self.lock().supports_next_thread = yes;
    }

    pub fn set_write_reports_count(&self, yes: bool) {
        self.lock().write_reports_count = yes;
    }

    pub fn set_system_dll(&self, base: usize, image: Vec<u8>) {
        let mut s = self.lock();
        s.system_dll_base = base;
        s.system_dll_image = image;
    }

    pub fn set_registry_string(&self, key: &str, value: &str, data: &str) {
        self.lock()
            .registry
            .insert((key.to_string(), value.to_string()), data.to_string());
    }

    pub fn add_drive(&self, letter: u8, target: &str) {
        let mut s = self.lock();
        s.drives.push(DriveEntry {
            letter,
            target: target.to_string(),
        });
        s.symlinks
            .insert(format!("\\??\\{}:", letter as char), target.to_string());
    }

    /// Map pages `[base, base+size)` in one go. `alloc_base` defaults to
    /// `base` when zero.
    pub fn map_region(
        &self,
        base: usize,
        size: usize,
        state: u32,
        protect: u32,
        mem_type: u32,
        alloc_base: usize,
    ) {
        let alloc_base = if alloc_base == 0 { base } else { alloc_base };
        let mut s = self.lock();
        let mut page = page_start(base);
        while page < base + size {
            s.pages.insert(
                page,
                Page {
                    alloc_base,
                    state,
                    protect,
                    mem_type,
                },
            );
            page += PAGE_SIZE;
        }
    }

    pub fn commit(&self, base: usize, size: usize, protect: u32) {
        self.map_region(base, size, MEM_COMMIT, protect, MEM_PRIVATE, 0);
    }

    pub fn poke_bytes(&self, addr: usize, bytes: &[u8]) {
        let mut s = self.lock();
        for (i, b) in bytes.iter().enumerate() {
            s.mem.insert(addr + i, *b);
        }
    }

    pub fn peek_bytes(&self, addr: usize, len: usize) -> Vec<u8> {
        let s = self.lock();
        (0..len)
            .map(|i| *s.mem.get(&(addr + i)).unwrap_or(&0))
            .collect()
    }

    pub fn page_protect_of(&self, addr: usize) -> Option<u32> {
        self.lock().pages.get(&page_start(addr)).map(|p| p.protect)
    }

    /// Simulate the OS delivering (and thereby clearing) a guard fault.
    pub fn fire_guard(&self, addr: usize) {
        let mut s = self.lock();
        if let Some(p) = s.pages.get_mut(&page_start(addr)) {
            p.protect &= !PAGE_GUARD;
        }
    }

    /// Register a thread whose context says it executes at `ip`. Visible
    /// from the first enumeration.
    pub fn add_thread(&self, tid: u32, ip: usize) {
        self.add_thread_visible_after(tid, ip, 0);
    }

    /// Register a thread that enumeration only reports from pass
    /// `pass` (1-based) onward.
    pub fn add_thread_visible_after(&self, tid: u32, ip: usize, pass: usize) {
        let mut s = self.lock();
        let arch = if s.user64 {
            SupportedArch::X64
        } else {
            SupportedArch::X86
        };
        let mut ctx = Context::new(arch);
        ctx.set_ip(ip);
        ctx.set_sp(0x0012_F000);
        let mut wide = Context64::default();
        wide.rip = ip as u64;
        wide.rsp = 0x0012_F000;
        s.threads.insert(
            tid,
            FakeThread {
                ctx,
                wide,
                suspend_count: 0,
                alive: true,
                start_address: ip,
                teb_slot: None,
                visible_after: pass,
            },
        );
    }

    pub fn set_thread_wide_context(&self, tid: u32, wide: Context64) {
        if let Some(t) = self.lock().threads.get_mut(&tid) {
            t.wide = wide;
        }
    }

    pub fn thread_wide_context(&self, tid: u32) -> Context64 {
        self.lock().threads.get(&tid).map(|t| t.wide).unwrap_or_default()
    }

    pub fn thread_context(&self, tid: u32) -> Context {
        self.lock()
            .threads
            .get(&tid)
            .map(|t| t.ctx)
            .unwrap_or_else(|| Context::new(SupportedArch::X64))
    }

    pub fn thread_suspend_count(&self, tid: u32) -> u32 {
        self.lock()
            .threads
            .get(&tid)
            .map(|t| t.suspend_count)
            .unwrap_or(0)
    }

    pub fn kill_thread(&self, tid: u32) {
        if let Some(t) = self.lock().threads.get_mut(&tid) {
            t.alive = false;
        }
    }

    pub fn fail_suspend_of(&self, tid: u32) {
        self.lock().suspend_failures.insert(tid);
    }

    pub fn fail_set_context_of(&self, tid: u32) {
        self.lock().set_context_failures.insert(tid);
    }

    pub fn set_teb_slot(&self, tid: u32, addr: usize) {
        if let Some(t) = self.lock().threads.get_mut(&tid) {
            t.teb_slot = Some(addr);
        }
    }

    pub fn terminations(&self) -> Vec<TerminateCall> {
        self.lock().terminations.clone()
    }

    pub fn open_handle_count(&self) -> usize {
        self.lock().handles.len()
    }

    fn new_thread_handle(s: &mut FakeState, tid: u32) -> Handle {
        let h = s.next_handle;
        s.next_handle += 4;
        s.handles.insert(h, HandleKind::Thread(tid));
        Handle(h)
    }

    fn thread_of(s: &FakeState, handle: Handle) -> Result<u32, NtStatus> {
        if handle == NT_CURRENT_THREAD {
            return Ok(s.self_tid);
        }
        match s.handles.get(&handle.0) {
            Some(HandleKind::Thread(tid)) => Ok(*tid),
            _ => Err(STATUS_INVALID_HANDLE),
        }
    }

    /// The maximal run of identical pages containing `page`.
    fn region_around(s: &FakeState, page: usize) -> (usize, usize, Page) {
        let p = s.pages[&page];
        let mut start = page;
        while start >= PAGE_SIZE {
            match s.pages.get(&(start - PAGE_SIZE)) {
                Some(q) if *q == p => start -= PAGE_SIZE,
                _ => break,
            }
        }
        let mut end = page + PAGE_SIZE;
        while let Some(q) = s.pages.get(&end) {
            if *q == p {
                end += PAGE_SIZE;
            } else {
                break;
            }
        }
        (start, end - start, p)
    }
}

impl Kernel for FakeKernel {
    fn query_virtual_memory(
        &self,
        _process: Handle,
        addr: usize,
    ) -> Result<MemoryBasicInformation, NtStatus> {
        let s = self.lock();
        if addr > s.highest_user {
            return Err(STATUS_INVALID_PARAMETER);
        }
        let page = page_start(addr);
        if s.pages.contains_key(&page) {
            let (base, size, p) = Self::region_around(&s, page);
            Ok(MemoryBasicInformation {
                base_address: base,
                allocation_base: p.alloc_base,
                allocation_protect: p.protect,
                region_size: size,
                state: p.state,
                protect: p.protect,
                mem_type: p.mem_type,
            })
        } else {
            // Free run: from the end of the previous mapping to the start
            // of the next one.
            let start = s
                .pages
                .range(..page)
                .next_back()
                .map(|(&b, _)| b + PAGE_SIZE)
                .unwrap_or(0);
            let end = s
                .pages
                .range(page..)
                .next()
                .map(|(&b, _)| b)
                .unwrap_or(s.highest_user + 1);
            Ok(MemoryBasicInformation {
                base_address: start,
                allocation_base: 0,
                allocation_protect: 0,
                region_size: end - start,
                state: MEM_FREE,
                protect: PAGE_NOACCESS,
                mem_type: 0,
            })
        }
    }

    fn allocate_virtual_memory(
        &self,
        _process: Handle,
        preferred: usize,
        size: usize,
        alloc_type: u32,
        protect: u32,
    ) -> Result<(usize, usize), NtStatus> {
        let mut s = self.lock();
        if size == 0 {
            return Err(STATUS_INVALID_PARAMETER);
        }
        let size = page_align_up(size);
        let base = if preferred != 0 {
            preferred & !(ALLOCATION_GRANULARITY - 1)
        } else {
            // First granule-aligned free hole.
            let mut candidate = ALLOCATION_GRANULARITY;
            loop {
                let mut free = true;
                let mut page = candidate;
                while page < candidate + size {
                    if s.pages.contains_key(&page) {
                        free = false;
                        break;
                    }
                    page += PAGE_SIZE;
                }
                if free {
                    break candidate;
                }
                candidate += ALLOCATION_GRANULARITY;
                if candidate > s.highest_user {
                    return Err(STATUS_NO_MEMORY);
                }
            }
        };
        if alloc_type & MEM_RESERVE != 0 {
            let mut page = base;
            while page < base + size {
                if s.pages.contains_key(&page) {
                    return Err(STATUS_CONFLICTING_ADDRESSES);
                }
                page += PAGE_SIZE;
            }
            let state = if alloc_type & MEM_COMMIT != 0 {
                MEM_COMMIT
            } else {
                MEM_RESERVE
            };
            let mut page = base;
            while page < base + size {
                s.pages.insert(
                    page,
                    Page {
                        alloc_base: base,
                        state,
                        protect,
                        mem_type: MEM_PRIVATE,
                    },
                );
                page += PAGE_SIZE;
            }
            return Ok((base, size));
        }
        if alloc_type & MEM_COMMIT != 0 {
            // Commit of an existing reservation.
            let base = page_start(if preferred != 0 { preferred } else { base });
            let mut page = base;
            while page < base + size {
                match s.pages.get_mut(&page) {
                    Some(p) => {
                        p.state = MEM_COMMIT;
                        p.protect = protect;
                    }
                    None => return Err(STATUS_CONFLICTING_ADDRESSES),
                }
                page += PAGE_SIZE;
            }
            return Ok((base, size));
        }
        Err(STATUS_INVALID_PARAMETER)
    }

    fn free_virtual_memory(
        &self,
        _process: Handle,
        base: usize,
        size: usize,
        free_type: u32,
    ) -> Result<(), NtStatus> {
        let mut s = self.lock();
        if free_type == MEM_RELEASE {
            let pages: Vec<usize> = s
                .pages
                .iter()
                .filter(|(_, p)| p.alloc_base == base)
                .map(|(&b, _)| b)
                .collect();
            if pages.is_empty() {
                return Err(STATUS_INVALID_PARAMETER);
            }
            for page in pages {
                s.pages.remove(&page);
            }
            Ok(())
        } else if free_type == MEM_DECOMMIT {
            let size = page_align_up(size.max(1));
            let mut page = page_start(base);
            while page < base + size {
                if let Some(p) = s.pages.get_mut(&page) {
                    p.state = MEM_RESERVE;
                }
                page += PAGE_SIZE;
            }
            Ok(())
        } else {
            Err(STATUS_INVALID_PARAMETER)
        }
    }

    fn protect_virtual_memory(
        &self,
        _process: Handle,
        base: usize,
        size: usize,
        protect: u32,
    ) -> Result<u32, NtStatus> {
        let mut s = self.lock();
        let first = page_start(base);
        let end = page_align_up(base + size.max(1));
        let old = match s.pages.get(&first) {
            Some(p) if p.state == MEM_COMMIT => p.protect,
            _ => return Err(STATUS_INVALID_PAGE_PROTECTION),
        };
        // All-or-nothing like the kernel: validate first.
        let mut page = first;
        while page < end {
            match s.pages.get(&page) {
                Some(p) if p.state == MEM_COMMIT => {}
                _ => return Err(STATUS_INVALID_PAGE_PROTECTION),
            }
            page += PAGE_SIZE;
        }
        let mut page = first;
        while page < end {
            if let Some(p) = s.pages.get_mut(&page) {
                p.protect = protect;
            }
            page += PAGE_SIZE;
        }
        Ok(old)
    }

    fn read_virtual_memory(
        &self,
        _process: Handle,
        addr: usize,
        buf: &mut [u8],
    ) -> Result<usize, NtStatus> {
        let s = self.lock();
        let mut copied = 0;
        for i in 0..buf.len() {
            let a = addr + i;
            let readable = match s.pages.get(&page_start(a)) {
                Some(p) => {
                    p.state == MEM_COMMIT
                        && p.protect & PAGE_PROT_MASK != PAGE_NOACCESS
                        && p.protect & PAGE_GUARD == 0
                }
                None => false,
            };
            if !readable {
                break;
            }
            buf[i] = *s.mem.get(&a).unwrap_or(&0);
            copied += 1;
        }
        if copied == 0 && !buf.is_empty() {
            Err(STATUS_ACCESS_VIOLATION)
        } else {
            Ok(copied)
        }
    }

    fn write_virtual_memory(
        &self,
        _process: Handle,
        addr: usize,
        buf: &[u8],
    ) -> Result<Option<usize>, NtStatus> {
        let mut s = self.lock();
        const WRITABLE: [u32; 4] = [
            PAGE_READWRITE,
            PAGE_WRITECOPY,
            PAGE_EXECUTE_READWRITE,
            PAGE_EXECUTE_WRITECOPY,
        ];
        let mut copied = 0;
        for i in 0..buf.len() {
            let a = addr + i;
            let writable = match s.pages.get(&page_start(a)) {
                Some(p) => {
                    p.state == MEM_COMMIT
                        && WRITABLE.contains(&(p.protect & PAGE_PROT_MASK))
                        && p.protect & PAGE_GUARD == 0
                }
                None => false,
            };
            if !writable {
                break;
            }
            s.mem.insert(a, buf[i]);
            copied += 1;
        }
        if copied == 0 && !buf.is_empty() {
            return Err(STATUS_ACCESS_VIOLATION);
        }
        if s.write_reports_count {
            Ok(Some(copied))
        } else {
            Ok(None)
        }
    }

    fn flush_instruction_cache(
        &self,
        _process: Handle,
        _addr: usize,
        _size: usize,
    ) -> Result<(), NtStatus> {
        Ok(())
    }

    fn highest_user_address(&self) -> usize {
        self.lock().highest_user
    }

    fn current_thread_id(&self) -> u32 {
        self.lock().self_tid
    }

    fn open_thread(&self, tid: u32) -> Result<Handle, NtStatus> {
        let mut s = self.lock();
        if !s.threads.contains_key(&tid) {
            return Err(STATUS_INVALID_PARAMETER);
        }
        Ok(Self::new_thread_handle(&mut s, tid))
    }

    fn duplicate_thread_handle(&self, thread: Handle) -> Result<Handle, NtStatus> {
        let mut s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        Ok(Self::new_thread_handle(&mut s, tid))
    }

    fn close_handle(&self, handle: Handle) -> Result<(), NtStatus> {
        if handle.is_pseudo() {
            return Ok(());
        }
        let mut s = self.lock();
        match s.handles.remove(&handle.0) {
            Some(_) => Ok(()),
            None => Err(STATUS_INVALID_HANDLE),
        }
    }

    fn suspend_thread(&self, thread: Handle) -> Result<u32, NtStatus> {
        let mut s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        if s.suspend_failures.contains(&tid) {
            return Err(STATUS_ACCESS_DENIED);
        }
        let t = s.threads.get_mut(&tid).ok_or(STATUS_INVALID_HANDLE)?;
        if !t.alive {
            return Err(STATUS_THREAD_IS_TERMINATING);
        }
        let prev = t.suspend_count;
        t.suspend_count += 1;
        Ok(prev)
    }

    fn resume_thread(&self, thread: Handle) -> Result<u32, NtStatus> {
        let mut s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        let t = s.threads.get_mut(&tid).ok_or(STATUS_INVALID_HANDLE)?;
        let prev = t.suspend_count;
        t.suspend_count = t.suspend_count.saturating_sub(1);
        Ok(prev)
    }

    fn get_context(&self, thread: Handle, ctx: &mut Context) -> Result<(), NtStatus> {
        let s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        let t = s.threads.get(&tid).ok_or(STATUS_INVALID_HANDLE)?;
        *ctx = t.ctx;
        Ok(())
    }

    fn set_context(&self, thread: Handle, ctx: &Context) -> Result<(), NtStatus> {
        let mut s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        if s.set_context_failures.contains(&tid) {
            return Err(STATUS_ACCESS_DENIED);
        }
        let t = s.threads.get_mut(&tid).ok_or(STATUS_INVALID_HANDLE)?;
        t.ctx = *ctx;
        Ok(())
    }

    fn get_context_x64(&self, thread: Handle, ctx: &mut Context64) -> Result<(), NtStatus> {
        let s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        let t = s.threads.get(&tid).ok_or(STATUS_INVALID_HANDLE)?;
        *ctx = t.wide;
        Ok(())
    }

    fn set_context_x64(&self, thread: Handle, ctx: &Context64) -> Result<(), NtStatus> {
        let mut s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        let t = s.threads.get_mut(&tid).ok_or(STATUS_INVALID_HANDLE)?;
        t.wide = *ctx;
        Ok(())
    }

    fn next_thread(&self, prev: Option<Handle>) -> Result<Handle, NtStatus> {
        let mut s = self.lock();
        if !s.supports_next_thread {
            return Err(STATUS_NOT_IMPLEMENTED);
        }
        let from = match prev {
            None => {
                s.enumeration_calls += 1;
                0
            }
            Some(h) => Self::thread_of(&s, h)? + 1,
        };
        let epoch = s.enumeration_calls;
        let next = s
            .threads
            .range(from..)
            .find(|(_, t)| t.visible_after <= epoch)
            .map(|(&tid, _)| tid);
        match next {
            Some(tid) => Ok(Self::new_thread_handle(&mut s, tid)),
            None => Err(STATUS_NO_MORE_ENTRIES),
        }
    }

    fn system_thread_ids(&self) -> Result<Vec<u32>, NtStatus> {
        let mut s = self.lock();
        s.enumeration_calls += 1;
        let epoch = s.enumeration_calls;
        Ok(s
            .threads
            .iter()
            .filter(|(_, t)| t.visible_after <= epoch)
            .map(|(&tid, _)| tid)
            .collect())
    }

    fn thread_id_of(&self, thread: Handle) -> Result<u32, NtStatus> {
        let s = self.lock();
        Self::thread_of(&s, thread)
    }

    fn thread_start_address(&self, thread: Handle) -> Result<usize, NtStatus> {
        let s = self.lock();
        let tid = Self::thread_of(&s, thread)?;
        Ok(s.threads.get(&tid).map(|t| t.start_address).unwrap_or(0))
    }

    fn terminate_thread(&self, thread: Handle, exit_code: u32) -> NtStatus {
        let mut s = self.lock();
        let tid = match Self::thread_of(&s, thread) {
            Ok(t) => t,
            Err(status) => return status,
        };
        if let Some(t) = s.threads.get_mut(&tid) {
            t.alive = false;
        }
        s.terminations.push(TerminateCall {
            target: thread,
            exit_code,
            is_process: false,
        });
        STATUS_SUCCESS
    }

    fn terminate_process(&self, process: Handle, exit_code: u32) -> NtStatus {
        let mut s = self.lock();
        s.terminations.push(TerminateCall {
            target: process,
            exit_code,
            is_process: true,
        });
        STATUS_SUCCESS
    }

    fn create_event(&self) -> Result<Handle, NtStatus> {
        let mut s = self.lock();
        let id = s.next_event;
        s.next_event += 1;
        s.events.insert(id, false);
        let h = s.next_handle;
        s.next_handle += 4;
        s.handles.insert(h, HandleKind::Event(id));
        Ok(Handle(h))
    }

    fn set_event(&self, event: Handle) -> Result<(), NtStatus> {
        let mut s = self.lock();
        match s.handles.get(&event.0).copied() {
            Some(HandleKind::Event(id)) => {
                s.events.insert(id, true);
                Ok(())
            }
            _ => Err(STATUS_INVALID_HANDLE),
        }
    }

    fn reset_event(&self, event: Handle) -> Result<(), NtStatus> {
        let mut s = self.lock();
        match s.handles.get(&event.0).copied() {
            Some(HandleKind::Event(id)) => {
                s.events.insert(id, false);
                Ok(())
            }
            _ => Err(STATUS_INVALID_HANDLE),
        }
    }

    fn wait_event(&self, event: Handle, _timeout_ms: u32) -> NtStatus {
        // Never blocks: tests signal first or expect timeout.
        let s = self.lock();
        match s.handles.get(&event.0) {
            Some(HandleKind::Event(id)) => {
                if *s.events.get(id).unwrap_or(&false) {
                    STATUS_SUCCESS
                } else {
                    STATUS_TIMEOUT
                }
            }
            _ => STATUS_INVALID_HANDLE,
        }
    }

    fn os_numbers(&self) -> OsNumbers {
        self.lock().numbers
    }

    fn is_wow64_process(&self) -> bool {
        self.lock().wow64
    }

    fn user_is_64bit(&self) -> bool {
        self.lock().user64
    }

    fn system_dll_base(&self) -> usize {
        self.lock().system_dll_base
    }

    fn system_dll_image(&self) -> Vec<u8> {
        self.lock().system_dll_image.clone()
    }

    fn registry_string(&self, key_path: &str, value_name: &str) -> Option<String> {
        self.lock()
            .registry
            .get(&(key_path.to_string(), value_name.to_string()))
            .cloned()
    }

    fn device_map(&self) -> Result<Vec<DriveEntry>, NtStatus> {
        Ok(self.lock().drives.clone())
    }

    fn query_symbolic_link(&self, path: &str) -> Result<String, NtStatus> {
        self.lock()
            .symlinks
            .get(path)
            .cloned()
            .ok_or(STATUS_OBJECT_NAME_NOT_FOUND)
    }

    fn teb_scratch_slot(&self, thread: Option<Handle>) -> Option<usize> {
        let s = self.lock();
        let tid = match thread {
            None => s.self_tid,
            Some(h) => Self::thread_of(&s, h).ok()?,
        };
        s.threads.get(&tid).and_then(|t| t.teb_slot)
    }
}

/// Builds minimal mapped 64-bit PE images with export and import tables,
/// enough for header parsing, export probing, prologue extraction and
/// import-walk tests.
pub mod pe_builder {
    const TEXT_RVA: usize = 0x1000;
    const RDATA_RVA: usize = 0x3000;
    const IMAGE_SIZE: usize = 0x6000;

    pub struct FakePeBuilder {
        exports: Vec<(String, Vec<u8>)>,
        imports: Vec<(String, String)>,
    }

    fn put_u16(image: &mut Vec<u8>, at: usize, v: u16) {
        image[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(image: &mut Vec<u8>, at: usize, v: u32) {
        image[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u64(image: &mut Vec<u8>, at: usize, v: u64) {
        image[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    impl FakePeBuilder {
        pub fn new() -> FakePeBuilder {
            FakePeBuilder {
                exports: Vec::new(),
                imports: Vec::new(),
            }
        }

        pub fn export(mut self, name: &str, body: &[u8]) -> FakePeBuilder {
            self.exports.push((name.to_string(), body.to_vec()));
            self
        }

        /// A syscall wrapper export with the x64 dispatch prologue.
        pub fn syscall_wrapper(self, name: &str, number: u32) -> FakePeBuilder {
            let n = number.to_le_bytes();
            let body = [
                0x4C, 0x8B, 0xD1, // mov r10, rcx
                0xB8, n[0], n[1], n[2], n[3], // mov eax, imm32
                0x0F, 0x05, // syscall
                0xC3, // ret
            ];
            self.export(name, &body)
        }

        pub fn import(mut self, dll: &str, symbol: &str) -> FakePeBuilder {
            self.imports.push((dll.to_string(), symbol.to_string()));
            self
        }

        pub fn build(mut self) -> Vec<u8> {
            // The parser walks export names linearly, but a sorted table is
            // what a real linker emits.
            self.exports.sort_by(|a, b| a.0.cmp(&b.0));
            let mut image = vec![0u8; IMAGE_SIZE];

            // DOS header.
            put_u16(&mut image, 0x00, 0x5A4D); // MZ
            put_u32(&mut image, 0x3C, 0x80); // e_lfanew
            let pe = 0x80;
            put_u32(&mut image, pe, 0x0000_4550); // PE\0\0
            let coff = pe + 4;
            put_u16(&mut image, coff, 0x8664); // machine
            put_u16(&mut image, coff + 2, 2); // sections
            put_u16(&mut image, coff + 16, 0xF0); // optional header size
            put_u16(&mut image, coff + 18, 0x2022); // dll, executable
            let opt = coff + 20;
            put_u16(&mut image, opt, 0x20B); // PE32+
            put_u32(&mut image, opt + 16, TEXT_RVA as u32); // entry
            put_u64(&mut image, opt + 24, 0x7FFA_0000_0000); // image base
            put_u32(&mut image, opt + 32, 0x1000); // section alignment
            put_u32(&mut image, opt + 36, 0x1000); // file alignment
            put_u32(&mut image, opt + 56, IMAGE_SIZE as u32); // size of image
            put_u32(&mut image, opt + 60, 0x400); // size of headers
            put_u16(&mut image, opt + 68, 3); // subsystem: console
            put_u32(&mut image, opt + 108, 16); // rva-and-sizes count
            let dirs = opt + 112;

            // Lay out export bodies into .text first so the section's
            // virtual size is known.
            let sec = opt + 0xF0;
            let mut at = TEXT_RVA;
            for (_, body) in &self.exports {
                image[at..at + body.len()].copy_from_slice(body);
                at += (body.len() + 0xF) & !0xF;
            }
            let text_used = (at - TEXT_RVA).max(0x10);
            image[sec..sec + 5].copy_from_slice(b".text");
            put_u32(&mut image, sec + 8, text_used as u32); // virtual size
            put_u32(&mut image, sec + 12, TEXT_RVA as u32);
            put_u32(&mut image, sec + 16, text_used as u32);
            put_u32(&mut image, sec + 20, TEXT_RVA as u32);
            put_u32(&mut image, sec + 36, 0x6000_0020); // code | exec | read
            let sec2 = sec + 40;
            image[sec2..sec2 + 6].copy_from_slice(b".rdata");
            put_u32(&mut image, sec2 + 8, (IMAGE_SIZE - RDATA_RVA) as u32);
            put_u32(&mut image, sec2 + 12, RDATA_RVA as u32);
            put_u32(&mut image, sec2 + 16, (IMAGE_SIZE - RDATA_RVA) as u32);
            put_u32(&mut image, sec2 + 20, RDATA_RVA as u32);
            put_u32(&mut image, sec2 + 36, 0x4000_0040); // data | read

            let mut cursor = RDATA_RVA;

            // Export directory.
            if !self.exports.is_empty() {
                let n = self.exports.len();
                let dir = cursor;
                cursor += 40;
                let functions = cursor;
                cursor += 4 * n;
                let names = cursor;
                cursor += 4 * n;
                let ordinals = cursor;
                cursor += 2 * n;

                let mut body_rva = TEXT_RVA;
                for (i, (name, body)) in self.exports.iter().enumerate() {
                    put_u32(&mut image, functions + 4 * i, body_rva as u32);
                    body_rva += (body.len() + 0xF) & !0xF;
                    let name_rva = cursor;
                    image[cursor..cursor + name.len()].copy_from_slice(name.as_bytes());
                    cursor += name.len() + 1;
                    put_u32(&mut image, names + 4 * i, name_rva as u32);
                    put_u16(&mut image, ordinals + 2 * i, i as u16);
                }
                put_u32(&mut image, dir + 0x10, 1); // ordinal base
                put_u32(&mut image, dir + 0x14, n as u32);
                put_u32(&mut image, dir + 0x18, n as u32);
                put_u32(&mut image, dir + 0x1C, functions as u32);
                put_u32(&mut image, dir + 0x20, names as u32);
                put_u32(&mut image, dir + 0x24, ordinals as u32);
                put_u32(&mut image, dirs, dir as u32);
                put_u32(&mut image, dirs + 4, (cursor - dir) as u32);
            }

            // Import descriptors, grouped by dll.
            if !self.imports.is_empty() {
                cursor = (cursor + 0xF) & !0xF;
                let mut dlls: Vec<String> = Vec::new();
                for (dll, _) in &self.imports {
                    if !dlls.iter().any(|d| d == dll) {
                        dlls.push(dll.clone());
                    }
                }
                let desc_base = cursor;
                cursor += 0x14 * (dlls.len() + 1); // + zero terminator
                let import_dir_size = cursor - desc_base;

                for (d, dll) in dlls.iter().enumerate() {
                    let symbols: Vec<&String> = self
                        .imports
                        .iter()
                        .filter(|(dl, _)| dl == dll)
                        .map(|(_, sym)| sym)
                        .collect();
                    // Hint/name entries.
                    let mut hint_rvas = Vec::new();
                    for sym in &symbols {
                        cursor = (cursor + 1) & !1;
                        hint_rvas.push(cursor);
                        cursor += 2; // hint
                        image[cursor..cursor + sym.len()].copy_from_slice(sym.as_bytes());
                        cursor += sym.len() + 1;
                    }
                    cursor = (cursor + 7) & !7;
                    let int = cursor;
                    cursor += 8 * (symbols.len() + 1);
                    let iat = cursor;
                    cursor += 8 * (symbols.len() + 1);
                    for (i, hint) in hint_rvas.iter().enumerate() {
                        put_u64(&mut image, int + 8 * i, *hint as u64);
                        put_u64(&mut image, iat + 8 * i, *hint as u64);
                    }
                    let dll_name = cursor;
                    image[cursor..cursor + dll.len()].copy_from_slice(dll.as_bytes());
                    cursor += dll.len() + 1;

                    let desc = desc_base + 0x14 * d;
                    put_u32(&mut image, desc, int as u32);
                    put_u32(&mut image, desc + 0x0C, dll_name as u32);
                    put_u32(&mut image, desc + 0x10, iat as u32);
                }
                put_u32(&mut image, dirs + 8, desc_base as u32);
                put_u32(&mut image, dirs + 12, import_dir_size as u32);
            }

            image
        }
    }
}
