//! Earliest-injection entry point.
//!
//! When the injector's hook fires, the runtime image is mapped but its
//! imports are unresolved: nothing that depends on an import table may
//! run. The injector leaves an arguments block at a well-known address;
//! this module parses it, resolves the runtime's own imports against the
//! system DLL's export directory by hand, restores the protection the
//! injector lifted on the hook site, records the handful of process-wide
//! facts the rest of initialization needs, and frees the block with a
//! direct syscall.
//!
//! There is no logging here: the sink is not wired up yet, and a failure
//! silently surrenders the process to its native continuation.

use crate::nt::pe::MappedPe;
use crate::nt::types::{MEM_RELEASE, NT_CURRENT_PROCESS, PAGE_SIZE};
use crate::nt::Kernel;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const MAX_PATH: usize = 260;

/// The block the injector places in the target. Layout is part of the
/// injector contract.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct EarlyInjectArgs {
    /// Base of the mapped runtime image.
    pub runtime_base: usize,
    /// Base of the loaded system DLL.
    pub system_dll_base: usize,
    /// NUL-terminated file path of the runtime image.
    pub runtime_path: [u8; MAX_PATH],
    /// Address the injector patched to gain control.
    pub hook_location: usize,
    /// Protection the hook page had before the injector made it
    /// writable.
    pub hook_old_protection: u32,
    /// Non-zero when injection happened after process initialization.
    pub late: u32,
}

const_assert!(std::mem::size_of::<EarlyInjectArgs>() <= PAGE_SIZE);

static SYSTEM_DLL_BASE: AtomicUsize = AtomicUsize::new(0);

lazy_static! {
    static ref RUNTIME_PATH: Mutex<Option<String>> = Mutex::new(None);
}

pub fn system_dll_base() -> usize {
    SYSTEM_DLL_BASE.load(Ordering::Acquire)
}

pub fn runtime_image_path() -> Option<String> {
    match RUNTIME_PATH.lock() {
        Ok(p) => p.clone(),
        Err(_) => None,
    }
}

/// Parse the injector's block out of raw bytes.
pub fn parse_early_args(bytes: &[u8]) -> Option<EarlyInjectArgs> {
    if bytes.len() < std::mem::size_of::<EarlyInjectArgs>() {
        return None;
    }
    // Plain-old-data; the injector gives no alignment promise.
    let args =
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const EarlyInjectArgs) };
    if args.runtime_base == 0 || args.system_dll_base == 0 {
        return None;
    }
    Some(args)
}

fn path_from_args(args: &EarlyInjectArgs) -> Option<String> {
    let len = args
        .runtime_path
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(MAX_PATH);
    std::str::from_utf8(&args.runtime_path[..len])
        .ok()
        .map(|s| s.to_string())
}

/// Read a whole mapped image: header page first to learn the size, then
/// the rest.
fn read_image(kernel: &dyn Kernel, base: usize) -> Option<Vec<u8>> {
    let mut header = vec![0u8; PAGE_SIZE];
    let n = kernel
        .read_virtual_memory(NT_CURRENT_PROCESS, base, &mut header)
        .ok()?;
    if n < header.len() {
        return None;
    }
    let size = MappedPe::parse(&header)?.size_of_image();
    let mut image = vec![0u8; size];
    let n = kernel
        .read_virtual_memory(NT_CURRENT_PROCESS, base, &mut image)
        .ok()?;
    image.truncate(n);
    Some(image)
}

/// Resolve every by-name import the runtime declares against the system
/// DLL, as `(iat_address, resolved_address)` pairs. None when any symbol
/// is missing: a partially-imported runtime must not run.
pub fn resolve_imports(
    runtime_image: &[u8],
    runtime_base: usize,
    system_dll_image: &[u8],
    system_dll_base: usize,
) -> Option<Vec<(usize, usize)>> {
    let runtime = MappedPe::parse(runtime_image)?;
    let system = MappedPe::parse(system_dll_image)?;
    let mut resolved = Vec::new();
    for (iat_rva, symbol) in runtime.imports_from("ntdll.dll") {
        let rva = system.export_rva(&symbol)?;
        resolved.push((runtime_base + iat_rva as usize, system_dll_base + rva as usize));
    }
    Some(resolved)
}

/// Entry point for injectors that use the pre-configured block address
/// instead of passing one in.
pub fn early_inject_init_at_configured(kernel: &dyn Kernel) -> Option<()> {
    let addr = crate::options::Options::get().early_inject_address;
    if addr == 0 {
        return None;
    }
    early_inject_init(kernel, addr)
}

/// The whole early sequence. Returns None on any failure, leaving the
/// process to continue natively.
pub fn early_inject_init(kernel: &dyn Kernel, args_addr: usize) -> Option<()> {
    let mut block = vec![0u8; std::mem::size_of::<EarlyInjectArgs>()];
    let n = kernel
        .read_virtual_memory(NT_CURRENT_PROCESS, args_addr, &mut block)
        .ok()?;
    let args = parse_early_args(&block[..n])?;

    let runtime_image = read_image(kernel, args.runtime_base)?;
    let system_image = read_image(kernel, args.system_dll_base)?;

    // Patch our own import address table, one word at a time.
    let entries = resolve_imports(
        &runtime_image,
        args.runtime_base,
        &system_image,
        args.system_dll_base,
    )?;
    for (iat_addr, target) in &entries {
        let bytes = target.to_le_bytes();
        match kernel.write_virtual_memory(NT_CURRENT_PROCESS, *iat_addr, &bytes) {
            Ok(_) => {}
            Err(_) => return None,
        }
    }

    // Put the hook page's protection back the way the injector found it.
    kernel
        .protect_virtual_memory(
            NT_CURRENT_PROCESS,
            args.hook_location,
            1,
            args.hook_old_protection,
        )
        .ok()?;

    // Record the process-wide facts.
    SYSTEM_DLL_BASE.store(args.system_dll_base, Ordering::Release);
    if let Ok(mut p) = RUNTIME_PATH.lock() {
        *p = path_from_args(&args);
    }
    let runtime_size = MappedPe::parse(&runtime_image)?.size_of_image();
    crate::set_runtime_image_bounds(args.runtime_base, args.runtime_base + runtime_size);

    // The block was ours to free.
    kernel
        .free_virtual_memory(NT_CURRENT_PROCESS, args_addr, 0, MEM_RELEASE)
        .ok()?;
    Some(())
}
