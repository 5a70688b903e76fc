//! Core runtime of a dynamic binary instrumentation system for the
//! Windows/x86 family.
//!
//! The crate owns the subsystems that let the runtime seize control of an
//! already-running process and keep it: per-kernel syscall-number selection
//! (`os_version`, `syscall_numbers`), thread takeover and release
//! (`takeover`, `detach`), the final terminate syscall (`terminate`), the
//! virtual-memory layer (`vm`), bounded access to possibly-invalid memory
//! (`safe_mem`), the earliest-injection entry point (`bootstrap`) and
//! native-path translation (`sys_path`).
//!
//! Everything the kernel does for us goes through the [`nt::Kernel`] trait;
//! the only implementation that talks to a real kernel is `nt::direct`,
//! compiled for Windows targets. All logic above that seam is host
//! independent and is exercised by the in-memory kernel in `testing`.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod app_ptr;
pub mod bootstrap;
pub mod detach;
pub mod nt;
pub mod options;
pub mod os_version;
pub mod registers;
pub mod safe_mem;
pub mod sync;
pub mod sys_path;
pub mod syscall_numbers;
pub mod takeover;
pub mod terminate;
pub mod vm;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// True once per-thread fault recovery and the rest of the runtime are wired
/// up. `safe_mem` keys its backend choice off this flag, so the store must
/// happen with release semantics strictly after the fault handler is
/// installed.
static RUNTIME_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Bounds of the runtime's own code image, `[base, end)`. Zero until the
/// loader (or a test) records them. Takeover consults these to recognise
/// threads that are already executing runtime code.
static RUNTIME_IMAGE_BASE: AtomicUsize = AtomicUsize::new(0);
static RUNTIME_IMAGE_END: AtomicUsize = AtomicUsize::new(0);

pub fn runtime_initialized() -> bool {
    RUNTIME_INITIALIZED.load(Ordering::Acquire)
}

pub fn set_runtime_initialized() {
    RUNTIME_INITIALIZED.store(true, Ordering::Release);
}

pub fn set_runtime_image_bounds(base: usize, end: usize) {
    debug_assert!(base < end);
    RUNTIME_IMAGE_BASE.store(base, Ordering::Release);
    RUNTIME_IMAGE_END.store(end, Ordering::Release);
}

pub fn runtime_image_bounds() -> (usize, usize) {
    (
        RUNTIME_IMAGE_BASE.load(Ordering::Acquire),
        RUNTIME_IMAGE_END.load(Ordering::Acquire),
    )
}

/// Return true if `addr` falls inside the runtime's own code image.
pub fn is_in_runtime_image(addr: usize) -> bool {
    let (base, end) = runtime_image_bounds();
    base != 0 && addr >= base && addr < end
}
