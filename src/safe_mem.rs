//! Bounded access to possibly-invalid memory.
//!
//! Two backends. Before the runtime is fully initialized the only safe
//! option is the foreign-memory syscall aimed at our own process: slow, but
//! it can never fault the calling thread. Once initialization completes a
//! registered fault-recovery implementation takes over: a straight copy
//! guarded by the runtime's exception handling, which reports how far it
//! got instead of faulting. The switch is a single acquire load of the
//! initialization flag.
//!
//! Contract: word-sized accesses to word-aligned addresses are atomic;
//! everything else is best effort. A short count is how callers learn of
//! mid-range invalidity. This layer never logs; it returns counts.

use crate::app_ptr::AppPtr;
use crate::nt::{Kernel, NT_CURRENT_PROCESS};
use crate::options::Options;
use std::sync::RwLock;

/// The explicit handler-registration seam: an implementation performs a
/// guarded copy and returns the bytes moved before the first fault.
pub trait FaultHandling: Sync {
    fn guarded_read(&self, src: usize, dst: &mut [u8]) -> usize;
    fn guarded_write(&self, dst: usize, src: &[u8]) -> usize;
}

lazy_static! {
    static ref FAULT_HANDLER: RwLock<Option<&'static dyn FaultHandling>> = RwLock::new(None);
}

/// Install the fault-handling backend. Must happen before
/// [`crate::set_runtime_initialized`]; the release store on that flag is
/// what publishes the handler to other threads.
pub fn install_fault_handler(handler: &'static dyn FaultHandling) {
    if let Ok(mut h) = FAULT_HANDLER.write() {
        *h = Some(handler);
    }
}

fn fault_handler() -> Option<&'static dyn FaultHandling> {
    if !crate::runtime_initialized() {
        return None;
    }
    FAULT_HANDLER.read().ok().and_then(|h| *h)
}

/// Read up to `buf.len()` bytes from `src`. Returns the bytes actually
/// read; never faults the calling thread.
pub fn safe_read(kernel: &dyn Kernel, src: AppPtr<u8>, buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    if let Some(handler) = fault_handler() {
        return handler.guarded_read(src.as_usize(), buf);
    }
    kernel
        .read_virtual_memory(NT_CURRENT_PROCESS, src.as_usize(), buf)
        .unwrap_or(0)
}

/// Read exactly `buf.len()` bytes or report failure.
pub fn safe_read_exact(kernel: &dyn Kernel, src: AppPtr<u8>, buf: &mut [u8]) -> bool {
    safe_read(kernel, src, buf) == buf.len()
}

/// Fire-and-forget write: true only if the whole range was written.
pub fn safe_write(kernel: &dyn Kernel, dst: AppPtr<u8>, bytes: &[u8]) -> bool {
    if bytes.is_empty() {
        return true;
    }
    if let Some(handler) = fault_handler() {
        return handler.guarded_write(dst.as_usize(), bytes) == bytes.len();
    }
    match kernel.write_virtual_memory(NT_CURRENT_PROCESS, dst.as_usize(), bytes) {
        Ok(Some(n)) => n == bytes.len(),
        // No count reported; believe the success status.
        Ok(None) => true,
        Err(_) => false,
    }
}

/// Write with a byte count, using the process-wide options.
pub fn safe_write_counted(kernel: &dyn Kernel, dst: AppPtr<u8>, bytes: &[u8]) -> usize {
    safe_write_counted_with(kernel, Options::get(), dst, bytes)
}

/// Write and report how many bytes landed. On kernels whose foreign-write
/// syscall stopped reporting counts this always takes the fault-handling
/// path, because a counted answer cannot be synthesized from a countless
/// success.
pub fn safe_write_counted_with(
    kernel: &dyn Kernel,
    options: &Options,
    dst: AppPtr<u8>,
    bytes: &[u8],
) -> usize {
    if bytes.is_empty() {
        return 0;
    }
    if let Some(handler) = fault_handler() {
        return handler.guarded_write(dst.as_usize(), bytes);
    }
    if !options.raw_counted_writes() {
        // No usable backend for a counted write yet; probe word-by-word so
        // the caller still learns the valid prefix length.
        let mut written = 0;
        while written < bytes.len() {
            let chunk = (bytes.len() - written).min(std::mem::size_of::<usize>());
            match kernel.write_virtual_memory(
                NT_CURRENT_PROCESS,
                dst.as_usize() + written,
                &bytes[written..written + chunk],
            ) {
                Ok(_) => written += chunk,
                Err(_) => break,
            }
        }
        return written;
    }
    match kernel.write_virtual_memory(NT_CURRENT_PROCESS, dst.as_usize(), bytes) {
        Ok(Some(n)) => n,
        Ok(None) => bytes.len(),
        Err(_) => 0,
    }
}

/// Read one machine word; atomic when `src` is word-aligned.
pub fn safe_read_word(kernel: &dyn Kernel, src: AppPtr<usize>) -> Option<usize> {
    let mut buf = [0u8; std::mem::size_of::<usize>()];
    if safe_read_exact(kernel, src.cast(), &mut buf) {
        Some(usize::from_le_bytes(buf))
    } else {
        None
    }
}

/// Write one machine word; atomic when `dst` is word-aligned.
pub fn safe_write_word(kernel: &dyn Kernel, dst: AppPtr<usize>, value: usize) -> bool {
    safe_write(kernel, dst.cast(), &value.to_le_bytes())
}
