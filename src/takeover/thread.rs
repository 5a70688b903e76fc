//! A handle to one target thread plus the attach-pass bookkeeping entry.

use crate::nt::types::{NtStatus, STATUS_THREAD_IS_TERMINATING};
use crate::nt::{Handle, Kernel};
use crate::registers::{Context, Context64, SupportedArch};

/// Where one thread stands within a single attachment pass.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ThreadListState {
    New,
    /// Processed but not taken over; left native.
    Tried,
    /// Taken over, already ours, or ignorable.
    Success,
}

/// Transient, owned by one attachment pass.
#[derive(Copy, Clone, Debug)]
pub struct ThreadListEntry {
    pub handle: Handle,
    pub tid: u32,
    pub state: ThreadListState,
    /// Whether we suspended it and owe it a resume at pass end.
    pub suspended: bool,
}

/// A thread we operate on. Thin wrapper so the attach loop reads as
/// intent instead of handle plumbing.
pub struct TargetThread<'k> {
    kernel: &'k dyn Kernel,
    pub handle: Handle,
    pub tid: u32,
}

impl<'k> TargetThread<'k> {
    pub fn open(kernel: &'k dyn Kernel, tid: u32) -> Result<TargetThread<'k>, NtStatus> {
        let handle = kernel.open_thread(tid)?;
        Ok(TargetThread {
            kernel,
            handle,
            tid,
        })
    }

    pub fn from_handle(
        kernel: &'k dyn Kernel,
        handle: Handle,
    ) -> Result<TargetThread<'k>, NtStatus> {
        let tid = kernel.thread_id_of(handle)?;
        Ok(TargetThread {
            kernel,
            handle,
            tid,
        })
    }

    pub fn suspend(&self) -> Result<u32, NtStatus> {
        self.kernel.suspend_thread(self.handle)
    }

    pub fn resume(&self) -> Result<u32, NtStatus> {
        self.kernel.resume_thread(self.handle)
    }

    pub fn context(&self, arch: SupportedArch) -> Result<Context, NtStatus> {
        let mut ctx = Context::new(arch);
        self.kernel.get_context(self.handle, &mut ctx)?;
        Ok(ctx)
    }

    pub fn set_context(&self, ctx: &Context) -> Result<(), NtStatus> {
        self.kernel.set_context(self.handle, ctx)
    }

    pub fn wide_context(&self) -> Result<Context64, NtStatus> {
        let mut ctx = Context64::default();
        self.kernel.get_context_x64(self.handle, &mut ctx)?;
        Ok(ctx)
    }

    pub fn set_wide_context(&self, ctx: &Context64) -> Result<(), NtStatus> {
        self.kernel.set_context_x64(self.handle, ctx)
    }

    pub fn start_address(&self) -> Option<usize> {
        self.kernel.thread_start_address(self.handle).ok()
    }

    /// Duplicate the handle for the takeover record, which outlives this
    /// pass-scoped wrapper.
    pub fn duplicate_handle(&self) -> Result<Handle, NtStatus> {
        self.kernel.duplicate_thread_handle(self.handle)
    }

    pub fn close(self) {
        let _ = self.kernel.close_handle(self.handle);
    }
}

/// A thread that died between enumeration and suspension reports this
/// status; it is ignored rather than counted as an attach failure.
pub fn is_terminating_status(status: NtStatus) -> bool {
    status == STATUS_THREAD_IS_TERMINATING
}
