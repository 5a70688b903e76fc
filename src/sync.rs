//! Lock wrappers that know how many locks the calling thread holds.
//!
//! The terminate path must issue its final syscall with zero runtime locks
//! held, and takeover wants to detect recursion. Plain std primitives can't
//! answer "does this thread hold anything", so every runtime lock goes
//! through these wrappers, which keep a per-thread count that guards can
//! assert against.

use crate::log::{LogLevel, SyslogCode};
use crate::nt::{Handle, Kernel, NtStatus};
use crate::nt::types::STATUS_TIMEOUT;
use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

thread_local! {
    static HELD_LOCKS: Cell<usize> = Cell::new(0);
}

/// Number of runtime locks the calling thread currently holds. This is the
/// lock-registry capability the terminate and takeover paths consult.
pub fn locks_held_by_current_thread() -> usize {
    HELD_LOCKS.with(|h| h.get())
}

fn note_acquire() {
    HELD_LOCKS.with(|h| h.set(h.get() + 1));
}

fn note_release() {
    HELD_LOCKS.with(|h| {
        debug_assert!(h.get() > 0);
        h.set(h.get() - 1);
    });
}

pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

pub struct MutexGuard<'a, T> {
    inner: Option<std::sync::MutexGuard<'a, T>>,
}

impl<T> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            inner: std::sync::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<T> {
        // Poisoning is another thread's panic; the runtime's locks protect
        // state that stays consistent across that, so keep going.
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        note_acquire();
        MutexGuard { inner: Some(guard) }
    }
}

impl<'a, T> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard taken")
    }
}

impl<'a, T> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard taken")
    }
}

impl<'a, T> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.take();
        note_release();
    }
}

pub struct RwLock<T> {
    inner: std::sync::RwLock<T>,
}

pub struct ReadGuard<'a, T> {
    inner: Option<std::sync::RwLockReadGuard<'a, T>>,
}

pub struct WriteGuard<'a, T> {
    inner: Option<std::sync::RwLockWriteGuard<'a, T>>,
}

impl<T> RwLock<T> {
    pub fn new(value: T) -> RwLock<T> {
        RwLock {
            inner: std::sync::RwLock::new(value),
        }
    }

    pub fn read(&self) -> ReadGuard<T> {
        let guard = match self.inner.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        note_acquire();
        ReadGuard { inner: Some(guard) }
    }

    pub fn write(&self) -> WriteGuard<T> {
        let guard = match self.inner.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        note_acquire();
        WriteGuard { inner: Some(guard) }
    }
}

impl<'a, T> Deref for ReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard taken")
    }
}

impl<'a, T> Drop for ReadGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.take();
        note_release();
    }
}

impl<'a, T> Deref for WriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().expect("guard taken")
    }
}

impl<'a, T> DerefMut for WriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().expect("guard taken")
    }
}

impl<'a, T> Drop for WriteGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.take();
        note_release();
    }
}

/// Depth of data-section unprotection. The rarely-written section is
/// read-only by default; mutations of tombstone or option state nest inside
/// a [`DataSectionGuard`].
static DATA_SECTION_UNPROTECT_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Hooks that actually flip the section protection. Installed once the VM
/// layer is functional; until then the guard only tracks depth.
static DATA_SECTION_HOOKS: AtomicUsize = AtomicUsize::new(0);

pub struct DataSectionHooks {
    pub unprotect: fn(),
    pub protect: fn(),
}

pub fn install_data_section_hooks(hooks: &'static DataSectionHooks) {
    DATA_SECTION_HOOKS.store(hooks as *const _ as usize, Ordering::Release);
}

fn hooks() -> Option<&'static DataSectionHooks> {
    let p = DATA_SECTION_HOOKS.load(Ordering::Acquire);
    if p == 0 {
        None
    } else {
        Some(unsafe { &*(p as *const DataSectionHooks) })
    }
}

/// Scoped unprotect of the rarely-written data section. Drop restores
/// protection once the outermost guard goes away.
pub struct DataSectionGuard {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl DataSectionGuard {
    pub fn enter() -> DataSectionGuard {
        if DATA_SECTION_UNPROTECT_DEPTH.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Some(h) = hooks() {
                (h.unprotect)();
            }
        }
        DataSectionGuard {
            _not_send: std::marker::PhantomData,
        }
    }

    pub fn depth() -> usize {
        DATA_SECTION_UNPROTECT_DEPTH.load(Ordering::Acquire)
    }
}

impl Drop for DataSectionGuard {
    fn drop(&mut self) {
        if DATA_SECTION_UNPROTECT_DEPTH.fetch_sub(1, Ordering::AcqRel) == 1 {
            if let Some(h) = hooks() {
                (h.protect)();
            }
        }
    }
}

/// [`wait_event_with_deadlock_allowance`] with the process-wide timeout
/// knob.
pub fn wait_event_with_default_timeout(kernel: &dyn Kernel, event: Handle) -> NtStatus {
    wait_event_with_deadlock_allowance(
        kernel,
        event,
        crate::options::Options::get().deadlock_timeout_ms,
    )
}

/// Wait on `event` with the debugger allowance: a timeout is only believed
/// after one additional wait four times as long, so a debugger stopping the
/// world does not read as deadlock. Returns the final status; on a
/// second-chance timeout a deadlock report goes to the sink.
pub fn wait_event_with_deadlock_allowance(
    kernel: &dyn Kernel,
    event: Handle,
    timeout_ms: u32,
) -> NtStatus {
    let status = kernel.wait_event(event, timeout_ms);
    if status != STATUS_TIMEOUT || timeout_ms == 0 {
        return status;
    }
    let status = kernel.wait_event(event, timeout_ms.saturating_mul(4));
    if status == STATUS_TIMEOUT {
        crate::log::syslog(
            LogLevel::LogError,
            SyslogCode::DeadlockTimeout,
            "wait timed out twice; declaring deadlock",
        );
    }
    status
}
