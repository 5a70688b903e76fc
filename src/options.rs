use std::sync::atomic::{AtomicBool, Ordering};

lazy_static! {
    static ref OPTIONS: Options = Options::default();
}

/// Runtime knobs. Read-mostly: the only field mutated after startup is
/// `raw_counted_writes`, which OS identification may clear when it decides
/// the foreign-write syscall on this kernel no longer reports byte counts.
/// That mutation goes through the rarely-written-data guard.
pub struct Options {
    /// Highest NT major version the build agrees to run on. Anything past
    /// this is a fatal-usage error (or a clean `Err` in standalone-library
    /// mode).
    pub max_supported_os_version: u32,
    /// Upper bound on attach passes. Each pass re-enumerates the thread
    /// list; the loop stops early once a pass discovers nothing new.
    pub takeover_passes: usize,
    /// Library mode: unsupported-kernel and similar usage errors are
    /// returned to the caller instead of ending the process.
    pub standalone_library: bool,
    /// Where the injector placed the early-inject arguments block, when the
    /// default well-known address is not usable.
    pub early_inject_address: usize,
    /// Base wait used before suspecting deadlock. The actual declaration
    /// only happens after one additional long wait, so a debugger stopping
    /// the world does not trip it.
    pub deadlock_timeout_ms: u32,
    /// Whether the raw foreign-write syscall can be trusted to report how
    /// many bytes it wrote. Cleared on kernels where it returns no count.
    raw_counted_writes: AtomicBool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            max_supported_os_version: 10,
            takeover_passes: 16,
            standalone_library: cfg!(feature = "standalone_library"),
            early_inject_address: 0,
            deadlock_timeout_ms: 60_000,
            raw_counted_writes: AtomicBool::new(true),
        }
    }
}

impl Options {
    pub fn get() -> &'static Options {
        &*OPTIONS
    }

    pub fn raw_counted_writes(&self) -> bool {
        self.raw_counted_writes.load(Ordering::Acquire)
    }

    /// Record that counted raw writes are unusable on this kernel. Takes the
    /// data-section guard like every post-startup option mutation.
    pub fn disable_raw_counted_writes(&self) {
        let _unprot = crate::sync::DataSectionGuard::enter();
        self.raw_counted_writes.store(false, Ordering::Release);
    }
}
