use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Log levels, most severe first. The process-wide level admits everything
/// at or above it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum LogLevel {
    LogFatal,
    LogError,
    LogWarn,
    LogInfo,
    LogDebug,
}

/// Event codes reported through the external syslog sink. These are the
/// situations upstream wants to be able to match on without parsing text.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyslogCode {
    /// The running kernel is older or newer than anything the build
    /// supports.
    UnsupportedOsVersion,
    /// The kernel is newer than every known syscall table; running on a
    /// copy of the most recent one.
    UnknownFutureOs,
    /// The forward region walk hit its hard iteration cap.
    QueryWalkCap,
    /// New threads kept appearing for the whole bounded attach loop.
    TakeoverPassCap,
    /// A wait timed out twice; the runtime is declaring deadlock.
    DeadlockTimeout,
    /// Abrupt (no-cleanup) process or thread exit.
    AbruptExit,
}

/// The external logging-and-event sink. The default writes to stderr; the
/// embedding runtime installs its own to feed the event log.
pub trait Syslog: Send + Sync {
    fn notify(&self, level: LogLevel, code: SyslogCode, message: &str);
}

struct StderrSyslog;

impl Syslog for StderrSyslog {
    fn notify(&self, level: LogLevel, code: SyslogCode, message: &str) {
        let _ = writeln!(
            std::io::stderr(),
            "[wrest {:?} {:?}] {}",
            level,
            code,
            message
        );
    }
}

static LOG_LEVEL: AtomicUsize = AtomicUsize::new(LogLevel::LogWarn as usize);

lazy_static! {
    static ref SYSLOG: RwLock<Box<dyn Syslog>> = RwLock::new(Box::new(StderrSyslog));
}

pub fn log_level() -> LogLevel {
    match LOG_LEVEL.load(Ordering::Relaxed) {
        0 => LogLevel::LogFatal,
        1 => LogLevel::LogError,
        2 => LogLevel::LogWarn,
        3 => LogLevel::LogInfo,
        _ => LogLevel::LogDebug,
    }
}

pub fn set_log_level(level: LogLevel) {
    LOG_LEVEL.store(level as usize, Ordering::Relaxed);
}

pub fn is_logging(level: LogLevel) -> bool {
    level <= log_level()
}

/// Replace the syslog sink. Returns nothing; the previous sink is dropped.
pub fn install_syslog(sink: Box<dyn Syslog>) {
    match SYSLOG.write() {
        Ok(mut s) => *s = sink,
        Err(_) => {}
    }
}

pub fn syslog(level: LogLevel, code: SyslogCode, message: &str) {
    if let Ok(s) = SYSLOG.read() {
        s.notify(level, code, message);
    }
}

#[doc(hidden)]
pub fn write_log(level: LogLevel, module: &str, args: std::fmt::Arguments) {
    let _ = writeln!(std::io::stderr(), "[{:?} {}] {}", level, module, args);
}

/// Leveled logging: `log!(LogDebug, "took over {} threads", n)`.
#[macro_export]
macro_rules! log {
    ($level:expr, $($args:tt)+) => {{
        if $crate::log::is_logging($level) {
            $crate::log::write_log($level, module_path!(), format_args!($($args)+));
        }
    }};
}

/// Report through the syslog sink exactly once per call site. Used for
/// curiosity warnings that would otherwise repeat on every pass.
#[macro_export]
macro_rules! syslog_once {
    ($level:expr, $code:expr, $($args:tt)+) => {{
        static REPORTED: std::sync::atomic::AtomicBool =
            std::sync::atomic::AtomicBool::new(false);
        if !REPORTED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            $crate::log::syslog($level, $code, &format!($($args)+));
        }
    }};
}

/// Unrecoverable misuse. Reports through the sink and aborts; callers in
/// standalone-library mode never reach this (they get an `Err` instead).
#[macro_export]
macro_rules! fatal {
    ($code:expr, $($args:tt)+) => {{
        let msg = format!($($args)+);
        $crate::log::syslog($crate::log::LogLevel::LogFatal, $code, &msg);
        panic!("fatal: {}", msg);
    }};
}
