use libc::pid_t;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong outside the signal handlers. The handlers
/// themselves never fail; an unexpected condition there forwards the trapped
/// syscall unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// A probability or error weight supplied at plan construction is out of
    /// range.
    #[error("invalid probability: {0}")]
    InvalidProbability(String),

    /// Could not locate the executable mapping of this library's text, which
    /// Syscall User Dispatch needs as its exempt range.
    #[error("self text mapping unavailable: {0}")]
    MapUnavailable(String),

    #[error("sigaction for signal {signal} failed: {}", errno_str(.errno))]
    SigactionFailed { signal: i32, errno: i32 },

    #[error("arming syscall dispatch for thread {tid} failed: {}", errno_str(.errno))]
    ArmFailed { tid: pid_t, errno: i32 },

    #[error("disarming syscall dispatch for thread {tid} failed: {}", errno_str(.errno))]
    DisarmFailed { tid: pid_t, errno: i32 },

    /// The one-shot re-arm timer behind the momentary-disable window could
    /// not be created or armed.
    #[error("re-arm timer {op} failed: {}", errno_str(.errno))]
    TimerFailed { op: &'static str, errno: i32 },

    /// At most one session may exist per process.
    #[error("a sysfault session is already active in this process")]
    SessionExists,
}

fn errno_str(errno: &i32) -> &'static str {
    nix::errno::Errno::from_i32(*errno).desc()
}
