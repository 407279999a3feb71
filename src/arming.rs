//! Turns Syscall User Dispatch on and off per thread.
//!
//! `prctl(PR_SET_SYSCALL_USER_DISPATCH)` only ever affects the calling task,
//! so arming another thread has to bounce through a signal: the request is
//! queued with `rt_tgsigqueueinfo` carrying the thread-state pointer in
//! `si_value`, and the target arms itself inside the handler. The momentary
//! disable window used to cross libc's clone3 wrapper re-arms the same way,
//! from a one-shot CPU-clock timer.

use crate::error::{Error, Result};
use crate::mem_map::AddrRange;
use crate::syscalls::{self, sys_getpid, sys_gettid, sys_getuid};
use crate::thread_state::{ThreadState, FILTER_ALLOW, FILTER_BLOCK, THREAD_STATES};
use libc::{c_int, c_long};
use libc::pid_t;
use static_assertions::const_assert_eq;
use std::cell::Cell;
use std::ptr;

// Not exposed by libc for this target; values are the Linux kernel's
// `PR_SET_SYSCALL_USER_DISPATCH` / `PR_SYS_DISPATCH_*` ABI constants
// (uapi/linux/prctl.h).
const PR_SET_SYSCALL_USER_DISPATCH: c_int = 59;
const PR_SYS_DISPATCH_OFF: c_int = 0;
const PR_SYS_DISPATCH_ON: c_int = 1;

/// Expiry of the momentary-disable timer and cross-thread arm requests both
/// arrive on this signal; `si_code` tells them apart.
pub(crate) fn rearm_signal() -> c_int {
    libc::SIGRTMIN()
}

/// Momentary-disable window: thread-CPU time the re-arm timer waits for.
const REARM_DELAY_NS: i64 = 10 * 1_000;

thread_local! {
    /// This thread's state pointer, cached when it arms so signal handlers
    /// never consult the table.
    static SELF_STATE: Cell<*const ThreadState> = const { Cell::new(ptr::null()) };
    /// Kernel id of the in-flight momentary-disable timer, if any.
    static PENDING_TIMER: Cell<Option<c_int>> = const { Cell::new(None) };
}

pub(crate) fn cached_self_state() -> *const ThreadState {
    SELF_STATE.with(|c| c.get())
}

pub(crate) fn take_pending_timer() -> Option<c_int> {
    PENDING_TIMER.with(|c| c.take())
}

/// Registers `st`'s byte for the calling thread and flips it to BLOCK: every
/// syscall from outside `text` now traps. Safe to call from signal context.
pub(crate) fn arm_current_thread(text: &AddrRange, st: *const ThreadState) -> Result<()> {
    let ret = unsafe {
        syscalls::sys_prctl(
            PR_SET_SYSCALL_USER_DISPATCH,
            PR_SYS_DISPATCH_ON as c_long,
            text.start as c_long,
            text.length as c_long,
            (*st).byte_ptr() as c_long,
        )
    };
    if ret < 0 {
        return Err(Error::ArmFailed {
            tid: sys_gettid(),
            errno: -ret as i32,
        });
    }
    unsafe { (*st).set(FILTER_BLOCK) };
    SELF_STATE.with(|c| c.set(st));
    Ok(())
}

/// Disarms the calling thread and drops its table entry. With dispatch off
/// the kernel no longer reads the byte, so the entry is safe to free.
pub(crate) fn disarm_current_thread() -> Result<()> {
    let tid = sys_gettid();
    if let Some(st) = THREAD_STATES.get(tid) {
        unsafe { (*st).set(FILTER_ALLOW) };
    }
    let ret = unsafe {
        syscalls::sys_prctl(
            PR_SET_SYSCALL_USER_DISPATCH,
            PR_SYS_DISPATCH_OFF as c_long,
            0,
            0,
            0,
        )
    };
    if ret < 0 {
        return Err(Error::DisarmFailed {
            tid,
            errno: -ret as i32,
        });
    }
    SELF_STATE.with(|c| c.set(ptr::null()));
    THREAD_STATES.remove(tid);
    Ok(())
}

/// Best-effort dispatch-off for signal context; keeps the table entry.
pub(crate) fn disarm_quietly() {
    unsafe {
        syscalls::sys_prctl(
            PR_SET_SYSCALL_USER_DISPATCH,
            PR_SYS_DISPATCH_OFF as c_long,
            0,
            0,
            0,
        );
    }
}

/// Asks `tid` to arm itself: queues the re-arm signal with the thread-state
/// pointer in `si_value`. The target may legitimately be gone by the time the
/// queue call runs; the caller decides whether that is worth logging.
pub(crate) fn arm_thread(tid: pid_t) -> Result<()> {
    let st = THREAD_STATES.insert_or_get(tid);
    let info = QueueInfo::arm_request(st);
    let ret = unsafe {
        syscalls::sys_rt_tgsigqueueinfo(
            sys_getpid(),
            tid,
            rearm_signal(),
            &info as *const QueueInfo as *const libc::c_void,
        )
    };
    if ret < 0 {
        return Err(Error::ArmFailed {
            tid,
            errno: -ret as i32,
        });
    }
    Ok(())
}

/// Stops interception for another thread by flipping its byte; effective on
/// its very next syscall. The entry stays put: the kernel keeps reading the
/// byte until the thread disarms itself or exits.
pub(crate) fn disarm_thread(tid: pid_t) {
    if let Some(st) = THREAD_STATES.get(tid) {
        unsafe { (*st).set(FILTER_ALLOW) };
    }
}

/// Disarms the calling thread and schedules a one-shot 10µs thread-CPU timer
/// whose expiry delivers the re-arm signal back to this thread, `st` riding
/// along in `sigev_value`. Runs inside the SIGSYS handler, so raw syscalls
/// only; on timer failure the thread simply stays disarmed (fail-open).
pub(crate) fn disarm_momentarily(st: *const ThreadState) -> Result<()> {
    disarm_quietly();

    let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
    sev.sigev_notify = libc::SIGEV_THREAD_ID;
    sev.sigev_signo = rearm_signal();
    sev.sigev_notify_thread_id = sys_gettid();
    sev.sigev_value = libc::sigval {
        sival_ptr: st as *mut libc::c_void,
    };

    let mut timer_id: c_int = 0;
    let ret = unsafe {
        syscalls::sys_timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut sev, &mut timer_id)
    };
    if ret < 0 {
        return Err(Error::TimerFailed {
            op: "create",
            errno: -ret as i32,
        });
    }

    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: 0,
            tv_nsec: REARM_DELAY_NS,
        },
    };
    // park the id before arming: expiry can interrupt as soon as settime runs
    PENDING_TIMER.with(|c| c.set(Some(timer_id)));
    let ret = unsafe { syscalls::sys_timer_settime(timer_id, 0, &spec) };
    if ret < 0 {
        PENDING_TIMER.with(|c| c.take());
        unsafe { syscalls::sys_timer_delete(timer_id) };
        return Err(Error::TimerFailed {
            op: "settime",
            errno: -ret as i32,
        });
    }
    Ok(())
}

/// Kernel siginfo image for `rt_tgsigqueueinfo`; only the SI_QUEUE fields the
/// receiving handler reads are populated.
#[repr(C)]
struct QueueInfo {
    si_signo: c_int,
    si_errno: c_int,
    si_code: c_int,
    _pad: c_int,
    si_pid: c_int,
    si_uid: u32,
    si_value: usize,
    _rest: [u64; 12],
}

const_assert_eq!(std::mem::size_of::<QueueInfo>(), 128);

impl QueueInfo {
    fn arm_request(st: *const ThreadState) -> QueueInfo {
        QueueInfo {
            si_signo: rearm_signal(),
            si_errno: 0,
            si_code: libc::SI_QUEUE,
            _pad: 0,
            si_pid: sys_getpid(),
            si_uid: sys_getuid(),
            si_value: st as usize,
            _rest: [0; 12],
        }
    }
}
