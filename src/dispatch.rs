//! The signal-context engine.
//!
//! `handle_sigsys` runs on the trapping thread for every dispatched syscall
//! and decides its fate; `handle_enable` arms threads in response to re-arm
//! timers and cross-thread arm requests. Both execute in async-signal
//! context: no allocation, no locking, no libc syscall wrappers; syscalls go
//! through the exempt-text primitives in `syscalls`, and both handlers leave
//! through `sysfault_restore` whenever the thread is (or has just become)
//! armed, because the ordinary sigreturn trampoline would re-trap.

use crate::arming;
use crate::error::{Error, Result};
use crate::registers::Registers;
use crate::session::{self, ActiveSession};
use crate::syscalls;
use crate::thread_state::ThreadState;
use libc::{c_int, c_void, siginfo_t, ucontext_t};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;

pub(crate) fn install_handlers() -> Result<()> {
    install_handler(libc::SIGSYS, handle_sigsys)?;
    install_handler(arming::rearm_signal(), handle_enable)
}

/// SA_SIGINFO for the ucontext; SA_NODEFER so a nested trap could re-enter
/// (the exempt range normally prevents one from occurring at all).
fn install_handler(
    signal: c_int,
    handler: unsafe extern "C" fn(c_int, *mut siginfo_t, *mut c_void),
) -> Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
            return Err(Error::SigactionFailed {
                signal,
                errno: nix::errno::errno(),
            });
        }
    }
    Ok(())
}

/// Every dispatched syscall of an armed thread lands here.
unsafe extern "C" fn handle_sigsys(_sig: c_int, _info: *mut siginfo_t, ucontext: *mut c_void) {
    let ctx = &mut *(ucontext as *mut ucontext_t);
    let mut regs = Registers::from_ucontext(ctx);
    let call = regs.syscallno();
    let sess = session::active_session();

    if call == libc::SYS_clone3 {
        // libc's clone3 wrapper splits control flow between parent and child
        // in a way that does not survive forwarding from here: re-issuing the
        // syscall would start the child inside this handler's frame. Instead
        // drop dispatch for a moment, step back onto the syscall instruction
        // and let the wrapper retry natively; the timer re-arms us.
        let st = arming::cached_self_state();
        if sess.is_some() && !st.is_null() {
            let _ = arming::disarm_momentarily(st);
        } else {
            arming::disarm_quietly();
        }
        regs.rewind_syscall_insn();
        regs.store(ctx);
        syscalls::sysfault_restore(ctx.uc_mcontext.gregs.as_ptr());
    }

    // libc blocks every signal around thread teardown; letting SIGSYS into a
    // thread's mask would wedge dispatch for good, so it is filtered out of
    // the set and the original pointer put back once the call is done.
    let mut patched_set: u64 = 0;
    let mut original_set_arg: Option<i64> = None;
    if call == libc::SYS_rt_sigprocmask {
        let how = regs.arg(0) as c_int;
        let setp = regs.arg(1) as *const u64;
        if (how == libc::SIG_BLOCK || how == libc::SIG_SETMASK) && !setp.is_null() {
            let sigsys_bit = 1u64 << (libc::SIGSYS - 1);
            if *setp & sigsys_bit != 0 {
                patched_set = *setp & !sigsys_bit;
                original_set_arg = Some(regs.arg(1));
                regs.set_arg(1, &patched_set as *const u64 as i64);
            }
        }
    }

    match sess {
        Some(s) if call != libc::SYS_exit => fail_maybe(s, &mut regs),
        _ => continue_syscall(&mut regs),
    }

    if let Some(orig) = original_set_arg {
        regs.set_arg(1, orig);
    }

    regs.store(ctx);
    syscalls::sysfault_restore(ctx.uc_mcontext.gregs.as_ptr());
}

/// Decides the trapped syscall's fate per the active plan. Anything
/// unexpected forwards the call unchanged.
fn fail_maybe(sess: &ActiveSession, regs: &mut Registers) {
    let outcome = match sess.plan.outcome(regs.syscallno()) {
        Some(o) => o,
        None => return continue_syscall(regs),
    };

    if let Some(eligible) = &outcome.eligible {
        if !eligible(regs) {
            return continue_syscall(regs);
        }
    }

    if outcome.delay_p > 0.0 && draw_unit() < outcome.delay_p {
        syscalls::sys_nanosleep_us(draw_delay_us(outcome.max_delay_us));
    }

    if outcome.fail_p > 0.0 && draw_unit() < outcome.fail_p {
        if let Some(errno) = outcome.pick_errno(draw_unit()) {
            // kernel convention: errors are -errno in RAX
            regs.set_syscall_result(-(errno as i64));
            return;
        }
    }

    continue_syscall(regs);
}

/// Forwards the trapped syscall as-is. The re-issued instruction lives in
/// this crate's text, inside the exempt range.
fn continue_syscall(regs: &mut Registers) {
    let ret = unsafe {
        syscalls::syscall6(
            regs.syscallno(),
            regs.arg(0),
            regs.arg(1),
            regs.arg(2),
            regs.arg(3),
            regs.arg(4),
            regs.arg(5),
        )
    };
    regs.set_syscall_result(ret);
}

/// Re-arm entry: either the momentary-disable timer expired (SI_TIMER) or
/// another thread queued an arm request (SI_QUEUE). The thread-state pointer
/// rides in `si_value` either way.
unsafe extern "C" fn handle_enable(_sig: c_int, info: *mut siginfo_t, ucontext: *mut c_void) {
    let info = &*info;
    match info.si_code {
        libc::SI_TIMER => {
            if let Some(timer) = arming::take_pending_timer() {
                syscalls::sys_timer_delete(timer);
            }
        }
        libc::SI_QUEUE => {}
        _ => return,
    }

    let sess = match session::active_session() {
        Some(s) => s,
        None => return,
    };
    let st = info.si_value().sival_ptr as *const ThreadState;
    if st.is_null() {
        return;
    }
    if arming::arm_current_thread(sess.self_text(), st).is_ok() {
        // armed again: returning through the sigreturn trampoline would trap
        let ctx = &*(ucontext as *const ucontext_t);
        syscalls::sysfault_restore(ctx.uc_mcontext.gregs.as_ptr());
    }
    // arm failed: the thread is not dispatched, the normal return is safe
}

thread_local! {
    /// Per-thread sampling state in a const-initialized cell: first touch in
    /// signal context neither allocates nor locks.
    static RNG: RefCell<Option<SmallRng>> = const { RefCell::new(None) };
}

fn with_rng<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    RNG.with(|cell| {
        let mut slot = cell.borrow_mut();
        let rng = slot.get_or_insert_with(seed_rng);
        f(rng)
    })
}

/// Seeded once per thread, from sources reachable without leaving the exempt
/// range.
fn seed_rng() -> SmallRng {
    let ts = syscalls::sys_clock_gettime(libc::CLOCK_MONOTONIC);
    let tid = syscalls::sys_gettid() as u64;
    let seed = (ts.tv_sec as u64)
        .wrapping_mul(1_000_000_007)
        .wrapping_add(ts.tv_nsec as u64)
        ^ (tid << 32);
    SmallRng::seed_from_u64(seed)
}

/// Uniform draw in [0, 1).
fn draw_unit() -> f64 {
    with_rng(|rng| rng.gen::<f64>())
}

/// Uniform draw in [0, max].
fn draw_delay_us(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    with_rng(|rng| rng.gen_range(0, max.saturating_add(1)))
}
