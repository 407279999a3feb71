//! Direct syscall issue and signal-context restore.
//!
//! Every syscall made while a thread is armed has to execute from this
//! crate's text segment: that range is registered with the kernel as exempt
//! from dispatch, while the syscall instructions inside libc (including the
//! signal-return trampoline) are not and would re-trap. So the SIGSYS path
//! issues syscalls through `syscall6` below and leaves handlers through
//! `sysfault_restore` instead of returning into the trampoline.

use libc::{c_int, c_long, greg_t, pid_t};
use static_assertions::const_assert_eq;
use std::arch::{asm, global_asm};

// Not exposed by libc for this target; matches glibc's x86-64 `NGREG`
// (sys/ucontext.h).
const NGREG: libc::c_int = 23;

// The greg layout sysfault_restore hardcodes is glibc's x86-64 one.
const_assert_eq!(NGREG, 23);
const_assert_eq!(std::mem::size_of::<greg_t>(), 8);

/// Byte length of the x86-64 `syscall` instruction (0x0f 0x05); the amount
/// the instruction pointer is rewound to retry a trapped syscall.
pub(crate) const SYSCALL_INSN_LEN: i64 = 2;

/// Issues `nr` with up to six arguments per the x86-64 Linux convention
/// (args in RDI, RSI, RDX, R10, R8, R9). Returns the raw kernel result:
/// negative errno on failure, no `errno` variable involved.
#[inline]
pub(crate) unsafe fn syscall6(
    nr: c_long,
    a1: c_long,
    a2: c_long,
    a3: c_long,
    a4: c_long,
    a5: c_long,
    a6: c_long,
) -> c_long {
    let ret: c_long;
    asm!(
        "syscall",
        inlateout("rax") nr => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        in("r8") a5,
        in("r9") a6,
        out("rcx") _,
        out("r11") _,
        options(nostack),
    );
    ret
}

pub(crate) fn sys_gettid() -> pid_t {
    unsafe { syscall6(libc::SYS_gettid, 0, 0, 0, 0, 0, 0) as pid_t }
}

pub(crate) fn sys_getpid() -> pid_t {
    unsafe { syscall6(libc::SYS_getpid, 0, 0, 0, 0, 0, 0) as pid_t }
}

pub(crate) fn sys_getuid() -> libc::uid_t {
    unsafe { syscall6(libc::SYS_getuid, 0, 0, 0, 0, 0, 0) as libc::uid_t }
}

pub(crate) unsafe fn sys_prctl(
    option: c_int,
    arg2: c_long,
    arg3: c_long,
    arg4: c_long,
    arg5: c_long,
) -> c_long {
    syscall6(libc::SYS_prctl, option as c_long, arg2, arg3, arg4, arg5, 0)
}

/// Sleeps the calling thread for `us` microseconds, restarting on EINTR.
pub(crate) fn sys_nanosleep_us(us: u64) {
    if us == 0 {
        return;
    }
    let mut req = libc::timespec {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_nsec: ((us % 1_000_000) * 1_000) as libc::c_long,
    };
    loop {
        let mut rem = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        let ret = unsafe {
            syscall6(
                libc::SYS_nanosleep,
                &req as *const libc::timespec as c_long,
                &mut rem as *mut libc::timespec as c_long,
                0,
                0,
                0,
                0,
            )
        };
        if ret == -(libc::EINTR as c_long) {
            req = rem;
            continue;
        }
        break;
    }
}

pub(crate) fn sys_clock_gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        syscall6(
            libc::SYS_clock_gettime,
            clock as c_long,
            &mut ts as *mut libc::timespec as c_long,
            0,
            0,
            0,
            0,
        );
    }
    ts
}

pub(crate) unsafe fn sys_timer_create(
    clock: libc::clockid_t,
    sev: *mut libc::sigevent,
    timer_id: *mut c_int,
) -> c_long {
    syscall6(
        libc::SYS_timer_create,
        clock as c_long,
        sev as c_long,
        timer_id as c_long,
        0,
        0,
        0,
    )
}

pub(crate) unsafe fn sys_timer_settime(
    timer_id: c_int,
    flags: c_int,
    new_value: *const libc::itimerspec,
) -> c_long {
    syscall6(
        libc::SYS_timer_settime,
        timer_id as c_long,
        flags as c_long,
        new_value as c_long,
        0,
        0,
        0,
    )
}

pub(crate) unsafe fn sys_timer_delete(timer_id: c_int) -> c_long {
    syscall6(libc::SYS_timer_delete, timer_id as c_long, 0, 0, 0, 0, 0)
}

pub(crate) unsafe fn sys_rt_tgsigqueueinfo(
    tgid: pid_t,
    tid: pid_t,
    sig: c_int,
    info: *const libc::c_void,
) -> c_long {
    syscall6(
        libc::SYS_rt_tgsigqueueinfo,
        tgid as c_long,
        tid as c_long,
        sig as c_long,
        info as c_long,
        0,
        0,
    )
}

const OFF_R8: usize = libc::REG_R8 as usize * 8;
const OFF_R9: usize = libc::REG_R9 as usize * 8;
const OFF_R10: usize = libc::REG_R10 as usize * 8;
const OFF_R11: usize = libc::REG_R11 as usize * 8;
const OFF_R12: usize = libc::REG_R12 as usize * 8;
const OFF_R13: usize = libc::REG_R13 as usize * 8;
const OFF_R14: usize = libc::REG_R14 as usize * 8;
const OFF_R15: usize = libc::REG_R15 as usize * 8;
const OFF_RDI: usize = libc::REG_RDI as usize * 8;
const OFF_RSI: usize = libc::REG_RSI as usize * 8;
const OFF_RBP: usize = libc::REG_RBP as usize * 8;
const OFF_RBX: usize = libc::REG_RBX as usize * 8;
const OFF_RDX: usize = libc::REG_RDX as usize * 8;
const OFF_RAX: usize = libc::REG_RAX as usize * 8;
const OFF_RCX: usize = libc::REG_RCX as usize * 8;
const OFF_RSP: usize = libc::REG_RSP as usize * 8;
const OFF_RIP: usize = libc::REG_RIP as usize * 8;
const OFF_EFL: usize = libc::REG_EFL as usize * 8;

// Reloads every general-purpose register plus RFLAGS from a saved greg array
// and jumps to the saved RIP. The saved RIP and RFLAGS transit through the
// target stack; RDI is reloaded last because it carries the array pointer.
global_asm!(
    ".text",
    ".globl sysfault_restore",
    ".type sysfault_restore, @function",
    "sysfault_restore:",
    "mov rsp, qword ptr [rdi + {rsp}]",
    "push qword ptr [rdi + {rip}]",
    "push qword ptr [rdi + {efl}]",
    "popfq",
    "mov r8, qword ptr [rdi + {r8}]",
    "mov r9, qword ptr [rdi + {r9}]",
    "mov r10, qword ptr [rdi + {r10}]",
    "mov r11, qword ptr [rdi + {r11}]",
    "mov r12, qword ptr [rdi + {r12}]",
    "mov r13, qword ptr [rdi + {r13}]",
    "mov r14, qword ptr [rdi + {r14}]",
    "mov r15, qword ptr [rdi + {r15}]",
    "mov rsi, qword ptr [rdi + {rsi}]",
    "mov rbp, qword ptr [rdi + {rbp}]",
    "mov rbx, qword ptr [rdi + {rbx}]",
    "mov rdx, qword ptr [rdi + {rdx}]",
    "mov rax, qword ptr [rdi + {rax}]",
    "mov rcx, qword ptr [rdi + {rcx}]",
    "mov rdi, qword ptr [rdi + {rdi}]",
    "ret",
    ".size sysfault_restore, . - sysfault_restore",
    r8 = const OFF_R8,
    r9 = const OFF_R9,
    r10 = const OFF_R10,
    r11 = const OFF_R11,
    r12 = const OFF_R12,
    r13 = const OFF_R13,
    r14 = const OFF_R14,
    r15 = const OFF_R15,
    rdi = const OFF_RDI,
    rsi = const OFF_RSI,
    rbp = const OFF_RBP,
    rbx = const OFF_RBX,
    rdx = const OFF_RDX,
    rax = const OFF_RAX,
    rcx = const OFF_RCX,
    rsp = const OFF_RSP,
    rip = const OFF_RIP,
    efl = const OFF_EFL,
);

extern "C" {
    /// Resumes the interrupted thread from a saved greg array, bypassing
    /// rt_sigreturn. Only meaningful with an array laid out like
    /// `ucontext_t.uc_mcontext.gregs`.
    pub(crate) fn sysfault_restore(gregs: *const greg_t) -> !;
}
