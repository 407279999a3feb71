//! Per-thread dispatch-control bytes.
//!
//! `prctl(PR_SET_SYSCALL_USER_DISPATCH)` takes the address of a single byte
//! the kernel consults on every syscall the thread makes: ALLOW passes the
//! call through, BLOCK traps it to SIGSYS. Each armed thread gets its own
//! byte here; flipping a byte changes that thread's behavior instantly,
//! without another kernel call.

use libc::pid_t;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// Not exposed by libc for this target; values are the Linux kernel's
// `SYSCALL_DISPATCH_FILTER_*` ABI constants (uapi/linux/prctl.h).
const SYSCALL_DISPATCH_FILTER_ALLOW: libc::c_int = 0;
const SYSCALL_DISPATCH_FILTER_BLOCK: libc::c_int = 1;

pub(crate) const FILTER_ALLOW: u8 = SYSCALL_DISPATCH_FILTER_ALLOW as u8;
pub(crate) const FILTER_BLOCK: u8 = SYSCALL_DISPATCH_FILTER_BLOCK as u8;

/// Dispatch-control state for one thread. Boxed by the table so the byte
/// address stays stable for the entry's whole life; the kernel dereferences
/// it on every syscall the thread makes while armed.
pub(crate) struct ThreadState {
    on: AtomicU8,
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            on: AtomicU8::new(FILTER_ALLOW),
        }
    }

    /// The address handed to `prctl`.
    pub(crate) fn byte_ptr(&self) -> *const u8 {
        &self.on as *const AtomicU8 as *const u8
    }

    pub(crate) fn set(&self, value: u8) {
        self.on.store(value, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> u8 {
        self.on.load(Ordering::SeqCst)
    }
}

/// Concurrent tid -> [`ThreadState`] map. Signal handlers never touch it
/// (state pointers reach them through thread-locals or `si_value`), so plain
/// reader-writer locking from ordinary threads is enough.
pub(crate) struct ThreadStateTable {
    entries: RwLock<HashMap<pid_t, Box<ThreadState>>>,
}

impl ThreadStateTable {
    fn new() -> ThreadStateTable {
        ThreadStateTable {
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<HashMap<pid_t, Box<ThreadState>>> {
        match self.entries.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<HashMap<pid_t, Box<ThreadState>>> {
        match self.entries.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Returns the stable address of `tid`'s state, creating the entry if
    /// needed. The pointer stays valid until the entry is removed; removal is
    /// only legal once the thread can make no further dispatched syscalls.
    pub(crate) fn insert_or_get(&self, tid: pid_t) -> *const ThreadState {
        if let Some(st) = self.read().get(&tid) {
            return &**st as *const ThreadState;
        }
        let mut entries = self.write();
        &**entries
            .entry(tid)
            .or_insert_with(|| Box::new(ThreadState::new())) as *const ThreadState
    }

    pub(crate) fn get(&self, tid: pid_t) -> Option<*const ThreadState> {
        self.read().get(&tid).map(|st| &**st as *const ThreadState)
    }

    pub(crate) fn remove(&self, tid: pid_t) {
        self.write().remove(&tid);
    }

    /// Teardown kill-switch: flips every byte to ALLOW so interception stops
    /// process-wide before anything else is released.
    pub(crate) fn allow_all(&self) {
        for st in self.read().values() {
            st.set(FILTER_ALLOW);
        }
    }

    /// Drops entries whose thread no longer exists. Called between sessions:
    /// a dead thread's byte is no longer read by the kernel, so its entry is
    /// finally safe to free even if the terminated event was never observed.
    pub(crate) fn retain_live(&self, live: &dyn Fn(pid_t) -> bool) {
        self.write().retain(|tid, _| live(*tid));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.read().len()
    }
}

lazy_static! {
    /// Process-global: the kernel keeps dereferencing a registered byte until
    /// its thread disarms or exits, so entries must be able to outlive any
    /// one session.
    pub(crate) static ref THREAD_STATES: ThreadStateTable = ThreadStateTable::new();
}
