//! Session lifecycle: process-wide owner of the active plan.

use crate::arming;
use crate::dispatch;
use crate::error::{Error, Result};
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::mem_map::{self, AddrRange};
use crate::plan::{ActivePlan, Plan};
use crate::syscalls::sys_gettid;
use crate::thread_monitor::{ThreadEvent, ThreadMonitor};
use crate::thread_state::THREAD_STATES;
use libc::pid_t;
use std::collections::HashSet;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Arc;

/// Runtime state the signal handlers consult.
pub(crate) struct ActiveSession {
    pub(crate) plan: ActivePlan,
    self_text: AddrRange,
}

impl ActiveSession {
    pub(crate) fn self_text(&self) -> &AddrRange {
        &self.self_text
    }
}

static ACTIVE_SESSION: AtomicPtr<ActiveSession> = AtomicPtr::new(ptr::null_mut());
static SESSION_LIVE: AtomicBool = AtomicBool::new(false);

/// Raw active-session pointer for signal-handler use; no reference counting
/// on this path. Teardown keeps it sound by flipping every dispatch byte to
/// ALLOW (no new traps) before retracting the pointer and releasing the plan.
pub(crate) fn active_session() -> Option<&'static ActiveSession> {
    let p = ACTIVE_SESSION.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

fn publish(active: &Arc<ActiveSession>) {
    let raw = Arc::into_raw(Arc::clone(active)) as *mut ActiveSession;
    ACTIVE_SESSION.store(raw, Ordering::Release);
}

fn retract() {
    let old = ACTIVE_SESSION.swap(ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        unsafe { drop(Arc::from_raw(old as *const ActiveSession)) };
    }
}

/// A live fault-injection session. At most one exists per process; dropping
/// it stops interception everywhere before the plan is released. Signal
/// handlers stay installed across sessions and fail open while none is live.
pub struct Session {
    active: Arc<ActiveSession>,
    monitor: Option<ThreadMonitor>,
}

impl Session {
    /// Reads the self-text range, precomputes the plan, installs the SIGSYS
    /// and re-arm handlers, arms the calling thread (selector permitting) and
    /// starts thread discovery.
    pub fn new(plan: Plan) -> Result<Session> {
        if SESSION_LIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::SessionExists);
        }
        match Session::start(plan) {
            Ok(session) => Ok(session),
            Err(e) => {
                SESSION_LIVE.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn start(plan: Plan) -> Result<Session> {
        let self_text = mem_map::get_self_text()?;
        let strategy = plan.thread_discovery();
        let active = Arc::new(ActiveSession {
            plan: ActivePlan::new(plan),
            self_text,
        });

        dispatch::install_handlers()?;

        // Handlers fail open on a null session pointer, so publish before any
        // thread can trap.
        publish(&active);

        let tid = sys_gettid();
        if active.plan.selects(tid) {
            let st = THREAD_STATES.insert_or_get(tid);
            if let Err(e) = arming::arm_current_thread(&active.self_text, st) {
                retract();
                return Err(e);
            }
        }

        let monitor_active = Arc::clone(&active);
        let monitor = ThreadMonitor::new(
            strategy,
            Box::new(move |tid, evt| on_thread_event(&monitor_active, tid, evt)),
        );

        // Threads that died while no monitor was watching never produced a
        // Terminated event; their bytes are no longer read, free them now.
        let live: HashSet<pid_t> = monitor.known_tids().into_iter().collect();
        THREAD_STATES.retain_live(&|tid| live.contains(&tid));

        log!(
            LogInfo,
            "session armed, exempt text {:#x}+{:#x} ({})",
            active.self_text.start,
            active.self_text.length,
            active.self_text.path
        );
        Ok(Session {
            active,
            monitor: Some(monitor),
        })
    }

    /// Arms the calling thread, selector permitting.
    pub fn add(&self) -> Result<()> {
        let tid = sys_gettid();
        if !self.active.plan.selects(tid) {
            return Ok(());
        }
        let st = THREAD_STATES.insert_or_get(tid);
        arming::arm_current_thread(&self.active.self_text, st)
    }

    /// Arms `tid`, selector permitting. For another thread this queues an arm
    /// request the target serves on its next interrupt.
    pub fn add_thread(&self, tid: pid_t) -> Result<()> {
        if tid == sys_gettid() {
            return self.add();
        }
        if !self.active.plan.selects(tid) {
            return Ok(());
        }
        arming::arm_thread(tid)
    }

    /// Stops interception for the calling thread; other threads stay armed.
    pub fn remove(&self) -> Result<()> {
        arming::disarm_current_thread()
    }

    /// Stops interception for `tid`, effective on its next syscall.
    pub fn remove_thread(&self, tid: pid_t) -> Result<()> {
        if tid == sys_gettid() {
            return self.remove();
        }
        arming::disarm_thread(tid);
        Ok(())
    }

    /// Forces a thread-discovery scan now.
    pub fn discover_threads(&self) {
        if let Some(monitor) = &self.monitor {
            monitor.rescan();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Flip every dispatch byte first: interception stops process-wide
        // before anything else is torn down, and handlers still in flight
        // drain against a live plan.
        THREAD_STATES.allow_all();
        self.monitor.take();
        retract();
        SESSION_LIVE.store(false, Ordering::SeqCst);
        log!(LogDebug, "session closed");
    }
}

fn on_thread_event(active: &ActiveSession, tid: pid_t, evt: ThreadEvent) {
    match evt {
        ThreadEvent::Terminated => {
            THREAD_STATES.remove(tid);
        }
        ThreadEvent::SelfThread | ThreadEvent::Existing | ThreadEvent::Spawned => {
            if !active.plan.selects(tid) {
                return;
            }
            if tid == sys_gettid() {
                let st = THREAD_STATES.insert_or_get(tid);
                if let Err(e) = arming::arm_current_thread(active.self_text(), st) {
                    log!(LogWarn, "cannot arm thread {}: {}", tid, e);
                }
            } else if let Err(e) = arming::arm_thread(tid) {
                // the thread may have exited between the scan and the queue
                log!(LogDebug, "arm request for thread {} not delivered: {}", tid, e);
            }
        }
    }
}
