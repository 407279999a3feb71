//! Thread discovery by scanning the process's task directory.
//!
//! Found the hard way (upstream of this design) that inotify does not work on
//! /proc, so the poller re-lists /proc/self/task on an interval. Netlink
//! cn_proc notifications would cut the discovery latency.
//! TODO: switch the ProcPoll driver to netlink cn_proc.

use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::syscalls::sys_gettid;
use libc::pid_t;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::plan::thread_discovery::Strategy;

/// What a scan learned about a thread.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadEvent {
    /// The monitor's own poller thread, reported once at startup.
    SelfThread,
    /// Present in the first scan; predates the session.
    Existing,
    /// Appeared in a later scan.
    Spawned,
    /// Seen before, gone now.
    Terminated,
}

pub(crate) type EventHandler = Box<dyn Fn(pid_t, ThreadEvent) + Send + Sync>;

struct ScanState {
    /// tid -> generation of the last scan that saw it.
    known_thds: HashMap<pid_t, u64>,
    gen: u64,
    stop: bool,
}

struct MonitorInner {
    handler: EventHandler,
    tasks_dir: PathBuf,
    state: Mutex<ScanState>,
    stop_cv: Condvar,
    started: (Mutex<bool>, Condvar),
}

/// Emits [`ThreadEvent`]s for the process's threads, either from a background
/// poller (`Strategy::ProcPoll`) or synchronously at construction and on
/// [`ThreadMonitor::rescan`] (`Strategy::None`).
pub(crate) struct ThreadMonitor {
    inner: Arc<MonitorInner>,
    poller: Option<thread::JoinHandle<()>>,
}

impl ThreadMonitor {
    pub(crate) fn new(strategy: Strategy, handler: EventHandler) -> ThreadMonitor {
        let inner = Arc::new(MonitorInner {
            handler,
            tasks_dir: PathBuf::from("/proc/self/task"),
            state: Mutex::new(ScanState {
                known_thds: HashMap::new(),
                gen: 0,
                stop: false,
            }),
            stop_cv: Condvar::new(),
            started: (Mutex::new(false), Condvar::new()),
        });

        match strategy {
            Strategy::ProcPoll { interval } => {
                let poll_inner = Arc::clone(&inner);
                let poller = thread::Builder::new()
                    .name("sysfault-thdmon".into())
                    .spawn(move || poll_inner.process(interval))
                    .unwrap_or_else(|e| fatal!("cannot spawn thread monitor: {}", e));
                // Callers rely on existing threads having been reported once
                // construction returns.
                let (flag, cv) = &inner.started;
                let mut done = lock(flag);
                while !*done {
                    done = match cv.wait(done) {
                        Ok(g) => g,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
                drop(done);
                ThreadMonitor {
                    inner,
                    poller: Some(poller),
                }
            }
            Strategy::None => {
                {
                    let mut st = lock(&inner.state);
                    inner.scan(&mut st);
                }
                ThreadMonitor {
                    inner,
                    poller: None,
                }
            }
        }
    }

    /// Runs a scan now, on the calling thread.
    pub(crate) fn rescan(&self) {
        let mut st = lock(&self.inner.state);
        self.inner.scan(&mut st);
    }

    /// tids seen by the most recent scan.
    pub(crate) fn known_tids(&self) -> Vec<pid_t> {
        lock(&self.inner.state).known_thds.keys().copied().collect()
    }
}

impl Drop for ThreadMonitor {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.take() {
            lock(&self.inner.state).stop = true;
            self.inner.stop_cv.notify_one();
            let _ = poller.join();
        }
    }
}

impl MonitorInner {
    fn process(&self, interval: Duration) {
        let self_tid = sys_gettid();
        {
            let mut st = lock(&self.state);
            let gen = st.gen;
            st.known_thds.insert(self_tid, gen);
        }
        (self.handler)(self_tid, ThreadEvent::SelfThread);

        let mut st = lock(&self.state);
        loop {
            self.scan(&mut st);
            if st.gen == 1 {
                let (flag, cv) = &self.started;
                *lock(flag) = true;
                cv.notify_all();
            }
            let (guard, _) = match self.stop_cv.wait_timeout(st, interval) {
                Ok(r) => r,
                Err(poisoned) => poisoned.into_inner(),
            };
            st = guard;
            if st.stop {
                break;
            }
        }
        log!(LogDebug, "thread monitor stopping");
    }

    /// One pass over the task directory: report unknown tids as
    /// Existing/Spawned, then report and forget every known tid the pass did
    /// not see. Transient races (a task vanishing mid-scan) just show up as a
    /// Terminated event on a later pass.
    fn scan(&self, st: &mut ScanState) {
        st.gen += 1;
        let first_scan = st.gen == 1;

        let entries = match fs::read_dir(&self.tasks_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log!(LogWarn, "cannot list {:?}: {}", self.tasks_dir, e);
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log!(LogDebug, "task entry vanished mid-scan: {}", e);
                    continue;
                }
            };
            let name = entry.file_name();
            let tid: pid_t = match name.to_string_lossy().parse() {
                Ok(tid) => tid,
                Err(_) => {
                    log!(LogDebug, "ignoring non-task entry {:?}", name);
                    continue;
                }
            };
            let gen = st.gen;
            match st.known_thds.entry(tid) {
                Entry::Occupied(mut entry) => {
                    entry.insert(gen);
                }
                Entry::Vacant(entry) => {
                    entry.insert(gen);
                    (self.handler)(
                        tid,
                        if first_scan {
                            ThreadEvent::Existing
                        } else {
                            ThreadEvent::Spawned
                        },
                    );
                }
            }
        }

        let gen = st.gen;
        let dead: Vec<pid_t> = st
            .known_thds
            .iter()
            .filter(|(_, g)| **g < gen)
            .map(|(tid, _)| *tid)
            .collect();
        for tid in dead {
            st.known_thds.remove(&tid);
            log!(LogDebug, "thread {} terminated", tid);
            (self.handler)(tid, ThreadEvent::Terminated);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    type Events = Arc<Mutex<Vec<(pid_t, ThreadEvent)>>>;

    fn collector() -> (Events, EventHandler) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler: EventHandler = Box::new(move |tid, evt| {
            sink.lock().unwrap().push((tid, evt));
        });
        (events, handler)
    }

    #[test]
    fn first_scan_reports_current_thread_as_existing() {
        let (events, handler) = collector();
        let _monitor = ThreadMonitor::new(Strategy::None, handler);
        let tid = sys_gettid();
        assert!(events
            .lock()
            .unwrap()
            .contains(&(tid, ThreadEvent::Existing)));
    }

    #[test]
    fn rescan_reports_spawn_and_termination() {
        let (events, handler) = collector();
        let monitor = ThreadMonitor::new(Strategy::None, handler);

        let (tid_tx, tid_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let child = thread::spawn(move || {
            tid_tx.send(sys_gettid()).unwrap();
            release_rx.recv().ok();
        });
        let child_tid = tid_rx.recv().unwrap();

        monitor.rescan();
        assert!(events
            .lock()
            .unwrap()
            .contains(&(child_tid, ThreadEvent::Spawned)));

        drop(release_tx);
        child.join().unwrap();
        // the tid may linger briefly in /proc while the thread is reaped
        let mut terminated = false;
        for _ in 0..50 {
            monitor.rescan();
            if events
                .lock()
                .unwrap()
                .contains(&(child_tid, ThreadEvent::Terminated))
            {
                terminated = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(terminated);
    }

    #[test]
    fn poller_reports_itself_and_signals_startup() {
        let (events, handler) = collector();
        let monitor = ThreadMonitor::new(
            Strategy::ProcPoll {
                interval: Duration::from_millis(5),
            },
            handler,
        );
        // constructor returned, so the first scan has happened
        {
            let events = events.lock().unwrap();
            assert!(events.iter().any(|(_, e)| *e == ThreadEvent::SelfThread));
            assert!(events
                .iter()
                .any(|(tid, e)| *e == ThreadEvent::Existing && *tid == sys_gettid()));
        }
        drop(monitor); // joins the poller
    }
}
