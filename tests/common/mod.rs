//! Shared fixtures for the session tests.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tempfile::TempDir;

lazy_static::lazy_static! {
    static ref SESSION_LOCK: Mutex<()> = Mutex::new(());
}

/// Sessions are process-wide and cargo's harness runs tests in parallel, so
/// every test body runs under this lock.
pub fn serial() -> MutexGuard<'static, ()> {
    match SESSION_LOCK.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Burns this thread's CPU time. Interception resumes a short CPU-clock
/// interval after a thread crosses clone3, so tests spin here before
/// asserting that injection is back on.
pub fn spin_cpu(amount: Duration) {
    let start = thread_time();
    while thread_time().checked_sub(start).unwrap_or_default() < amount {}
}

fn thread_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Temp-file fixture. Each operation opens the file afresh and issues exactly
/// one read or write syscall, so tests can reason about per-syscall failure
/// probabilities (libc wrappers otherwise get creative: glibc's open is an
/// openat, buffered reads multiply the read count).
pub struct TmpFile {
    _dir: TempDir,
    path: PathBuf,
}

impl TmpFile {
    pub fn new() -> TmpFile {
        let dir = TempDir::new().expect("cannot create temp dir");
        let path = dir.path().join("data");
        File::create(&path).expect("cannot create temp file");
        TmpFile { _dir: dir, path }
    }

    pub fn write(&self, content: &str) -> io::Result<()> {
        let mut f = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        f.write_all(content.as_bytes())
    }

    pub fn read(&self) -> io::Result<String> {
        let mut f = File::open(&self.path)?;
        let mut buf = [0u8; 4096];
        let n = f.read(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}
