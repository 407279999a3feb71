//! Probabilistic syscall fault injection for Linux on x86-64.
//!
//! `sysfault` uses the kernel's Syscall User Dispatch facility to route every
//! syscall an armed thread makes into a SIGSYS handler, which then injects an
//! errno, a delay, or forwards the call untouched according to a [`Plan`].
//! The library's own text segment is exempted from dispatch, so the handler
//! can issue syscalls (including re-issuing the trapped one) without
//! re-trapping.
//!
//! ```no_run
//! use std::collections::HashMap;
//! use sysfault::{thread_discovery, Outcome, Plan, Session};
//!
//! let mut outcomes = HashMap::new();
//! outcomes.insert(libc::SYS_read, Outcome::fail(0.3, libc::EIO).unwrap());
//! let plan = Plan::new(outcomes, |_tid| true, thread_discovery::Strategy::None);
//!
//! let session = Session::new(plan).unwrap();
//! // ... run the workload whose error paths you want to exercise ...
//! drop(session);
//! ```

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("sysfault requires Syscall User Dispatch on Linux/x86-64");

#[macro_use]
extern crate lazy_static;

#[macro_use]
mod log;

mod arming;
mod dispatch;
mod error;
mod mem_map;
mod plan;
mod registers;
mod session;
mod syscalls;
mod thread_monitor;
mod thread_state;

pub use crate::error::{Error, Result};
pub use crate::mem_map::AddrRange;
pub use crate::plan::{
    thread_discovery, EligibleFn, Errno, Outcome, Plan, Probability, SelectorFn, Syscall,
};
pub use crate::registers::Registers;
pub use crate::session::Session;
pub use crate::thread_monitor::ThreadEvent;
