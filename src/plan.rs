//! The user-facing fault plan and its precomputed runtime form.

use crate::error::{Error, Result};
use crate::registers::Registers;
use libc::pid_t;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Syscall number as the kernel sees it in RAX.
pub type Syscall = i64;
/// Errno value, returned to the application per the kernel's negative-return
/// convention.
pub type Errno = i32;

/// Decides which threads are subject to injection.
pub type SelectorFn = Box<dyn Fn(pid_t) -> bool + Send + Sync>;
/// Per-call gate evaluated on the trapping thread's register snapshot. Runs
/// in signal context: it must not allocate, lock, or call into libc.
pub type EligibleFn = Box<dyn Fn(&Registers) -> bool + Send + Sync>;

pub mod thread_discovery {
    use std::time::Duration;

    /// How a session learns about threads it did not arm explicitly.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub enum Strategy {
        /// Poll the process's task directory from a background thread.
        /// (inotify does not work on /proc; netlink cn_proc would beat
        /// polling and is the intended replacement.)
        ProcPoll { interval: Duration },
        /// Scan once at session start and again only on explicit rescans.
        None,
    }
}

/// Chance of an effect firing. `after_bias` is advisory: 0 means apply the
/// effect before the syscall executes, 1 after. The engine currently applies
/// all effects before.
#[derive(Copy, Clone, Debug)]
pub struct Probability {
    p: f64,
    after_bias: f64,
}

impl Probability {
    pub fn new(p: f64, after_bias: f64) -> Result<Probability> {
        if !p.is_finite() || !(0.0..=1.0).contains(&p) {
            return Err(Error::InvalidProbability(format!("p = {} not in [0, 1]", p)));
        }
        if !after_bias.is_finite() || !(0.0..=1.0).contains(&after_bias) {
            return Err(Error::InvalidProbability(format!(
                "after_bias = {} not in [0, 1]",
                after_bias
            )));
        }
        Ok(Probability { p, after_bias })
    }

    /// The effect never fires.
    pub fn never() -> Probability {
        Probability {
            p: 0.0,
            after_bias: 0.0,
        }
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    pub fn after_bias(&self) -> f64 {
        self.after_bias
    }
}

/// Desired behavior for one syscall number.
pub struct Outcome {
    fail: Probability,
    delay: Probability,
    max_delay: Duration,
    error_weights: BTreeMap<Errno, f64>,
    eligible: Option<EligibleFn>,
}

impl Outcome {
    pub fn new(
        fail: Probability,
        delay: Probability,
        max_delay: Duration,
        error_weights: BTreeMap<Errno, f64>,
    ) -> Result<Outcome> {
        let mut total = 0.0;
        for (errno, weight) in &error_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(Error::InvalidProbability(format!(
                    "weight {} for errno {} must be a non-negative number",
                    weight, errno
                )));
            }
            total += weight;
        }
        if fail.p() > 0.0 && total <= 0.0 {
            return Err(Error::InvalidProbability(
                "fail probability is positive but no error has positive weight".into(),
            ));
        }
        Ok(Outcome {
            fail,
            delay,
            max_delay,
            error_weights,
            eligible: None,
        })
    }

    /// Fail with a single errno at probability `p`.
    pub fn fail(p: f64, errno: Errno) -> Result<Outcome> {
        let mut weights = BTreeMap::new();
        weights.insert(errno, 1.0);
        Outcome::new(
            Probability::new(p, 0.0)?,
            Probability::never(),
            Duration::from_micros(0),
            weights,
        )
    }

    /// Delay at probability `p` for a uniform duration in `[0, max_delay]`.
    pub fn delay(p: f64, max_delay: Duration) -> Result<Outcome> {
        Outcome::new(
            Probability::never(),
            Probability::new(p, 0.0)?,
            max_delay,
            BTreeMap::new(),
        )
    }

    /// Restrict this outcome to calls whose register snapshot passes `f`.
    pub fn with_eligible(mut self, f: EligibleFn) -> Outcome {
        self.eligible = Some(f);
        self
    }
}

/// Immutable description of what to inject and where. Built by user code,
/// consumed by [`crate::Session::new`].
pub struct Plan {
    outcomes: HashMap<Syscall, Outcome>,
    selector: SelectorFn,
    thread_discovery: thread_discovery::Strategy,
}

impl Plan {
    pub fn new(
        outcomes: HashMap<Syscall, Outcome>,
        selector: impl Fn(pid_t) -> bool + Send + Sync + 'static,
        thread_discovery: thread_discovery::Strategy,
    ) -> Plan {
        Plan {
            outcomes,
            selector: Box::new(selector),
            thread_discovery,
        }
    }

    pub fn thread_discovery(&self) -> thread_discovery::Strategy {
        self.thread_discovery
    }
}

impl Default for Plan {
    /// No outcomes and a selector that rejects every thread: a session over
    /// the default plan observes without interfering.
    fn default() -> Plan {
        Plan::new(
            HashMap::new(),
            |_tid| false,
            thread_discovery::Strategy::None,
        )
    }
}

/// An [`Outcome`] with the errno distribution precomputed, so the signal
/// handler samples with arithmetic and a lower-bound scan only.
pub(crate) struct ActiveOutcome {
    pub(crate) fail_p: f64,
    pub(crate) delay_p: f64,
    pub(crate) max_delay_us: u64,
    total_weight: f64,
    error_by_cumulative_w: Vec<(f64, Errno)>,
    pub(crate) eligible: Option<EligibleFn>,
}

impl ActiveOutcome {
    fn new(o: Outcome) -> ActiveOutcome {
        let mut cumulative = 0.0;
        let mut table = Vec::with_capacity(o.error_weights.len());
        for (errno, weight) in &o.error_weights {
            if *weight <= 0.0 {
                continue;
            }
            cumulative += weight;
            table.push((cumulative, *errno));
        }
        ActiveOutcome {
            fail_p: o.fail.p(),
            delay_p: o.delay.p(),
            max_delay_us: o.max_delay.as_micros() as u64,
            total_weight: cumulative,
            error_by_cumulative_w: table,
            eligible: o.eligible,
        }
    }

    /// Picks the errno whose cumulative weight is the lower bound of
    /// `u * total_weight`, for a uniform draw `u` in `[0, 1)`.
    pub(crate) fn pick_errno(&self, u: f64) -> Option<Errno> {
        if self.error_by_cumulative_w.is_empty() {
            return None;
        }
        let target = u * self.total_weight;
        let i = self
            .error_by_cumulative_w
            .partition_point(|(cum, _)| *cum < target);
        let i = i.min(self.error_by_cumulative_w.len() - 1);
        Some(self.error_by_cumulative_w[i].1)
    }
}

/// The runtime form of a [`Plan`]; immutable once the session is live, which
/// is what makes lock-free reads from the SIGSYS handler sound.
pub(crate) struct ActivePlan {
    outcomes: HashMap<Syscall, ActiveOutcome>,
    selector: SelectorFn,
}

impl ActivePlan {
    pub(crate) fn new(plan: Plan) -> ActivePlan {
        let outcomes = plan
            .outcomes
            .into_iter()
            .map(|(call, o)| (call, ActiveOutcome::new(o)))
            .collect();
        ActivePlan {
            outcomes,
            selector: plan.selector,
        }
    }

    pub(crate) fn outcome(&self, call: Syscall) -> Option<&ActiveOutcome> {
        self.outcomes.get(&call)
    }

    pub(crate) fn selects(&self, tid: pid_t) -> bool {
        (self.selector)(tid)
    }
}
