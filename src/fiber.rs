//! Fiber identity and the host fiber contract.
//!
//! A fiber is a cooperative execution context owned by the host runtime
//! embedding this crate. The core only ever stores an opaque identity
//! ([`FiberId`]) and relies on the host for the actual context switch — this
//! mirrors the design's framing of "command-line entry points... the
//! concrete choice of event-loop library" as external collaborators: the
//! stack-switching substrate is likewise a host concern, specified here only
//! as the three-method [`Host`] contract.
//!
//! [`thread::ThreadHost`] is a concrete, realistic implementation of that
//! contract for callers who don't already have a stackful-coroutine crate of
//! their own: one parked OS thread per fiber, handed off with a `Condvar` so
//! only one ever runs at a time.

use std::sync::atomic::{AtomicU64, Ordering};

pub mod thread;

/// Opaque identity of a fiber. Two `FiberId`s compare equal iff they
/// identify the same fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId(u64);

impl FiberId {
    /// Allocates a fresh, process-wide-unique id. Hosts that already have
    /// their own fiber identity (an address, a slot index) may instead
    /// construct a `FiberId` directly via [`Self::from_raw`].
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a host-supplied raw identity, e.g. a slot index or address cast
    /// to `u64`. Two different raw values never compare equal.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw identity, for hosts that need to round-trip it through their
    /// own bookkeeping.
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// The resume value threaded through `await`/`switch_fiber`/`schedule`.
///
/// Modeled as a sum type rather than a sentinel-pointer check, per the
/// design's "exception-as-resume-value" note: an op that receives anything
/// other than [`ResumeValue::Unit`] must unregister its watchers and
/// propagate before returning.
#[derive(Debug, Clone)]
pub enum ResumeValue {
    /// Ordinary wakeup; carries no payload.
    Unit,
    /// Delivered by the child-watcher waitpid path: `(pid, exit_status)`.
    Child(libc::pid_t, i32),
    /// The fiber's operation was cancelled while suspended.
    Cancelled,
    /// A `timeout` deadline elapsed. Carries the identity of the timeout
    /// frame that armed the timer, so nested timeouts don't swallow each
    /// other's sentinels (see [`crate::time::timeout`]).
    TimedOut(TimeoutToken),
}

impl ResumeValue {
    /// True for every variant except [`ResumeValue::Unit`] — i.e. whether
    /// this resume must be propagated by the op that receives it instead of
    /// being treated as a plain wakeup.
    pub fn is_exceptional(&self) -> bool {
        !matches!(self, ResumeValue::Unit)
    }

    /// Converts a resume delivered to a suspended I/O-style op into a
    /// `Result`, the common exit path every op in [`crate::io`],
    /// [`crate::splice`], and [`crate::process`] funnels through after
    /// `await`ing a watcher. `Child` is only ever meaningful to
    /// [`crate::process::waitpid`], which matches on it directly instead of
    /// going through this helper.
    pub fn into_result(self) -> crate::error::Result<()> {
        match self {
            ResumeValue::Unit | ResumeValue::Child(..) => Ok(()),
            ResumeValue::Cancelled => Err(crate::error::Error::Cancelled),
            ResumeValue::TimedOut(token) => Err(crate::error::Error::TimedOut(token)),
        }
    }
}

/// Unique identity of one `timeout(...)` call's timer, used to distinguish
/// an outer timeout's sentinel from an inner one when timeouts nest.
#[derive(Debug, Clone)]
pub struct TimeoutToken(std::sync::Arc<()>);

impl TimeoutToken {
    pub fn new() -> Self {
        Self(std::sync::Arc::new(()))
    }

    /// Whether `value` is *this* token's sentinel specifically (not just any
    /// `TimedOut`), by pointer identity rather than by variant match.
    pub fn is_mine(&self, value: &ResumeValue) -> bool {
        matches!(value, ResumeValue::TimedOut(other) if std::sync::Arc::ptr_eq(&self.0, &other.0))
    }
}

impl Default for TimeoutToken {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TimeoutToken {
    fn eq(&self, other: &Self) -> bool {
        std::sync::Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TimeoutToken {}

/// The external fiber contract (design §6 "Host fiber contract").
///
/// Implemented by the host runtime; the scheduler core (`Backend<H>`) is
/// generic over this trait and never assumes anything about how fibers are
/// actually executed.
pub trait Host {
    /// The identity of the fiber currently running on this thread.
    fn current(&self) -> FiberId;

    /// Switches execution from the current fiber to `target`, handing it
    /// `value` as its resume value, and blocks until some other fiber
    /// switches back to the caller. Returns the value *that* switch-back
    /// supplied.
    fn switch_to(&self, target: FiberId, value: ResumeValue) -> ResumeValue;

    /// Marks `fiber` as eligible to be switched to. Unlike [`Self::switch_to`]
    /// this does not yield control; it only records that `fiber` should run
    /// the next time the scheduler switches to it. Called from watcher
    /// callbacks, which never run with a "current fiber" of their own.
    fn make_runnable(&self, fiber: FiberId);
}
