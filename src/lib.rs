//! A fiber-scheduling I/O backend: a single-threaded, cooperative-multitasking
//! reactor that turns blocking POSIX I/O calls into fiber suspend/resume
//! pairs.
//!
//! The crate does not implement fibers itself. It is generic over a small
//! [`fiber::Host`] trait that any stackful-coroutine runtime can implement;
//! [`fiber::thread::ThreadHost`] is a reference implementation backed by
//! parked OS threads, useful for testing and for embedding this crate without
//! bringing your own coroutine library.
//!
//! ### Layout
//!
//! - [`fiber`] — fiber identity, resume values, and the [`fiber::Host`]
//!   contract fibers are scheduled through.
//! - [`watcher`] — the tagged watcher variants the reactor multiplexes.
//! - [`runqueue`] — the scheduler's FIFO of runnable fibers.
//! - [`reactor`] — the `mio`-backed event loop: IO readiness, timers, child
//!   processes, and cross-thread wakeups.
//! - [`scheduler`] — [`scheduler::Backend`], the core that ties the run queue
//!   and the reactor together and drives one iteration of the event loop.
//! - [`io`] — fiber-suspending wrappers over `read`/`write`/`send`/`recv`/
//!   `accept`/`connect`.
//! - [`time`] — `sleep`, drift-free `timer_loop`, and `timeout`.
//! - [`process`] — `waitpid`, via `pidfd_open(2)` on Linux or a dedicated
//!   waiter thread elsewhere.
//! - [`splice`] — zero-copy and buffered data shuttling between file
//!   descriptors.
//! - [`control`] — polling a backend from outside a fiber, cross-thread
//!   wakeup, and post-fork reset.
//! - [`trace`] — optional tracing hooks for op-level instrumentation.
//! - [`error`] — the crate's [`error::Error`] enum and [`error::Result`]
//!   alias.

pub mod control;
pub mod error;
pub mod fiber;
pub mod io;
pub mod process;
pub mod reactor;
pub mod runqueue;
pub mod scheduler;
pub mod splice;
pub mod time;
pub mod trace;
pub mod watcher;

pub use error::{Error, Result};
pub use fiber::{FiberId, Host, ResumeValue};
pub use scheduler::Backend;
