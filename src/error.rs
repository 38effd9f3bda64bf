//! Error handling utils.
//!
//! All errors produced by this crate funnel through a single [`Error`] enum.
//! This mirrors the error kinds from the design: a failed syscall, a
//! cancellation delivered while a fiber was suspended, an invalid argument
//! such as a `chain` call with the wrong arity, and a `timeout` deadline
//! (identified by the frame's own [`TimeoutToken`] — see
//! [`crate::time::timeout`]).

use std::io;

use crate::fiber::TimeoutToken;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error cases produced by this crate.
///
/// Propagation policy: every variant is surfaced to the caller once the
/// operation that raised it has unregistered its watchers and freed its
/// resources. A `TimedOut` belonging to the innermost `timeout` frame is
/// caught and converted there; anything else propagates further out.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A syscall failed with an errno other than `EWOULDBLOCK`/`EAGAIN`
    /// (or `EINPROGRESS` for `connect`), which are would-block signals, not
    /// errors, in this model.
    #[error("syscall failed: {0}")]
    Syscall(#[from] io::Error),

    /// The fiber's operation was resumed with a cancellation while awaiting
    /// a watcher.
    #[error("fiber operation was cancelled")]
    Cancelled,

    /// A `timeout` block ran past its deadline and an exception constructor
    /// was supplied. Carries the identity of the timeout frame that armed
    /// the timer (not just a label) so a `timeout` call can tell its own
    /// deadline apart from an outer, still-propagating one when timeouts
    /// nest — see [`crate::time::timeout`].
    #[error("operation timed out")]
    TimedOut(TimeoutToken),

    /// A `chain` call (or another op with validated arity) was given the
    /// wrong number or kind of arguments.
    #[error("invalid argument: {0}")]
    InvalidArgument(Box<str>),
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Syscall(_) => "Syscall",
            Self::Cancelled => "Cancelled",
            Self::TimedOut(_) => "TimedOut",
            Self::InvalidArgument(_) => "InvalidArgument",
        }
    }

    /// True for the errno values this model treats as "would block" rather
    /// than failure: the caller should register a watcher and await
    /// readiness instead of propagating the error.
    pub fn is_would_block(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
    }

    /// True for `EINTR`: retried immediately, without registering a watcher
    /// or suspending the fiber.
    pub fn is_interrupted(err: &io::Error) -> bool {
        err.kind() == io::ErrorKind::Interrupted
    }
}
