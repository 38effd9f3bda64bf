//! `waitpid` and `wait_event` (design §4.E "Time & lifecycle" / child
//! processes), grounded in `Backend_waitpid`'s two variants
//! (`POLYPHONY_USE_PIDFD_OPEN` and the plain child-watcher fallback) and
//! `Backend_wait_event` from the original backend.

use crate::error::Result;
use crate::fiber::{Host, ResumeValue};
use crate::scheduler::Backend;
use crate::watcher::Events;

#[cfg(all(target_os = "linux", feature = "pidfd"))]
mod pidfd {
    use std::os::unix::io::RawFd;

    // pidfd_open(2) has no libc wrapper in the `libc` crate versions this
    // crate targets; the raw syscall number is stable on every architecture
    // Linux 5.3+ runs on.
    pub fn pidfd_open(pid: libc::pid_t) -> std::io::Result<RawFd> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if fd < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(fd as RawFd)
        }
    }
}

/// Waits for `pid` to exit, returning `(pid, exit_status)`.
///
/// On Linux with the `pidfd` feature (the default), this opens a pidfd for
/// the process and waits on it exactly like any other readable fd — no
/// dedicated waiter thread, and safe to call from any thread since the pidfd
/// becomes readable the instant the kernel reaps the process regardless of
/// who's `poll`ing. Everywhere else, it registers the child-watcher
/// fallback (a dedicated thread blocking in `waitpid(2)`, see
/// [`crate::reactor::Reactor::register_child`]).
pub fn waitpid<H: Host>(backend: &Backend<H>, pid: libc::pid_t) -> Result<(libc::pid_t, i32)> {
    backend.bump_op_count();

    #[cfg(all(target_os = "linux", feature = "pidfd"))]
    {
        if let Ok(fd) = pidfd::pidfd_open(pid) {
            let result = backend.wait_for_io(fd, Events::READ);
            unsafe {
                libc::close(fd);
            }
            result.into_result()?;

            let mut status: libc::c_int = 0;
            let ret = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if ret < 0 {
                return Err(crate::error::Error::Syscall(std::io::Error::last_os_error()));
            }
            return Ok((ret, unsafe { libc::WEXITSTATUS(status) }));
        }
        // pidfd_open can fail on a kernel too old to support it even though
        // the feature is compiled in; fall through to the watcher path.
    }

    match backend.wait_for_child(pid) {
        ResumeValue::Child(got_pid, status) => Ok((got_pid, status)),
        other => {
            other.into_result()?;
            unreachable!("child watcher resumed with a non-exceptional, non-Child value")
        }
    }
}

/// Suspends the current fiber on a plain async watcher with no readiness
/// source of its own, to be woken by an external `schedule`/cross-thread
/// signal. Mirrors `Backend_wait_event`; `raise_on_exceptional` mirrors the
/// original's `raise` argument, controlling whether a `Cancelled`/`TimedOut`
/// resume propagates as an error or is swallowed and returned as a plain
/// "something happened" wakeup.
pub fn wait_event<H: Host>(backend: &Backend<H>, raise_on_exceptional: bool) -> Result<()> {
    backend.bump_op_count();
    let resume = backend.wait_for_event();
    if raise_on_exceptional {
        resume.into_result()
    } else {
        Ok(())
    }
}
