//! Operations meant to be called from outside any fiber — driving a
//! backend's event loop from a host's top-level loop, waking it from another
//! thread, and resetting it after `fork()` (design §4.G "Control surface").
//! Grounded in `Backend_poll`, `Backend_wakeup`, `Backend_post_fork`,
//! `Backend_kind`, and `Backend_chain` from the original backend.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::fiber::Host;
use crate::scheduler::{Backend, WakeHandle};

/// Runs the reactor once. `blocking` selects `Backend_poll(self, blocking)`'s
/// two modes: `true` blocks until at least one watcher fires (or the next
/// timer deadline), `false` returns immediately having processed whatever was
/// already ready. A host's own top-level loop calls this directly; fibers
/// never do, since every suspending op already polls through
/// [`Backend::switch_fiber`].
pub fn poll<H: Host>(backend: &Backend<H>, blocking: bool) {
    backend.poll(blocking);
}

/// Hands back a `Send + Sync` handle that can interrupt a blocking [`poll`]
/// from any other thread — the only operation on a [`Backend`] this crate
/// considers safe to call concurrently with the fiber actually running on
/// it. Mirrors `Backend_wakeup`, which uses `ev_async_send` specifically
/// because (unlike `ev_break`) it may be called across threads.
pub fn wake_handle<H: Host>(backend: &Backend<H>) -> WakeHandle {
    backend.wake_handle()
}

/// Tears down and recreates everything fork-sensitive: the reactor (its
/// epoll fd and every registered waiter thread belong to the parent and are
/// meaningless after `fork()`) and the run queue. Must be called in the
/// child immediately after `fork()`, before resuming any fiber. Mirrors
/// `Backend_post_fork`'s `ev_loop_destroy` + `backend_base_reset`.
pub fn post_fork<H: Host>(backend: &Backend<H>) -> std::io::Result<()> {
    backend.post_fork()
}

/// Identifies this crate's one concrete backend flavor. Mirrors
/// `Backend_kind`, which exists because the original ships two backend
/// implementations (`libev` and io_uring) selectable at runtime; this crate
/// has only the `mio` one, but keeps the method for host code written
/// against that same surface.
pub fn kind<H: Host>(backend: &Backend<H>) -> &'static str {
    backend.kind()
}

/// One step of a [`chain`] call — an I/O op small enough to run back-to-back
/// with its neighbors without an intervening fiber switch between the
/// syscall and its suspend point. Mirrors `Backend_chain`'s arity-checked
/// `:write`/`:send`/`:splice` symbols, expressed as a typed enum instead of
/// runtime arity validation since Rust can enforce each op's shape at the
/// call site.
pub enum ChainOp<'a> {
    Write { fd: RawFd, buf: &'a [u8] },
    Send { fd: RawFd, buf: &'a [u8], flags: i32 },
    Splice { src_fd: RawFd, dest_fd: RawFd, maxlen: usize },
}

/// Runs each op in `ops` in order, returning the last op's result. Mirrors
/// `Backend_chain`: a convenience for issuing several I/O calls from one
/// host-level call site, not a transaction — an earlier op's failure still
/// aborts the rest, it just returns that op's error. An empty chain is an
/// invalid argument (the original's `argc == 0` returns `nil` silently, but
/// a no-op chain is never meaningful and more likely a caller bug here).
pub fn chain<H: Host>(backend: &Backend<H>, ops: &mut [ChainOp]) -> Result<usize> {
    if ops.is_empty() {
        return Err(Error::InvalidArgument("chain: at least one op required".into()));
    }
    let mut result = 0;
    for op in ops {
        result = match op {
            ChainOp::Write { fd, buf } => crate::io::write(backend, *fd, buf)?,
            ChainOp::Send { fd, buf, flags } => crate::io::send(backend, *fd, buf, *flags)?,
            ChainOp::Splice { src_fd, dest_fd, maxlen } => {
                crate::splice::splice(backend, *src_fd, *dest_fd, *maxlen)?
            }
        };
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::thread::ThreadHost;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn run_fiber<T: Send + 'static>(
        backend: Arc<Backend<ThreadHost>>,
        body: impl FnOnce(&Backend<ThreadHost>) -> T + Send + 'static,
    ) -> T {
        let (tx, rx) = mpsc::channel();
        let host = backend.host().clone();
        let (fiber, join) = host.spawn(move |_| {
            let value = body(&backend);
            tx.send(value).unwrap();
        });
        host.make_runnable(fiber);
        join.join().unwrap()
    }

    #[test]
    fn kind_matches_the_backend_method() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        assert_eq!(kind(&backend), "mio");
    }

    #[test]
    fn post_fork_delegates_to_the_backend() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        backend.bump_op_count();
        post_fork(&backend).unwrap();
        assert_eq!(backend.op_count(), 0);
    }

    #[test]
    fn wake_handle_is_a_noop_when_not_polling() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        assert!(!wake_handle(&backend).wakeup());
    }

    #[test]
    fn chain_rejects_an_empty_op_list() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        assert!(chain(&backend, &mut []).is_err());
    }

    #[test]
    fn chain_runs_writes_in_order_and_returns_the_last_result() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());

        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let last = run_fiber(backend, move |backend| {
            let result = chain(
                backend,
                &mut [
                    ChainOp::Write { fd: write_fd, buf: b"ab" },
                    ChainOp::Write { fd: write_fd, buf: b"cde" },
                ],
            );
            unsafe {
                libc::close(write_fd);
            }
            result
        })
        .unwrap();
        assert_eq!(last, 3);

        let mut buf = [0u8; 16];
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut _, buf.len()) };
        assert_eq!(&buf[..n as usize], b"abcde");
        unsafe {
            libc::close(read_fd);
        }
    }
}
