//! The scheduler core (design §4.C): `schedule`, `switch_fiber`, `snooze`,
//! `await`, parking, idle bookkeeping, and the `Backend<H>` type that ties the
//! run queue and the reactor together.
//!
//! `Backend<H>` is generic over [`Host`] so this crate never assumes anything
//! about how a fiber's stack is actually switched; [`crate::fiber::thread::ThreadHost`]
//! is a ready-made implementation for callers who don't bring their own.
//!
//! Every piece of mutable state here sits behind a `Mutex`, not a `RefCell`.
//! Only one fiber is ever logically running at a time, so these locks never
//! actually contend in practice — but [`fiber::thread::ThreadHost`](crate::fiber::thread::ThreadHost)
//! backs each fiber with a real OS thread, and a `Backend` is shared across
//! all of them behind an `Arc`, so it has to be genuinely `Sync`.

use std::collections::HashSet;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::fiber::{FiberId, Host, ResumeValue};
use crate::reactor::{PollMode, Reactor, ReactorHandle};
use crate::trace::{TraceEvent, TraceSink};
use crate::watcher::{Events, WatcherId};

/// Every `switch_fiber` call this many times polls the reactor
/// non-blockingly first, so a run of CPU-bound fibers doesn't starve pending
/// I/O (design §4.C point 2). Small and implementation-defined, per spec.
const NONBLOCKING_POLL_INTERVAL: u32 = 32;

/// A `Send + Sync` handle for waking a [`Backend`] from another thread — the
/// *only* thread-safe operation this crate exposes on a backend (design §5).
#[derive(Clone)]
pub struct WakeHandle {
    reactor: ReactorHandle,
    break_id: WatcherId,
    currently_polling: Arc<AtomicBool>,
}

impl WakeHandle {
    /// Interrupts a blocking `poll` on the owning thread. Returns `true` if a
    /// signal was actually sent (the backend was polling at the time),
    /// `false` if this was a no-op.
    pub fn wakeup(&self) -> bool {
        if self.currently_polling.load(Ordering::SeqCst) {
            self.reactor.signal(self.break_id);
            true
        } else {
            false
        }
    }
}

/// Per-thread singleton that owns the reactor, the run queue, and every other
/// piece of scheduling state (design §3 "Backend").
pub struct Backend<H: Host> {
    host: H,
    reactor: Mutex<Reactor>,
    runqueue: Mutex<crate::runqueue::RunQueue>,

    op_count: AtomicU64,
    poll_count: AtomicU64,
    switches_since_poll: AtomicU32,
    currently_polling: Arc<AtomicBool>,

    parked: Mutex<HashSet<FiberId>>,

    idle_proc: Mutex<Option<Box<dyn FnMut() + Send>>>,
    idle_gc_period: Mutex<Option<Duration>>,
    idle_gc_last_time: Mutex<Instant>,

    trace: Mutex<TraceSink>,
}

impl<H: Host> Backend<H> {
    pub fn new(host: H) -> io::Result<Self> {
        Ok(Self {
            host,
            reactor: Mutex::new(Reactor::new()?),
            runqueue: Mutex::new(crate::runqueue::RunQueue::new()),
            op_count: AtomicU64::new(0),
            poll_count: AtomicU64::new(0),
            switches_since_poll: AtomicU32::new(0),
            currently_polling: Arc::new(AtomicBool::new(false)),
            parked: Mutex::new(HashSet::new()),
            idle_proc: Mutex::new(None),
            idle_gc_period: Mutex::new(None),
            idle_gc_last_time: Mutex::new(Instant::now()),
            trace: Mutex::new(TraceSink::new()),
        })
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn current_fiber(&self) -> FiberId {
        self.host.current()
    }

    pub fn op_count(&self) -> u64 {
        self.op_count.load(Ordering::Relaxed)
    }

    pub fn poll_count(&self) -> u64 {
        self.poll_count.load(Ordering::Relaxed)
    }

    pub(crate) fn bump_op_count(&self) {
        self.op_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Identifies this backend's flavor (design §6 `kind()`); this crate has
    /// exactly one concrete reactor implementation, built on `mio`.
    pub fn kind(&self) -> &'static str {
        "mio"
    }

    // ---- schedule / switch_fiber / snooze / await (design §4.C) ----

    /// Schedules `fiber` to run with `value`. Idempotent: an already-queued
    /// fiber just has its resume value updated. Safe to call from watcher
    /// callbacks or from plain code running on a fiber.
    pub fn schedule(&self, fiber: FiberId, value: ResumeValue, prioritize: bool) {
        self.emit_trace(TraceEvent::Schedule { fiber });
        let mut rq = self.runqueue.lock().expect("run queue poisoned");
        if prioritize {
            rq.push_front(fiber, value);
        } else {
            rq.push_back(fiber, value);
        }
    }

    /// Removes `fiber` from the run queue regardless of position. Used when a
    /// fiber dies (design notes, "Run-queue index").
    pub fn unschedule(&self, fiber: FiberId) {
        self.runqueue.lock().expect("run queue poisoned").delete(fiber);
    }

    fn emit_trace(&self, event: TraceEvent) {
        self.trace.lock().expect("trace sink poisoned").emit(event);
    }

    fn run_idle_tasks(&self) {
        let gc_period = *self.idle_gc_period.lock().expect("idle gc period poisoned");
        if let Some(period) = gc_period {
            let mut last = self.idle_gc_last_time.lock().expect("idle gc clock poisoned");
            if last.elapsed() >= period {
                *last = Instant::now();
                drop(last);
                // Host GC hook: this crate has no allocator of its own to
                // collect, so the idle proc (if any) is the only sink for
                // this tick. A host embedding a GC'd runtime would instead
                // wire an actual collection pass in here.
                self.emit_trace(TraceEvent::IdleGc);
            }
        }
        if let Some(idle_proc) = self.idle_proc.lock().expect("idle proc poisoned").as_mut() {
            idle_proc();
        }
    }

    fn poll_reactor(&self, mode: PollMode) {
        self.poll_count.fetch_add(1, Ordering::Relaxed);
        self.emit_trace(TraceEvent::PollEnter {
            fiber: self.host.current(),
        });
        self.currently_polling.store(true, Ordering::SeqCst);
        let ready = self.reactor.lock().expect("reactor poisoned").run(mode);
        self.currently_polling.store(false, Ordering::SeqCst);
        self.emit_trace(TraceEvent::PollLeave {
            fiber: self.host.current(),
        });
        for (fiber, value) in ready {
            self.schedule(fiber, value, false);
        }
    }

    /// The central scheduling primitive (design §4.C). Pops the next
    /// runnable fiber and switches to it, blocking the caller until it is
    /// switched back to.
    pub fn switch_fiber(&self) -> ResumeValue {
        loop {
            let empty = self.runqueue.lock().expect("run queue poisoned").is_empty();
            if empty {
                self.run_idle_tasks();
                self.poll_reactor(PollMode::OnceBlocking);
                if !self.runqueue.lock().expect("run queue poisoned").is_empty() {
                    break;
                }
            } else {
                let n = self.switches_since_poll.fetch_add(1, Ordering::Relaxed) + 1;
                if n % NONBLOCKING_POLL_INTERVAL == 0 {
                    self.poll_reactor(PollMode::NonBlocking);
                }
                break;
            }
        }
        let (next, value) = self
            .runqueue
            .lock()
            .expect("run queue poisoned")
            .pop_front()
            .expect("run queue was just confirmed non-empty");
        self.host.switch_to(next, value)
    }

    /// Schedules the current fiber at the back of the run queue, then
    /// switches. Used both to yield cooperatively and after a successful
    /// non-blocking syscall, so a hot op doesn't starve its peers.
    pub fn snooze(&self) -> ResumeValue {
        let me = self.host.current();
        self.schedule(me, ResumeValue::Unit, false);
        self.switch_fiber()
    }

    /// Suspends the current fiber without self-scheduling. It stays off the
    /// run queue until some external callback (a watcher firing, or a direct
    /// `schedule` call) puts it back.
    pub fn r#await(&self) -> ResumeValue {
        self.switch_fiber()
    }

    // ---- parking (design §4.C, for diagnostics / shutdown enumeration) ----

    pub fn park_fiber(&self, fiber: FiberId) {
        self.parked.lock().expect("parked set poisoned").insert(fiber);
    }

    pub fn unpark_fiber(&self, fiber: FiberId) {
        self.parked.lock().expect("parked set poisoned").remove(&fiber);
    }

    pub fn parked_fibers(&self) -> Vec<FiberId> {
        self.parked
            .lock()
            .expect("parked set poisoned")
            .iter()
            .copied()
            .collect()
    }

    // ---- cross-thread wakeup (design §4.C, the only thread-safe op) ----

    pub fn wake_handle(&self) -> WakeHandle {
        let reactor = self.reactor.lock().expect("reactor poisoned");
        WakeHandle {
            reactor: reactor.handle(),
            break_id: reactor.break_watcher(),
            currently_polling: self.currently_polling.clone(),
        }
    }

    // ---- idle tasks / control surface (design §4.C, §4.G) ----

    pub fn set_idle_proc(&self, idle_proc: Option<Box<dyn FnMut() + Send>>) {
        *self.idle_proc.lock().expect("idle proc poisoned") = idle_proc;
    }

    pub fn set_idle_gc_period(&self, period: Option<Duration>) {
        *self.idle_gc_period.lock().expect("idle gc period poisoned") = period;
        *self.idle_gc_last_time.lock().expect("idle gc clock poisoned") = Instant::now();
    }

    /// Runs the reactor once, per design §4.G `poll(blocking)`. Meant to be
    /// called from outside any fiber (e.g. a host's top-level driving loop).
    pub fn poll(&self, blocking: bool) {
        let mode = if blocking {
            PollMode::OnceBlocking
        } else {
            PollMode::NonBlocking
        };
        self.poll_reactor(mode);
    }

    /// Tears down the reactor and creates a fresh one, resetting every
    /// counter and the run queue (design §4.G `post_fork`). Must be called in
    /// the child immediately after `fork()`.
    pub fn post_fork(&self) -> io::Result<()> {
        self.reactor.lock().expect("reactor poisoned").reset()?;
        *self.runqueue.lock().expect("run queue poisoned") = crate::runqueue::RunQueue::new();
        self.op_count.store(0, Ordering::Relaxed);
        self.poll_count.store(0, Ordering::Relaxed);
        self.switches_since_poll.store(0, Ordering::Relaxed);
        self.parked.lock().expect("parked set poisoned").clear();
        Ok(())
    }

    pub fn trace(&self, sink: impl FnMut(TraceEvent) + Send + 'static) {
        self.trace
            .lock()
            .expect("trace sink poisoned")
            .set_proc(Box::new(sink));
    }

    pub fn clear_trace(&self) {
        self.trace.lock().expect("trace sink poisoned").clear_proc();
    }

    // ---- reactor registration helpers shared by io/time/process/splice ----

    /// Registers a one-shot IO watcher and awaits it, unregistering on every
    /// return path. This *is* the `wait_io` operation (design §4.D); every
    /// other I/O op's would-block branch funnels through this same helper.
    pub(crate) fn wait_for_io(&self, fd: RawFd, events: Events) -> ResumeValue {
        let fiber = self.host.current();
        let id = self
            .reactor
            .lock()
            .expect("reactor poisoned")
            .register_io(fd, events, fiber);
        let result = self.r#await();
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .unregister_io(id, fd);
        result
    }

    /// Registers an RW watcher across up to two fds and awaits it (design
    /// §4.F), used by [`crate::splice`].
    pub(crate) fn wait_for_rw_io(
        &self,
        read_fd: Option<RawFd>,
        write_fd: Option<RawFd>,
    ) -> ResumeValue {
        let fiber = self.host.current();
        let id = self
            .reactor
            .lock()
            .expect("reactor poisoned")
            .register_rw_io(read_fd, write_fd, fiber);
        let result = self.r#await();
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .unregister_rw_io(id, read_fd, write_fd);
        result
    }

    /// Arms a one-shot timer delivering `resume` and awaits it, for
    /// [`crate::time::sleep`] and [`crate::time::timeout`].
    pub(crate) fn wait_for_timer(&self, after: Duration, resume: ResumeValue) -> ResumeValue {
        let fiber = self.host.current();
        let id = self
            .reactor
            .lock()
            .expect("reactor poisoned")
            .register_timer(after, fiber, resume);
        let result = self.r#await();
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .unregister_timer(id);
        result
    }

    /// Like [`Self::wait_for_timer`] but leaves the timer registered on
    /// return, handing back the id so the caller can unregister once its
    /// *own* protected block finishes — this is what lets `timeout` keep
    /// running the block concurrently with the armed deadline.
    pub(crate) fn arm_timer(&self, after: Duration, resume: ResumeValue) -> WatcherId {
        let fiber = self.host.current();
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .register_timer(after, fiber, resume)
    }

    pub(crate) fn disarm_timer(&self, id: WatcherId) {
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .unregister_timer(id);
    }

    /// Registers the child-watcher fallback and awaits it (design §4.E
    /// `waitpid`, non-pidfd path).
    pub(crate) fn wait_for_child(&self, pid: libc::pid_t) -> ResumeValue {
        let fiber = self.host.current();
        let _id = self
            .reactor
            .lock()
            .expect("reactor poisoned")
            .register_child(pid, fiber);
        let result = self.r#await();
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .unregister_child(pid);
        result
    }

    /// Registers a no-op async watcher and awaits it — design §4.E
    /// `wait_event`: a thread-safe "ping" primitive with no readiness source
    /// of its own. The caller is woken by someone else calling
    /// [`Backend::schedule`] directly (same thread) or via a
    /// [`WakeHandle`]-style signal (cross-thread); this watcher's sole job is
    /// to give that suspension a name to register/unregister symmetrically.
    pub(crate) fn wait_for_event(&self) -> ResumeValue {
        let fiber = self.host.current();
        let id = self
            .reactor
            .lock()
            .expect("reactor poisoned")
            .register_async(Some(fiber));
        let result = self.r#await();
        self.reactor
            .lock()
            .expect("reactor poisoned")
            .unregister_async(id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::thread::ThreadHost;

    #[test]
    fn kind_identifies_the_mio_backend() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        assert_eq!(backend.kind(), "mio");
    }

    #[test]
    fn post_fork_resets_counters() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        backend.bump_op_count();
        backend.bump_op_count();
        assert_eq!(backend.op_count(), 2);
        backend.post_fork().unwrap();
        assert_eq!(backend.op_count(), 0);
    }

    #[test]
    fn park_and_unpark_track_membership() {
        let backend = Backend::new(ThreadHost::new()).unwrap();
        let fiber = FiberId::next();
        assert!(backend.parked_fibers().is_empty());
        backend.park_fiber(fiber);
        assert_eq!(backend.parked_fibers(), vec![fiber]);
        backend.unpark_fiber(fiber);
        assert!(backend.parked_fibers().is_empty());
    }
}
