//! The `mio`-backed event loop (design §4.A).
//!
//! Owns every registration the scheduler core hands it: fd readiness, one-shot
//! timers (mio has no timer watcher of its own, so we keep a small min-heap),
//! child-process exits (via a dedicated waiter thread per pid — mio has no
//! child watcher either, and this is explicitly the fallback path; see
//! [`crate::process::waitpid`] for the pidfd fast path that needs none of
//! this), and async watchers (a `mio::Waker`-backed primitive used both for
//! the always-registered, unreferenced "break" watcher and for ad hoc
//! cross-thread pings like [`crate::process::wait_event`]).
//!
//! `run()` drains everything that became ready and hands the ready list back
//! to the caller as `(FiberId, ResumeValue)` pairs; per the design's note that
//! reactor callbacks "only mutate the run queue and watcher-local state", the
//! scheduler (not the reactor) is the one that actually pushes these onto the
//! run queue — this keeps the reactor free of any dependency on the run
//! queue's type.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events as MioEvents, Interest, Poll, Token, Waker};

use crate::fiber::{FiberId, ResumeValue};
use crate::watcher::{Events, WatcherId};

/// `run(mode)`'s argument: process whatever is ready and return (non-blocking
/// poll used between run-queue switches to keep I/O progressing under a
/// CPU-bound fiber), or block until at least one watcher fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    NonBlocking,
    OnceBlocking,
}

/// The token reserved for the reactor's internal `mio::Waker`. Every other
/// token is `watcher_id * 2 (+ 1)`, which never collides with this since
/// `usize::MAX` is never a valid doubled id in practice.
const WAKER_TOKEN: Token = Token(usize::MAX);

struct IoEntry {
    fiber: FiberId,
}

/// Registration state for an RW watcher (design §3, §4.F, §9 "RW watcher
/// refcount"): up to two sides, each its own mio token, but a single logical
/// watcher. `remaining` starts at the number of sides actually registered (1
/// or 2) and is decremented as each side's token fires; the fiber is made
/// runnable only once it reaches zero — i.e. once *every* registered side has
/// fired at least once (see `DESIGN.md`: this matches
/// `Backend_rw_io_callback`'s `ref_count--`/`if (!ref_count) make_runnable` in
/// the original backend, and is the only sound choice for `splice(2)`, which
/// needs both the source readable and the destination writable before the
/// syscall can make progress at all).
struct RwEntry {
    fiber: FiberId,
    remaining: u8,
    /// Sides already counted, so a side that keeps reporting ready across
    /// several non-blocking polls (level-triggered readiness) before the
    /// other side fires isn't decremented more than once.
    fired: Events,
}

struct TimerKey {
    deadline: Instant,
    seq: u64,
    id: WatcherId,
}

impl PartialEq for TimerKey {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerKey {}
impl PartialOrd for TimerKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A handle that may be held and signalled from any thread, independent of
/// the (single-threaded) [`Reactor`] it was derived from. This is the
/// mechanism behind both [`crate::scheduler::Backend::wake_handle`] (cross-
/// thread `wakeup()`, design §4.C) and ad hoc async watchers registered via
/// [`Reactor::register_async`] (used by [`crate::process::wait_event`]).
#[derive(Clone)]
pub struct ReactorHandle {
    pending_signals: Arc<Mutex<VecDeque<WatcherId>>>,
    waker: Arc<Waker>,
}

impl ReactorHandle {
    /// Marks `id` as signalled and wakes a blocked `run()` on the owning
    /// thread, if any. Safe to call from any thread, any number of times.
    pub fn signal(&self, id: WatcherId) {
        self.pending_signals
            .lock()
            .expect("reactor signal queue poisoned")
            .push_back(id);
        // best-effort: if nothing is blocked in run(), this wake is simply
        // observed (harmlessly) the next time run() is called.
        let _ = self.waker.wake();
    }
}

/// The event loop itself (design §4.A "Reactor").
pub struct Reactor {
    poll: Poll,
    events: MioEvents,

    io: HashMap<Token, IoEntry>,
    rw: HashMap<WatcherId, RwEntry>,
    rw_tokens: HashMap<Token, (WatcherId, Events)>,

    timers: BinaryHeap<Reverse<TimerKey>>,
    timer_fibers: HashMap<WatcherId, (FiberId, ResumeValue)>,

    children: HashMap<libc::pid_t, (WatcherId, FiberId)>,
    child_results: Arc<Mutex<VecDeque<(libc::pid_t, i32)>>>,

    async_watchers: HashMap<WatcherId, Option<FiberId>>,
    pending_signals: Arc<Mutex<VecDeque<WatcherId>>>,

    waker: Arc<Waker>,
    break_id: WatcherId,

    next_id: u64,
    next_seq: u64,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let mut reactor = Self {
            poll,
            events: MioEvents::with_capacity(256),
            io: HashMap::new(),
            rw: HashMap::new(),
            rw_tokens: HashMap::new(),
            timers: BinaryHeap::new(),
            timer_fibers: HashMap::new(),
            children: HashMap::new(),
            child_results: Arc::new(Mutex::new(VecDeque::new())),
            async_watchers: HashMap::new(),
            pending_signals: Arc::new(Mutex::new(VecDeque::new())),
            waker,
            break_id: WatcherId(0),
            next_id: 1,
            next_seq: 0,
        };
        // The break watcher: always registered, unreferenced (its presence
        // alone never keeps `run(OnceBlocking)` from returning), and never
        // associated with a fiber — see module docs.
        reactor.break_id = reactor.register_async(None);
        Ok(reactor)
    }

    fn alloc_id(&mut self) -> WatcherId {
        let id = WatcherId(self.next_id);
        self.next_id += 1;
        id
    }

    fn token_of(id: WatcherId) -> Token {
        Token((id.0 as usize) * 2)
    }
    fn write_token_of(id: WatcherId) -> Token {
        Token((id.0 as usize) * 2 + 1)
    }

    fn interest_of(events: Events) -> Interest {
        match (
            events.contains(Events::READ),
            events.contains(Events::WRITE),
        ) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE | Interest::WRITABLE,
        }
    }

    /// Registers an fd for the given readiness events. Registering the same
    /// fd twice before unregistering it is undefined, per design §4.A.
    pub fn register_io(&mut self, fd: RawFd, events: Events, fiber: FiberId) -> WatcherId {
        let id = self.alloc_id();
        let token = Self::token_of(id);
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), token, Self::interest_of(events))
            .expect("mio registration failed");
        self.io.insert(token, IoEntry { fiber });
        id
    }

    pub fn unregister_io(&mut self, id: WatcherId, fd: RawFd) {
        let token = Self::token_of(id);
        if self.io.remove(&token).is_some() {
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    /// Registers up to two fds that together make up one logical RW watcher
    /// (design §3 "RW-IO", used by [`crate::splice`]). The fiber is woken
    /// only once *every* registered side has fired at least once (see
    /// [`RwEntry`]).
    pub fn register_rw_io(
        &mut self,
        read_fd: Option<RawFd>,
        write_fd: Option<RawFd>,
        fiber: FiberId,
    ) -> WatcherId {
        let id = self.alloc_id();
        let mut remaining = 0u8;
        if let Some(fd) = read_fd {
            let token = Self::token_of(id);
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::READABLE)
                .expect("mio registration failed");
            self.rw_tokens.insert(token, (id, Events::READ));
            remaining += 1;
        }
        if let Some(fd) = write_fd {
            let token = Self::write_token_of(id);
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, Interest::WRITABLE)
                .expect("mio registration failed");
            self.rw_tokens.insert(token, (id, Events::WRITE));
            remaining += 1;
        }
        self.rw.insert(
            id,
            RwEntry {
                fiber,
                remaining,
                fired: Events::empty(),
            },
        );
        id
    }

    pub fn unregister_rw_io(&mut self, id: WatcherId, read_fd: Option<RawFd>, write_fd: Option<RawFd>) {
        if let Some(fd) = read_fd {
            self.rw_tokens.remove(&Self::token_of(id));
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        if let Some(fd) = write_fd {
            self.rw_tokens.remove(&Self::write_token_of(id));
            let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        }
        self.rw.remove(&id);
    }

    /// Arms a one-shot timer. `resume` is delivered to `fiber` when it fires:
    /// `ResumeValue::Unit` for a plain sleep, `ResumeValue::TimedOut(token)`
    /// for a `timeout` frame's deadline.
    pub fn register_timer(&mut self, after: Duration, fiber: FiberId, resume: ResumeValue) -> WatcherId {
        let id = self.alloc_id();
        let deadline = Instant::now() + after;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.timers.push(Reverse(TimerKey { deadline, seq, id }));
        self.timer_fibers.insert(id, (fiber, resume));
        id
    }

    pub fn unregister_timer(&mut self, id: WatcherId) {
        // Lazy deletion: the heap entry is left in place and skipped over
        // when it eventually surfaces in `fire_expired_timers`.
        self.timer_fibers.remove(&id);
    }

    /// Registers a child-watcher fallback (design §4.A, "fallback only" — the
    /// pidfd path in [`crate::process::waitpid`] bypasses this entirely by
    /// waiting on a pidfd through [`Self::register_io`]). Spawns a dedicated
    /// waiter thread that blocks in `waitpid(2)`; this is why the design
    /// notes this path only works reliably called from the main thread in
    /// the original libev model — ours is thread-agnostic since each
    /// registration gets its own waiter thread, but see `DESIGN.md`.
    pub fn register_child(&mut self, pid: libc::pid_t, fiber: FiberId) -> WatcherId {
        let id = self.alloc_id();
        self.children.insert(pid, (id, fiber));

        let results = self.child_results.clone();
        let waker = self.waker.clone();
        std::thread::Builder::new()
            .name(format!("waitpid-{pid}"))
            .spawn(move || {
                let mut status: libc::c_int = 0;
                // SAFETY: pid is a valid child pid owned by the caller; we
                // block until it exits, matching the design's "child-watcher
                // path" semantics exactly.
                let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
                if ret == pid {
                    let exit_status = unsafe { libc::WEXITSTATUS(status) };
                    results
                        .lock()
                        .expect("child result queue poisoned")
                        .push_back((pid, exit_status));
                    let _ = waker.wake();
                }
            })
            .expect("failed to spawn waitpid thread");

        id
    }

    pub fn unregister_child(&mut self, pid: libc::pid_t) {
        self.children.remove(&pid);
    }

    /// Registers a watcher with no readiness source of its own. `fiber` is
    /// `None` only for the backend's own break watcher; every other caller
    /// supplies the fiber to wake when [`ReactorHandle::signal`] fires it.
    pub fn register_async(&mut self, fiber: Option<FiberId>) -> WatcherId {
        let id = self.alloc_id();
        self.async_watchers.insert(id, fiber);
        id
    }

    pub fn unregister_async(&mut self, id: WatcherId) {
        self.async_watchers.remove(&id);
    }

    pub fn break_watcher(&self) -> WatcherId {
        self.break_id
    }

    /// A cheap, `Send + Sync` handle for signalling async watchers (including
    /// the break watcher) from any thread.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            pending_signals: self.pending_signals.clone(),
            waker: self.waker.clone(),
        }
    }

    fn fire_expired_timers(&mut self, ready: &mut Vec<(FiberId, ResumeValue)>) {
        let now = Instant::now();
        while let Some(Reverse(top)) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let Reverse(top) = self.timers.pop().expect("just peeked");
            if let Some((fiber, resume)) = self.timer_fibers.remove(&top.id) {
                ready.push((fiber, resume));
            }
        }
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers
            .iter()
            .find(|Reverse(key)| self.timer_fibers.contains_key(&key.id))
            .map(|Reverse(key)| key.deadline)
    }

    fn drain_child_results(&mut self, ready: &mut Vec<(FiberId, ResumeValue)>) {
        let mut results = self.child_results.lock().expect("child result queue poisoned");
        while let Some((pid, status)) = results.pop_front() {
            if let Some((_, fiber)) = self.children.remove(&pid) {
                ready.push((fiber, ResumeValue::Child(pid, status)));
            }
        }
    }

    fn drain_signals(&mut self, ready: &mut Vec<(FiberId, ResumeValue)>) {
        let signalled: Vec<WatcherId> = {
            let mut pending = self.pending_signals.lock().expect("reactor signal queue poisoned");
            pending.drain(..).collect()
        };
        for id in signalled {
            if id == self.break_id {
                continue; // the break watcher exists only to interrupt poll
            }
            if let Some(Some(fiber)) = self.async_watchers.get(&id) {
                ready.push((*fiber, ResumeValue::Unit));
            }
        }
    }

    /// Processes whatever is ready and returns the fibers that should be
    /// scheduled. `run(OnceBlocking)` blocks until the earliest timer
    /// deadline or until some watcher fires (including the break watcher);
    /// `run(NonBlocking)` never blocks.
    pub fn run(&mut self, mode: PollMode) -> Vec<(FiberId, ResumeValue)> {
        let timeout = match mode {
            PollMode::NonBlocking => Some(Duration::ZERO),
            PollMode::OnceBlocking => self
                .next_timer_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now())),
        };

        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            // EINTR is retried at the syscall layer elsewhere; here a
            // poll-level interrupt is harmless to treat as "nothing ready".
            if err.kind() != io::ErrorKind::Interrupted {
                log::warn!("reactor poll failed: {err}");
            }
        }

        let mut ready = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            if let Some(entry) = self.io.get(&token) {
                ready.push((entry.fiber, ResumeValue::Unit));
                continue;
            }
            if let Some(&(id, side)) = self.rw_tokens.get(&token) {
                if let Some(entry) = self.rw.get_mut(&id) {
                    if !entry.fired.contains(side) {
                        entry.fired |= side;
                        entry.remaining = entry.remaining.saturating_sub(1);
                        if entry.remaining == 0 {
                            ready.push((entry.fiber, ResumeValue::Unit));
                        }
                    }
                }
            }
        }

        self.fire_expired_timers(&mut ready);
        self.drain_child_results(&mut ready);
        self.drain_signals(&mut ready);
        ready
    }

    /// Tears down this reactor's loop and builds a fresh one in its place,
    /// for [`crate::scheduler::Backend::post_fork`] (design §4.G): any
    /// watchers inherited from the parent process are meaningless in the
    /// child, so we don't try to migrate them.
    pub fn reset(&mut self) -> io::Result<()> {
        *self = Self::new()?;
        Ok(())
    }
}
