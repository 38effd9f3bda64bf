//! A reference [`Host`] implementation backed by OS threads.
//!
//! Each fiber gets its own `std::thread`, parked on a per-fiber `Condvar`
//! until it is its turn to run. Because only one fiber's thread is ever
//! unparked at a time, the illusion of single-threaded cooperative
//! multitasking holds exactly as the design requires — no two fibers
//! observe concurrent execution, and there is no preemption: a fiber's
//! thread only ever yields at the points this crate's `await`/`snooze`
//! primitives call [`Host::switch_to`].
//!
//! This is meant for embedding this crate standalone (tests, small tools) or
//! as a model to adapt; a production host will more likely back fibers with
//! a real stackful-coroutine crate and implement [`Host`] directly against
//! it without OS threads at all.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::fiber::{FiberId, Host, ResumeValue};

enum SlotState {
    /// Not yet scheduled to run; the owning thread is parked here.
    Parked,
    /// Scheduled with a resume value; the owning thread should wake, take
    /// the value, and run.
    Scheduled(ResumeValue),
}

struct Slot {
    state: Mutex<SlotState>,
    cv: Condvar,
}

impl Slot {
    fn parked() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState::Parked),
            cv: Condvar::new(),
        })
    }

    /// Schedules this slot's owner to run with `value`, without blocking
    /// the caller.
    fn schedule(&self, value: ResumeValue) {
        let mut state = self.state.lock().expect("fiber slot mutex poisoned");
        *state = SlotState::Scheduled(value);
        self.cv.notify_one();
    }

    /// Blocks the calling thread until this slot is scheduled, then returns
    /// the resume value and leaves the slot parked again.
    fn park_until_scheduled(&self) -> ResumeValue {
        let mut state = self.state.lock().expect("fiber slot mutex poisoned");
        loop {
            if matches!(*state, SlotState::Scheduled(_)) {
                let SlotState::Scheduled(value) =
                    std::mem::replace(&mut *state, SlotState::Parked)
                else {
                    unreachable!()
                };
                return value;
            }
            state = self.cv.wait(state).expect("fiber slot mutex poisoned");
        }
    }
}

thread_local! {
    static CURRENT: Cell<Option<FiberId>> = Cell::new(None);
}

/// Cooperative [`Host`] backed by one parked OS thread per fiber.
#[derive(Clone)]
pub struct ThreadHost {
    slots: Arc<Mutex<HashMap<FiberId, Arc<Slot>>>>,
}

impl ThreadHost {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn slot_of(&self, fiber: FiberId) -> Arc<Slot> {
        self.slots
            .lock()
            .expect("fiber registry poisoned")
            .get(&fiber)
            .expect("unknown fiber id: was it spawned through this ThreadHost?")
            .clone()
    }

    /// Spawns a new fiber running `body`, parked until the scheduler first
    /// switches to it. `body` receives its first resume value (typically
    /// [`ResumeValue::Unit`]) and runs on a dedicated OS thread for the rest
    /// of its life; the thread exits when `body` returns.
    ///
    /// Registering the fiber with this host happens before the thread is
    /// spawned, so a `switch_to` issued immediately after this call always
    /// finds a live slot to schedule into.
    pub fn spawn<F>(&self, body: F) -> (FiberId, JoinHandle<()>)
    where
        F: FnOnce(ResumeValue) + Send + 'static,
    {
        let fiber = FiberId::next();
        let slot = Slot::parked();
        self.slots
            .lock()
            .expect("fiber registry poisoned")
            .insert(fiber, slot.clone());

        let handle = {
            let slot = slot.clone();
            std::thread::Builder::new()
                .name(format!("fiber-{}", fiber.as_raw()))
                .spawn(move || {
                    CURRENT.with(|c| c.set(Some(fiber)));
                    let value = slot.park_until_scheduled();
                    body(value);
                })
                .expect("failed to spawn fiber thread")
        };

        (fiber, handle)
    }
}

impl Default for ThreadHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ThreadHost {
    fn current(&self) -> FiberId {
        CURRENT
            .with(|c| c.get())
            .expect("current() called from a thread that isn't running a fiber body")
    }

    fn switch_to(&self, target: FiberId, value: ResumeValue) -> ResumeValue {
        let me = self.current();
        let target_slot = self.slot_of(target);
        let my_slot = self.slot_of(me);

        target_slot.schedule(value);
        my_slot.park_until_scheduled()
    }

    fn make_runnable(&self, fiber: FiberId) {
        self.slot_of(fiber).schedule(ResumeValue::Unit);
    }
}
