//! `sleep`, drift-free `timer_loop`, and `timeout` (design §4.B "Time &
//! lifecycle"), grounded in `Backend_sleep`/`Backend_timer_loop`/
//! `Backend_timeout` from the original backend.

use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::fiber::{Host, ResumeValue, TimeoutToken};
use crate::scheduler::Backend;
use crate::watcher::WatcherId;

/// Suspends the current fiber for `duration`, then resumes it. Equivalent to
/// `Backend_sleep`: arms a one-shot timer and awaits it. Nothing else can
/// wake this particular suspension, so the resume value carries no
/// information worth inspecting.
pub fn sleep<H: Host>(backend: &Backend<H>, duration: Duration) {
    backend.bump_op_count();
    backend.wait_for_timer(duration, ResumeValue::Unit);
}

/// Calls `tick` once per `interval`, forever, correcting for time spent
/// inside `tick` (or inside anything else that ran before the scheduler got
/// back to this fiber) so the cadence does not drift. Mirrors
/// `Backend_timer_loop`'s `do { next_time += interval } while (next_time <=
/// now)`: if a tick or two was missed because something on the run queue ran
/// long, the schedule jumps forward to the next boundary still in the
/// future rather than firing a burst of catch-up calls.
///
/// Returns only once `tick` returns `false`.
pub fn timer_loop<H: Host>(
    backend: &Backend<H>,
    interval: Duration,
    mut tick: impl FnMut() -> bool,
) {
    let mut next_time = Instant::now() + interval;
    loop {
        let wait = next_time.saturating_duration_since(Instant::now());
        backend.bump_op_count();
        backend.wait_for_timer(wait, ResumeValue::Unit);

        if !tick() {
            return;
        }

        let now = Instant::now();
        loop {
            next_time += interval;
            if next_time > now {
                break;
            }
        }
    }
}

struct TimerGuard<'a, H: Host> {
    backend: &'a Backend<H>,
    id: WatcherId,
}

impl<'a, H: Host> Drop for TimerGuard<'a, H> {
    fn drop(&mut self) {
        self.backend.disarm_timer(self.id);
    }
}

/// Runs `body`, racing it against a `duration` deadline. If the deadline
/// fires first, `body`'s own next suspension point (inside whatever I/O op
/// it is blocked on) returns `Err(Error::TimedOut(token))` for *this* call's
/// token, and `timeout` converts that into `Ok(on_timeout())` without
/// running any more of `body`. Any other error — including a `TimedOut` that
/// belongs to an outer, still-pending `timeout` call — propagates unchanged.
///
/// The armed timer is always disarmed before `timeout` returns, whichever
/// way `body` exits: mirrors `Backend_timeout_ensure`'s guaranteed cleanup
/// via `rb_ensure`, expressed here as an RAII guard instead of a manual
/// ensure-block.
pub fn timeout<H: Host, T>(
    backend: &Backend<H>,
    duration: Duration,
    on_timeout: impl FnOnce() -> T,
    body: impl FnOnce() -> Result<T>,
) -> Result<T> {
    let token = TimeoutToken::new();
    let id = backend.arm_timer(duration, ResumeValue::TimedOut(token.clone()));
    let _guard = TimerGuard { backend, id };

    match body() {
        Ok(value) => Ok(value),
        Err(Error::TimedOut(fired)) if fired == token => Ok(on_timeout()),
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::thread::ThreadHost;
    use std::sync::mpsc;
    use std::sync::Arc;

    fn spawn_on_backend(
        backend: Arc<Backend<ThreadHost>>,
        body: impl FnOnce(&Backend<ThreadHost>) + Send + 'static,
    ) -> std::thread::JoinHandle<()> {
        let host = backend.host().clone();
        let (fiber, join) = host.spawn(move |_| body(&backend));
        host.make_runnable(fiber);
        join
    }

    #[test]
    fn sleep_suspends_and_resumes() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (tx, rx) = mpsc::channel();

        let join = spawn_on_backend(backend.clone(), move |backend| {
            let start = Instant::now();
            sleep(backend, Duration::from_millis(20));
            tx.send(start.elapsed()).unwrap();
        });
        join.join().unwrap();
        let elapsed = rx.recv().unwrap();
        assert!(elapsed >= Duration::from_millis(15));
    }

    #[test]
    fn timeout_returns_move_on_value_when_body_blocks_past_deadline() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (tx, rx) = mpsc::channel();

        let join = spawn_on_backend(backend.clone(), move |backend| {
            let result: Result<&'static str> = timeout(
                backend,
                Duration::from_millis(10),
                || "timed-out",
                || {
                    // never signalled; only the timeout's own timer can wake
                    // this suspension.
                    backend
                        .wait_for_timer(Duration::from_secs(30), ResumeValue::Unit)
                        .into_result()?;
                    Ok("finished")
                },
            );
            tx.send(result).unwrap();
        });
        join.join().unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), "timed-out");
    }

    #[test]
    fn timer_loop_ticks_at_the_requested_cadence_without_drifting() {
        // Spec scenario 2, scaled down for test speed: a `timer_loop(0.01)`
        // ticking 100 times should take ~1.00-1.10s wall-clock. Here we tick
        // 20 times at 5ms and check the same shape of bound holds, plus that
        // a deliberately slow tick doesn't cause a burst of catch-up calls
        // afterwards (missed ticks coalesce to the next boundary instead).
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (tx, rx) = mpsc::channel();

        let interval = Duration::from_millis(5);
        let join = spawn_on_backend(backend.clone(), move |backend| {
            let start = Instant::now();
            let mut count = 0u32;
            timer_loop(backend, interval, || {
                count += 1;
                if count == 5 {
                    // Simulate a slow tick that overruns several intervals;
                    // the loop must not fire a burst of catch-up calls for
                    // the intervals it missed.
                    std::thread::sleep(Duration::from_millis(30));
                }
                count < 20
            });
            tx.send((count, start.elapsed())).unwrap();
        });
        join.join().unwrap();

        let (count, elapsed) = rx.recv().unwrap();
        assert_eq!(count, 20);
        let ideal = interval * 20;
        assert!(
            elapsed >= ideal,
            "timer_loop returned before its ideal cadence elapsed: {elapsed:?} < {ideal:?}"
        );
        // Generous upper bound: scheduler jitter plus the one deliberate
        // 30ms overrun, but nowhere near what a catch-up-burst bug would
        // produce (which would instead finish close to `ideal` despite the
        // injected delay, since missed ticks would never be coalesced).
        assert!(
            elapsed <= ideal + Duration::from_millis(200),
            "timer_loop took far longer than expected: {elapsed:?}"
        );
    }

    #[test]
    fn timeout_disarms_its_timer_when_body_finishes_first() {
        let host = ThreadHost::new();
        let backend = Arc::new(Backend::new(host).unwrap());
        let (tx, rx) = mpsc::channel();

        let join = spawn_on_backend(backend.clone(), move |backend| {
            let result = timeout(
                backend,
                Duration::from_secs(30),
                || "timed-out",
                || Ok("finished"),
            );
            // If the armed timer weren't disarmed it would still fire 30s
            // from now, leaking a live registration in the reactor forever.
            tx.send(result).unwrap();
        });
        join.join().unwrap();
        assert_eq!(rx.recv().unwrap().unwrap(), "finished");
    }
}
