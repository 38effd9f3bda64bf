//! Optional tracing hooks (design §4.G, grounded on `Backend_trace`/
//! `Backend_trace_proc_set` in the original backend). A host can install a
//! callback to observe scheduler-level events — fiber scheduling, reactor
//! poll entry/exit, idle GC ticks — without this crate depending on any
//! particular tracing framework.
//!
//! This is deliberately thin: a `Box<dyn FnMut(TraceEvent)>`, not a `tracing`
//! subscriber. Structured, leveled logging of this crate's own internals
//! (errno translation, reactor registration churn) goes through the `log`
//! facade instead, the way the rest of this crate's ambient stack does;
//! `trace` is for fiber-scheduling events a *host* cares about, which are
//! meaningless outside the context of whatever fiber runtime sits above us.

use crate::fiber::FiberId;

/// A single scheduler-level event, passed to the trace proc installed via
/// [`crate::scheduler::Backend::trace`].
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent {
    /// A fiber was pushed onto the run queue.
    Schedule { fiber: FiberId },
    /// The reactor is about to call `poll`.
    PollEnter { fiber: FiberId },
    /// The reactor's `poll` call returned.
    PollLeave { fiber: FiberId },
    /// An idle-GC tick fired.
    IdleGc,
}

pub(crate) struct TraceSink {
    proc: Option<Box<dyn FnMut(TraceEvent) + Send>>,
}

impl TraceSink {
    pub(crate) fn new() -> Self {
        Self { proc: None }
    }

    pub(crate) fn set_proc(&mut self, proc: Box<dyn FnMut(TraceEvent) + Send>) {
        self.proc = Some(proc);
    }

    pub(crate) fn clear_proc(&mut self) {
        self.proc = None;
    }

    pub(crate) fn emit(&mut self, event: TraceEvent) {
        if let Some(proc) = self.proc.as_mut() {
            proc(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_only_when_a_proc_is_installed() {
        let mut sink = TraceSink::new();
        sink.emit(TraceEvent::IdleGc);

        let count = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count2 = count.clone();
        sink.set_proc(Box::new(move |_event| {
            count2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));
        sink.emit(TraceEvent::IdleGc);
        sink.emit(TraceEvent::PollEnter {
            fiber: FiberId::next(),
        });
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);

        sink.clear_proc();
        sink.emit(TraceEvent::IdleGc);
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
