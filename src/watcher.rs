//! Watcher kinds registered with the [reactor](crate::reactor).
//!
//! Each watcher is owned by the fiber whose operation created it: it is
//! stack-allocated in spirit (in practice held in the reactor's internal
//! tables, but its lifetime is still exactly the operation that owns it —
//! every op unregisters on every exit path). The design's tagged-union
//! sketch (§3 Data model, design notes "Variant-based watcher modelling")
//! is realized here as one `HashMap` per watcher kind inside
//! [`crate::reactor::Reactor`] rather than as a single `enum` — a better fit
//! for `mio`'s per-kind registration APIs, since the reactor never needs to
//! dispatch on "which kind is this token" without already knowing the answer
//! from which map it found the token in.

bitflags::bitflags! {
    /// Requested readiness, mirroring `EV_READ`/`EV_WRITE` in the design.
    pub struct Events: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// A registration token handed back by the reactor; used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatcherId(pub(crate) u64);
