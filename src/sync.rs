/// Cross-task signals shared by the motion loop and the extrusion task
///
/// `SyncFlag` is the only shared mutable playback state. Every read and
/// write happens under its mutex, and the guard is never held across a
/// motor command. `StopSignal` is the run-wide cancellation request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::error::PlotterError;

/// Shortest sleep of any polling loop, so a zero interval still yields
pub const MIN_POLL: Duration = Duration::from_millis(1);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlagSnapshot {
    /// Extrusion may advance
    pub permitted: bool,
    /// Motion loop has finished; no further transitions will happen
    pub closed: bool,
    /// Number of writes so far
    pub generation: u64,
}

/// Outcome of one bounded wait on the flag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Permitted,
    Paused,
    Closed,
}

/// Mutex-guarded "extrusion permitted" flag with condvar wake-up
#[derive(Debug, Clone, Default)]
pub struct SyncFlag {
    inner: Arc<(Mutex<FlagSnapshot>, Condvar)>,
}

impl SyncFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FlagSnapshot> {
        self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the permitted bit and wake any waiter
    pub fn set(&self, permitted: bool) {
        {
            let mut state = self.state();
            state.permitted = permitted;
            state.generation += 1;
        }
        self.inner.1.notify_all();
    }

    pub fn is_permitted(&self) -> bool {
        self.state().permitted
    }

    /// Copy of the whole flag taken under one lock
    pub fn snapshot(&self) -> FlagSnapshot {
        *self.state()
    }

    /// Mark the motion loop finished. A paused waiter returns `Gate::Closed`.
    pub fn close(&self) {
        {
            let mut state = self.state();
            state.closed = true;
            state.generation += 1;
        }
        self.inner.1.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Wait at most `poll` for the flag to become permitted.
    ///
    /// Returns immediately when already permitted or closed. A permitted flag
    /// wins over a closed one so trailing draw-points still extrude.
    pub fn wait_permitted(&self, poll: Duration) -> Gate {
        self.wait_gate(poll).0
    }

    /// `wait_permitted`, also returning the flag the gate was decided on
    pub fn wait_gate(&self, poll: Duration) -> (Gate, FlagSnapshot) {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let guard = if guard.permitted || guard.closed {
            guard
        } else {
            let (guard, _) = cvar
                .wait_timeout(guard, poll.max(MIN_POLL))
                .unwrap_or_else(PoisonError::into_inner);
            guard
        };
        let gate = if guard.permitted {
            Gate::Permitted
        } else if guard.closed {
            Gate::Closed
        } else {
            Gate::Paused
        };
        (gate, *guard)
    }

    /// Wait at most `poll` for any write after `generation`. Returns the flag
    /// as it stands when the wait ends.
    pub fn wait_past(&self, generation: u64, poll: Duration) -> FlagSnapshot {
        let (lock, cvar) = &*self.inner;
        let guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = cvar
            .wait_timeout_while(guard, poll.max(MIN_POLL), |state| state.generation <= generation)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Run-wide stop request, observed at the top of every loop iteration
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// `Err(Stopped)` naming `phase` if a stop was requested
    pub fn check(&self, phase: &str) -> Result<(), PlotterError> {
        if self.is_requested() {
            Err(PlotterError::stopped(phase))
        } else {
            Ok(())
        }
    }
}
