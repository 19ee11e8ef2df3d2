//! Coordination primitives for one benchmark round.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

//
// StartGate
//

type Action<'a> = Box<dyn FnOnce() + Send + 'a>;

struct GateState<'a> {
    arrived: usize,
    open: bool,
    action: Option<Action<'a>>,
}

/// Single-use rendezvous for a fixed number of threads.
///
/// The last thread to arrive runs the release action while every other
/// participant is still parked, then opens the gate for all of them.
pub struct StartGate<'a> {
    parties: usize,
    state: Mutex<GateState<'a>>,
    released: Condvar,
}

impl<'a> StartGate<'a> {
    pub fn new(parties: usize) -> Self {
        Self::build(parties, None)
    }

    pub fn with_action(parties: usize, action: impl FnOnce() + Send + 'a) -> Self {
        Self::build(parties, Some(Box::new(action)))
    }

    fn build(parties: usize, action: Option<Action<'a>>) -> Self {
        Self {
            parties,
            state: Mutex::new(GateState {
                arrived: 0,
                open: parties == 0,
                action,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until all parties have arrived.
    ///
    /// Returns `true` for the one caller that opened the gate.
    pub fn wait(&self) -> bool {
        let mut state = self.state.lock();
        if state.open {
            return false;
        }

        state.arrived += 1;
        if state.arrived == self.parties {
            if let Some(action) = state.action.take() {
                action();
            }
            state.open = true;
            self.released.notify_all();
            return true;
        }

        while !state.open {
            self.released.wait(&mut state);
        }
        false
    }

    /// Open the gate without running the release action.
    ///
    /// Used when the round cannot start, so threads already parked in `wait`
    /// are let go instead of waiting for parties that will never arrive.
    pub fn abort(&self) {
        let mut state = self.state.lock();
        state.action = None;
        state.open = true;
        self.released.notify_all();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

//
// StopSignal
//

/// Cooperative cancellation flag, polled once per worker loop iteration.
#[derive(Debug, Default)]
pub struct StopSignal(AtomicBool);

impl StopSignal {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

//
// Completion
//

/// Create a completion tracker that fires on the first `Completer::complete`.
///
/// Hand a clone of the `Completer` to every worker and drop the original;
/// once every clone is gone without firing, `Completion::wait` gives up. A
/// `Completer` dropped while its thread unwinds fires the tracker too, so a
/// panicking worker never leaves the round waiting on a reader that cannot
/// reach the target.
pub fn completion_tracker() -> (Completer, Completion) {
    let (tx, rx) = channel::bounded(1);
    let completer = Completer {
        fired: Arc::new(AtomicBool::new(false)),
        tx,
    };
    (completer, Completion { rx })
}

#[derive(Debug, Clone)]
pub struct Completer {
    fired: Arc<AtomicBool>,
    tx: Sender<Instant>,
}

impl Completer {
    /// Report that this worker is done.
    ///
    /// Returns `true` if this call fired the tracker.
    pub fn complete(self) -> bool {
        self.fire()
    }

    fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Err(error) = self.tx.try_send(Instant::now()) {
            tracing::warn!(?error, "Completion already closed");
        }
        true
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if std::thread::panicking() && self.fire() {
            tracing::warn!("Worker panicked; ending the round early");
        }
    }
}

#[derive(Debug)]
pub struct Completion {
    rx: Receiver<Instant>,
}

impl Completion {
    /// Block until the tracker fires and return the moment it did.
    ///
    /// Returns `None` if every `Completer` was dropped without firing.
    pub fn wait(&self) -> Option<Instant> {
        self.rx.recv().ok()
    }
}

//
// tests
//
