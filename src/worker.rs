use crate::counter::Counter;
use crate::sync::{Completer, StartGate, StopSignal};

/// Polls the counter until it passes `target` or the round is cancelled.
pub struct Reader<'a> {
    counter: &'a dyn Counter,
    target: i64,
}

impl<'a> Reader<'a> {
    pub fn new(counter: &'a dyn Counter, target: i64) -> Self {
        Self { counter, target }
    }

    /// Returns the last value observed.
    pub fn run(self, gate: &StartGate<'_>, stop: &StopSignal, done: Completer) -> i64 {
        gate.wait();

        let mut value = 0;
        while !stop.is_cancelled() {
            value = self.counter.get();
            if value > self.target {
                break;
            }
        }

        let fired = done.complete();
        tracing::trace!(value, fired, "Reader finished");
        value
    }
}

/// Increments the counter until the round is cancelled.
pub struct Writer<'a> {
    counter: &'a dyn Counter,
}

impl<'a> Writer<'a> {
    pub fn new(counter: &'a dyn Counter) -> Self {
        Self { counter }
    }

    /// Returns how many increments this writer performed.
    pub fn run(self, gate: &StartGate<'_>, stop: &StopSignal, done: Completer) -> u64 {
        gate.wait();

        let mut increments = 0u64;
        while !stop.is_cancelled() {
            self.counter.increment();
            increments += 1;
        }

        done.complete();
        tracing::trace!(increments, "Writer finished");
        increments
    }
}
