use crate::configuration::RunConfiguration;
use crate::counter::{Counter, Variant};
use crate::sync::{completion_tracker, StartGate, StopSignal};
use crate::worker::{Reader, Writer};
use itertools::Itertools;
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::io;
use std::iter;
use std::time::{Duration, Instant};
use thiserror::Error;

/// The trimmed mean drops one sample from each end, so it needs at least one
/// left over.
pub const MIN_SAMPLES: usize = 3;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("need at least {MIN_SAMPLES} samples to trim, got {0}")]
    TooFewSamples(usize),

    #[error("could not start a worker thread for {variant}")]
    Spawn {
        variant: Variant,
        #[source]
        source: io::Error,
    },
}

impl BenchError {
    /// Whether the rest of a sweep is pointless after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BenchError::Spawn { .. })
    }
}

/// Hooks for reporting how a sweep is going. Every method defaults to doing
/// nothing.
pub trait Progress {
    fn variant_started(&mut self, _variant: Variant) {}

    /// `round` counts from 1.
    fn round_finished(&mut self, _variant: Variant, _round: usize, _rounds: usize) {}

    fn variant_finished(&mut self, _report: &VariantReport) {}
}

impl Progress for () {}

//
// Results
//

#[derive(Debug, Clone)]
pub struct VariantReport {
    pub variant: Variant,
    /// Trimmed mean of `rounds`.
    pub average: Duration,
    /// Elapsed time of every completed round, in the order they ran.
    pub rounds: Vec<Duration>,
}

/// One report per variant, in the order the sweep ran them.
#[derive(Debug, Clone, Default)]
pub struct BenchmarkResult {
    pub reports: Vec<VariantReport>,
}

impl BenchmarkResult {
    /// Reports from fastest to slowest. Ties keep sweep order.
    pub fn ranking(&self) -> Vec<&VariantReport> {
        self.reports
            .iter()
            .sorted_by_key(|report| report.average)
            .collect_vec()
    }

    pub fn get(&self, variant: Variant) -> Option<&VariantReport> {
        self.reports.iter().find(|report| report.variant == variant)
    }

    /// Average per variant name, in milliseconds.
    pub fn milliseconds(&self) -> BTreeMap<&'static str, f64> {
        self.reports
            .iter()
            .map(|report| (report.variant.name(), report.average.as_secs_f64() * 1000.0))
            .collect()
    }
}

//
// Orchestration
//

/// Benchmark every variant in `variants` once, skipping repeats.
///
/// A variant that cannot produce a report is logged and left out of the
/// result. Only a failure to start worker threads ends the sweep.
pub fn sweep(
    variants: &[Variant],
    config: &RunConfiguration,
    progress: &mut dyn Progress,
) -> Result<BenchmarkResult, BenchError> {
    let mut reports = Vec::with_capacity(variants.len());
    for variant in variants.iter().copied().unique() {
        match benchmark(variant, config, progress) {
            Ok(report) => reports.push(report),
            Err(error) if error.is_fatal() => return Err(error),
            Err(error) => tracing::error!(%variant, %error, "Variant left out of the ranking"),
        }
    }
    Ok(BenchmarkResult { reports })
}

/// Run `config.rounds()` rounds against a fresh counter of the given variant
/// and reduce them to a trimmed mean.
pub fn benchmark(
    variant: Variant,
    config: &RunConfiguration,
    progress: &mut dyn Progress,
) -> Result<VariantReport, BenchError> {
    let counter = variant.instantiate();
    benchmark_counter(variant, counter.as_ref(), config, progress)
}

/// Rounds in which a worker panicked are logged and yield no sample.
#[tracing::instrument(skip(counter, config, progress), fields(%config))]
fn benchmark_counter(
    variant: Variant,
    counter: &dyn Counter,
    config: &RunConfiguration,
    progress: &mut dyn Progress,
) -> Result<VariantReport, BenchError> {
    progress.variant_started(variant);

    let total = config.rounds();
    let mut rounds = Vec::with_capacity(total);
    for round in 1..=total {
        match run_round(counter, config) {
            Ok(elapsed) => {
                tracing::debug!(round, elapsed_us = elapsed.as_micros() as u64, "Round finished");
                rounds.push(elapsed);
            }
            Err(RoundError::Panicked) => {
                tracing::warn!(round, "Worker panicked, round skipped");
            }
            Err(RoundError::Spawn(source)) => {
                return Err(BenchError::Spawn { variant, source });
            }
        }
        progress.round_finished(variant, round, total);
    }

    let average = trimmed_mean(&rounds)?;
    tracing::info!(average_us = average.as_micros() as u64, "Benchmark finished");

    let report = VariantReport {
        variant,
        average,
        rounds,
    };
    progress.variant_finished(&report);
    Ok(report)
}

#[derive(Debug)]
pub(crate) enum RoundError {
    Spawn(io::Error),
    Panicked,
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Reader,
    Writer,
}

/// One round: reset, release every worker at once, time until the first
/// reader sees the target, then cancel and join everything.
///
/// All workers have exited by the time this returns, whatever the outcome.
pub(crate) fn run_round(
    counter: &dyn Counter,
    config: &RunConfiguration,
) -> Result<Duration, RoundError> {
    counter.reset();

    let started = OnceCell::new();
    let gate = StartGate::with_action(config.total_threads(), || {
        let _ = started.set(Instant::now());
    });
    let stop = StopSignal::default();
    let (completer, completion) = completion_tracker();
    let spawned = Instant::now();

    let roles = iter::repeat(Role::Reader)
        .take(config.readers())
        .chain(iter::repeat(Role::Writer).take(config.writers()));

    let finished = crossbeam::scope(|s| -> io::Result<Instant> {
        start_workers(roles, &gate, &stop, |role| {
            let (gate, stop, done) = (&gate, &stop, completer.clone());
            let handle = match role {
                Role::Reader => {
                    let reader = Reader::new(counter, config.target());
                    s.builder().spawn(move |_| {
                        reader.run(gate, stop, done);
                    })
                }
                Role::Writer => {
                    let writer = Writer::new(counter);
                    s.builder().spawn(move |_| {
                        writer.run(gate, stop, done);
                    })
                }
            };
            handle.map(drop)
        })?;
        drop(completer);

        let finished = completion.wait().unwrap_or_else(|| {
            tracing::warn!("Every worker exited without completing the round");
            Instant::now()
        });

        // workers only look at this between iterations; the scope then joins
        // them all, however long that takes
        stop.cancel();
        Ok(finished)
    });

    match finished {
        Ok(Ok(finished)) => {
            let started = started.get().copied().unwrap_or(spawned);
            Ok(finished.saturating_duration_since(started))
        }
        Ok(Err(error)) => Err(RoundError::Spawn(error)),
        Err(_) => {
            tracing::error!("Worker panicked");
            Err(RoundError::Panicked)
        }
    }
}

/// Spawn one worker per job. If the OS refuses a thread, the ones already
/// parked at `gate` are cancelled and let through so the scope can join them.
fn start_workers<I, F>(
    jobs: I,
    gate: &StartGate<'_>,
    stop: &StopSignal,
    mut spawn: F,
) -> io::Result<()>
where
    I: IntoIterator,
    F: FnMut(I::Item) -> io::Result<()>,
{
    for (started, job) in jobs.into_iter().enumerate() {
        if let Err(error) = spawn(job) {
            tracing::error!(%error, started, "Could not spawn worker");
            stop.cancel();
            gate.abort();
            return Err(error);
        }
    }
    Ok(())
}

/// Mean of `samples` after dropping the single smallest and largest.
pub fn trimmed_mean(samples: &[Duration]) -> Result<Duration, BenchError> {
    if samples.len() < MIN_SAMPLES {
        return Err(BenchError::TooFewSamples(samples.len()));
    }

    let sorted = samples.iter().copied().sorted().collect_vec();
    let kept = &sorted[1..sorted.len() - 1];
    let nanos = kept.iter().map(Duration::as_nanos).sum::<u128>() / kept.len() as u128;
    Ok(Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX)))
}

/// Have `writers` threads each call `increment` `increments` times on a fresh
/// counter, all starting together, and return the final count.
pub fn contend(variant: Variant, writers: usize, increments: u64) -> Result<i64, BenchError> {
    let counter = variant.instantiate();
    let gate = StartGate::new(writers);
    let stop = StopSignal::default();

    let joined = crossbeam::scope(|s| {
        start_workers(0..writers, &gate, &stop, |_| {
            let (counter, gate, stop) = (counter.as_ref(), &gate, &stop);
            s.builder()
                .spawn(move |_| {
                    gate.wait();
                    if stop.is_cancelled() {
                        return;
                    }
                    for _ in 0..increments {
                        counter.increment();
                    }
                })
                .map(drop)
        })
    });
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(source)) => return Err(BenchError::Spawn { variant, source }),
        Err(_) => tracing::error!(%variant, "Writer panicked"),
    }

    Ok(counter.get())
}
