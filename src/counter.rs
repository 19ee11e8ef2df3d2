use crossbeam::utils::CachePadded;
use parking_lot::{MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::cell::UnsafeCell;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{fence, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::PoisonError;
use thiserror::Error;

/// A 64-bit counter shared between threads.
///
/// Every implementation must tolerate concurrent calls from any number of
/// threads without crashing. How much it promises beyond that depends on the
/// synchronization strategy behind it.
pub trait Counter: Send + Sync {
    /// Set the value back to zero.
    ///
    /// Only called while no other thread is touching the counter.
    fn reset(&self);

    fn get(&self) -> i64;

    /// Add one, wrapping from `i64::MAX` to `i64::MIN` like `fetch_add`.
    fn increment(&self);
}

//
// Variant
//

#[derive(Debug, Error)]
#[error("unknown counter `{0}`")]
pub struct UnknownVariant(String);

/// The synchronization strategies under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    Raw,
    Volatile,
    AtomicLong,
    LongAdder,
    StampedLock,
    OptimisticStampedLock,
    RWLock,
    Synchronized,
    FairReentrantLock,
    NonfairReentrantLock,
}

impl Variant {
    /// Every variant, in the order a sweep runs them.
    pub const ALL: [Variant; 10] = [
        Variant::Raw,
        Variant::Volatile,
        Variant::AtomicLong,
        Variant::LongAdder,
        Variant::StampedLock,
        Variant::OptimisticStampedLock,
        Variant::RWLock,
        Variant::Synchronized,
        Variant::FairReentrantLock,
        Variant::NonfairReentrantLock,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Variant::Raw => "Raw",
            Variant::Volatile => "Volatile",
            Variant::AtomicLong => "AtomicLong",
            Variant::LongAdder => "LongAdder",
            Variant::StampedLock => "StampedLock",
            Variant::OptimisticStampedLock => "OptimisticStampedLock",
            Variant::RWLock => "RWLock",
            Variant::Synchronized => "Synchronized",
            Variant::FairReentrantLock => "FairReentrantLock",
            Variant::NonfairReentrantLock => "NonfairReentrantLock",
        }
    }

    /// Whether concurrent increments are guaranteed not to be lost.
    pub fn is_linearizable(self) -> bool {
        !matches!(self, Variant::Raw | Variant::Volatile)
    }

    /// Build a fresh counter, starting at zero.
    pub fn instantiate(self) -> Box<dyn Counter> {
        match self {
            Variant::Raw => Box::<Raw>::default(),
            Variant::Volatile => Box::<Volatile>::default(),
            Variant::AtomicLong => Box::<AtomicLong>::default(),
            Variant::LongAdder => Box::<LongAdder>::default(),
            Variant::StampedLock => Box::<StampedLock>::default(),
            Variant::OptimisticStampedLock => Box::<OptimisticStampedLock>::default(),
            Variant::RWLock => Box::<RWLock>::default(),
            Variant::Synchronized => Box::<Synchronized>::default(),
            Variant::FairReentrantLock => Box::<FairReentrantLock>::default(),
            Variant::NonfairReentrantLock => Box::<NonfairReentrantLock>::default(),
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Variant {
    type Err = UnknownVariant;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let value = value.trim();
        Variant::ALL
            .into_iter()
            .find(|v| v.name().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownVariant(value.to_owned()))
    }
}

//
// Raw
//

/// No synchronization at all.
///
/// Reads and writes go straight to memory through volatile accesses, so the
/// compiler can neither cache the value in a register nor drop the stores,
/// but concurrent increments race and lose updates. This is the one place in
/// the crate where a data race is accepted: the cell is a single aligned word
/// and its value never feeds an index or a pointer, so the worst outcome is a
/// wrong count.
#[derive(Debug, Default)]
pub struct Raw(UnsafeCell<i64>);

// SAFETY: racing accesses only ever produce a stale or lost count; see the
// type-level docs.
unsafe impl Sync for Raw {}

impl Counter for Raw {
    fn reset(&self) {
        // SAFETY: the pointer comes from a live `UnsafeCell`.
        unsafe { self.0.get().write_volatile(0) }
    }

    fn get(&self) -> i64 {
        // SAFETY: see `reset`.
        unsafe { self.0.get().read_volatile() }
    }

    fn increment(&self) {
        let cell = self.0.get();
        // SAFETY: see `reset`.
        unsafe { cell.write_volatile(cell.read_volatile().wrapping_add(1)) }
    }
}

//
// Volatile
//

/// Every access is fenced, but the increment is a separate load and store, so
/// writers still overwrite each other.
#[derive(Debug, Default)]
pub struct Volatile(AtomicI64);

impl Counter for Volatile {
    fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        let value = self.0.load(Ordering::SeqCst);
        self.0.store(value.wrapping_add(1), Ordering::SeqCst);
    }
}

//
// AtomicLong
//

#[derive(Debug, Default)]
pub struct AtomicLong(AtomicI64);

impl Counter for AtomicLong {
    fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

//
// LongAdder
//

const STRIPES: usize = 64;

static NEXT_STRIPE: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static STRIPE: usize = NEXT_STRIPE.fetch_add(1, Ordering::Relaxed) % STRIPES;
}

/// A striped adder.
///
/// Each thread bumps its own cache-padded cell, so writers on different
/// stripes never contend. `get` sums every stripe and is only eventually
/// consistent with in-flight increments.
#[derive(Debug)]
pub struct LongAdder {
    cells: Box<[CachePadded<AtomicI64>]>,
}

impl LongAdder {
    pub fn new() -> Self {
        Self {
            cells: (0..STRIPES)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
        }
    }
}

impl Default for LongAdder {
    fn default() -> Self {
        Self::new()
    }
}

impl Counter for LongAdder {
    fn reset(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Relaxed);
        }
    }

    fn get(&self) -> i64 {
        self.cells
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .fold(0, i64::wrapping_add)
    }

    fn increment(&self) {
        let stripe = STRIPE.with(|s| *s);
        self.cells[stripe].fetch_add(1, Ordering::Relaxed);
    }
}

//
// VersionedLock
//

/// A read/write lock that also hands out version stamps for optimistic reads.
///
/// The version is odd while a writer holds the lock and is bumped twice per
/// write, so a stamp taken before a read validates only if no write started or
/// finished in between.
#[derive(Debug, Default)]
pub struct VersionedLock {
    version: AtomicU64,
    lock: RwLock<()>,
}

pub struct WriteStamp<'a> {
    lock: &'a VersionedLock,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for WriteStamp<'_> {
    fn drop(&mut self) {
        self.lock.version.fetch_add(1, Ordering::Release);
    }
}

impl VersionedLock {
    /// Take a stamp without blocking.
    ///
    /// Returns `None` if a writer currently holds the lock.
    pub fn try_optimistic_read(&self) -> Option<u64> {
        let stamp = self.version.load(Ordering::Acquire);
        (stamp & 1 == 0).then_some(stamp)
    }

    /// Check that nothing was written since `stamp` was taken.
    pub fn validate(&self, stamp: u64) -> bool {
        fence(Ordering::Acquire);
        self.version.load(Ordering::Relaxed) == stamp
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.lock.read()
    }

    pub fn write(&self) -> WriteStamp<'_> {
        let guard = self.lock.write();
        self.version.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::Release);
        WriteStamp {
            lock: self,
            _guard: guard,
        }
    }
}

//
// StampedLock
//

/// Versioned lock used pessimistically: readers always take the read lock.
///
/// The value lives in an atomic so optimistic readers may look at it while a
/// writer is active; all stores happen under the write lock.
#[derive(Debug, Default)]
pub struct StampedLock {
    lock: VersionedLock,
    value: AtomicI64,
}

impl Counter for StampedLock {
    fn reset(&self) {
        let _stamp = self.lock.write();
        self.value.store(0, Ordering::Relaxed);
    }

    fn get(&self) -> i64 {
        let _guard = self.lock.read();
        self.value.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        let _stamp = self.lock.write();
        let value = self.value.load(Ordering::Relaxed);
        self.value.store(value.wrapping_add(1), Ordering::Relaxed);
    }
}

//
// OptimisticStampedLock
//

/// Reads without blocking and only falls back to the read lock when a write
/// raced with the read.
#[derive(Debug, Default)]
pub struct OptimisticStampedLock(StampedLock);

impl Counter for OptimisticStampedLock {
    fn reset(&self) {
        self.0.reset();
    }

    fn get(&self) -> i64 {
        let inner = &self.0;
        if let Some(stamp) = inner.lock.try_optimistic_read() {
            let value = inner.value.load(Ordering::Relaxed);
            if inner.lock.validate(stamp) {
                return value;
            }
        }
        inner.get()
    }

    fn increment(&self) {
        self.0.increment();
    }
}

//
// RWLock
//

#[derive(Debug, Default)]
pub struct RWLock(std::sync::RwLock<i64>);

impl Counter for RWLock {
    fn reset(&self) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = 0;
    }

    fn get(&self) -> i64 {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn increment(&self) {
        let mut value = self.0.write().unwrap_or_else(PoisonError::into_inner);
        *value = value.wrapping_add(1);
    }
}

//
// Synchronized
//

/// One monitor guarding both reads and writes.
#[derive(Debug, Default)]
pub struct Synchronized(std::sync::Mutex<i64>);

impl Counter for Synchronized {
    fn reset(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = 0;
    }

    fn get(&self) -> i64 {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn increment(&self) {
        let mut value = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *value = value.wrapping_add(1);
    }
}

//
// ReentrantLock
//

/// Mutex that hands the lock directly to the longest waiter on every unlock.
#[derive(Debug, Default)]
pub struct FairReentrantLock(parking_lot::Mutex<i64>);

impl Counter for FairReentrantLock {
    fn reset(&self) {
        *self.0.lock() = 0;
    }

    fn get(&self) -> i64 {
        let guard = self.0.lock();
        let value = *guard;
        MutexGuard::unlock_fair(guard);
        value
    }

    fn increment(&self) {
        let mut guard = self.0.lock();
        *guard = guard.wrapping_add(1);
        MutexGuard::unlock_fair(guard);
    }
}

/// Mutex that lets a running thread barge ahead of parked waiters.
#[derive(Debug, Default)]
pub struct NonfairReentrantLock(parking_lot::Mutex<i64>);

impl Counter for NonfairReentrantLock {
    fn reset(&self) {
        *self.0.lock() = 0;
    }

    fn get(&self) -> i64 {
        *self.0.lock()
    }

    fn increment(&self) {
        let mut value = self.0.lock();
        *value = value.wrapping_add(1);
    }
}

//
// tests
//

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reset_reads_zero() {
        for variant in Variant::ALL {
            let counter = variant.instantiate();
            counter.increment();
            counter.reset();
            assert_eq!(counter.get(), 0, "{variant}");
        }
    }

    #[test]
    fn test_reset_then_increment_reads_one() {
        for variant in Variant::ALL {
            let counter = variant.instantiate();
            counter.reset();
            counter.increment();
            assert_eq!(counter.get(), 1, "{variant}");
        }
    }

    #[test]
    fn test_names_parse_back() {
        for variant in Variant::ALL {
            assert_eq!(variant.name().parse::<Variant>().unwrap(), variant);
        }
        assert_eq!(
            "optimisticstampedlock".parse::<Variant>().unwrap(),
            Variant::OptimisticStampedLock
        );
        assert!("Semaphore".parse::<Variant>().is_err());
    }

    #[test]
    fn test_optimistic_stamp_unavailable_while_writing() {
        let lock = VersionedLock::default();
        let stamp = lock.try_optimistic_read().unwrap();
        {
            let _write = lock.write();
            assert!(lock.try_optimistic_read().is_none());
        }
        assert!(!lock.validate(stamp));
        let stamp = lock.try_optimistic_read().unwrap();
        assert!(lock.validate(stamp));
    }

    #[test]
    fn test_long_adder_sums_across_threads() {
        let adder = LongAdder::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        adder.increment();
                    }
                });
            }
        });
        assert_eq!(adder.get(), 8000);
    }

    #[test]
    fn test_increment_wraps_at_max() {
        let adder = LongAdder::new();
        adder.cells[0].store(i64::MAX, Ordering::Relaxed);
        let stamped = StampedLock::default();
        stamped.value.store(i64::MAX, Ordering::Relaxed);
        let optimistic = OptimisticStampedLock::default();
        optimistic.0.value.store(i64::MAX, Ordering::Relaxed);

        let counters: Vec<Box<dyn Counter>> = vec![
            Box::new(Raw(UnsafeCell::new(i64::MAX))),
            Box::new(Volatile(AtomicI64::new(i64::MAX))),
            Box::new(AtomicLong(AtomicI64::new(i64::MAX))),
            Box::new(adder),
            Box::new(stamped),
            Box::new(optimistic),
            Box::new(RWLock(std::sync::RwLock::new(i64::MAX))),
            Box::new(Synchronized(std::sync::Mutex::new(i64::MAX))),
            Box::new(FairReentrantLock(parking_lot::Mutex::new(i64::MAX))),
            Box::new(NonfairReentrantLock(parking_lot::Mutex::new(i64::MAX))),
        ];
        assert_eq!(counters.len(), Variant::ALL.len());

        for (variant, counter) in Variant::ALL.into_iter().zip(&counters) {
            assert_eq!(counter.get(), i64::MAX, "{variant}");
            counter.increment();
            assert_eq!(counter.get(), i64::MIN, "{variant}");
        }
    }

    proptest! {
        #[test]
        fn test_sequential_increments_are_exact(n in 0usize..2000) {
            for variant in Variant::ALL {
                let counter = variant.instantiate();
                counter.reset();
                for _ in 0..n {
                    counter.increment();
                }
                prop_assert_eq!(counter.get(), n as i64);
            }
        }
    }
}
