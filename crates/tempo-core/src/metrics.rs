//! Sharded process metrics.
//!
//! Two disjoint key sets per metric kind:
//!
//! - **ST** keys are written only from the reactor thread and go straight
//!   into the global totals (relaxed atomic ops, no lock).
//! - **MT** keys may be written from any thread and land in a lazily
//!   created thread-local shard; [`flush_thread`] periodically folds the
//!   shard into the globals under the single fold mutex. A thread that
//!   terminates folds unconditionally via the shard guard's `Drop`.
//!
//! Counters are summed monotonically. Additive gauges track a per-shard
//! *current* value and a *last-synced* snapshot; each fold applies
//! `current - last_synced` in wrapping arithmetic, so the global equals the
//! sum of every shard's current value once all shards have folded.
//!
//! There are no happens-before guarantees between concurrent MT writers:
//! readers see values as of each shard's last fold. [`get_counter`],
//! [`get_gauge`] and [`global_reset`] take the fold mutex and are meant for
//! tests and periodic reporting, not the hot path.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use crate::key_enum;
use crate::keys::{Key, KeyArray};

pub type CounterValue = u64;
pub type GaugeValue = u64;

key_enum! {
    /// Counter keys written only from the reactor thread.
    pub enum StCounterKey {
        BytesReceived => "net.bytes_received",
        BytesSent => "net.bytes_sent",
        SocketErrorTotal => "net.socket_error.total",
        SocketErrorConnReset => "net.socket_error.econnreset",
        SocketErrorTimedOut => "net.socket_error.etimedout",
        SocketErrorPipe => "net.socket_error.epipe",
        SocketErrorNetDown => "net.socket_error.enetdown",
        SocketErrorOther => "net.socket_error.other",
        AcceptErrorMfile => "net.accept_error.emfile",
        AcceptErrorNfile => "net.accept_error.enfile",
        AcceptErrorNobufs => "net.accept_error.enobufs",
        AcceptErrorOther => "net.accept_error.other",
        TestFooSt => "testc.foo_st",
    }
}

key_enum! {
    /// Counter keys written from arbitrary threads via the shard.
    pub enum MtCounterKey {
        TestFooMt => "testc.foo_mt",
    }
}

key_enum! {
    /// Union of all counter keys, in global slot order.
    pub enum CounterKey {
        BytesReceived => "net.bytes_received",
        BytesSent => "net.bytes_sent",
        SocketErrorTotal => "net.socket_error.total",
        SocketErrorConnReset => "net.socket_error.econnreset",
        SocketErrorTimedOut => "net.socket_error.etimedout",
        SocketErrorPipe => "net.socket_error.epipe",
        SocketErrorNetDown => "net.socket_error.enetdown",
        SocketErrorOther => "net.socket_error.other",
        AcceptErrorMfile => "net.accept_error.emfile",
        AcceptErrorNfile => "net.accept_error.enfile",
        AcceptErrorNobufs => "net.accept_error.enobufs",
        AcceptErrorOther => "net.accept_error.other",
        TestFooSt => "testc.foo_st",
        TestFooMt => "testc.foo_mt",
    }
}

key_enum! {
    /// Additive gauge keys written only from the reactor thread.
    pub enum StGaugeKey {
        ConnActive => "net.conn.active",
        TestFooSt => "testg.foo_st",
    }
}

key_enum! {
    /// Additive gauge keys written from arbitrary threads via the shard.
    pub enum MtGaugeKey {
        TestFooMt => "testg.foo_mt",
    }
}

key_enum! {
    /// Union of all gauge keys, in global slot order.
    pub enum GaugeKey {
        ConnActive => "net.conn.active",
        TestFooSt => "testg.foo_st",
        TestFooMt => "testg.foo_mt",
    }
}

impl From<StCounterKey> for CounterKey {
    fn from(k: StCounterKey) -> CounterKey {
        match k {
            StCounterKey::BytesReceived => CounterKey::BytesReceived,
            StCounterKey::BytesSent => CounterKey::BytesSent,
            StCounterKey::SocketErrorTotal => CounterKey::SocketErrorTotal,
            StCounterKey::SocketErrorConnReset => CounterKey::SocketErrorConnReset,
            StCounterKey::SocketErrorTimedOut => CounterKey::SocketErrorTimedOut,
            StCounterKey::SocketErrorPipe => CounterKey::SocketErrorPipe,
            StCounterKey::SocketErrorNetDown => CounterKey::SocketErrorNetDown,
            StCounterKey::SocketErrorOther => CounterKey::SocketErrorOther,
            StCounterKey::AcceptErrorMfile => CounterKey::AcceptErrorMfile,
            StCounterKey::AcceptErrorNfile => CounterKey::AcceptErrorNfile,
            StCounterKey::AcceptErrorNobufs => CounterKey::AcceptErrorNobufs,
            StCounterKey::AcceptErrorOther => CounterKey::AcceptErrorOther,
            StCounterKey::TestFooSt => CounterKey::TestFooSt,
        }
    }
}

impl From<MtCounterKey> for CounterKey {
    fn from(k: MtCounterKey) -> CounterKey {
        match k {
            MtCounterKey::TestFooMt => CounterKey::TestFooMt,
        }
    }
}

impl From<StGaugeKey> for GaugeKey {
    fn from(k: StGaugeKey) -> GaugeKey {
        match k {
            StGaugeKey::ConnActive => GaugeKey::ConnActive,
            StGaugeKey::TestFooSt => GaugeKey::TestFooSt,
        }
    }
}

impl From<MtGaugeKey> for GaugeKey {
    fn from(k: MtGaugeKey) -> GaugeKey {
        match k {
            MtGaugeKey::TestFooMt => GaugeKey::TestFooMt,
        }
    }
}

// ── Global totals ─────────────────────────────────────────────────

struct Global {
    /// Serializes folds and snapshot reads. The atomic slots make ST
    /// writes safe without it.
    fold: Mutex<()>,
    counters: KeyArray<CounterKey, AtomicU64, { CounterKey::COUNT }>,
    gauges: KeyArray<GaugeKey, AtomicU64, { GaugeKey::COUNT }>,
}

fn global() -> &'static Global {
    static GLOBAL: OnceLock<Global> = OnceLock::new();
    GLOBAL.get_or_init(|| Global {
        fold: Mutex::new(()),
        counters: KeyArray::new(),
        gauges: KeyArray::new(),
    })
}

fn fold_lock(g: &Global) -> MutexGuard<'_, ()> {
    // A panic while holding the fold mutex leaves the totals merely stale,
    // never torn; keep serving.
    match g.fold.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ── Per-thread shard ──────────────────────────────────────────────

struct Shard {
    counters: KeyArray<MtCounterKey, u64, { MtCounterKey::COUNT }>,
    gauge_current: KeyArray<MtGaugeKey, u64, { MtGaugeKey::COUNT }>,
    gauge_synced: KeyArray<MtGaugeKey, u64, { MtGaugeKey::COUNT }>,
    last_fold: Instant,
}

impl Shard {
    fn new() -> Self {
        Self {
            counters: KeyArray::new(),
            gauge_current: KeyArray::new(),
            gauge_synced: KeyArray::new(),
            last_fold: Instant::now(),
        }
    }

    fn fold(&mut self) {
        let g = global();
        {
            let _guard = fold_lock(g);
            for &k in MtCounterKey::ALL {
                let v = *self.counters.get(k);
                if v != 0 {
                    g.counters.get(CounterKey::from(k)).fetch_add(v, Ordering::Relaxed);
                }
            }
            for &k in MtGaugeKey::ALL {
                let delta = self.gauge_current.get(k).wrapping_sub(*self.gauge_synced.get(k));
                if delta != 0 {
                    g.gauges.get(GaugeKey::from(k)).fetch_add(delta, Ordering::Relaxed);
                }
            }
        }
        // Post-sync bookkeeping happens outside the mutex; the shard is
        // thread-local.
        self.counters.reset();
        for &k in MtGaugeKey::ALL {
            *self.gauge_synced.get_mut(k) = *self.gauge_current.get(k);
        }
        self.last_fold = Instant::now();
    }
}

/// Wrapper whose `Drop` gives the terminating thread one final fold.
struct ShardCell(RefCell<Shard>);

impl Drop for ShardCell {
    fn drop(&mut self) {
        self.0.borrow_mut().fold();
    }
}

thread_local! {
    static SHARD: ShardCell = ShardCell(RefCell::new(Shard::new()));
}

// ── Write path ────────────────────────────────────────────────────

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::StCounterKey {}
    impl Sealed for super::MtCounterKey {}
    impl Sealed for super::StGaugeKey {}
    impl Sealed for super::MtGaugeKey {}
}

/// Writable counter keys: ST keys hit the globals, MT keys the shard.
/// Only the two counter key enums implement this.
pub trait CounterKind: Copy + sealed::Sealed {
    #[doc(hidden)]
    fn apply(self, n: CounterValue);
}

impl CounterKind for StCounterKey {
    #[inline]
    fn apply(self, n: CounterValue) {
        global().counters.get(CounterKey::from(self)).fetch_add(n, Ordering::Relaxed);
    }
}

impl CounterKind for MtCounterKey {
    #[inline]
    fn apply(self, n: CounterValue) {
        SHARD.with(|s| *s.0.borrow_mut().counters.get_mut(self) += n);
    }
}

/// Writable gauge keys, split like [`CounterKind`].
pub trait GaugeKind: Copy + sealed::Sealed {
    #[doc(hidden)]
    fn put(self, v: GaugeValue);
}

impl GaugeKind for StGaugeKey {
    #[inline]
    fn put(self, v: GaugeValue) {
        global().gauges.get(GaugeKey::from(self)).store(v, Ordering::Relaxed);
    }
}

impl GaugeKind for MtGaugeKey {
    #[inline]
    fn put(self, v: GaugeValue) {
        SHARD.with(|s| *s.0.borrow_mut().gauge_current.get_mut(self) = v);
    }
}

/// Add `n` to a counter.
#[inline]
pub fn add_counter<K: CounterKind>(key: K, n: CounterValue) {
    key.apply(n);
}

/// Add 1 to a counter.
#[inline]
pub fn inc_counter<K: CounterKind>(key: K) {
    key.apply(1);
}

/// Set the current value of an additive gauge.
#[inline]
pub fn set_gauge<K: GaugeKind>(key: K, v: GaugeValue) {
    key.put(v);
}

// ── Fold path ─────────────────────────────────────────────────────

/// Fold this thread's shard into the global totals, unless fewer than
/// `min_interval` has elapsed since this thread's last fold.
///
/// Cooperative: call from loop bodies with a small interval; pass
/// `Duration::ZERO` to force a fold.
pub fn flush_thread(min_interval: Duration) {
    SHARD.with(|s| {
        let mut shard = s.0.borrow_mut();
        if shard.last_fold.elapsed() < min_interval {
            return;
        }
        shard.fold();
    });
}

// ── Read path (tests and reporting) ───────────────────────────────

/// Read a counter's global total as of the contributing shards' last
/// folds. Takes the fold mutex.
pub fn get_counter(key: impl Into<CounterKey>) -> CounterValue {
    let g = global();
    let _guard = fold_lock(g);
    g.counters.get(key.into()).load(Ordering::Relaxed)
}

/// Read an additive gauge's global value. Takes the fold mutex.
pub fn get_gauge(key: impl Into<GaugeKey>) -> GaugeValue {
    let g = global();
    let _guard = fold_lock(g);
    g.gauges.get(key.into()).load(Ordering::Relaxed)
}

/// Snapshot of every counter `(name, total)`, in slot order.
pub fn counter_totals() -> Vec<(&'static str, CounterValue)> {
    let g = global();
    let _guard = fold_lock(g);
    let mut out = Vec::with_capacity(CounterKey::COUNT);
    g.counters.for_each(|k, v| out.push((k.name(), v.load(Ordering::Relaxed))));
    out
}

/// Snapshot of every gauge `(name, value)`, in slot order.
pub fn gauge_totals() -> Vec<(&'static str, GaugeValue)> {
    let g = global();
    let _guard = fold_lock(g);
    let mut out = Vec::with_capacity(GaugeKey::COUNT);
    g.gauges.for_each(|k, v| out.push((k.name(), v.load(Ordering::Relaxed))));
    out
}

/// Zero the global totals and the calling thread's shard. Test hook;
/// shards of other live threads are untouched.
pub fn global_reset() {
    let g = global();
    {
        let _guard = fold_lock(g);
        for &k in CounterKey::ALL {
            g.counters.get(k).store(0, Ordering::Relaxed);
        }
        for &k in GaugeKey::ALL {
            g.gauges.get(k).store(0, Ordering::Relaxed);
        }
    }
    SHARD.with(|s| {
        let mut shard = s.0.borrow_mut();
        shard.counters.reset();
        shard.gauge_current.reset();
        shard.gauge_synced.reset();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    // The globals are process-wide; serialize the tests that touch them.
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    fn guard() -> MutexGuard<'static, ()> {
        match TEST_GUARD.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    #[test]
    fn counters_single_threaded() {
        let _t = guard();
        global_reset();

        assert_eq!(get_counter(StCounterKey::TestFooSt), 0);
        inc_counter(StCounterKey::TestFooSt);
        assert_eq!(get_counter(StCounterKey::TestFooSt), 1);
        inc_counter(StCounterKey::TestFooSt);
        assert_eq!(get_counter(StCounterKey::TestFooSt), 2);
        add_counter(StCounterKey::TestFooSt, 100);
        assert_eq!(get_counter(StCounterKey::TestFooSt), 102);

        global_reset();
        assert_eq!(get_counter(StCounterKey::TestFooSt), 0);
    }

    #[test]
    fn counters_multi_threaded() {
        let _t = guard();
        global_reset();

        const NTHREADS: usize = 4;
        const NITERS: u64 = 100_000;

        let start = std::sync::Arc::new(Barrier::new(NTHREADS + 1));

        let worker = |start: std::sync::Arc<Barrier>| {
            start.wait();
            for i in 0..NITERS {
                add_counter(MtCounterKey::TestFooMt, 1);
                // Exercise the fold mutex under contention.
                if i % 10 == 0 {
                    flush_thread(Duration::ZERO);
                }
            }
            flush_thread(Duration::ZERO);
        };

        let mut handles = Vec::with_capacity(NTHREADS);
        for _ in 0..NTHREADS {
            let start = start.clone();
            handles.push(std::thread::spawn(move || worker(start)));
        }

        worker(start);

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(
            get_counter(MtCounterKey::TestFooMt),
            (NTHREADS as u64 + 1) * NITERS
        );

        global_reset();
        assert_eq!(get_counter(MtCounterKey::TestFooMt), 0);
    }

    #[test]
    fn counter_folds_on_thread_exit() {
        let _t = guard();
        global_reset();

        // No explicit flush: the shard guard's Drop must fold.
        std::thread::spawn(|| {
            add_counter(MtCounterKey::TestFooMt, 7);
        })
        .join()
        .unwrap();

        assert_eq!(get_counter(MtCounterKey::TestFooMt), 7);
        global_reset();
    }

    #[test]
    fn additive_gauges_single_threaded() {
        let _t = guard();
        global_reset();

        assert_eq!(get_gauge(StGaugeKey::TestFooSt), 0);

        for v in [3u64, 5, 4, 1000, 99, 123, 100, 105, 9999, 5000] {
            set_gauge(StGaugeKey::TestFooSt, v);
            assert_eq!(get_gauge(StGaugeKey::TestFooSt), v);
        }

        global_reset();
        assert_eq!(get_gauge(StGaugeKey::TestFooSt), 0);
    }

    #[test]
    fn additive_gauges_multi_threaded() {
        let _t = guard();
        global_reset();

        const NTHREADS: usize = 4;
        const FINAL_VALUE: u64 = 123;

        let start = std::sync::Arc::new(Barrier::new(NTHREADS + 1));

        // Deterministic pseudo-random values; the extremes are covered
        // explicitly so the wrapping delta arithmetic gets exercised.
        let worker = |start: std::sync::Arc<Barrier>, seed: u64| {
            start.wait();
            let mut x = seed | 1;
            for i in 0..10_000u64 {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                let v = match i {
                    0 => 0,
                    1 => u64::MAX,
                    _ => x,
                };
                set_gauge(MtGaugeKey::TestFooMt, v);
                if i % 10 == 0 {
                    flush_thread(Duration::ZERO);
                }
            }
            set_gauge(MtGaugeKey::TestFooMt, FINAL_VALUE);
            flush_thread(Duration::ZERO);
        };

        let mut handles = Vec::with_capacity(NTHREADS);
        for t in 0..NTHREADS {
            let start = start.clone();
            handles.push(std::thread::spawn(move || worker(start, 0xDEADBEEF + t as u64)));
        }

        worker(start, 0xDEADBEEF + NTHREADS as u64);

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(
            get_gauge(MtGaugeKey::TestFooMt),
            (NTHREADS as u64 + 1) * FINAL_VALUE
        );

        global_reset();
        assert_eq!(get_gauge(MtGaugeKey::TestFooMt), 0);
    }

    #[test]
    fn interval_gates_the_fold() {
        let _t = guard();
        global_reset();

        add_counter(MtCounterKey::TestFooMt, 5);
        // Freshly created shard + long interval: the fold is skipped.
        flush_thread(Duration::from_secs(3600));
        assert_eq!(get_counter(MtCounterKey::TestFooMt), 0);

        flush_thread(Duration::ZERO);
        assert_eq!(get_counter(MtCounterKey::TestFooMt), 5);
        global_reset();
    }

    #[test]
    fn totals_snapshots_carry_stable_names() {
        let _t = guard();
        let counters = counter_totals();
        assert!(counters.iter().any(|(name, _)| *name == "net.bytes_received"));
        assert!(counters.iter().any(|(name, _)| *name == "net.accept_error.emfile"));
        let gauges = gauge_totals();
        assert!(gauges.iter().any(|(name, _)| *name == "net.conn.active"));
    }
}
