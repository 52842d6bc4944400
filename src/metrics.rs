//! Meters, timers and snapshots.
//!
//! Timers record latencies in nanoseconds into per-stripe HDR histograms so
//! concurrent completions don't contend on one lock; snapshots merge the
//! stripes and report microseconds. Meters carry a monotonic count plus
//! 1/5/15-minute exponentially-weighted rates.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Operation kinds the bundle keys its timers by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Select,
    Mutation,
    Delete,
    Populate,
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Select => "select",
            Self::Mutation => "mutation",
            Self::Delete => "delete",
            Self::Populate => "populate",
        }
    }
}

const TICK_SECS: u64 = 5;
const HIST_MAX_NANOS: u64 = 60_000_000_000;
const STRIPES: usize = 8;

/// One EWMA window. Alpha follows the classic `1 - exp(-tick/window)` form.
#[derive(Debug, Clone, Copy)]
struct Ewma {
    alpha: f64,
    rate: f64,
    initialized: bool,
}

impl Ewma {
    fn window_minutes(minutes: f64) -> Self {
        let alpha = 1.0 - (-(TICK_SECS as f64) / (minutes * 60.0)).exp();
        Self { alpha, rate: 0.0, initialized: false }
    }

    fn tick(&mut self, instant_rate: f64) {
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

#[derive(Debug)]
struct MeterWindows {
    m1: Ewma,
    m5: Ewma,
    m15: Ewma,
    last_tick: Instant,
    // cursor for the instantaneous rate between snapshots
    cursor_count: u64,
    cursor_at: Instant,
}

impl MeterWindows {
    fn fresh() -> Self {
        let now = Instant::now();
        Self {
            m1: Ewma::window_minutes(1.0),
            m5: Ewma::window_minutes(5.0),
            m15: Ewma::window_minutes(15.0),
            last_tick: now,
            cursor_count: 0,
            cursor_at: now,
        }
    }
}

/// Thread-safe event meter: lock-free `mark`, locked bookkeeping only on
/// reads.
#[derive(Debug)]
pub struct Meter {
    count: AtomicU64,
    uncounted: AtomicU64,
    windows: Mutex<MeterWindows>,
}

impl Default for Meter {
    fn default() -> Self {
        Self::new()
    }
}

impl Meter {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            uncounted: AtomicU64::new(0),
            windows: Mutex::new(MeterWindows::fresh()),
        }
    }

    pub fn mark(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.uncounted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    fn tick_if_due(&self) {
        let mut windows = self.windows.lock();
        let intervals = windows.last_tick.elapsed().as_secs() / TICK_SECS;
        if intervals == 0 {
            return;
        }
        let uncounted = self.uncounted.swap(0, Ordering::Relaxed);
        apply_ticks(&mut windows, uncounted, intervals);
    }

    pub fn rates(&self) -> (f64, f64, f64) {
        self.tick_if_due();
        let windows = self.windows.lock();
        (windows.m1.rate, windows.m5.rate, windows.m15.rate)
    }

    /// Events/second since the previous snapshot (or since creation).
    /// Advances the snapshot cursor.
    pub fn current_rate(&self) -> f64 {
        let mut windows = self.windows.lock();
        let now = Instant::now();
        let count = self.count();
        let secs = now.duration_since(windows.cursor_at).as_secs_f64();
        let delta = count.saturating_sub(windows.cursor_count);
        windows.cursor_count = count;
        windows.cursor_at = now;
        if secs == 0.0 { 0.0 } else { delta as f64 / secs }
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Relaxed);
        self.uncounted.store(0, Ordering::Relaxed);
        *self.windows.lock() = MeterWindows::fresh();
    }
}

/// Folds `intervals` missed tick periods into the EWMA windows. Only the
/// first period sees the uncounted events; the rest decay toward zero.
fn apply_ticks(windows: &mut MeterWindows, uncounted: u64, intervals: u64) {
    for i in 0..intervals {
        let events = if i == 0 { uncounted } else { 0 };
        let instant_rate = events as f64 / TICK_SECS as f64;
        windows.m1.tick(instant_rate);
        windows.m5.tick(instant_rate);
        windows.m15.tick(instant_rate);
    }
    windows.last_tick += std::time::Duration::from_secs(intervals * TICK_SECS);
}

/// Latency timer: meter plus striped nanosecond histograms.
pub struct Timer {
    meter: Meter,
    stripes: Vec<Mutex<Histogram<u64>>>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    pub fn new() -> Self {
        let stripes = (0..STRIPES)
            .map(|_| {
                let hist = Histogram::new_with_bounds(1, HIST_MAX_NANOS, 3)
                    .unwrap_or_else(|_| Histogram::new(3).expect("histogram sigfigs"));
                Mutex::new(hist)
            })
            .collect();
        Self { meter: Meter::new(), stripes }
    }

    /// Records one successful sample. `stripe_hint` spreads concurrent
    /// writers; workers pass their index.
    pub fn record_nanos(&self, nanos: u64, stripe_hint: usize) {
        self.meter.mark();
        self.stripes[stripe_hint % self.stripes.len()]
            .lock()
            .saturating_record(nanos.max(1));
    }

    pub fn count(&self) -> u64 {
        self.meter.count()
    }

    pub fn reset(&self) {
        self.meter.reset();
        for stripe in &self.stripes {
            stripe.lock().reset();
        }
    }

    fn merged(&self) -> Histogram<u64> {
        let mut merged = Histogram::new(3).expect("histogram sigfigs");
        for stripe in &self.stripes {
            let guard = stripe.lock();
            let _ = merged.add(&*guard);
        }
        merged
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        let merged = self.merged();
        let (m1, m5, m15) = self.meter.rates();
        let us = |nanos: u64| nanos as f64 / 1_000.0;
        TimerSnapshot {
            count: self.meter.count(),
            rate: self.meter.current_rate(),
            rate_1min: m1,
            rate_5min: m5,
            rate_15min: m15,
            latency: LatencySnapshot {
                mean_us: merged.mean() / 1_000.0,
                median_us: us(merged.value_at_quantile(0.50)),
                p95_us: us(merged.value_at_quantile(0.95)),
                p99_us: us(merged.value_at_quantile(0.99)),
                p999_us: us(merged.value_at_quantile(0.999)),
                max_us: us(merged.max()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencySnapshot {
    pub mean_us: f64,
    pub median_us: f64,
    pub p95_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    pub max_us: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub count: u64,
    /// Ops/second since the previous snapshot.
    pub rate: f64,
    pub rate_1min: f64,
    pub rate_5min: f64,
    pub rate_15min: f64,
    pub latency: LatencySnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ErrorSnapshot {
    pub count: u64,
    pub rate_1min: f64,
    pub rate_5min: f64,
    pub rate_15min: f64,
}

/// Live view of the whole bundle; serialised on the control surface and
/// rendered by the CLI summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub selects: TimerSnapshot,
    pub mutations: TimerSnapshot,
    pub deletions: TimerSnapshot,
    pub populate: TimerSnapshot,
    pub errors: ErrorSnapshot,
}

impl MetricsSnapshot {
    pub fn total_ops(&self) -> u64 {
        self.selects.count
            + self.mutations.count
            + self.deletions.count
            + self.populate.count
            + self.errors.count
    }
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let row = |f: &mut fmt::Formatter<'_>, name: &str, t: &TimerSnapshot| {
            writeln!(
                f,
                "{name:<10} {:>12} ops {:>10.0}/s  p50 {:>9.0}µs  p95 {:>9.0}µs  p99 {:>9.0}µs  p99.9 {:>9.0}µs  max {:>9.0}µs",
                t.count,
                t.rate,
                t.latency.median_us,
                t.latency.p95_us,
                t.latency.p99_us,
                t.latency.p999_us,
                t.latency.max_us,
            )
        };
        row(f, "select", &self.selects)?;
        row(f, "mutation", &self.mutations)?;
        row(f, "delete", &self.deletions)?;
        row(f, "populate", &self.populate)?;
        write!(f, "{:<10} {:>12}", "errors", self.errors.count)
    }
}

/// Four timers plus the error meter, shared by every worker.
#[derive(Default)]
pub struct MetricsBundle {
    pub selects: Timer,
    pub mutations: Timer,
    pub deletions: Timer,
    pub populate: Timer,
    pub errors: Meter,
}

impl MetricsBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timer(&self, kind: OpKind) -> &Timer {
        match kind {
            OpKind::Select => &self.selects,
            OpKind::Mutation => &self.mutations,
            OpKind::Delete => &self.deletions,
            OpKind::Populate => &self.populate,
        }
    }

    /// Sum of every timer count plus errors.
    pub fn total_ops(&self) -> u64 {
        self.selects.count()
            + self.mutations.count()
            + self.deletions.count()
            + self.populate.count()
            + self.errors.count()
    }

    /// Clears all timers and the error meter; runs between the populate and
    /// measured phases.
    pub fn reset(&self) {
        self.selects.reset();
        self.mutations.reset();
        self.deletions.reset();
        self.populate.reset();
        self.errors.reset();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (e1, e5, e15) = self.errors.rates();
        MetricsSnapshot {
            selects: self.selects.snapshot(),
            mutations: self.mutations.snapshot(),
            deletions: self.deletions.snapshot(),
            populate: self.populate.snapshot(),
            errors: ErrorSnapshot {
                count: self.errors.count(),
                rate_1min: e1,
                rate_5min: e5,
                rate_15min: e15,
            },
        }
    }
}
