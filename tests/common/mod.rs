// tests/common/mod.rs
//! Shared test doubles: a scripted clock, a scripted metrics backend,
//! a notifier that captures its argument vectors, and a threshold
//! expression.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use vigil::backend::{LookupOutcome, LookupRequest, MetricsBackend};
use vigil::clock::{Clock, USEC_PER_SEC};
use vigil::expr::{EvalResult, ExprEnv, Expression};
use vigil::notify::Notifier;
use vigil::Result;

/// A clock the test advances by hand. Wall and monotonic time move
/// independently so suspension can be simulated.
pub struct ManualClock {
    realtime: AtomicU64,
    monotonic: AtomicU64,
}

impl ManualClock {
    pub fn new(start_sec: i64) -> Self {
        Self {
            realtime: AtomicU64::new(start_sec as u64 * USEC_PER_SEC),
            monotonic: AtomicU64::new(1),
        }
    }

    /// Advance both clocks in lockstep (normal passage of time).
    pub fn tick(&self, secs: u64) {
        self.advance(secs, secs);
    }

    /// Advance wall and monotonic time by different amounts.
    pub fn advance(&self, wall_secs: u64, mono_secs: u64) {
        self.realtime
            .fetch_add(wall_secs * USEC_PER_SEC, Ordering::SeqCst);
        self.monotonic
            .fetch_add(mono_secs * USEC_PER_SEC, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn realtime_usec(&self) -> u64 {
        self.realtime.load(Ordering::SeqCst)
    }

    fn monotonic_usec(&self) -> u64 {
        self.monotonic.load(Ordering::SeqCst)
    }
}

/// A metrics backend fed with per-chart value queues. When a queue
/// runs dry the last value keeps being served.
#[derive(Default)]
pub struct ScriptedBackend {
    feeds: Mutex<HashMap<String, VecDeque<f64>>>,
    last: Mutex<HashMap<String, f64>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&self, chart: &str, values: &[f64]) {
        self.feeds
            .lock()
            .entry(chart.to_string())
            .or_default()
            .extend(values.iter().copied());
    }
}

impl MetricsBackend for ScriptedBackend {
    fn lookup(&self, request: &LookupRequest<'_>) -> Result<LookupOutcome> {
        let mut feeds = self.feeds.lock();
        let mut last = self.last.lock();
        match feeds.get_mut(request.chart).and_then(|q| q.pop_front()) {
            Some(value) => {
                last.insert(request.chart.to_string(), value);
                Ok(LookupOutcome::Value(value))
            }
            None => match last.get(request.chart) {
                Some(value) => Ok(LookupOutcome::Value(*value)),
                None => Ok(LookupOutcome::Empty),
            },
        }
    }
}

/// Captures every argument vector instead of spawning a process.
pub struct CaptureNotifier {
    calls: Mutex<Vec<Vec<String>>>,
    exit_code: AtomicI32,
}

impl Default for CaptureNotifier {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            exit_code: AtomicI32::new(0),
        }
    }
}

impl CaptureNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn set_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Notifier for CaptureNotifier {
    async fn notify(&self, argv: &[String]) -> Result<i32> {
        self.calls.lock().push(argv.to_vec());
        Ok(self.exit_code.load(Ordering::SeqCst))
    }
}

/// `value > threshold`, the canonical warning condition. NaN input
/// propagates so the status composes to undefined.
pub struct ValueAbove {
    threshold: f64,
    source: String,
}

impl ValueAbove {
    pub fn new(threshold: f64) -> Arc<Self> {
        Arc::new(Self {
            threshold,
            source: format!("$this > {threshold}"),
        })
    }
}

impl Expression for ValueAbove {
    fn evaluate(&self, env: &ExprEnv) -> EvalResult {
        if env.value.is_nan() {
            return Ok(f64::NAN);
        }
        Ok(if env.value > self.threshold { 1.0 } else { 0.0 })
    }

    fn source(&self) -> &str {
        &self.source
    }

    fn parsed_as(&self) -> &str {
        &self.source
    }
}
