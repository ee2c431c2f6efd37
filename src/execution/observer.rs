use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, trace};

/// What the [`super::ExecutionEngine`] reports while it works through a job.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    RunStarted { job: &'static str, units: usize },
    ThrottleWaited { duration: Duration },
    /// `index` is the chunk's position in the job; results are reassembled in this order.
    ChunkStarted { index: usize, rows: usize },
    ChunkFinished { index: usize },
    RunFinished {
        job: &'static str,
        elapsed: Duration,
        metrics: ExecutionMetricsSnapshot,
    },
}

pub trait ExecutionObserver: Send + Sync {
    fn on_event(&self, event: &ExecutionEvent);
}

/// Forwards execution events to `tracing`: run boundaries at debug, chunk chatter at trace.
#[derive(Debug, Default)]
pub struct TracingExecutionObserver;

impl ExecutionObserver for TracingExecutionObserver {
    fn on_event(&self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::RunStarted { job, units } => debug!(job, units, "execution started"),
            ExecutionEvent::RunFinished { job, elapsed, metrics } => debug!(
                job,
                elapsed_ms = elapsed.as_millis() as u64,
                %metrics,
                "execution finished"
            ),
            other => trace!(event = ?other, "execution event"),
        }
    }
}

/// Counters for the most recent run of an engine, readable while the run is in flight.
#[derive(Default)]
pub struct ExecutionMetrics {
    runs: AtomicU64,
    job: Mutex<&'static str>,
    elapsed_us: AtomicU64,
    rows: AtomicU64,
    units_started: AtomicU64,
    units_finished: AtomicU64,
    throttled_us: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin_run(&self, job: &'static str) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.job.lock() {
            *current = job;
        }
        for counter in [
            &self.elapsed_us,
            &self.rows,
            &self.units_started,
            &self.units_finished,
            &self.throttled_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.in_flight.store(0, Ordering::Relaxed);
        self.peak_in_flight.store(0, Ordering::Relaxed);
    }

    pub(crate) fn finish_run(&self, elapsed: Duration) {
        self.elapsed_us.store(micros(elapsed), Ordering::Relaxed);
    }

    pub(crate) fn unit_started(&self) {
        self.units_started.fetch_add(1, Ordering::Relaxed);
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn unit_finished(&self, rows: usize) {
        self.rows.fetch_add(rows as u64, Ordering::Relaxed);
        self.units_finished.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn throttled(&self, waited: Duration) {
        self.throttled_us.fetch_add(micros(waited).max(1), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExecutionMetricsSnapshot {
        let elapsed_us = self.elapsed_us.load(Ordering::Relaxed);
        ExecutionMetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            job: self.job.lock().map(|job| *job).unwrap_or_default(),
            elapsed: (elapsed_us > 0).then(|| Duration::from_micros(elapsed_us)),
            rows: self.rows.load(Ordering::Relaxed),
            units_started: self.units_started.load(Ordering::Relaxed),
            units_finished: self.units_finished.load(Ordering::Relaxed),
            throttled: Duration::from_micros(self.throttled_us.load(Ordering::Relaxed)),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Point-in-time copy of [`ExecutionMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionMetricsSnapshot {
    /// Runs started over the engine's lifetime.
    pub runs: u64,
    pub job: &'static str,
    /// `None` while the run is still going.
    pub elapsed: Option<Duration>,
    pub rows: u64,
    pub units_started: u64,
    pub units_finished: u64,
    pub throttled: Duration,
    pub peak_in_flight: usize,
}

impl fmt::Display for ExecutionMetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}: {} rows in {}/{} units, peak {} in flight, throttled {}us",
            self.job,
            self.runs,
            self.rows,
            self.units_finished,
            self.units_started,
            self.peak_in_flight,
            self.throttled.as_micros(),
        )
    }
}
