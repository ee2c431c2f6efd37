//! Bounded worker pool for CPU-bound inference and transformation work.
//!
//! The [`ExecutionEngine`] owns a dedicated `rayon` pool so that type detection, casting and row
//! filtering never run on the async request path. Work is split into units (row chunks or
//! columns) that may finish in any order; results always come back in unit order.
//!
//! - Throttling: at most `max_in_flight_chunks` units run at once, on top of the pool size.
//! - Metrics + observer hooks report rows, chunks, throttle waits and peak concurrency.

mod observer;
mod semaphore;

use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

use rayon::ThreadPool;
use rayon::ThreadPoolBuilder;
use rayon::prelude::*;

use crate::types::{DataSet, Value};

pub use observer::{
    ExecutionEvent, ExecutionMetrics, ExecutionMetricsSnapshot, ExecutionObserver, TracingExecutionObserver,
};

use semaphore::Semaphore;

/// Configuration for the [`ExecutionEngine`].
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    /// Number of worker threads. If `None`, uses the platform's available parallelism.
    pub num_threads: Option<usize>,
    /// Number of rows per chunk.
    pub chunk_size: usize,
    /// Upper bound on concurrently executing units.
    pub max_in_flight_chunks: usize,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        let n = available_threads();
        Self {
            num_threads: Some(n),
            chunk_size: 8_192,
            max_in_flight_chunks: n,
        }
    }
}

impl ExecutionOptions {
    /// Default options with an explicit thread count (`None` keeps available parallelism).
    pub fn with_threads(num_threads: Option<usize>) -> Self {
        let n = num_threads.unwrap_or_else(available_threads).max(1);
        Self {
            num_threads: Some(n),
            max_in_flight_chunks: n,
            ..Self::default()
        }
    }
}

fn available_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// A worker pool for in-memory [`DataSet`] jobs.
pub struct ExecutionEngine {
    pool: ThreadPool,
    opts: ExecutionOptions,
    observer: Option<Arc<dyn ExecutionObserver>>,
    metrics: Arc<ExecutionMetrics>,
}

impl ExecutionEngine {
    /// Create a new engine. Zero sizes are clamped to one.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn the pool threads.
    pub fn new(mut opts: ExecutionOptions) -> Self {
        opts.chunk_size = opts.chunk_size.max(1);
        opts.max_in_flight_chunks = opts.max_in_flight_chunks.max(1);
        let n_threads = opts.num_threads.unwrap_or_else(available_threads).max(1);

        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|i| format!("tabular-worker-{i}"))
            .build()
            .expect("failed to build worker thread pool");

        Self {
            pool,
            opts,
            observer: None,
            metrics: Arc::new(ExecutionMetrics::new()),
        }
    }

    /// Attach an observer for execution events.
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Handle to live execution metrics.
    pub fn metrics(&self) -> Arc<ExecutionMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.opts
    }

    /// Run `f` over each row chunk of `dataset` in parallel and return the per-chunk results in
    /// chunk order. `f` receives the chunk's absolute row range and its rows.
    pub fn fold_chunks<A, F>(&self, job: &'static str, dataset: &DataSet, f: F) -> Vec<A>
    where
        A: Send,
        F: Fn(Range<usize>, &[Vec<Value>]) -> A + Send + Sync,
    {
        let units = chunk_ranges(dataset.row_count(), self.opts.chunk_size)
            .into_iter()
            .map(|range| {
                let rows = range.len();
                (range, rows)
            })
            .collect();
        self.run_units(job, units, |range| f(range.clone(), &dataset.rows[range]))
    }

    /// Run `f` once per column index in parallel; results come back in column order.
    pub fn map_columns<T, F>(&self, job: &'static str, dataset: &DataSet, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Send + Sync,
    {
        let rows = dataset.row_count();
        let units = (0..dataset.column_count()).map(|idx| (idx, rows)).collect();
        self.run_units(job, units, f)
    }

    /// Each unit carries the number of rows it covers, for metrics.
    fn run_units<U, T, F>(&self, job: &'static str, units: Vec<(U, usize)>, f: F) -> Vec<T>
    where
        U: Send,
        T: Send,
        F: Fn(U) -> T + Send + Sync,
    {
        let start = Instant::now();
        self.metrics.begin_run(job);
        self.emit(ExecutionEvent::RunStarted {
            job,
            units: units.len(),
        });

        let sem = Semaphore::new(self.opts.max_in_flight_chunks);
        let out: Vec<T> = self.pool.install(|| {
            units
                .into_par_iter()
                .enumerate()
                .map(|(index, (unit, rows))| {
                    let permit = sem.acquire();
                    if !permit.waited.is_zero() {
                        self.metrics.throttled(permit.waited);
                        self.emit(ExecutionEvent::ThrottleWaited {
                            duration: permit.waited,
                        });
                    }
                    self.metrics.unit_started();
                    self.emit(ExecutionEvent::ChunkStarted { index, rows });
                    let result = f(unit);
                    self.emit(ExecutionEvent::ChunkFinished { index });
                    self.metrics.unit_finished(rows);
                    drop(permit);
                    result
                })
                .collect()
        });

        let elapsed = start.elapsed();
        self.metrics.finish_run(elapsed);
        self.emit(ExecutionEvent::RunFinished {
            job,
            elapsed,
            metrics: self.metrics.snapshot(),
        });
        out
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(obs) = &self.observer {
            obs.on_event(&event);
        }
    }
}

impl Default for ExecutionEngine {
    fn default() -> Self {
        Self::new(ExecutionOptions::default())
    }
}

fn chunk_ranges(row_count: usize, chunk_size: usize) -> Vec<Range<usize>> {
    (0..row_count)
        .step_by(chunk_size)
        .map(|start| start..(start + chunk_size).min(row_count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{ExecutionEngine, ExecutionOptions, chunk_ranges};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::execution::{ExecutionEvent, ExecutionObserver};
    use crate::types::{DataSet, DataType, Field, Schema, Value};

    fn dataset_of_n(n: usize) -> DataSet {
        let schema = Schema::new(vec![Field::new("id", DataType::Int64)]);
        let rows = (0..n as i64).map(|i| vec![Value::Int64(i)]).collect();
        DataSet::new(schema, rows)
    }

    #[test]
    fn chunk_ranges_cover_all_rows() {
        assert!(chunk_ranges(0, 4).is_empty());
        assert_eq!(chunk_ranges(10, 4), vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn fold_chunks_preserves_chunk_order() {
        let ds = dataset_of_n(1_000);
        let engine = ExecutionEngine::new(ExecutionOptions {
            num_threads: Some(4),
            chunk_size: 7,
            max_in_flight_chunks: 4,
        });

        let starts = engine.fold_chunks("test", &ds, |range, rows| {
            // Later chunks finish first.
            std::thread::sleep(Duration::from_micros((1_000 - range.start as u64) / 10));
            (range.start, rows.len())
        });

        let mut expected_start = 0;
        for (start, len) in starts {
            assert_eq!(start, expected_start);
            expected_start += len;
        }
        assert_eq!(expected_start, 1_000);
    }

    struct ConcurrencyObserver {
        active: AtomicUsize,
        max_active: AtomicUsize,
    }

    impl ExecutionObserver for ConcurrencyObserver {
        fn on_event(&self, event: &ExecutionEvent) {
            match event {
                ExecutionEvent::ChunkStarted { .. } => {
                    let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                    self.max_active.fetch_max(now, Ordering::SeqCst);
                }
                ExecutionEvent::ChunkFinished { .. } => {
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    #[test]
    fn max_in_flight_chunks_throttles_concurrency() {
        let ds = dataset_of_n(100);
        let observer = Arc::new(ConcurrencyObserver {
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });
        let engine = ExecutionEngine::new(ExecutionOptions {
            num_threads: Some(4),
            chunk_size: 1,
            max_in_flight_chunks: 1,
        })
        .with_observer(observer.clone());

        let out = engine.fold_chunks("throttle", &ds, |_range, rows| {
            std::thread::sleep(Duration::from_millis(1));
            rows.len()
        });

        assert_eq!(out.iter().sum::<usize>(), 100);
        assert_eq!(observer.max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn metrics_are_available_after_run() {
        let ds = dataset_of_n(60);
        let engine = ExecutionEngine::new(ExecutionOptions {
            num_threads: Some(4),
            chunk_size: 1,
            max_in_flight_chunks: 1,
        });
        let metrics = engine.metrics();

        engine.fold_chunks("metrics", &ds, |_range, _rows| {
            std::thread::sleep(Duration::from_millis(2));
        });

        let snap = metrics.snapshot();
        assert_eq!(snap.job, "metrics");
        assert_eq!(snap.runs, 1);
        assert_eq!(snap.rows, 60);
        assert_eq!((snap.units_started, snap.units_finished), (60, 60));
        assert_eq!(snap.peak_in_flight, 1);
        assert!(snap.throttled > Duration::ZERO);
        assert!(snap.elapsed.is_some());
    }

    #[test]
    fn map_columns_returns_column_order() {
        let schema = Schema::new(vec![
            Field::new("a", DataType::Int64),
            Field::new("b", DataType::Int64),
            Field::new("c", DataType::Int64),
        ]);
        let ds = DataSet::new(schema, vec![]);
        let engine = ExecutionEngine::new(ExecutionOptions::with_threads(Some(2)));
        let names = engine.map_columns("names", &ds, |idx| ds.schema.fields[idx].name.clone());
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
