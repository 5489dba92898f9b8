//! Prometheus metrics for the work queue and worker loop.
//!
//! All series carry a `name` const label with the queue name so several
//! controllers can share one registry.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};

/// Queue and reconcile metrics.
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    depth: IntGauge,
    adds: IntCounter,
    retries: IntCounter,
    exhausted: IntCounter,
    queue_latency: Histogram,
    work_duration: Histogram,
}

fn opts(name: &str, help: &str, queue: &str) -> Opts {
    Opts::new(name, help).const_label("name", queue)
}

fn histogram_opts(name: &str, help: &str, queue: &str) -> HistogramOpts {
    let buckets = prometheus::exponential_buckets(0.001, 4.0, 10);
    HistogramOpts::new(name, help)
        .const_label("name", queue)
        .buckets(buckets.unwrap_or_default())
}

impl QueueMetrics {
    /// Creates unregistered metrics for the queue called `queue`.
    ///
    /// # Errors
    ///
    /// Fails if `queue` is not a valid label value.
    pub fn new(queue: &str) -> Result<Self, prometheus::Error> {
        Ok(Self {
            depth: IntGauge::with_opts(opts(
                "workqueue_depth",
                "Current depth of the work queue",
                queue,
            ))?,
            adds: IntCounter::with_opts(opts(
                "workqueue_adds_total",
                "Keys inserted into the work queue",
                queue,
            ))?,
            retries: IntCounter::with_opts(opts(
                "workqueue_retries_total",
                "Rate-limited re-queues after a failed reconcile",
                queue,
            ))?,
            exhausted: IntCounter::with_opts(opts(
                "workqueue_retries_exhausted_total",
                "Keys dropped after exhausting their retries",
                queue,
            ))?,
            queue_latency: Histogram::with_opts(histogram_opts(
                "workqueue_queue_duration_seconds",
                "Time a key waits in the queue before a worker picks it up",
                queue,
            ))?,
            work_duration: Histogram::with_opts(histogram_opts(
                "workqueue_work_duration_seconds",
                "Time spent reconciling one key",
                queue,
            ))?,
        })
    }

    /// Registers every series with `registry`.
    ///
    /// # Errors
    ///
    /// Fails on duplicate registration.
    pub fn register(&self, registry: &Registry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.depth.clone()))?;
        registry.register(Box::new(self.adds.clone()))?;
        registry.register(Box::new(self.retries.clone()))?;
        registry.register(Box::new(self.exhausted.clone()))?;
        registry.register(Box::new(self.queue_latency.clone()))?;
        registry.register(Box::new(self.work_duration.clone()))?;
        Ok(())
    }

    pub(crate) fn set_depth(&self, depth: usize) {
        self.depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    pub(crate) fn inc_adds(&self) {
        self.adds.inc();
    }

    pub(crate) fn inc_retries(&self) {
        self.retries.inc();
    }

    pub(crate) fn inc_exhausted(&self) {
        self.exhausted.inc();
    }

    pub(crate) fn observe_queue_latency(&self, seconds: f64) {
        self.queue_latency.observe(seconds);
    }

    pub(crate) fn observe_work_duration(&self, seconds: f64) {
        self.work_duration.observe(seconds);
    }

    /// Current depth as last recorded.
    pub fn depth(&self) -> i64 {
        self.depth.get()
    }

    /// Total adds so far.
    pub fn adds(&self) -> u64 {
        self.adds.get()
    }

    /// Total rate-limited re-queues so far.
    pub fn retries(&self) -> u64 {
        self.retries.get()
    }

    /// Total keys dropped after exhausting retries.
    pub fn exhausted(&self) -> u64 {
        self.exhausted.get()
    }
}
