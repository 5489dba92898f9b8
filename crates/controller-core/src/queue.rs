//! Rate-limited work queue of object keys.
//!
//! Semantics follow the classic controller work queue:
//!
//! - A key is queued at most once. Adding a key that is already queued is a
//!   no-op; adding a key that a worker is currently processing marks it
//!   *dirty*, and [`WorkQueue::done`] puts it back exactly once.
//! - [`WorkQueue::get`] hands a key to one worker at a time, so the same key
//!   is never reconciled concurrently.
//! - Failed keys are re-queued through [`WorkQueue::add_rate_limited`] after
//!   an exponential per-key delay. The failure count lives here, next to the
//!   key, and is reset by [`WorkQueue::forget`].
//!
//! All methods take `&self`; the queue is shared as `Arc<WorkQueue>` between
//! event handlers (producers) and workers (consumers).

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::backoff::ExponentialBackoff;
use crate::metrics::QueueMetrics;
use crate::object::ObjectKey;

#[derive(Default)]
struct QueueState {
    /// Keys ready for a worker, in insertion order
    queue: VecDeque<ObjectKey>,
    /// Keys that need processing: everything in `queue` plus keys re-added
    /// while in flight
    dirty: HashSet<ObjectKey>,
    /// Keys currently held by a worker
    processing: HashSet<ObjectKey>,
    /// Insertion time of queued keys, for latency metrics
    queued_at: HashMap<ObjectKey, Instant>,
    /// Ready time of each delayed key (earliest wins)
    waiting: HashMap<ObjectKey, Instant>,
    /// Delayed keys ordered by ready time; entries not matching `waiting` are stale
    delayed: BinaryHeap<Reverse<(Instant, u64, ObjectKey)>>,
    seq: u64,
    /// Consecutive failures per key
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

impl QueueState {
    /// Returns true if the key was appended to `queue`.
    fn insert(&mut self, key: ObjectKey) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queued_at.insert(key.clone(), Instant::now());
        self.queue.push_back(key);
        true
    }

    /// Moves delayed keys whose time has come into the queue.
    fn promote_ready(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse((ready_at, _, _))) = self.delayed.peek() {
            if *ready_at > now {
                break;
            }
            let Some(Reverse((ready_at, _, key))) = self.delayed.pop() else {
                break;
            };
            if self.waiting.get(&key) == Some(&ready_at) {
                self.waiting.remove(&key);
                if self.insert(key) {
                    promoted += 1;
                }
            }
        }
        promoted
    }

    fn next_ready_at(&self) -> Option<Instant> {
        self.delayed
            .peek()
            .map(|Reverse((ready_at, _, _))| *ready_at)
    }
}

/// Deduplicating, rate-limited FIFO of [`ObjectKey`]s.
pub struct WorkQueue {
    name: String,
    backoff: ExponentialBackoff,
    state: Mutex<QueueState>,
    notify: Notify,
    metrics: Option<QueueMetrics>,
}

impl WorkQueue {
    /// Creates an empty queue.
    ///
    /// # Arguments
    ///
    /// * `name` - Used in logs and metric labels
    /// * `backoff` - Delay policy for [`WorkQueue::add_rate_limited`]
    pub fn new(name: &str, backoff: ExponentialBackoff) -> Self {
        Self {
            name: name.to_string(),
            backoff,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            metrics: None,
        }
    }

    /// Attaches metrics; call before sharing the queue.
    #[must_use]
    pub fn with_metrics(mut self, metrics: QueueMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn metrics(&self) -> Option<&QueueMetrics> {
        self.metrics.as_ref()
    }

    fn inserted(&self, added: usize, depth: usize) {
        if added == 0 {
            return;
        }
        if let Some(metrics) = &self.metrics {
            for _ in 0..added {
                metrics.inc_adds();
            }
            metrics.set_depth(depth);
        }
        self.notify.notify_one();
    }

    /// Queues `key` unless it is already queued; marks it dirty if in flight.
    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        let added = usize::from(state.insert(key));
        let depth = state.queue.len();
        drop(state);
        self.inserted(added, depth);
    }

    /// Queues `key` once `delay` has elapsed.
    ///
    /// If the key is already waiting, the earlier ready time is kept.
    pub fn add_after(&self, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        let ready_at = Instant::now() + delay;
        let earlier = state.waiting.get(&key).is_some_and(|at| *at <= ready_at);
        if earlier {
            return;
        }
        state.waiting.insert(key.clone(), ready_at);
        state.seq = state.seq.wrapping_add(1);
        let seq = state.seq;
        state.delayed.push(Reverse((ready_at, seq, key)));
        drop(state);
        // Wake a waiting worker so it re-arms its timer for the new deadline
        self.notify.notify_one();
    }

    /// Queues `key` after its per-key backoff and records one more failure.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let (delay, failures) = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay_for(*failures);
            *failures = failures.saturating_add(1);
            (delay, *failures)
        };
        if let Some(metrics) = &self.metrics {
            metrics.inc_retries();
        }
        debug!(
            queue = %self.name,
            key = %key,
            failures,
            delay_ms = delay.as_millis(),
            "requeueing with backoff"
        );
        self.add_after(key, delay);
    }

    /// Clears the failure count of `key`. Queue membership is unaffected.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Waits for the next key and marks it as processing.
    ///
    /// Returns `None` once the queue is shut down. Every key returned must be
    /// released with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            // Register interest before inspecting the state so a concurrent
            // add or shut_down between the check and the await is not lost.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                let promoted = state.promote_ready(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let queued_at = state.queued_at.remove(&key);
                    let depth = state.queue.len();
                    drop(state);

                    if let Some(metrics) = &self.metrics {
                        for _ in 0..promoted {
                            metrics.inc_adds();
                        }
                        metrics.set_depth(depth);
                        if let Some(queued_at) = queued_at {
                            metrics.observe_queue_latency(queued_at.elapsed().as_secs_f64());
                        }
                    }
                    if depth > 0 {
                        // Pass the baton: promoted keys may be waiting for an idle worker
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.next_ready_at()
            };

            match deadline {
                Some(ready_at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(ready_at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Releases a key obtained from [`WorkQueue::get`].
    ///
    /// If the key was added again while it was processing, it is queued now.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }
        state.queued_at.insert(key.clone(), Instant::now());
        state.queue.push_back(key.clone());
        let depth = state.queue.len();
        drop(state);
        self.inserted(1, depth);
    }

    /// Stops the queue.
    ///
    /// Further adds are ignored, keys not yet handed out are dropped and every
    /// pending or future [`WorkQueue::get`] returns `None`. Workers still
    /// holding a key may call [`WorkQueue::done`].
    pub fn shut_down(&self) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        let dropped = state.queue.len() + state.waiting.len();
        state.queue.clear();
        state.dirty.clear();
        state.queued_at.clear();
        state.waiting.clear();
        state.delayed.clear();
        drop(state);

        if let Some(metrics) = &self.metrics {
            metrics.set_depth(0);
        }
        info!(queue = %self.name, dropped, "work queue shutting down");
        self.notify.notify_waiters();
    }

    /// True once [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys ready for a worker (excludes delayed and in-flight keys).
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// True if no key is ready for a worker.
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Number of keys currently held by workers.
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}

impl fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("waiting", &state.waiting.len())
            .field("shutting_down", &state.shutting_down)
            .finish_non_exhaustive()
    }
}
