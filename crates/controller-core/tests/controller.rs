//! End-to-end controller runs against the in-memory source.

mod common;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{TestPod, eventually, pod};
use controller_core::{
    Controller, ControllerConfig, ControllerError, ErrorReporter, MockSource, NAMESPACE_INDEX,
    ObjectKey, ReconcileError, Reconciler, Store, WorkQueue, namespace_index,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

type Outcome = Result<(), std::io::Error>;

const WAIT: Duration = Duration::from_secs(5);

fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced("default", name)
}

fn fast_config() -> ControllerConfig {
    ControllerConfig::new("pods")
        .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
        .with_relist_backoff(Duration::from_millis(1), Duration::from_millis(10))
        .with_shutdown_grace_period(Duration::from_secs(2))
}

/// Reconciler delegating to a closure, counting calls per key.
struct FnReconciler<F> {
    calls: Arc<Mutex<Vec<(ObjectKey, bool)>>>,
    handler: F,
}

impl<F, Fut> FnReconciler<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send,
{
    fn new(handler: F) -> (Self, Arc<Mutex<Vec<(ObjectKey, bool)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let reconciler = Self {
            calls: Arc::clone(&calls),
            handler,
        };
        (reconciler, calls)
    }
}

#[async_trait]
impl<F, Fut> Reconciler<TestPod> for FnReconciler<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send,
{
    type Error = std::io::Error;

    async fn reconcile(
        &self,
        key: &ObjectKey,
        object: Option<Arc<TestPod>>,
    ) -> Result<(), Self::Error> {
        let call = (key.clone(), object.is_some());
        self.calls.lock().unwrap().push(call);
        (self.handler)(key.clone()).await
    }
}

#[derive(Default)]
struct CollectingReporter {
    reports: Mutex<Vec<(ObjectKey, u32, String)>>,
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, key: &ObjectKey, retries: u32, error: &ReconcileError) {
        let report = (key.clone(), retries, error.to_string());
        self.reports.lock().unwrap().push(report);
    }
}

fn count(calls: &Mutex<Vec<(ObjectKey, bool)>>, key: &ObjectKey, exists: bool) -> usize {
    calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(k, e)| k == key && *e == exists)
        .count()
}

fn spawn<R>(
    source: MockSource<TestPod>,
    reconciler: R,
    config: ControllerConfig,
    reporter: Option<Arc<dyn ErrorReporter>>,
) -> (CancellationToken, JoinHandle<Result<(), ControllerError>>)
where
    R: Reconciler<TestPod>,
{
    let store: Store<TestPod> = Store::new();
    store
        .register_index(NAMESPACE_INDEX, namespace_index)
        .unwrap();
    let store = Arc::new(store);
    let queue = Arc::new(WorkQueue::new(&config.name, config.backoff()));
    let built = Controller::new(source, store, queue, reconciler, config);
    let mut controller = built.unwrap();
    if let Some(reporter) = reporter {
        controller = controller.with_reporter(reporter);
    }
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(controller.run(shutdown.clone()));
    (shutdown, task)
}

async fn stop(shutdown: CancellationToken, task: JoinHandle<Result<(), ControllerError>>) {
    shutdown.cancel();
    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(result.is_ok(), "{result:?}");
}

#[tokio::test]
async fn test_reconciles_existing_new_and_deleted_objects() {
    let source = MockSource::with_objects([
        pod("default", "a", "node-1", 1),
        pod("default", "b", "node-1", 1),
    ]);
    let (reconciler, calls) = FnReconciler::new(|_| async { Outcome::Ok(()) });
    let (shutdown, task) = spawn(source.clone(), reconciler, fast_config(), None);

    eventually("initial objects", || {
        count(&calls, &key("a"), true) == 1 && count(&calls, &key("b"), true) == 1
    })
    .await;

    source.apply(pod("default", "c", "node-2", 2));
    eventually("new object", || count(&calls, &key("c"), true) == 1).await;

    source.remove(&key("a"));
    // A deleted object reaches the reconciler as missing
    eventually("deletion", || count(&calls, &key("a"), false) == 1).await;

    stop(shutdown, task).await;
}

#[tokio::test]
async fn test_initial_reconcile_disabled_skips_existing_objects() {
    let source = MockSource::with_objects([pod("default", "a", "node-1", 1)]);
    let (reconciler, calls) = FnReconciler::new(|_| async { Outcome::Ok(()) });
    let config = fast_config().with_initial_reconcile(false);
    let (shutdown, task) = spawn(source.clone(), reconciler, config, None);

    // b must arrive over the watch, not the initial list
    eventually("watch to open", || source.open_watches() == 1).await;
    assert_eq!(source.list_calls(), 1);
    source.apply(pod("default", "b", "node-1", 2));
    eventually("new object", || count(&calls, &key("b"), true) == 1).await;
    assert_eq!(count(&calls, &key("a"), true), 0);

    stop(shutdown, task).await;
}

#[tokio::test]
async fn test_failing_key_is_retried_then_reported_once() {
    let source = MockSource::with_objects([
        pod("default", "bad", "node-1", 1),
        pod("default", "good", "node-1", 1),
    ]);
    let (reconciler, calls) = FnReconciler::new(|key: ObjectKey| async move {
        if key.name() == "bad" {
            Err(std::io::Error::other("remote unavailable"))
        } else {
            Ok(())
        }
    });
    let reporter = Arc::new(CollectingReporter::default());
    let reporting = Some(reporter.clone() as Arc<dyn ErrorReporter>);
    let (shutdown, task) = spawn(source, reconciler, fast_config(), reporting);

    let reported = || !reporter.reports.lock().unwrap().is_empty();
    eventually("terminal report", reported).await;
    // Give a stray extra retry the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(count(&calls, &key("bad"), true), 6);
    assert_eq!(count(&calls, &key("good"), true), 1);
    let reports = reporter.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, key("bad"));
    assert_eq!(reports[0].1, 5);
    assert!(reports[0].2.contains("remote unavailable"));

    stop(shutdown, task).await;
}

#[tokio::test]
async fn test_transient_failure_recovers_without_report() {
    let failures_left = Arc::new(AtomicUsize::new(2));
    let remaining = Arc::clone(&failures_left);
    let (reconciler, calls) = FnReconciler::new(move |_| {
        let remaining = Arc::clone(&remaining);
        async move {
            let previous = remaining.fetch_update(SeqCst, SeqCst, |n| n.checked_sub(1));
            if previous.is_ok() {
                Err(std::io::Error::other("conflict"))
            } else {
                Ok(())
            }
        }
    });
    let reporter = Arc::new(CollectingReporter::default());
    let source = MockSource::with_objects([pod("default", "a", "node-1", 1)]);
    let reporting = Some(reporter.clone() as Arc<dyn ErrorReporter>);
    let (shutdown, task) = spawn(source, reconciler, fast_config(), reporting);

    // Two failures, then success
    eventually("third attempt", || count(&calls, &key("a"), true) == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(count(&calls, &key("a"), true), 3);
    assert!(reporter.reports.lock().unwrap().is_empty());
    assert_eq!(failures_left.load(SeqCst), 0);

    stop(shutdown, task).await;
}

#[tokio::test]
async fn test_panicking_reconciler_counts_as_failure() {
    let panicked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&panicked);
    let (reconciler, calls) = FnReconciler::new(move |_| {
        let seen = Arc::clone(&seen);
        async move {
            let attempt = seen.fetch_add(1, SeqCst);
            assert!(attempt > 0, "first attempt blows up");
            Ok(())
        }
    });
    let source = MockSource::with_objects([pod("default", "a", "node-1", 1)]);
    let (shutdown, task) = spawn(source, reconciler, fast_config(), None);

    eventually("retry after panic", || count(&calls, &key("a"), true) == 2).await;
    stop(shutdown, task).await;
}

/// Tracks reconciles in flight per key and records any overlap.
struct ExclusiveReconciler {
    in_flight: Mutex<HashSet<ObjectKey>>,
    overlaps: AtomicUsize,
    per_key: Mutex<HashMap<ObjectKey, usize>>,
}

#[async_trait]
impl Reconciler<TestPod> for Arc<ExclusiveReconciler> {
    type Error = std::io::Error;

    async fn reconcile(
        &self,
        key: &ObjectKey,
        _object: Option<Arc<TestPod>>,
    ) -> Result<(), Self::Error> {
        if !self.in_flight.lock().unwrap().insert(key.clone()) {
            self.overlaps.fetch_add(1, SeqCst);
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
        *self.per_key.lock().unwrap().entry(key.clone()).or_default() += 1;
        self.in_flight.lock().unwrap().remove(key);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_key_never_reconciled_concurrently() {
    let reconciler = Arc::new(ExclusiveReconciler {
        in_flight: Mutex::new(HashSet::new()),
        overlaps: AtomicUsize::new(0),
        per_key: Mutex::new(HashMap::new()),
    });
    let source = MockSource::new();
    let config = fast_config().with_workers(4);
    let (shutdown, task) = spawn(source.clone(), Arc::clone(&reconciler), config, None);

    let producers: Vec<_> = (0..4u64)
        .map(|p| {
            let source = source.clone();
            tokio::spawn(async move {
                for i in 0..50u64 {
                    let name = format!("pod-{}", (i + p) % 3);
                    source.apply(pod("default", &name, "node-1", p * 1000 + i + 1));
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }

    let all_keys = || reconciler.per_key.lock().unwrap().len() == 3;
    eventually("every key reconciled", all_keys).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop(shutdown, task).await;

    assert_eq!(reconciler.overlaps.load(SeqCst), 0);
    // 200 events over 3 keys coalesce into fewer reconciles
    let total: usize = reconciler.per_key.lock().unwrap().values().sum();
    assert!(total < 200, "total reconciles {total}");
}

#[tokio::test]
async fn test_initial_list_failure_aborts_run() {
    let source: MockSource<TestPod> = MockSource::new();
    source.fail_next_lists(1);
    let (reconciler, calls) = FnReconciler::new(|_| async { Outcome::Ok(()) });
    let (_shutdown, task) = spawn(source, reconciler, fast_config(), None);

    let result = timeout(WAIT, task).await.unwrap().unwrap();
    assert!(matches!(result, Err(ControllerError::InitialList(_))));
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_shutdown_aborts_stuck_reconciles_after_grace_period() {
    let (reconciler, calls) = FnReconciler::new(|_| std::future::pending::<Outcome>());
    let source = MockSource::with_objects([pod("default", "stuck", "node-1", 1)]);
    let grace = Duration::from_millis(50);
    let config = fast_config().with_shutdown_grace_period(grace);
    let (shutdown, task) = spawn(source, reconciler, config, None);

    eventually("started", || count(&calls, &key("stuck"), true) == 1).await;
    stop(shutdown, task).await;
}

#[test]
fn test_invalid_config_is_rejected() {
    let (reconciler, _) = FnReconciler::new(|_| async { Outcome::Ok(()) });
    let store = Arc::new(Store::new());
    let backoff = ControllerConfig::default().backoff();
    let queue = Arc::new(WorkQueue::new("pods", backoff));
    let result = Controller::new(
        MockSource::<TestPod>::new(),
        store,
        queue,
        reconciler,
        ControllerConfig::new("pods").with_workers(0),
    );
    assert!(matches!(result, Err(ControllerError::InvalidConfig(_))));
}
