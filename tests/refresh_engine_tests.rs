/// Refresh engine tests
///
/// End-to-end scheduling, refresh and cancellation with the real loops running
/// Run with: cargo test --test refresh_engine_tests
use async_trait::async_trait;
use kvrefresh::{
    CachedPayload, DataSource, Engine, EngineConfig, InMemoryStore, KeyValueStore,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio_test::assert_ok;

struct InventorySource {
    fetches: AtomicUsize,
}

#[async_trait]
impl DataSource for InventorySource {
    async fn fetch(&self, task_id: &str) -> anyhow::Result<Value> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "sku": task_id, "stock": n }))
    }
}

struct FlakySource;

#[async_trait]
impl DataSource for FlakySource {
    async fn fetch(&self, _task_id: &str) -> anyhow::Result<Value> {
        anyhow::bail!("upstream timed out")
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .poll_interval(Duration::from_millis(10))
        .poll_jitter(Duration::from_millis(5))
        .session_check_interval(Duration::from_millis(20))
}

async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    while started.elapsed() < timeout {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn cached(engine: &Engine, task_id: &str) -> Option<CachedPayload> {
    engine.cached(task_id).await.unwrap()
}

#[tokio::test]
async fn test_schedule_refresh_cancel_lifecycle() {
    let store = Arc::new(InMemoryStore::new());
    let source = Arc::new(InventorySource {
        fetches: AtomicUsize::new(0),
    });
    let engine = Engine::new(store.clone(), source.clone(), fast_config()).unwrap();
    let handle = engine.start();

    assert_ok!(engine.schedule("itemX", 0.1).await);
    let engine_ref = &engine;

    // payload shows up shortly after scheduling
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            cached(engine_ref, "itemX").await.is_some()
        })
        .await
    );
    let first = cached(&engine, "itemX").await.unwrap();
    assert_eq!(first.data["sku"], "itemX");

    // and is refreshed on the interval
    let first_at = first.cached_at;
    assert!(
        wait_for(Duration::from_secs(2), || async move {
            cached(engine_ref, "itemX")
                .await
                .is_some_and(|payload| payload.cached_at > first_at)
        })
        .await
    );

    // cancellation removes the payload and both schedule entries
    assert!(engine.cancel("itemX").await.unwrap());
    assert!(
        wait_for(Duration::from_secs(1), || async move {
            cached(engine_ref, "itemX").await.is_none()
        })
        .await
    );
    assert_eq!(store.zscore("schedule:", "itemX").await.unwrap(), None);
    assert_eq!(store.zscore("delay:", "itemX").await.unwrap(), None);

    // nothing brings it back
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cached(&engine, "itemX").await.is_none());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_unknown_task_is_noop() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(
        store.clone(),
        Arc::new(InventorySource {
            fetches: AtomicUsize::new(0),
        }),
        fast_config(),
    )
    .unwrap();

    assert!(!engine.cancel("ghost").await.unwrap());
    assert!(!store.exists("schedule:").await.unwrap());
    assert!(!store.exists("delay:").await.unwrap());
}

#[tokio::test]
async fn test_rescheduling_overwrites_interval() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(
        store.clone(),
        Arc::new(InventorySource {
            fetches: AtomicUsize::new(0),
        }),
        fast_config(),
    )
    .unwrap();

    engine.schedule("itemY", 30.0).await.unwrap();
    engine.schedule("itemY", 60.0).await.unwrap();

    assert_eq!(engine.scheduler().interval("itemY").await.unwrap(), Some(60.0));
    assert_eq!(engine.scheduler().pending().await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_workers_share_one_schedule() {
    let store = Arc::new(InMemoryStore::new());
    let source = Arc::new(InventorySource {
        fetches: AtomicUsize::new(0),
    });
    let engine = Engine::new(store.clone(), source.clone(), fast_config().refresh_workers(3)).unwrap();

    for i in 0..10 {
        engine.schedule(&format!("item{i}"), 60.0).await.unwrap();
    }
    let handle = engine.start();

    let store_ref = &store;
    assert!(
        wait_for(Duration::from_secs(3), || async move {
            store_ref.keys_with_prefix("inv:").await.len() == 10
        })
        .await
    );
    handle.shutdown().await.unwrap();

    // every task was refreshed at least once and is queued again a minute out
    assert!(source.fetches.load(Ordering::SeqCst) >= 10);
    let next = engine.scheduler().next_due().await.unwrap().unwrap();
    assert!(next.due_at > kvrefresh::core::unix_seconds(chrono::Utc::now()) + 30.0);
}

#[tokio::test]
async fn test_failing_source_keeps_task_scheduled() {
    let store = Arc::new(InMemoryStore::new());
    let engine = Engine::new(store.clone(), Arc::new(FlakySource), fast_config()).unwrap();
    engine.schedule("itemZ", 1.0).await.unwrap();

    let handle = engine.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();

    assert!(engine.cached("itemZ").await.unwrap().is_none());
    assert_eq!(engine.scheduler().pending().await.unwrap(), 1);
    assert_eq!(engine.scheduler().interval("itemZ").await.unwrap(), Some(1.0));
}

#[tokio::test]
async fn test_shutdown_is_prompt() {
    let engine = Engine::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(InventorySource {
            fetches: AtomicUsize::new(0),
        }),
        EngineConfig::default().session_check_interval(Duration::from_secs(60)),
    )
    .unwrap();

    let handle = engine.start();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let started = Instant::now();
    handle.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
}
