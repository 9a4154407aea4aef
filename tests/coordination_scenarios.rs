//! End-to-end scenarios over the full coordination stack: store, sessions,
//! locks, the coordination facade, and the garbage collector composed the
//! way a real deployment would wire them.

use std::sync::Arc;
use std::time::Duration;

use pathkeeper::clock::{Clock, SystemClock};
use pathkeeper::config::CoordinationConfig;
use pathkeeper::coordination::CoordinationService;
use pathkeeper::error::CoordinationError;
use pathkeeper::gc::GarbageCollector;
use pathkeeper::invalidation::InvalidationDirectory;
use pathkeeper::lock::{LockManager, PeerBroadcast};
use pathkeeper::model::entry::CreateMode;
use pathkeeper::model::path::Path;
use pathkeeper::session::SessionManager;
use pathkeeper::store::memory::InMemoryStore;
use pathkeeper::store::BackingStore;
use pathkeeper::wait::WaitDirectory;
use pathkeeper::waitmgr::WaitManager;
use tokio_util::sync::CancellationToken;

struct Harness {
    store: Arc<InMemoryStore>,
    sessions: Arc<SessionManager>,
    locks: Arc<LockManager>,
    service: Arc<CoordinationService>,
}

fn build_harness() -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(SystemClock);
    let config = CoordinationConfig::default();

    let sessions = Arc::new(SessionManager::new(
        store.clone() as Arc<dyn BackingStore>,
        clock.clone() as Arc<dyn Clock>,
        config.clone(),
    ));
    let wait_directory = Arc::new(WaitDirectory::new());
    let wait_manager = Arc::new(WaitManager::new(
        store.clone() as Arc<dyn BackingStore>,
        sessions.clone(),
        wait_directory.clone(),
        Duration::from_millis(20),
    ));
    let invalidation_directory = Arc::new(InvalidationDirectory::new());
    let locks = Arc::new(LockManager::new(
        store.clone() as Arc<dyn BackingStore>,
        sessions.clone(),
        wait_manager,
        wait_directory,
        invalidation_directory.clone(),
        PeerBroadcast::default(),
        config.clone(),
    ));
    let service = CoordinationService::new(
        store.clone() as Arc<dyn BackingStore>,
        clock as Arc<dyn Clock>,
        sessions.clone(),
        locks.clone(),
        invalidation_directory,
        config,
    );
    Harness {
        store,
        sessions,
        locks,
        service,
    }
}

#[tokio::test]
async fn create_then_read_from_another_session() {
    let h = build_harness();
    h.service.ensure_root().await.unwrap();
    let cancellation = CancellationToken::new();
    let writer = h.sessions.allocate().await.unwrap();
    let reader = h.sessions.allocate().await.unwrap();
    let path = Path::parse("/config/flags").unwrap();

    h.service.create(&Path::parse("/config").unwrap(), Vec::new(), CreateMode::Default, writer.id, &cancellation).await.unwrap();
    h.service.create(&path, b"on".to_vec(), CreateMode::Default, writer.id, &cancellation).await.unwrap();

    let seen = h.service.get(&path, reader.id, &cancellation).await.unwrap();
    assert_eq!(seen.value, b"on");
}

#[tokio::test]
async fn read_cache_is_invalidated_by_a_concurrent_write() {
    let h = build_harness();
    h.service.ensure_root().await.unwrap();
    let cancellation = CancellationToken::new();
    let reader = h.sessions.allocate().await.unwrap();
    let writer = h.sessions.allocate().await.unwrap();
    let path = Path::parse("/config").unwrap();

    h.service.create(&path, b"v1".to_vec(), CreateMode::Default, writer.id, &cancellation).await.unwrap();

    let cached = h.service.get(&path, reader.id, &cancellation).await.unwrap();
    assert_eq!(cached.value, b"v1");

    // set_value must drain the reader's held read-lock (via invalidation)
    // before it can acquire the write-lock; the cache entry is evicted in
    // the same step.
    h.service.set_value(&path, b"v2".to_vec(), None, writer.id, &cancellation).await.unwrap();

    let refreshed = h.service.get(&path, reader.id, &cancellation).await.unwrap();
    assert_eq!(refreshed.value, b"v2");
}

#[tokio::test]
async fn ephemeral_entry_is_reaped_after_session_end() {
    let h = build_harness();
    h.service.ensure_root().await.unwrap();
    let cancellation = CancellationToken::new();
    let owner = h.sessions.allocate().await.unwrap();
    let path = Path::parse("/locks/widget").unwrap();

    h.service.create(&Path::parse("/locks").unwrap(), Vec::new(), CreateMode::Default, owner.id, &cancellation).await.unwrap();
    h.service.create(&path, Vec::new(), CreateMode::Ephemeral, owner.id, &cancellation).await.unwrap();
    assert!(h.service.get(&path, owner.id, &cancellation).await.is_ok());

    h.sessions.end(owner.id).await.unwrap();

    let gc = GarbageCollector::new(
        h.store.clone() as Arc<dyn BackingStore>,
        Arc::new(SystemClock) as Arc<dyn Clock>,
        h.sessions.clone(),
        h.locks.clone(),
        CoordinationConfig::default(),
    );
    let gc_owner = h.sessions.allocate().await.unwrap();
    let (sessions_reaped, entries_reaped) = gc.sweep_once(gc_owner.id).await.unwrap();
    assert_eq!(sessions_reaped, 1);
    assert_eq!(entries_reaped, 1);

    let result = h.service.get(&path, gc_owner.id, &cancellation).await;
    assert!(matches!(result, Err(CoordinationError::EntryNotFound { .. })));
}

#[tokio::test]
async fn children_are_populated_on_the_parent_after_create() {
    let h = build_harness();
    h.service.ensure_root().await.unwrap();
    let cancellation = CancellationToken::new();
    let session = h.sessions.allocate().await.unwrap();

    h.service.create(&Path::parse("/services").unwrap(), Vec::new(), CreateMode::Default, session.id, &cancellation).await.unwrap();
    h.service.create(&Path::parse("/services/a").unwrap(), Vec::new(), CreateMode::Default, session.id, &cancellation).await.unwrap();
    h.service.create(&Path::parse("/services/b").unwrap(), Vec::new(), CreateMode::Default, session.id, &cancellation).await.unwrap();

    let parent = h.store.get_entry(&Path::parse("/services").unwrap()).await.unwrap().unwrap();
    assert!(parent.children.contains("a"));
    assert!(parent.children.contains("b"));
    assert_eq!(parent.children.len(), 2);
}

#[tokio::test]
async fn exactly_one_of_two_concurrent_writes_under_the_same_expected_version_wins() {
    let h = build_harness();
    h.service.ensure_root().await.unwrap();
    let cancellation = CancellationToken::new();
    let a = h.sessions.allocate().await.unwrap();
    let b = h.sessions.allocate().await.unwrap();
    let path = Path::parse("/counter").unwrap();

    let created = h.service.create(&path, b"0".to_vec(), CreateMode::Default, a.id, &cancellation).await.unwrap();
    let expected = created.version;

    let service_a = Arc::clone(&h.service);
    let path_a = path.clone();
    let cancellation_a = CancellationToken::new();
    let task_a = tokio::spawn(async move { service_a.set_value(&path_a, b"a".to_vec(), Some(expected), a.id, &cancellation_a).await });

    let service_b = Arc::clone(&h.service);
    let path_b = path.clone();
    let cancellation_b = CancellationToken::new();
    let task_b = tokio::spawn(async move { service_b.set_value(&path_b, b"b".to_vec(), Some(expected), b.id, &cancellation_b).await });

    let (result_a, result_b) = tokio::join!(task_a, task_b);
    let outcomes = [result_a.unwrap(), result_b.unwrap()];
    let successes = outcomes.iter().filter(|r| r.is_ok()).count();
    let conflicts = outcomes
        .iter()
        .filter(|r| matches!(r, Err(CoordinationError::VersionConflict { .. })))
        .count();
    assert_eq!(successes, 1);
    assert_eq!(conflicts, 1);
}

#[tokio::test]
async fn write_lock_requester_evicts_a_dead_holder() {
    let h = build_harness();
    h.service.ensure_root().await.unwrap();
    let cancellation = CancellationToken::new();
    let crashed = h.sessions.allocate().await.unwrap();
    let survivor = h.sessions.allocate().await.unwrap();
    let path = Path::parse("/widget").unwrap();

    h.service.create(&path, b"v1".to_vec(), CreateMode::Default, survivor.id, &cancellation).await.unwrap();

    // Simulate another node's LockManager having granted `crashed` the
    // write-lock and then dying before it released; this node's LockManager
    // never observed the acquire locally, so only the backing-store record
    // carries the stale holder.
    let entry = h.store.get_entry(&path).await.unwrap().unwrap();
    h.store.try_update_entry(&entry, entry.with_write_lock(crashed.id)).await.unwrap();
    h.sessions.end(crashed.id).await.unwrap();

    let updated = h.service.set_value(&path, b"v2".to_vec(), None, survivor.id, &cancellation).await.unwrap();
    assert_eq!(updated.value, b"v2");
}
