//! Retention sweeps driven through the events service

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use roost_core::{Event, kinds};
use roost_storage::{Backend, InMemoryBackend, Row, SqliteBackend, TableStore};
use roost_sync::{RunningStorage, Services, Session, StorageOrchestrator, SyncConfig};
use tempfile::TempDir;

fn event(n: u64, kind: u32) -> Event {
    Event::new(format!("{n:064x}"), format!("author-{n}"), kind, n)
}

fn row(event: &Event) -> Row {
    Row::encode(event.id.clone(), event).unwrap()
}

async fn start(session: &Session, backend: Arc<dyn Backend>, config: &SyncConfig) -> (Services, RunningStorage) {
    roost_logging::init_testing();
    let services = session.services(config);
    let storage = StorageOrchestrator::new(backend)
        .with_services(services.all())
        .start()
        .await
        .unwrap();
    (services, storage)
}

#[tokio::test(start_paused = true)]
async fn test_sweep_trims_to_limit_keeping_identity() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = SyncConfig::testing().with_events_limit(10);

    // Identity events are the oldest, so only rank protects them
    let mut seeded: Vec<Event> = (1..=5).map(|n| event(n, kinds::PROFILE)).collect();
    seeded.extend((6..=15).map(|n| event(n, kinds::MESSAGE)));
    seeded.shuffle(&mut rand::rng());
    backend.table("events").seed(seeded.iter().map(row));

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;
    assert_eq!(services.events.managed_count(), 15);

    // 16 > 10 * 1.5 triggers a sweep after the flush
    session.repository.publish(event(16, kinds::MESSAGE));
    tokio::time::sleep(Duration::from_millis(200)).await;
    services.events.wait_for_sweep().await;

    let table = backend.table("events");
    assert_eq!(table.len(), 10);
    assert_eq!(services.events.managed_count(), 10);
    for n in 1..=5 {
        assert!(table.contains(&event(n, 0).id), "identity event {n} evicted");
    }
    // The five newest messages survive
    for n in 12..=16 {
        assert!(table.contains(&event(n, 0).id), "message {n} evicted");
    }
    storage.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_sweep_at_threshold() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = SyncConfig::testing().with_events_limit(10);
    backend
        .table("events")
        .seed((1..=14).map(|n| row(&event(n, kinds::MESSAGE))));

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;

    // Exactly limit * 1.5 does not sweep
    session.repository.publish(event(15, kinds::MESSAGE));
    tokio::time::sleep(Duration::from_millis(200)).await;
    services.events.wait_for_sweep().await;

    assert_eq!(backend.table("events").len(), 15);
    assert_eq!(backend.table("events").delete_calls(), 0);
    storage.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn test_sweeps_do_not_overlap() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = SyncConfig::testing().with_events_limit(10_000);
    let table = backend.table("events");
    table.seed((1..=15_000).map(|n| row(&event(n, kinds::MESSAGE))));

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;
    assert_eq!(services.events.managed_count(), 15_000);

    // Slow reads keep the first sweep running across the second flush
    table.set_read_delay(Some(Duration::from_secs(1)));

    session.repository.publish(event(20_001, kinds::MESSAGE));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(services.events.is_evicting());

    session.repository.publish(event(20_002, kinds::MESSAGE));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(services.events.is_evicting());
    assert!(services.events.evict().await.is_none());

    services.events.wait_for_sweep().await;
    assert!(!services.events.is_evicting());

    assert_eq!(table.delete_calls(), 1);
    assert_eq!(table.len(), 10_000);
    assert_eq!(services.events.managed_count(), 10_000);
    assert!(table.contains(&event(20_001, 0).id));
    assert!(table.contains(&event(20_002, 0).id));
    storage.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_waits_for_running_sweep() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = SyncConfig::testing().with_events_limit(10);
    let table = backend.table("events");
    table.seed((1..=15).map(|n| row(&event(n, kinds::MESSAGE))));

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;
    table.set_read_delay(Some(Duration::from_secs(1)));

    // The final flush on teardown starts a slow sweep
    session.repository.publish(event(16, kinds::MESSAGE));
    storage.unsubscribe().await;

    assert!(!services.events.is_evicting());
    assert_eq!(table.len(), 10);
    assert_eq!(table.delete_calls(), 1);
    assert_eq!(services.events.managed_count(), 10);

    // Nothing from the old session touches the next one's rows
    table.set_read_delay(None);
    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;
    assert_eq!(services.events.managed_count(), 10);
    session.repository.publish(event(17, kinds::MESSAGE));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(table.len(), 11);
    assert_eq!(table.delete_calls(), 1);
    storage.unsubscribe().await;
}

#[tokio::test]
async fn test_manual_evict_under_limit() {
    let backend = Arc::new(InMemoryBackend::new());
    backend
        .table("events")
        .seed((1..=5).map(|n| row(&event(n, kinds::MESSAGE))));

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &SyncConfig::testing()).await;

    assert_eq!(services.events.evict().await.unwrap().unwrap(), 0);
    assert_eq!(backend.table("events").delete_calls(), 0);
    storage.unsubscribe().await;
}

#[tokio::test]
async fn test_undecodable_rows_are_evicted_first() {
    let backend = Arc::new(InMemoryBackend::new());
    let table = backend.table("events");
    table.seed((1..=3).map(|n| row(&event(n, kinds::MESSAGE))));
    table.seed([Row::new("garbage", "[]")]);

    let session = Session::new();
    let config = SyncConfig::testing().with_events_limit(3);
    let (services, storage) = start(&session, backend.clone(), &config).await;

    assert_eq!(services.events.evict().await.unwrap().unwrap(), 1);
    assert!(!table.contains("garbage"));
    assert_eq!(table.len(), 3);
    assert_eq!(services.events.managed_count(), 3);
    storage.unsubscribe().await;
}

#[tokio::test]
async fn test_sqlite_sweep() {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(SqliteBackend::open_dir(dir.path()));
    let config = SyncConfig::testing().with_events_limit(20);

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;

    for n in 1..=31 {
        session.repository.publish(event(n, kinds::MESSAGE));
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    services.events.wait_for_sweep().await;

    assert_eq!(services.events.managed_count(), 20);
    storage.unsubscribe().await;

    // What the next session sees is what the sweep left
    let session = Session::new();
    let (services, storage) = start(&session, backend, &config).await;
    assert_eq!(session.repository.len(), 20);
    assert_eq!(services.events.managed_count(), 20);
    assert!(session.repository.get(&event(1, 0).id).is_none());
    assert!(session.repository.get(&event(31, 0).id).is_some());
    storage.unsubscribe().await;
}

#[tokio::test]
async fn test_count_matches_table_after_sweep() {
    let backend = Arc::new(InMemoryBackend::new());
    let config = SyncConfig::testing().with_events_limit(4);
    backend
        .table("events")
        .seed((1..=6).map(|n| row(&event(n, kinds::THREAD))));

    let session = Session::new();
    let (services, storage) = start(&session, backend.clone(), &config).await;
    session.repository.publish(event(7, kinds::THREAD));
    tokio::time::sleep(Duration::from_millis(200)).await;
    services.events.wait_for_sweep().await;

    let table: Arc<dyn TableStore> = backend.table("events");
    assert_eq!(table.count().await.unwrap(), 4);
    assert_eq!(services.events.managed_count(), 4);
    storage.unsubscribe().await;
}
