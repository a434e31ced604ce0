//! Unsubscribe and reset behaviour

use std::sync::Arc;
use std::time::Duration;

use roost_core::{Event, HandleRecord, kinds};
use roost_storage::InMemoryBackend;
use roost_sync::{RunningStorage, Services, Session, StorageOrchestrator, SyncConfig, SyncError};

fn event(n: u64) -> Event {
    Event::new(format!("{n:064x}"), "author", kinds::MESSAGE, n)
}

async fn start(session: &Session, backend: &Arc<InMemoryBackend>) -> (Services, RunningStorage) {
    roost_logging::init_testing();
    let services = session.services(&SyncConfig::testing());
    let storage = StorageOrchestrator::new(backend.clone())
        .with_services(services.all())
        .start()
        .await
        .unwrap();
    (services, storage)
}

#[tokio::test(start_paused = true)]
async fn test_changes_after_unsubscribe_are_not_persisted() {
    let backend = Arc::new(InMemoryBackend::new());

    let session = Session::new();
    let (_services, storage) = start(&session, &backend).await;
    session.repository.publish(event(1));
    tokio::time::sleep(Duration::from_millis(200)).await;
    storage.unsubscribe().await;

    session.repository.publish(event(2));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(backend.table("events").len(), 1);

    // A fresh session on the same backend sees only what was persisted
    let session = Session::new();
    let (_services, storage) = start(&session, &backend).await;
    assert_eq!(session.repository.len(), 1);
    assert!(session.repository.get(&event(1).id).is_some());
    storage.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn test_pending_batch_flushes_on_unsubscribe() {
    let backend = Arc::new(InMemoryBackend::new());
    let session = Session::new();
    let (_services, storage) = start(&session, &backend).await;

    session.repository.publish(event(1));
    session.tracker.track(&event(1).id, "wss://relay.one");
    storage.unsubscribe().await;

    assert!(backend.table("events").contains(&event(1).id));
    assert!(backend.table("tracker").contains(&event(1).id));
    assert_eq!(backend.table("events").put_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_interval_sampler_stops() {
    let backend = Arc::new(InMemoryBackend::new());
    let session = Session::new();
    let (_services, storage) = start(&session, &backend).await;

    session.set_plaintext("a", "one");
    tokio::time::sleep(Duration::from_millis(250)).await;
    let table = backend.table("plaintext");
    assert_eq!(table.put_calls(), 1);

    storage.unsubscribe().await;
    session.set_plaintext("b", "two");
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(table.put_calls(), 1);
    assert!(!table.contains("b"));
}

#[tokio::test(start_paused = true)]
async fn test_reset_clears_memory_and_tables() {
    let backend = Arc::new(InMemoryBackend::new());
    let session = Session::new();
    let (services, storage) = start(&session, &backend).await;

    session.repository.publish(event(1));
    session.tracker.track(&event(1).id, "wss://relay.one");
    session.handles.put(HandleRecord {
        nip05: "alice@example.com".to_string(),
        pubkey: None,
        relays: vec![],
        nip46: vec![],
        fetched_at: 1,
    });
    session.mark_fresh("feed");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!backend.table("freshness").is_empty());

    storage.reset().await.unwrap();

    assert!(session.repository.is_empty());
    assert!(session.tracker.is_empty());
    assert!(session.handles.is_empty());
    assert!(session.is_stale("feed", Duration::from_secs(3600)));
    for name in ["events", "tracker", "relays", "handles", "zappers", "freshness", "plaintext"] {
        assert!(backend.table(name).is_empty(), "{name} not cleared");
    }
    assert_eq!(services.events.managed_count(), 0);

    // Released tables can be bound by the next session
    let session = Session::new();
    let (_services, storage) = start(&session, &backend).await;
    assert!(session.repository.is_empty());
    storage.unsubscribe().await;
}

#[tokio::test(start_paused = true)]
async fn test_reset_reports_failed_services() {
    let backend = Arc::new(InMemoryBackend::new());
    let session = Session::new();
    let (_services, storage) = start(&session, &backend).await;

    session.repository.publish(event(1));
    tokio::time::sleep(Duration::from_millis(200)).await;
    backend.table("handles").set_fail_writes(true);

    let err = storage.reset().await.unwrap_err();
    assert!(matches!(err, SyncError::Reset(ref names) if names == &["handles".to_string()]));
    assert_eq!(err.to_string(), "Reset failed for: handles");

    // The others were still cleared
    assert!(backend.table("events").is_empty());
    assert!(session.repository.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_flush_is_not_retried() {
    let backend = Arc::new(InMemoryBackend::new());
    let session = Session::new();
    let (services, storage) = start(&session, &backend).await;
    let table = backend.table("events");

    table.set_fail_writes(true);
    session.repository.publish(event(1));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(table.is_empty());
    assert_eq!(services.events.managed_count(), 0);

    table.set_fail_writes(false);
    session.repository.publish(event(2));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!table.contains(&event(1).id));
    assert!(table.contains(&event(2).id));
    assert_eq!(table.put_calls(), 1);
    assert_eq!(services.events.managed_count(), 1);
    storage.unsubscribe().await;
}
