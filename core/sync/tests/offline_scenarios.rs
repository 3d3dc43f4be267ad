//! End-to-end scenarios over the in-memory ledger, blob store and geolocation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fieldsync_common::{AgentId, Error, GeoPosition, ImageFile};
use fieldsync_storage::{LocalStore, PunchRecord, UploadStatus};
use fieldsync_sync::{
    retry_with_backoff, ActivityState, Collaborators, DocumentPath, EngineConfig,
    MemoryBlobStore, MemoryLedger, NetworkMonitor, RemoteLedger, ScriptedGeolocation, SyncEngine,
};
use tempfile::TempDir;

struct Device {
    engine: SyncEngine,
    ledger: MemoryLedger,
    blobs: MemoryBlobStore,
}

fn device(store: LocalStore, ledger: MemoryLedger, blobs: MemoryBlobStore, online: bool) -> Device {
    let parts = Collaborators {
        store,
        ledger: Arc::new(ledger.clone()),
        blobs: Arc::new(blobs.clone()),
        geolocation: Arc::new(ScriptedGeolocation::fixed(GeoPosition::new(
            28.6139, 77.2090, 12.0,
        ))),
        network: Arc::new(NetworkMonitor::new(online)),
    };
    let engine = SyncEngine::new(agent(), EngineConfig::default(), parts);
    Device {
        engine,
        ledger,
        blobs,
    }
}

fn agent() -> AgentId {
    AgentId::new("field-agent-42").unwrap()
}

fn punch_path() -> DocumentPath {
    DocumentPath::new("agents", agent(), "activePunch")
}

fn photo(name: &str) -> ImageFile {
    ImageFile::new(name, "image/jpeg", vec![0xAB; 4096])
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn offline_punch_resyncs_without_duplicates() {
    let ledger = MemoryLedger::new();
    ledger.set_online(false);
    let device = device(LocalStore::ephemeral(), ledger, MemoryBlobStore::new(), false);
    device.engine.start().await.unwrap();

    let punch = device.engine.punches().start(None).await.unwrap();
    assert!(punch.pending_sync);
    assert!(device.engine.punches().current().is_active());
    assert_eq!(device.ledger.documents(&punch_path()).len(), 0);

    device.ledger.set_online(true);
    device.engine.network().report(true);
    settle().await;
    // A second reconnect must not replay the punch again.
    device.engine.network().report(false);
    device.engine.network().report(true);
    settle().await;

    let docs = device.ledger.documents(&punch_path());
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].status(), Some("active"));

    let current = device.engine.punches().current();
    let synced = current.active().unwrap();
    assert_eq!(synced.remote_id.as_deref(), Some(docs[0].id.as_str()));
    assert!(!synced.pending_sync);
}

#[tokio::test]
async fn offline_punch_adopts_record_started_elsewhere() {
    let ledger = MemoryLedger::new();
    let device = device(LocalStore::ephemeral(), ledger.clone(), MemoryBlobStore::new(), false);
    device.engine.start().await.unwrap();
    device.engine.punches().start(None).await.unwrap();

    // Another session punched in while this device was offline.
    let other = device.engine.punches().path().clone();
    ledger
        .create(
            &other,
            fieldsync_sync::LedgerWrite::new()
                .set("agentId", "field-agent-42")
                .set("status", "active")
                .set("punchInTime", chrono::Utc::now().to_rfc3339())
                .set(
                    "punchInLocation",
                    serde_json::to_value(GeoPosition::new(1.0, 1.0, 1.0)).unwrap(),
                ),
        )
        .await
        .unwrap();

    device.engine.network().report(true);
    settle().await;

    assert_eq!(ledger.active_count(&punch_path()), 1);
    assert_eq!(ledger.documents(&punch_path()).len(), 1);
    let adopted: PunchRecord = device.engine.punches().current().active().cloned().unwrap();
    assert_eq!(adopted.punch_in_location.latitude, 1.0);
}

#[tokio::test]
async fn queued_images_drain_on_reconnect() {
    let device = device(
        LocalStore::ephemeral(),
        MemoryLedger::new(),
        MemoryBlobStore::new(),
        false,
    );
    device.engine.start().await.unwrap();

    let images = device
        .engine
        .uploads()
        .enqueue(vec![photo("a.jpg"), photo("b.jpg"), photo("c.jpg")])
        .await
        .unwrap();
    assert!(images.iter().all(|img| img.status == UploadStatus::Queued));
    assert_eq!(*device.engine.uploads().pending_count().borrow(), 3);

    let mut pending = device.engine.uploads().pending_count();
    device.engine.network().report(true);
    tokio::time::timeout(Duration::from_secs(2), pending.wait_for(|n| *n == 0))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(device.blobs.len(), 3);
    let snapshot = device.engine.uploads().snapshot();
    assert!(snapshot.iter().all(|img| img.status == UploadStatus::Uploaded));
    assert!(snapshot.iter().all(|img| img.url.is_some()));
    assert_eq!(device.engine.uploads().uploaded_images().len(), 3);
}

#[tokio::test]
async fn queued_images_survive_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("device.db");
    let blobs = MemoryBlobStore::new();

    {
        let store = LocalStore::open(&db).unwrap();
        let device = device(store, MemoryLedger::new(), blobs.clone(), false);
        device.engine.start().await.unwrap();
        device
            .engine
            .uploads()
            .enqueue(vec![photo("visit.jpg")])
            .await
            .unwrap();
        device.engine.shutdown();
    }

    let store = LocalStore::open(&db).unwrap();
    assert_eq!(store.pending_uploads().await.unwrap().len(), 1);

    let device = device(store.clone(), MemoryLedger::new(), blobs.clone(), true);
    device.engine.start().await.unwrap();

    assert!(store.pending_uploads().await.unwrap().is_empty());
    assert_eq!(blobs.len(), 1);
    let (mime, bytes) = blobs.get(&blobs.paths()[0]).unwrap();
    assert_eq!(mime, "image/jpeg");
    assert_eq!(bytes, vec![0xAB; 4096]);
}

#[tokio::test]
async fn concurrent_starts_leave_one_active_trip() {
    let device = device(
        LocalStore::ephemeral(),
        MemoryLedger::new(),
        MemoryBlobStore::new(),
        true,
    );
    device.engine.start().await.unwrap();
    let trips = device.engine.trips().clone();

    let (first, second) = tokio::join!(trips.start(None), trips.start(None));
    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(
        r,
        Err(Error::Conflict(_)) | Err(Error::AlreadyExists(_))
    )));

    // A later attempt is refused too.
    assert!(trips.start(None).await.is_err());
    assert_eq!(device.ledger.active_count(trips.path()), 1);

    trips.end(None).await.unwrap();
    trips.start(None).await.unwrap();
    assert_eq!(device.ledger.active_count(trips.path()), 1);
    assert_eq!(device.ledger.documents(trips.path()).len(), 2);
}

#[tokio::test]
async fn offline_end_and_new_start_both_reach_ledger() {
    let device = device(
        LocalStore::ephemeral(),
        MemoryLedger::new(),
        MemoryBlobStore::new(),
        true,
    );
    device.engine.start().await.unwrap();
    let trips = device.engine.trips().clone();
    let first = trips.start(None).await.unwrap();
    let first_id = first.remote_id.unwrap();

    device.ledger.set_online(false);
    device.engine.network().report(false);
    trips.end(None).await.unwrap();
    let second = trips.start(None).await.unwrap();
    assert!(second.pending_sync);

    device.ledger.set_online(true);
    device.engine.network().report(true);
    settle().await;

    let docs = device.ledger.documents(trips.path());
    assert_eq!(docs.len(), 2);
    let ended = docs.iter().find(|doc| doc.id == first_id).unwrap();
    assert_eq!(ended.status(), Some("completed"));
    assert_eq!(device.ledger.active_count(trips.path()), 1);

    let current = trips.current();
    let active = current.active().unwrap();
    assert_ne!(active.remote_id.as_deref(), Some(first_id.as_str()));
    assert!(!active.pending_sync);
}

#[tokio::test]
async fn trip_end_reports_through_state() {
    let device = device(
        LocalStore::ephemeral(),
        MemoryLedger::new(),
        MemoryBlobStore::new(),
        true,
    );
    device.engine.start().await.unwrap();
    let mut notices = device.engine.notices().subscribe();

    device.engine.trips().start(None).await.unwrap();
    let trip = device.engine.trips().end(None).await.unwrap();

    assert_eq!(trip.total_distance, Some(0.0));
    assert!(matches!(
        device.engine.trips().current(),
        ActivityState::Completed(_)
    ));

    let mut seen = Vec::new();
    while let Ok(notice) = notices.try_recv() {
        seen.push(notice.message);
    }
    assert!(seen.iter().any(|m| m == "Trip started! Location: 28.6139, 77.2090"));
    assert!(seen.iter().any(|m| m.starts_with("Trip ended! Distance: 0.00 km | Duration: 00:00:0")));
}

#[tokio::test(start_paused = true)]
async fn retry_invokes_at_most_n_plus_one_times() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let started = tokio::time::Instant::now();

    let result: fieldsync_common::Result<()> = retry_with_backoff(
        move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Network("still down".to_string()))
            }
        },
        3,
        Duration::from_millis(1000),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(started.elapsed(), Duration::from_millis(7000));
}
