//! Per-agent engine wiring the managers to shared services.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use fieldsync_common::{AgentId, Result};
use fieldsync_storage::LocalStore;

use crate::activity::{PunchClock, TripTracker};
use crate::config::EngineConfig;
use crate::location::{GeolocationProvider, LocationService};
use crate::network::{ListenerGuard, NetworkMonitor};
use crate::notice::NoticeBus;
use crate::remote::{BlobStore, RemoteLedger};
use crate::upload::{DrainReport, UploadQueue};
use crate::visits::VisitOutbox;

/// Result of a manual [`SyncEngine::sync_now`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub uploads: DrainReport,
    pub visits: DrainReport,
}

/// External collaborators the engine is built on.
pub struct Collaborators {
    pub store: LocalStore,
    pub ledger: Arc<dyn RemoteLedger>,
    pub blobs: Arc<dyn BlobStore>,
    pub geolocation: Arc<dyn GeolocationProvider>,
    pub network: Arc<NetworkMonitor>,
}

/// Sync engine for one agent's session.
pub struct SyncEngine {
    agent_id: AgentId,
    config: EngineConfig,
    network: Arc<NetworkMonitor>,
    notices: NoticeBus,
    trips: Arc<TripTracker>,
    punches: Arc<PunchClock>,
    uploads: Arc<UploadQueue>,
    visits: Arc<VisitOutbox>,
    listeners: Mutex<Vec<ListenerGuard>>,
}

impl SyncEngine {
    /// Create an engine. Nothing runs until [`SyncEngine::start`].
    pub fn new(agent_id: AgentId, config: EngineConfig, parts: Collaborators) -> Self {
        let notices = NoticeBus::default();
        let location = LocationService::new(parts.geolocation, config.location.clone());

        let trips = Arc::new(TripTracker::new(
            agent_id.clone(),
            parts.store.clone(),
            parts.ledger.clone(),
            location.clone(),
            parts.network.clone(),
            notices.clone(),
            &config,
        ));
        let punches = Arc::new(PunchClock::new(
            agent_id.clone(),
            parts.store.clone(),
            parts.ledger.clone(),
            location,
            parts.network.clone(),
            notices.clone(),
            &config,
        ));
        let uploads = Arc::new(UploadQueue::new(
            agent_id.clone(),
            parts.store.clone(),
            parts.blobs,
            parts.network.clone(),
            notices.clone(),
            &config,
        ));
        let visits = Arc::new(VisitOutbox::new(
            agent_id.clone(),
            parts.store,
            parts.ledger,
            parts.network.clone(),
            notices.clone(),
            &config,
        ));

        Self {
            agent_id,
            config,
            network: parts.network,
            notices,
            trips,
            punches,
            uploads,
            visits,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Restore local state, register connectivity listeners and, when online,
    /// reconcile and drain.
    pub async fn start(&self) -> Result<()> {
        info!("Starting sync engine for {}", self.agent_id);
        self.trips.load().await;
        self.punches.load().await;
        self.uploads.refresh_pending_count().await;

        let offline_notices = self.notices.clone();
        let guards = vec![
            self.uploads.watch_network(),
            self.visits.watch_network(),
            self.trips.watch_network(),
            self.punches.watch_network(),
            self.network.add_listener(
                || {},
                move || offline_notices.warning("You are offline. Data will sync when connected."),
            ),
        ];
        lock(&self.listeners).extend(guards);
        self.network.start();

        if self.network.is_online() {
            self.sync_now().await;
            self.trips.attach();
            self.punches.attach();
        } else {
            self.notices
                .warning("You are offline. Data will sync when connected.");
        }
        Ok(())
    }

    /// Reconcile activities and drain both queues once.
    pub async fn sync_now(&self) -> SyncSummary {
        if let Err(e) = self.trips.reconcile().await {
            warn!("Trip reconcile failed: {}", e);
        }
        if let Err(e) = self.punches.reconcile().await {
            warn!("Punch reconcile failed: {}", e);
        }

        let uploads = self.uploads.drain_queue().await.unwrap_or_else(|e| {
            warn!("Upload drain failed: {}", e);
            DrainReport::default()
        });
        let visits = self.visits.drain().await.unwrap_or_else(|e| {
            warn!("Visit drain failed: {}", e);
            DrainReport::default()
        });
        SyncSummary { uploads, visits }
    }

    /// Unregister listeners, close subscriptions and stop the monitor.
    pub fn shutdown(&self) {
        lock(&self.listeners).clear();
        self.trips.detach();
        self.punches.detach();
        self.network.stop();
        info!("Sync engine for {} stopped", self.agent_id);
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn notices(&self) -> &NoticeBus {
        &self.notices
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn trips(&self) -> &Arc<TripTracker> {
        &self.trips
    }

    pub fn punches(&self) -> &Arc<PunchClock> {
        &self.punches
    }

    pub fn uploads(&self) -> &Arc<UploadQueue> {
        &self.uploads
    }

    pub fn visits(&self) -> &Arc<VisitOutbox> {
        &self.visits
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
