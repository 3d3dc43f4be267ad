//! Activity state managers for trips and punches.
//!
//! Each manager keeps at most one active record per agent. The remote ledger
//! is authoritative while a live subscription is open; the local mirror keeps
//! the timer visible when it is not, and carries transitions made offline
//! until [`ActivityManager::reconcile`] pushes them.

mod punch;
mod record;
mod trip;

pub use record::{is_previous_day, ActivityRecord};

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use fieldsync_common::{AgentId, Error, GeoPosition, Result};
use fieldsync_storage::{LocalStore, PunchRecord, TripRecord};

use crate::config::EngineConfig;
use crate::location::LocationService;
use crate::network::{ListenerGuard, NetworkMonitor};
use crate::notice::NoticeBus;
use crate::remote::{DocumentPath, LedgerDocument, RemoteLedger};
use crate::retry::RetryExecutor;

/// Manager for the agent's active trip.
pub type TripTracker = ActivityManager<TripRecord>;

/// Manager for the agent's active punch.
pub type PunchClock = ActivityManager<PunchRecord>;

/// Reactive state of one activity kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityState<R> {
    Inactive,
    Active(R),
    /// Just ended; kept so the UI can show the final figures.
    Completed(R),
}

impl<R: ActivityRecord> ActivityState<R> {
    pub fn active(&self) -> Option<&R> {
        match self {
            Self::Active(record) => Some(record),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Running time of an active record, or the final duration of a completed one.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match self {
            Self::Inactive => None,
            Self::Active(record) => Some((now - record.started_at()).max(chrono::Duration::zero())),
            Self::Completed(record) => record.total_duration().map(chrono::Duration::milliseconds),
        }
    }
}

/// Start/end state machine for one activity kind of one agent.
pub struct ActivityManager<R: ActivityRecord> {
    agent_id: AgentId,
    path: DocumentPath,
    store: LocalStore,
    ledger: Arc<dyn RemoteLedger>,
    location: LocationService,
    network: Arc<NetworkMonitor>,
    notices: NoticeBus,
    retry: RetryExecutor,
    state: watch::Sender<ActivityState<R>>,
    /// Held for the duration of a start, end or reconcile.
    transition: tokio::sync::Mutex<()>,
    subscription: Mutex<Option<JoinHandle<()>>>,
}

impl<R: ActivityRecord> ActivityManager<R> {
    pub fn new(
        agent_id: AgentId,
        store: LocalStore,
        ledger: Arc<dyn RemoteLedger>,
        location: LocationService,
        network: Arc<NetworkMonitor>,
        notices: NoticeBus,
        config: &EngineConfig,
    ) -> Self {
        let path = DocumentPath::new(
            config.agent_collection.clone(),
            agent_id.clone(),
            R::SUBCOLLECTION,
        );
        let (state, _) = watch::channel(ActivityState::Inactive);
        Self {
            agent_id,
            path,
            store,
            ledger,
            location,
            network,
            notices,
            retry: RetryExecutor::new(config.retry.to_retry_config()),
            state,
            transition: tokio::sync::Mutex::new(()),
            subscription: Mutex::new(None),
        }
    }

    /// Reactive current state.
    pub fn state(&self) -> watch::Receiver<ActivityState<R>> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ActivityState<R> {
        self.state.borrow().clone()
    }

    pub fn path(&self) -> &DocumentPath {
        &self.path
    }

    /// Restore state from the local mirror.
    ///
    /// Warns when the mirrored record started on an earlier day; it is never
    /// closed automatically.
    pub async fn load(&self) -> ActivityState<R> {
        let Some(record) = self.store.load_active::<R>(&self.agent_id).await else {
            if let Some(done) = self.queued_completions().await.pop() {
                self.state.send_replace(ActivityState::Completed(done));
            }
            return self.current();
        };

        if record.is_active() {
            if !self.network.is_online() {
                self.notices.info(format!(
                    "Loaded {} from local storage (offline mode)",
                    R::NOUN
                ));
            }
            self.warn_if_stale(&record);
            self.state.send_replace(ActivityState::Active(record));
        } else if record.pending_sync() {
            self.state.send_replace(ActivityState::Completed(record));
        }
        self.current()
    }

    /// Begin a new activity.
    ///
    /// With `retroactive` set, a failed location lookup records the
    /// unavailable placeholder instead of failing, and the record is flagged
    /// with the reason for review.
    pub async fn start(&self, retroactive: Option<String>) -> Result<R> {
        let _transition = self.begin_transition()?;

        if self.current().is_active() {
            return Err(Error::AlreadyExists(format!("an active {} already exists", R::NOUN)));
        }

        let mut online = self.network.is_online();
        if online {
            if let Err(e) = self.flush_completions().await {
                warn!("Earlier {} completion not pushed, starting offline: {}", R::NOUN, e);
                online = false;
            }
        }
        if online {
            match self.ledger.query_active(&self.path, R::START_FIELD).await {
                Ok(Some(doc)) => {
                    self.adopt(doc).await;
                    let err = Error::AlreadyExists(format!("an active {} already exists", R::NOUN));
                    self.notices.error(format!("{} failed: {}", R::START_ACTION, err));
                    return Err(err);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Could not check for an active {}, starting offline: {}", R::NOUN, e);
                    online = false;
                }
            }
        }

        let location = self.acquire_location(R::START_ACTION, retroactive.is_some()).await?;
        let mut record = R::begin(self.agent_id.clone(), location, Utc::now());
        if let Some(reason) = retroactive {
            record.mark_retroactive(R::LATE_START, reason);
        }

        if online {
            let write = record.creation_write()?;
            match self
                .retry
                .execute(|| self.ledger.create(&self.path, write.clone()))
                .await
            {
                Ok(id) => record.set_remote_id(id),
                Err(e) if e.is_transient() => {
                    warn!("{} not written to ledger, keeping it locally: {}", R::NOUN, e);
                    record.set_pending_sync(true);
                }
                Err(e) => {
                    self.notices.error(format!("{} failed: {}", R::START_ACTION, e));
                    return Err(e);
                }
            }
        } else {
            record.set_pending_sync(true);
        }

        self.mirror(&record).await;
        self.state.send_replace(ActivityState::Active(record.clone()));
        info!(
            "Started {} for {} (remote id: {:?}, pending sync: {})",
            R::NOUN,
            self.agent_id,
            record.remote_id(),
            record.pending_sync()
        );

        let mut message = record.started_message();
        if record.pending_sync() {
            message.push_str(" (saved offline, will sync when connected)");
        }
        self.notices.success(message);
        Ok(record)
    }

    /// Complete the active record and return it finalized.
    pub async fn end(&self, retroactive: Option<String>) -> Result<R> {
        let _transition = self.begin_transition()?;

        let mut record = match self.current() {
            ActivityState::Active(record) => record,
            _ => match self.store.load_active::<R>(&self.agent_id).await {
                Some(record) if record.is_active() => record,
                _ => {
                    let err = Error::NotFound(format!("no active {}", R::NOUN));
                    self.notices.error(format!("{} failed: {}", R::END_ACTION, err));
                    return Err(err);
                }
            },
        };

        let location = self.acquire_location(R::END_ACTION, retroactive.is_some()).await?;
        record.finish(location, Utc::now());
        if let Some(reason) = retroactive {
            record.mark_retroactive(R::LATE_END, reason);
        }

        if self.network.is_online() {
            if let Err(e) = self.push(&mut record).await {
                if !e.is_transient() {
                    self.notices.error(format!("{} failed: {}", R::END_ACTION, e));
                    return Err(e);
                }
                warn!("{} completion kept locally: {}", R::NOUN, e);
                record.set_pending_sync(true);
            }
        } else {
            record.set_pending_sync(true);
        }

        if record.pending_sync() {
            match self.store.push_pending_completion(&record).await {
                Ok(()) => self.clear_mirror().await,
                Err(e) => {
                    warn!("Could not queue {} completion, keeping it mirrored: {}", R::NOUN, e);
                    self.mirror(&record).await;
                }
            }
        } else {
            self.clear_mirror().await;
        }
        self.state.send_replace(ActivityState::Completed(record.clone()));
        info!(
            "Ended {} for {} (pending sync: {})",
            R::NOUN,
            self.agent_id,
            record.pending_sync()
        );

        let mut message = record.finished_message();
        if record.pending_sync() {
            message.push_str(" (saved offline, will sync when connected)");
        }
        self.notices.success(message);
        Ok(record)
    }

    /// Push transitions recorded offline.
    ///
    /// An offline start is not replayed when the ledger already has an
    /// active record; that record is adopted instead. Safe to call
    /// repeatedly and concurrently.
    pub async fn reconcile(&self) -> Result<()> {
        if !self.network.is_online() {
            return Ok(());
        }
        let _transition = self.transition.lock().await;

        let flushed = self.flush_completions().await?;
        let record = self
            .store
            .load_active::<R>(&self.agent_id)
            .await
            .filter(|record| record.pending_sync());
        let Some(mut record) = record else {
            if flushed > 0 {
                self.notices.info(format!("Offline {} synced", R::NOUN));
            }
            return Ok(());
        };
        info!("Reconciling offline {} for {}", R::NOUN, self.agent_id);

        if record.is_active() && record.remote_id().is_none() {
            if let Some(doc) = self.ledger.query_active(&self.path, R::START_FIELD).await? {
                info!("Ledger already has active {} {}, adopting it", R::NOUN, doc.id);
                self.adopt(doc).await;
                return Ok(());
            }
        }

        self.push(&mut record).await?;
        if record.is_active() {
            self.mirror(&record).await;
            self.state.send_replace(ActivityState::Active(record));
        } else {
            self.clear_mirror().await;
            self.state.send_replace(ActivityState::Completed(record));
        }
        self.notices.info(format!("Offline {} synced", R::NOUN));
        Ok(())
    }

    /// Open the live subscription to the ledger's active query.
    ///
    /// Replaces any open subscription. If the subscription fails, state
    /// falls back to the local mirror until the next attach.
    pub fn attach(self: &Arc<Self>) {
        let manager = Arc::downgrade(self);
        let mut snapshots = self.ledger.subscribe_active(&self.path, R::START_FIELD);

        let handle = tokio::spawn(async move {
            while let Some(item) = snapshots.next().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match item {
                    Ok(snapshot) => manager.apply_snapshot(snapshot).await,
                    Err(e) => {
                        manager.fall_back_to_mirror(e).await;
                        break;
                    }
                }
            }
        });

        if let Some(previous) = lock(&self.subscription).replace(handle) {
            previous.abort();
        }
        debug!("Subscribed to active {} at {}", R::NOUN, self.path);
    }

    /// Close the live subscription.
    pub fn detach(&self) {
        if let Some(handle) = lock(&self.subscription).take() {
            handle.abort();
            debug!("Unsubscribed from active {}", R::NOUN);
        }
    }

    /// Reconcile and resubscribe whenever connectivity returns.
    pub fn watch_network(self: &Arc<Self>) -> ListenerGuard {
        let manager = Arc::downgrade(self);
        self.network.add_listener(
            move || {
                let Some(manager) = manager.upgrade() else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = manager.reconcile().await {
                                warn!("Reconciling {} failed: {}", R::NOUN, e);
                            }
                            manager.attach();
                        });
                    }
                    Err(_) => warn!("No runtime available to reconcile {}", R::NOUN),
                }
            },
            || {},
        )
    }

    fn begin_transition(&self) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        self.transition.try_lock().map_err(|_| {
            Error::Conflict(format!("a {} transition is already in progress", R::NOUN))
        })
    }

    async fn acquire_location(&self, action: &str, retroactive: bool) -> Result<GeoPosition> {
        match self.location.get_location_with_retry().await {
            Ok(position) => Ok(position),
            Err(e) if retroactive => {
                warn!("Recording retroactive {} without location: {}", R::NOUN, e);
                Ok(GeoPosition::unavailable())
            }
            Err(e) => {
                self.notices.error(format!("{} failed: {}", action, e));
                Err(e)
            }
        }
    }

    /// Write `record` to the ledger: a create if it has no remote id yet,
    /// otherwise a completion merge. Clears `pending_sync` on success.
    async fn push(&self, record: &mut R) -> Result<()> {
        match record.remote_id().map(str::to_string) {
            None => {
                let write = record.creation_write()?;
                let id = self
                    .retry
                    .execute(|| self.ledger.create(&self.path, write.clone()))
                    .await?;
                record.set_remote_id(id);
            }
            Some(id) => {
                if !record.is_active() {
                    let write = record.completion_write()?;
                    self.retry
                        .execute(|| self.ledger.update(&self.path, &id, write.clone()))
                        .await?;
                }
            }
        }
        record.set_pending_sync(false);
        Ok(())
    }

    /// Push completions recorded offline, oldest first. Returns how many
    /// were pushed; on error the rest stay queued.
    async fn flush_completions(&self) -> Result<usize> {
        let mut queued = self.store.pending_completions::<R>(&self.agent_id).await?;
        let mut pushed = 0;
        while !queued.is_empty() {
            let mut record = queued.remove(0);
            if let Err(e) = self.push(&mut record).await {
                queued.insert(0, record);
                self.store
                    .save_pending_completions(&self.agent_id, &queued)
                    .await?;
                return Err(e);
            }
            self.store
                .save_pending_completions(&self.agent_id, &queued)
                .await?;
            pushed += 1;
            info!(
                "Pushed offline {} completion (remote id: {:?})",
                R::NOUN,
                record.remote_id()
            );

            let shown = matches!(
                &*self.state.borrow(),
                ActivityState::Completed(done) if done.started_at() == record.started_at()
            );
            if shown {
                self.state.send_replace(ActivityState::Completed(record));
            }
        }
        Ok(pushed)
    }

    async fn queued_completions(&self) -> Vec<R> {
        match self.store.pending_completions::<R>(&self.agent_id).await {
            Ok(queued) => queued,
            Err(e) => {
                warn!("Could not read queued {} completions: {}", R::NOUN, e);
                Vec::new()
            }
        }
    }

    /// Take a ledger document as the current active record.
    async fn adopt(&self, doc: LedgerDocument) {
        match doc.decode::<R>() {
            Ok(record) => {
                self.warn_if_stale(&record);
                self.mirror(&record).await;
                self.state.send_replace(ActivityState::Active(record));
            }
            Err(e) => warn!("Ignoring undecodable {} {}: {}", R::NOUN, doc.id, e),
        }
    }

    async fn apply_snapshot(&self, snapshot: Option<LedgerDocument>) {
        match snapshot {
            Some(doc) => {
                // Completion not pushed yet; the ledger still shows it active.
                let queued = self.queued_completions().await;
                if queued.iter().any(|r| r.remote_id() == Some(doc.id.as_str())) {
                    return;
                }
                let current = self.current();
                if let Ok(remote) = doc.decode::<R>() {
                    if current.active() == Some(&remote) {
                        return;
                    }
                }
                debug!("Ledger reports active {} {}", R::NOUN, doc.id);
                self.adopt(doc).await;
            }
            None => {
                if let ActivityState::Active(local) = self.current() {
                    if local.pending_sync() {
                        return;
                    }
                    info!("Active {} closed on the ledger", R::NOUN);
                    self.clear_mirror().await;
                    self.state.send_replace(ActivityState::Inactive);
                }
            }
        }
    }

    async fn fall_back_to_mirror(&self, err: Error) {
        warn!("Live {} subscription failed: {}", R::NOUN, err);
        if let Some(record) = self.store.load_active::<R>(&self.agent_id).await {
            if record.is_active() {
                self.state.send_replace(ActivityState::Active(record));
                self.notices.info(format!(
                    "Loaded {} from local storage (offline mode)",
                    R::NOUN
                ));
            }
        }
    }

    fn warn_if_stale(&self, record: &R) {
        if record.is_active() && is_previous_day(record.started_at(), Utc::now()) {
            let noun = R::NOUN;
            let mut capitalized = noun[..1].to_uppercase();
            capitalized.push_str(&noun[1..]);
            self.notices.warning(format!(
                "{} from previous day detected. Please end this {}.",
                capitalized, noun
            ));
        }
    }

    async fn mirror(&self, record: &R) {
        if let Err(e) = self.store.save_active(record).await {
            warn!("Could not mirror {} locally: {}", R::NOUN, e);
        }
    }

    async fn clear_mirror(&self) {
        if let Err(e) = self.store.clear_active::<R>(&self.agent_id).await {
            warn!("Could not clear local {} mirror: {}", R::NOUN, e);
        }
    }
}

impl<R: ActivityRecord> Drop for ActivityManager<R> {
    fn drop(&mut self) {
        self.detach();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
