//! Outbox for visit submissions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use fieldsync_common::{AgentId, Error, Result};
use fieldsync_storage::{LocalStore, PendingVisitRecord};

use crate::config::EngineConfig;
use crate::network::{ListenerGuard, NetworkMonitor};
use crate::notice::NoticeBus;
use crate::remote::{DocumentPath, LedgerWrite, RemoteLedger};
use crate::retry::RetryExecutor;
use crate::upload::DrainReport;

/// Ledger subcollection for visits.
pub const VISITS_SUBCOLLECTION: &str = "visits";

/// Where a submitted visit ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VisitSubmission {
    /// Written to the ledger under this document id.
    Delivered(String),
    /// Stored locally under this pending id.
    Queued(i64),
}

pub struct VisitOutbox {
    agent_id: AgentId,
    path: DocumentPath,
    store: LocalStore,
    ledger: Arc<dyn RemoteLedger>,
    network: Arc<NetworkMonitor>,
    notices: NoticeBus,
    retry: RetryExecutor,
    syncing: AtomicBool,
}

impl VisitOutbox {
    pub fn new(
        agent_id: AgentId,
        store: LocalStore,
        ledger: Arc<dyn RemoteLedger>,
        network: Arc<NetworkMonitor>,
        notices: NoticeBus,
        config: &EngineConfig,
    ) -> Self {
        let path = DocumentPath::new(
            config.agent_collection.clone(),
            agent_id.clone(),
            VISITS_SUBCOLLECTION,
        );
        Self {
            agent_id,
            path,
            store,
            ledger,
            network,
            notices,
            retry: RetryExecutor::new(config.retry.to_retry_config()),
            syncing: AtomicBool::new(false),
        }
    }

    /// Submit a visit, queueing it when it cannot be delivered now.
    pub async fn submit(&self, payload: Value) -> Result<VisitSubmission> {
        let Value::Object(fields) = payload else {
            return Err(Error::InvalidInput("visit payload must be an object".to_string()));
        };

        if self.network.is_online() {
            let write = LedgerWrite {
                fields: fields.clone(),
                server_timestamps: vec!["createdAt".to_string()],
            };
            match self
                .retry
                .execute(|| self.ledger.create(&self.path, write.clone()))
                .await
            {
                Ok(id) => {
                    info!("Visit {} submitted for {}", id, self.agent_id);
                    self.notices.success("Visit submitted successfully!");
                    return Ok(VisitSubmission::Delivered(id));
                }
                Err(e) if e.is_transient() => {
                    warn!("Visit submission failed, queueing: {}", e);
                }
                Err(e) => {
                    self.notices.error(format!("Visit submission failed: {}", e));
                    return Err(e);
                }
            }
        }

        let id = self
            .store
            .save_pending_visit(&self.agent_id, Value::Object(fields))
            .await?;
        self.notices
            .warning("Visit saved offline. Will sync when connected.");
        Ok(VisitSubmission::Queued(id))
    }

    /// Visits still waiting for delivery.
    pub async fn pending(&self) -> Result<Vec<PendingVisitRecord>> {
        self.store.pending_visits(&self.agent_id).await
    }

    /// Deliver every pending visit once; failures keep their record.
    pub async fn drain(&self) -> Result<DrainReport> {
        if !self.network.is_online() || self.syncing.swap(true, Ordering::SeqCst) {
            return Ok(DrainReport {
                skipped: true,
                ..DrainReport::default()
            });
        }
        let result = self.drain_pending().await;
        self.syncing.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_pending(&self) -> Result<DrainReport> {
        let visits = self.pending().await?;
        debug!("Draining {} pending visits", visits.len());

        let mut report = DrainReport::default();
        for visit in visits {
            report.attempted += 1;
            let mut write = match &visit.payload {
                Value::Object(fields) => LedgerWrite {
                    fields: fields.clone(),
                    server_timestamps: Vec::new(),
                },
                _ => LedgerWrite::new().set("payload", visit.payload.clone()),
            };
            write = write
                .set("createdAt", visit.created_at.to_rfc3339())
                .set("syncedOffline", true)
                .server_timestamp("syncedAt");

            match self.ledger.create(&self.path, write).await {
                Ok(id) => {
                    if let Err(e) = self.store.delete_pending_visit(visit.id).await {
                        warn!("Delivered visit #{} as {} but could not delete it: {}", visit.id, id, e);
                    }
                    report.uploaded += 1;
                }
                Err(e) => {
                    warn!("Pending visit #{} failed: {}", visit.id, e);
                    let message = e.to_string();
                    let updated = self
                        .store
                        .update_pending_visit(visit.id, move |v| {
                            v.retry_count += 1;
                            v.last_error = Some(message);
                        })
                        .await;
                    if let Err(e) = updated {
                        warn!("Could not record retry for visit #{}: {}", visit.id, e);
                    }
                    report.failed += 1;
                }
            }
        }

        report.remaining = self.pending().await?.len();
        info!(
            "Visit drain finished: {} attempted, {} delivered, {} failed",
            report.attempted, report.uploaded, report.failed
        );
        if report.uploaded > 0 {
            self.notices
                .success(format!("{} offline visit(s) synced", report.uploaded));
        }
        Ok(report)
    }

    /// Drain whenever connectivity returns.
    pub fn watch_network(self: &Arc<Self>) -> ListenerGuard {
        let outbox = Arc::downgrade(self);
        self.network.add_listener(
            move || {
                let Some(outbox) = outbox.upgrade() else {
                    return;
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = outbox.drain().await {
                                warn!("Visit drain failed: {}", e);
                            }
                        });
                    }
                    Err(_) => warn!("No runtime available to drain visits"),
                }
            },
            || {},
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryLedger;
    use serde_json::json;

    fn outbox(online: bool) -> (VisitOutbox, MemoryLedger, Arc<NetworkMonitor>) {
        let ledger = MemoryLedger::new();
        let network = Arc::new(NetworkMonitor::new(online));
        let outbox = VisitOutbox::new(
            AgentId::new("agent-2").unwrap(),
            LocalStore::ephemeral(),
            Arc::new(ledger.clone()),
            network.clone(),
            NoticeBus::default(),
            &EngineConfig::default(),
        );
        (outbox, ledger, network)
    }

    #[tokio::test]
    async fn test_online_submit() {
        let (outbox, ledger, _) = outbox(true);
        let result = outbox
            .submit(json!({"customer": "Acme", "notes": "restocked"}))
            .await
            .unwrap();

        assert!(matches!(result, VisitSubmission::Delivered(_)));
        let docs = ledger.documents(&outbox.path);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].fields["customer"], "Acme");
        assert!(docs[0].fields.contains_key("createdAt"));
    }

    #[tokio::test]
    async fn test_offline_submit_and_drain() {
        let (outbox, ledger, network) = outbox(false);
        let queued = outbox.submit(json!({"customer": "Acme"})).await.unwrap();
        assert!(matches!(queued, VisitSubmission::Queued(_)));
        assert_eq!(outbox.pending().await.unwrap().len(), 1);

        assert!(outbox.drain().await.unwrap().skipped);

        network.report(true);
        ledger.fail_next_writes(1);
        let report = outbox.drain().await.unwrap();
        assert_eq!((report.failed, report.remaining), (1, 1));
        assert_eq!(outbox.pending().await.unwrap()[0].retry_count, 1);

        let report = outbox.drain().await.unwrap();
        assert_eq!((report.uploaded, report.remaining), (1, 0));
        let docs = ledger.documents(&outbox.path);
        assert_eq!(docs[0].fields["syncedOffline"], true);
    }

    #[tokio::test]
    async fn test_rejects_non_object_payload() {
        let (outbox, _, _) = outbox(true);
        assert!(matches!(
            outbox.submit(json!(["not", "an", "object"])).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
