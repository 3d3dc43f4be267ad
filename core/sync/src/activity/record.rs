//! Record behavior shared by trips and punches.

use std::fmt::Debug;

use chrono::{DateTime, Local, Utc};
use serde_json::Value;

use fieldsync_common::{AgentId, GeoPosition, Result};
use fieldsync_storage::{ActivityStatus, MirroredRecord, RetroactiveType};

use crate::remote::LedgerWrite;

/// Fields mirrored locally but never written to the ledger.
const LOCAL_ONLY_FIELDS: &[&str] = &["id", "pendingSync"];

/// A single-active activity kind managed by [`super::ActivityManager`].
pub trait ActivityRecord: MirroredRecord + Clone + Debug + PartialEq + 'static {
    /// Lower-case noun for messages ("trip", "punch").
    const NOUN: &'static str;
    /// Ledger subcollection under the agent document.
    const SUBCOLLECTION: &'static str;
    /// Field holding the start time; the active query orders by it.
    const START_FIELD: &'static str;
    /// Field holding the end time.
    const END_FIELD: &'static str;
    /// Fields written when the activity completes.
    const COMPLETION_FIELDS: &'static [&'static str];
    /// Action names used in failure notices.
    const START_ACTION: &'static str;
    const END_ACTION: &'static str;
    const LATE_START: RetroactiveType;
    const LATE_END: RetroactiveType;

    /// New active record.
    fn begin(agent_id: AgentId, location: GeoPosition, at: DateTime<Utc>) -> Self;

    /// Complete the record, computing duration (and distance where relevant).
    fn finish(&mut self, location: GeoPosition, at: DateTime<Utc>);

    /// Flag the record for review.
    fn mark_retroactive(&mut self, kind: RetroactiveType, reason: String);

    fn started_at(&self) -> DateTime<Utc>;
    fn status(&self) -> ActivityStatus;
    /// Milliseconds between start and end once completed.
    fn total_duration(&self) -> Option<i64>;
    fn remote_id(&self) -> Option<&str>;
    fn set_remote_id(&mut self, id: String);
    fn pending_sync(&self) -> bool;
    fn set_pending_sync(&mut self, pending: bool);

    /// Success notice after a start.
    fn started_message(&self) -> String;
    /// Success notice after an end.
    fn finished_message(&self) -> String;

    fn is_active(&self) -> bool {
        self.status() == ActivityStatus::Active
    }

    /// Whole record as a ledger write. Live starts let the ledger stamp the
    /// start time; replays of offline starts keep the device time.
    fn creation_write(&self) -> Result<LedgerWrite> {
        let mut write = LedgerWrite::from_value(self)?;
        for key in LOCAL_ONLY_FIELDS {
            write = write.without(key);
        }
        if !self.pending_sync() {
            write = write.server_timestamp(Self::START_FIELD);
        }
        Ok(write)
    }

    /// Completion fields as a ledger merge.
    fn completion_write(&self) -> Result<LedgerWrite> {
        let full = LedgerWrite::from_value(self)?;
        let mut write = LedgerWrite::new();
        for key in Self::COMPLETION_FIELDS {
            if let Some(value) = full.fields.get(*key) {
                if !value.is_null() {
                    write = write.set(*key, value.clone());
                }
            }
        }
        if !self.pending_sync() {
            write = write.without(Self::END_FIELD).server_timestamp(Self::END_FIELD);
        }
        Ok(write.set("status", Value::from(ActivityStatus::Completed.as_str())))
    }
}

/// Whether `started` falls on an earlier local calendar day than `now`.
pub fn is_previous_day(started: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    started.with_timezone(&Local).date_naive() < now.with_timezone(&Local).date_naive()
}
