//! Record kinds persisted by the durable local store.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fieldsync_common::{AgentId, GeoPosition};

/// A single-record type mirrored per agent in both tiers.
pub trait MirroredRecord: Serialize + DeserializeOwned + Send + Sync {
    /// Key prefix, combined with the agent id.
    const MIRROR_PREFIX: &'static str;

    fn agent_id(&self) -> &AgentId;

    /// Tier key for the given agent.
    fn mirror_key(agent_id: &AgentId) -> String {
        format!("{}_{}", Self::MIRROR_PREFIX, agent_id)
    }

    /// Tier key for completions recorded offline and not yet pushed.
    fn completions_key(agent_id: &AgentId) -> String {
        format!("{}_completions_{}", Self::MIRROR_PREFIX, agent_id)
    }
}

/// Lifecycle status of a trip or punch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Active,
    Completed,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

/// Which transition a retroactive entry corrects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetroactiveType {
    LatePunchIn,
    LatePunchOut,
    LateTripStart,
    LateTripEnd,
}

/// Active (or just completed) trip for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TripRecord {
    /// Ledger document id, absent until the start has reached the ledger.
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub agent_id: AgentId,
    pub start_location: GeoPosition,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_location: Option<GeoPosition>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    /// Great-circle distance between start and end, in km.
    #[serde(default)]
    pub total_distance: Option<f64>,
    /// Milliseconds between start and end.
    #[serde(default)]
    pub total_duration: Option<i64>,
    pub status: ActivityStatus,
    #[serde(default)]
    pub retroactive: bool,
    #[serde(default)]
    pub retroactive_reason: Option<String>,
    #[serde(default)]
    pub retroactive_type: Option<RetroactiveType>,
    /// Local changes not yet written to the ledger.
    #[serde(default)]
    pub pending_sync: bool,
}

impl MirroredRecord for TripRecord {
    const MIRROR_PREFIX: &'static str = "active_trip";

    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

/// Active (or just completed) punch for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PunchRecord {
    #[serde(default, rename = "id", skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub agent_id: AgentId,
    pub punch_in_location: GeoPosition,
    pub punch_in_time: DateTime<Utc>,
    #[serde(default)]
    pub punch_out_location: Option<GeoPosition>,
    #[serde(default)]
    pub punch_out_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration: Option<i64>,
    /// `HH:MM:SS` rendering of `total_duration`.
    #[serde(default)]
    pub duration_formatted: Option<String>,
    pub status: ActivityStatus,
    #[serde(default)]
    pub retroactive: bool,
    #[serde(default)]
    pub retroactive_reason: Option<String>,
    #[serde(default)]
    pub retroactive_type: Option<RetroactiveType>,
    #[serde(default)]
    pub pending_sync: bool,
}

impl MirroredRecord for PunchRecord {
    const MIRROR_PREFIX: &'static str = "active_punch";

    fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }
}

/// Upload status shared by queued records and in-memory image descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Queued,
    Error,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Uploaded => "uploaded",
            Self::Queued => "queued",
            Self::Error => "error",
        }
    }
}

/// An image waiting in the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingUploadRecord {
    /// Local id assigned by the queue store.
    #[serde(default)]
    pub id: i64,
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    /// Full payload as a `data:` URI.
    pub data_url: String,
    pub agent_id: AgentId,
    /// Destination prefix in the blob store.
    pub storage_path: String,
    pub status: UploadStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied when an image is first queued.
#[derive(Debug, Clone)]
pub struct NewPendingUpload {
    pub file_name: String,
    pub file_type: String,
    pub file_size: u64,
    pub data_url: String,
    pub agent_id: AgentId,
    pub storage_path: String,
}

impl NewPendingUpload {
    pub(crate) fn into_record(self) -> PendingUploadRecord {
        PendingUploadRecord {
            id: 0,
            file_name: self.file_name,
            file_type: self.file_type,
            file_size: self.file_size,
            data_url: self.data_url,
            agent_id: self.agent_id,
            storage_path: self.storage_path,
            status: UploadStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: Utc::now(),
        }
    }
}

/// Status of a queued visit submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Pending,
}

impl VisitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
        }
    }
}

/// A visit submission that could not complete synchronously.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingVisitRecord {
    #[serde(default)]
    pub id: i64,
    pub agent_id: AgentId,
    pub status: VisitStatus,
    /// Arbitrary visit form payload.
    pub payload: serde_json::Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirror_keys() {
        let agent = AgentId::new("a1").unwrap();
        assert_eq!(TripRecord::mirror_key(&agent), "active_trip_a1");
        assert_eq!(PunchRecord::mirror_key(&agent), "active_punch_a1");
    }

    #[test]
    fn test_trip_record_accepts_ledger_shaped_json() {
        let json = serde_json::json!({
            "id": "doc-1",
            "agentId": "a1",
            "startLocation": {
                "latitude": 1.0,
                "longitude": 2.0,
                "accuracy": 5.0,
                "timestamp": "2026-01-05T08:00:00Z"
            },
            "startTime": "2026-01-05T08:00:00Z",
            "status": "active"
        });
        let trip: TripRecord = serde_json::from_value(json).unwrap();
        assert_eq!(trip.remote_id.as_deref(), Some("doc-1"));
        assert_eq!(trip.status, ActivityStatus::Active);
        assert!(trip.end_location.is_none());
        assert!(!trip.pending_sync);
    }

    #[test]
    fn test_retroactive_type_wire_names() {
        let value = serde_json::to_value(RetroactiveType::LatePunchOut).unwrap();
        assert_eq!(value, "late_punch_out");
        assert_eq!(UploadStatus::Queued.as_str(), "queued");
    }
}
