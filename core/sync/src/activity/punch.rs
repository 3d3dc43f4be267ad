use chrono::{DateTime, Utc};

use fieldsync_common::{format_duration, AgentId, GeoPosition};
use fieldsync_storage::{ActivityStatus, PunchRecord, RetroactiveType};

use super::record::ActivityRecord;

impl ActivityRecord for PunchRecord {
    const NOUN: &'static str = "punch";
    const SUBCOLLECTION: &'static str = "activePunch";
    const START_FIELD: &'static str = "punchInTime";
    const END_FIELD: &'static str = "punchOutTime";
    const COMPLETION_FIELDS: &'static [&'static str] = &[
        "punchOutLocation",
        "punchOutTime",
        "totalDuration",
        "durationFormatted",
        "retroactive",
        "retroactiveReason",
        "retroactiveType",
    ];
    const START_ACTION: &'static str = "Punch In";
    const END_ACTION: &'static str = "Punch Out";
    const LATE_START: RetroactiveType = RetroactiveType::LatePunchIn;
    const LATE_END: RetroactiveType = RetroactiveType::LatePunchOut;

    fn begin(agent_id: AgentId, location: GeoPosition, at: DateTime<Utc>) -> Self {
        PunchRecord {
            remote_id: None,
            agent_id,
            punch_in_location: location,
            punch_in_time: at,
            punch_out_location: None,
            punch_out_time: None,
            total_duration: None,
            duration_formatted: None,
            status: ActivityStatus::Active,
            retroactive: false,
            retroactive_reason: None,
            retroactive_type: None,
            pending_sync: false,
        }
    }

    fn finish(&mut self, location: GeoPosition, at: DateTime<Utc>) {
        let duration = (at - self.punch_in_time).num_milliseconds().max(0);
        self.total_duration = Some(duration);
        self.duration_formatted = Some(format_duration(duration));
        self.punch_out_location = Some(location);
        self.punch_out_time = Some(at);
        self.status = ActivityStatus::Completed;
    }

    fn mark_retroactive(&mut self, kind: RetroactiveType, reason: String) {
        self.retroactive = true;
        self.retroactive_type = Some(kind);
        self.retroactive_reason = Some(reason);
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.punch_in_time
    }

    fn status(&self) -> ActivityStatus {
        self.status
    }

    fn total_duration(&self) -> Option<i64> {
        self.total_duration
    }

    fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    fn set_remote_id(&mut self, id: String) {
        self.remote_id = Some(id);
    }

    fn pending_sync(&self) -> bool {
        self.pending_sync
    }

    fn set_pending_sync(&mut self, pending: bool) {
        self.pending_sync = pending;
    }

    fn started_message(&self) -> String {
        if self.punch_in_location.is_available() {
            format!("Punch In successful! Location: {}", self.punch_in_location)
        } else {
            "Punch In recorded (location unavailable, flagged for review)".to_string()
        }
    }

    fn finished_message(&self) -> String {
        format!(
            "Punch Out successful! Total time: {}",
            self.duration_formatted.as_deref().unwrap_or("00:00:00")
        )
    }
}
