use chrono::{DateTime, Utc};

use fieldsync_common::{format_duration, AgentId, GeoPosition};
use fieldsync_storage::{ActivityStatus, RetroactiveType, TripRecord};

use super::record::ActivityRecord;
use crate::geo::distance_between;

impl ActivityRecord for TripRecord {
    const NOUN: &'static str = "trip";
    const SUBCOLLECTION: &'static str = "trips";
    const START_FIELD: &'static str = "startTime";
    const END_FIELD: &'static str = "endTime";
    const COMPLETION_FIELDS: &'static [&'static str] = &[
        "endLocation",
        "endTime",
        "totalDistance",
        "totalDuration",
        "retroactive",
        "retroactiveReason",
        "retroactiveType",
    ];
    const START_ACTION: &'static str = "Trip start";
    const END_ACTION: &'static str = "Trip end";
    const LATE_START: RetroactiveType = RetroactiveType::LateTripStart;
    const LATE_END: RetroactiveType = RetroactiveType::LateTripEnd;

    fn begin(agent_id: AgentId, location: GeoPosition, at: DateTime<Utc>) -> Self {
        TripRecord {
            remote_id: None,
            agent_id,
            start_location: location,
            start_time: at,
            end_location: None,
            end_time: None,
            total_distance: None,
            total_duration: None,
            status: ActivityStatus::Active,
            retroactive: false,
            retroactive_reason: None,
            retroactive_type: None,
            pending_sync: false,
        }
    }

    fn finish(&mut self, location: GeoPosition, at: DateTime<Utc>) {
        self.total_distance = Some(distance_between(&self.start_location, &location));
        self.total_duration = Some((at - self.start_time).num_milliseconds().max(0));
        self.end_location = Some(location);
        self.end_time = Some(at);
        self.status = ActivityStatus::Completed;
    }

    fn mark_retroactive(&mut self, kind: RetroactiveType, reason: String) {
        self.retroactive = true;
        self.retroactive_type = Some(kind);
        self.retroactive_reason = Some(reason);
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.start_time
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
        if self.start_location.is_available() {
            format!("Trip started! Location: {}", self.start_location)
        } else {
            "Trip started (location unavailable, flagged for review)".to_string()
        }
    }

    fn finished_message(&self) -> String {
        format!(
            "Trip ended! Distance: {:.2} km | Duration: {}",
            self.total_distance.unwrap_or(0.0),
            format_duration(self.total_duration.unwrap_or(0))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn agent() -> AgentId {
        AgentId::new("agent-3").unwrap()
    }

    #[test]
    fn test_finish_computes_distance_and_duration() {
        let start = Utc::now() - Duration::minutes(90);
        let mut trip = TripRecord::begin(agent(), GeoPosition::new(0.0, 0.0, 5.0), start);
        trip.finish(GeoPosition::new(0.0, 1.0, 5.0), start + Duration::minutes(90));

        assert_eq!(trip.status, ActivityStatus::Completed);
        assert!((trip.total_distance.unwrap() - 111.19).abs() < 0.01);
        assert_eq!(trip.total_duration, Some(90 * 60 * 1000));
        assert_eq!(
            trip.finished_message(),
            "Trip ended! Distance: 111.19 km | Duration: 01:30:00"
        );
    }

    #[test]
    fn test_unavailable_start_records_zero_distance() {
        let start = Utc::now();
        let mut trip = TripRecord::begin(agent(), GeoPosition::unavailable(), start);
        trip.mark_retroactive(RetroactiveType::LateTripStart, "forgot to start".into());
        trip.finish(GeoPosition::new(10.0, 10.0, 5.0), start);

        assert_eq!(trip.total_distance, Some(0.0));
        assert!(trip.retroactive);
        assert!(trip.started_message().contains("location unavailable"));
    }

    #[test]
    fn test_completion_write_fields() {
        let start = Utc::now();
        let mut trip = TripRecord::begin(agent(), GeoPosition::new(1.0, 1.0, 5.0), start);
        trip.set_remote_id("doc-1".into());
        trip.finish(GeoPosition::new(1.0, 1.0, 5.0), start);

        let write = trip.completion_write().unwrap();
        assert_eq!(write.fields["status"], "completed");
        assert_eq!(write.fields["totalDistance"], 0.0);
        assert!(write.fields.contains_key("endLocation"));
        assert!(!write.fields.contains_key("endTime"));
        assert!(!write.fields.contains_key("retroactiveReason"));
        assert_eq!(write.server_timestamps, vec!["endTime".to_string()]);

        let create = trip.creation_write().unwrap();
        assert!(!create.fields.contains_key("id"));
        assert!(!create.fields.contains_key("pendingSync"));
    }

    #[test]
    fn test_offline_writes_keep_device_times() {
        let start = Utc::now();
        let mut trip = TripRecord::begin(agent(), GeoPosition::new(1.0, 1.0, 5.0), start);
        trip.set_pending_sync(true);

        let create = trip.creation_write().unwrap();
        assert!(create.server_timestamps.is_empty());
        assert!(create.fields.contains_key("startTime"));

        trip.finish(GeoPosition::new(1.0, 1.0, 5.0), start);
        let complete = trip.completion_write().unwrap();
        assert!(complete.fields.contains_key("endTime"));
        assert!(complete.server_timestamps.is_empty());
    }
}
