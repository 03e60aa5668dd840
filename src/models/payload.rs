use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::alert::AlertRecord;

/// Body POSTed to the alert-intake route. Location is flattened into
/// `lat`/`lng`/`accuracy`, all null when no fix was shared or obtained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_id: Uuid,
    pub name: String,
    pub situation: String,
    pub message: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub accuracy: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl From<&AlertRecord> for AlertPayload {
    fn from(record: &AlertRecord) -> Self {
        Self {
            alert_id: record.id,
            name: record.name.clone(),
            situation: record.situation.as_str().to_string(),
            message: record.message.clone(),
            lat: record.location.map(|l| l.lat),
            lng: record.location.map(|l| l.lon),
            accuracy: record.location.map(|l| l.accuracy_meters),
            created_at: record.created_at,
        }
    }
}

/// Whatever the intake answers with. Only used for logging; both the
/// `{"status": "ok"}` and `{"ok": true}` shapes are seen in the wild.
#[derive(Debug, Default, Deserialize)]
pub struct IntakeAck {
    pub status: Option<String>,
    pub ok: Option<bool>,
}

impl IntakeAck {
    pub fn parse(body: &str) -> Option<Self> {
        if body.trim().is_empty() {
            return None;
        }
        serde_json::from_str(body).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::alert::{Location, Situation};
    use serde_json::Value;

    #[test]
    fn test_payload_without_location_has_null_fields() {
        let record = AlertRecord::new("", Situation::PhysicalViolence, "", None);
        let body: Value = serde_json::to_value(AlertPayload::from(&record)).unwrap();

        assert_eq!(body["name"], "unspecified");
        assert_eq!(body["situation"], "physical violence");
        assert_eq!(body["message"], "");
        assert!(body["lat"].is_null());
        assert!(body["lng"].is_null());
        assert!(body["accuracy"].is_null());
        assert_eq!(body["alert_id"], record.id.to_string());
    }

    #[test]
    fn test_payload_flattens_location() {
        let location = Location {
            lat: 20.652494,
            lon: -100.391404,
            accuracy_meters: 7.5,
            captured_at: Utc::now(),
        };
        let record = AlertRecord::new("Ana", Situation::Stalking, "near the bus stop", Some(location));
        let body: Value = serde_json::to_value(AlertPayload::from(&record)).unwrap();

        assert_eq!(body["lat"], 20.652494);
        assert_eq!(body["lng"], -100.391404);
        assert_eq!(body["accuracy"], 7.5);
        assert!(body.get("location").is_none());
    }

    #[test]
    fn test_ack_parsing_is_lenient() {
        assert_eq!(IntakeAck::parse(r#"{"status":"ok"}"#).unwrap().status.as_deref(), Some("ok"));
        assert_eq!(IntakeAck::parse(r#"{"ok":true,"extra":1}"#).unwrap().ok, Some(true));
        assert!(IntakeAck::parse("").is_none());
        assert!(IntakeAck::parse("<html>").is_none());
    }
}
