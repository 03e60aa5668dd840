use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Name recorded when the reporter leaves the field blank.
pub const UNSPECIFIED_NAME: &str = "unspecified";

/// Fixed set of situation categories an alert can be raised for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Situation {
    #[serde(rename = "physical violence")]
    PhysicalViolence,
    #[serde(rename = "verbal threat")]
    VerbalThreat,
    #[serde(rename = "stalking")]
    Stalking,
    #[serde(rename = "other")]
    Other,
}

impl Situation {
    pub const ALL: [Situation; 4] = [
        Situation::PhysicalViolence,
        Situation::VerbalThreat,
        Situation::Stalking,
        Situation::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Situation::PhysicalViolence => "physical violence",
            Situation::VerbalThreat => "verbal threat",
            Situation::Stalking => "stalking",
            Situation::Other => "other",
        }
    }
}

impl fmt::Display for Situation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown situation: {0}")]
pub struct UnknownSituation(pub String);

impl FromStr for Situation {
    type Err = UnknownSituation;

    /// Accepts the wire label ("physical violence") as well as the
    /// snake/kebab forms typed at a console ("physical_violence").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace(['_', '-'], " ");
        Situation::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == normalized)
            .ok_or_else(|| UnknownSituation(s.to_string()))
    }
}

/// A single best-effort position reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
    pub accuracy_meters: f64,
    pub captured_at: DateTime<Utc>,
}

impl Location {
    pub fn accuracy_grade(&self) -> &'static str {
        if self.accuracy_meters <= 5.0 {
            "excellent"
        } else if self.accuracy_meters <= 10.0 {
            "good"
        } else {
            "fair"
        }
    }
}

/// The unit of work: one alert raised by one completed hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub id: Uuid,
    pub name: String,
    pub situation: Situation,
    pub message: String,
    pub location: Option<Location>,
    pub created_at: DateTime<Utc>,
    pub delivered: bool,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivered_via: Option<String>,
    pub retry_count: u32,
}

impl AlertRecord {
    pub fn new(
        name: &str,
        situation: Situation,
        message: &str,
        location: Option<Location>,
    ) -> Self {
        let name = name.trim();
        Self {
            id: Uuid::new_v4(),
            name: if name.is_empty() {
                UNSPECIFIED_NAME.to_string()
            } else {
                name.to_string()
            },
            situation,
            message: message.trim().to_string(),
            location,
            // Millisecond precision keeps the value identical across both stores.
            created_at: Utc::now().trunc_subsecs(3),
            delivered: false,
            delivered_at: None,
            delivered_via: None,
            retry_count: 0,
        }
    }

    /// Delivery bookkeeping. Returns false if the record was already delivered.
    pub fn mark_delivered(&mut self, endpoint: &str, at: DateTime<Utc>) -> bool {
        if self.delivered {
            return false;
        }
        self.delivered = true;
        self.delivered_at = Some(at);
        self.delivered_via = Some(endpoint.to_string());
        true
    }
}
