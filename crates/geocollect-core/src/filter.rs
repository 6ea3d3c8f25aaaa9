use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Restriction applied to a data fetch.
///
/// Both time bounds are exclusive: a record is kept when
/// `discard_before < timestamp < discard_after`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discard_after: Option<DateTime<Utc>>,
    /// Spatial restriction as WKT. Interpreted by the data accessor only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Return only the most recent record matching the remaining constraints.
    #[serde(default)]
    pub last_value_only: bool,
}

impl Filter {
    /// Merge the job's static filter with the last timestamp durably recorded
    /// for the job. The later lower bound always wins so already-processed
    /// data is never fetched again.
    pub fn with_last_timestamp(&self, last: Option<DateTime<Utc>>) -> Filter {
        let mut merged = self.clone();
        merged.discard_before = match (self.discard_before, last) {
            (Some(configured), Some(seen)) => Some(configured.max(seen)),
            (configured, seen) => configured.or(seen),
        };
        merged
    }

    /// Whether `timestamp` falls inside the time window.
    pub fn accepts(&self, timestamp: DateTime<Utc>) -> bool {
        self.discard_before.map_or(true, |b| timestamp > b)
            && self.discard_after.map_or(true, |a| timestamp < a)
    }
}
