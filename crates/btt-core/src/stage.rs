//! Stage records handed to the analytics backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::substage::Substage;

/// A completed substage in its reporting shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub command: String,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds.
    pub duration: u64,
    #[serde(default)]
    pub finished_incomplete: bool,
}

impl From<&Substage> for StageRecord {
    fn from(substage: &Substage) -> Self {
        Self {
            name: substage.display_name().to_string(),
            command: substage.command.clone(),
            started_at: substage.started_at(),
            finished_at: substage.finished_at(),
            duration: substage.duration,
            finished_incomplete: substage.finished_incomplete,
        }
    }
}

/// Sum of all record durations, in seconds.
pub fn total_duration(records: &[StageRecord]) -> u64 {
    records.iter().map(|record| record.duration).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_from_substage() {
        let substage = Substage {
            name: "install.1".to_string(),
            hash: "abc".to_string(),
            command: "pip install .".to_string(),
            start_timestamp: 1_418_665_435,
            finish_timestamp: 1_418_665_480,
            duration: 45,
            finished_incomplete: false,
        };

        let record = StageRecord::from(&substage);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "name": "install.1",
                "command": "pip install .",
                "started_at": "2014-12-15T17:43:55Z",
                "finished_at": "2014-12-15T17:44:40Z",
                "duration": 45,
                "finished_incomplete": false,
            })
        );
    }

    #[test]
    fn unset_timestamps_serialize_as_null() {
        let substage = Substage {
            hash: "abc".to_string(),
            finished_incomplete: true,
            ..Substage::default()
        };
        let json = serde_json::to_value(StageRecord::from(&substage)).unwrap();

        assert_eq!(json["name"], "abc");
        assert!(json["started_at"].is_null());
        assert!(json["finished_at"].is_null());
        assert!(json.as_object().unwrap().contains_key("finished_at"));
        assert!(json.get("command").is_none());
    }

    #[test]
    fn total_duration_sums_records() {
        let records: Vec<StageRecord> = [10, 25, 5]
            .into_iter()
            .map(|duration| {
                StageRecord::from(&Substage {
                    name: format!("script.{duration}"),
                    duration,
                    finish_timestamp: 1,
                    ..Substage::default()
                })
            })
            .collect();

        assert_eq!(total_duration(&records), 40);
    }
}
