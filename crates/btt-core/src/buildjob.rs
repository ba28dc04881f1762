//! Build job summaries and the analytics event payloads built from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::parser::ParseOutcome;
use crate::stage::{StageRecord, total_duration};

/// Key under which project info is attached to every event.
pub const PROJECT_INFO_KEY: &str = "buildtime_trend";

/// Version of the event payload layout.
pub const SCHEMA_VERSION: u32 = 1;

pub const BUILD_JOBS_COLLECTION: &str = "build_jobs";
pub const BUILD_SUBSTAGES_COLLECTION: &str = "build_substages";

/// Outcome of a job, derived from the exit code in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    Passed,
    Failed,
    #[default]
    Unknown,
}

impl JobResult {
    pub const fn from_exit_code(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => Self::Passed,
            Some(_) => Self::Failed,
            None => Self::Unknown,
        }
    }
}

/// Identifies which job a log belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Repository slug, e.g. `buildtimetrend/python-lib`.
    pub repo: Option<String>,
    pub build: Option<String>,
    pub job: Option<String>,
}

/// Project info attached to every event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub version: String,
    pub schema_version: String,
    pub project_name: String,
}

impl ProjectInfo {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            project_name: project_name.into(),
        }
    }
}

/// A parsed build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    #[serde(flatten)]
    pub meta: JobMeta,
    pub result: JobResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Sum of substage durations, in seconds.
    pub duration: u64,
    pub stages: Vec<StageRecord>,
}

impl BuildJob {
    pub fn from_outcome(meta: JobMeta, outcome: &ParseOutcome) -> Self {
        let stages = outcome.records();
        let started_at = stages.iter().find_map(|stage| stage.started_at);
        let finished_at = stages.iter().rev().find_map(|stage| stage.finished_at);

        Self {
            meta,
            result: JobResult::from_exit_code(outcome.exit_code()),
            started_at,
            finished_at,
            duration: total_duration(&stages),
            stages,
        }
    }

    fn project_info(&self, info: &ProjectInfo) -> ProjectInfo {
        let mut info = info.clone();
        if let Some(repo) = &self.meta.repo {
            info.project_name.clone_from(repo);
        }
        info
    }

    /// Event for the `build_jobs` collection.
    pub fn job_event(&self, info: &ProjectInfo) -> Value {
        let mut event = json!({
            "job": {
                "repo": self.meta.repo,
                "build": self.meta.build,
                "job": self.meta.job,
                "result": self.result,
                "started_at": self.started_at,
                "finished_at": self.finished_at,
                "duration": self.duration,
                "stages": self.stages.len(),
            },
            PROJECT_INFO_KEY: self.project_info(info),
        });
        if let Some(finished_at) = self.finished_at {
            event["keen"] = json!({ "timestamp": finished_at });
        }
        event
    }

    /// One event per substage for the `build_substages` collection.
    pub fn substage_events(&self, info: &ProjectInfo) -> Vec<Value> {
        let info = self.project_info(info);
        self.stages
            .iter()
            .map(|stage| {
                let mut event = json!({
                    "stage": stage,
                    "job": {
                        "repo": self.meta.repo,
                        "build": self.meta.build,
                        "job": self.meta.job,
                        "result": self.result,
                    },
                    PROJECT_INFO_KEY: info,
                });
                if let Some(finished_at) = stage.finished_at {
                    event["keen"] = json!({ "timestamp": finished_at });
                }
                event
            })
            .collect()
    }
}
