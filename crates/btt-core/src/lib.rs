//! Core domain logic for buildtime trend.
//!
//! This crate contains the fundamental types and logic for:
//! - Tags: recognizing Travis CI timing and fold markers in log lines
//! - Substages: assembling timed units of work from those markers
//! - Parsing: driving both over a log stream with size and cancellation guards
//! - Build jobs: shaping parsed substages into analytics events

mod anomaly;
pub mod buildjob;
pub mod format;
pub mod parser;
pub mod sink;
mod stage;
pub mod substage;
pub mod tags;

pub use anomaly::Anomaly;
pub use buildjob::{BuildJob, JobMeta, JobResult, ProjectInfo};
pub use format::{format_duration, format_timestamp};
pub use parser::{
    CancelToken, LogParser, ParseError, ParseEvent, ParseOptions, ParseOutcome, StopReason,
};
pub use sink::{AnalyticsSink, JsonlSink, SinkError, submit_build_job};
pub use stage::{StageRecord, total_duration};
pub use substage::{Substage, SubstageState, SubstageTracker, TimestampUnit, transition};
pub use tags::{Tag, TagError, TagKind, TagMatch, TagMatcher};
