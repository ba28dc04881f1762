//! Destination for analytics events.
//!
//! The analytics backend is external; anything that can accept events for a
//! named collection implements [`AnalyticsSink`].

use std::io::Write;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::buildjob::{
    BUILD_JOBS_COLLECTION, BUILD_SUBSTAGES_COLLECTION, BuildJob, ProjectInfo,
};

pub trait AnalyticsSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn add_event(&mut self, collection: &str, event: Value) -> Result<(), Self::Error>;

    fn add_events(&mut self, collection: &str, events: Vec<Value>) -> Result<(), Self::Error> {
        for event in events {
            self.add_event(collection, event)?;
        }
        Ok(())
    }
}

/// Sends a job event and its substage events. Returns the number of events.
pub fn submit_build_job<S: AnalyticsSink>(
    sink: &mut S,
    job: &BuildJob,
    info: &ProjectInfo,
) -> Result<usize, S::Error> {
    let substages = job.substage_events(info);
    let count = substages.len() + 1;

    sink.add_event(BUILD_JOBS_COLLECTION, job.job_event(info))?;
    sink.add_events(BUILD_SUBSTAGES_COLLECTION, substages)?;

    tracing::info!(
        repo = job.meta.repo.as_deref().unwrap_or_default(),
        job = job.meta.job.as_deref().unwrap_or_default(),
        events = count,
        "submitted build job"
    );
    Ok(count)
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write event: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode event: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct JsonlLine<'a> {
    collection: &'a str,
    event: &'a Value,
}

/// Writes each event as one JSON line: `{"collection": ..., "event": ...}`.
#[derive(Debug)]
pub struct JsonlSink<W: Write> {
    writer: W,
    written: usize,
}

impl<W: Write> JsonlSink<W> {
    pub const fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub const fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> AnalyticsSink for JsonlSink<W> {
    type Error = SinkError;

    fn add_event(&mut self, collection: &str, event: Value) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&JsonlLine {
            collection,
            event: &event,
        })?;
        writeln!(self.writer, "{line}")?;
        self.written += 1;
        Ok(())
    }

    fn add_events(&mut self, collection: &str, events: Vec<Value>) -> Result<(), Self::Error> {
        for event in events {
            self.add_event(collection, event)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
