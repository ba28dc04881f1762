//! Shared output for commands that parse job logs.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufWriter, Write};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use btt_core::{
    BuildJob, CancelToken, JobMeta, JsonlSink, LogParser, ParseError, ParseOptions, ParseOutcome,
    ProjectInfo, StopReason, format_duration, submit_build_job,
};
use clap::Args;
use serde::Serialize;

use crate::Config;

/// Identifies the job a log belongs to.
#[derive(Debug, Clone, Default, Args)]
pub struct JobArgs {
    /// Repository slug, e.g. buildtimetrend/python-lib.
    #[arg(long)]
    pub repo: Option<String>,

    /// Build number.
    #[arg(long)]
    pub build: Option<String>,

    /// Job number or ID.
    #[arg(long)]
    pub job: Option<String>,
}

impl JobArgs {
    pub fn meta(&self) -> JobMeta {
        JobMeta {
            repo: self.repo.clone(),
            build: self.build.clone(),
            job: self.job.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Args)]
pub struct OutputArgs {
    /// Output as JSON.
    #[arg(long)]
    pub json: bool,

    /// Append analytics events to the configured events file.
    #[arg(long)]
    pub submit: bool,
}

/// One parsed job log.
#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    /// File path or job ID the log came from.
    pub source: String,
    pub stop: StopReason,
    pub lines: usize,
    pub bytes: u64,
    pub anomalies: usize,
    pub job: BuildJob,
}

impl JobReport {
    pub fn new(source: impl Into<String>, meta: JobMeta, outcome: &ParseOutcome) -> Self {
        Self {
            source: source.into(),
            stop: outcome.stop,
            lines: outcome.lines,
            bytes: outcome.bytes,
            anomalies: outcome.anomalies,
            job: BuildJob::from_outcome(meta, outcome),
        }
    }
}

/// Returns a token that is cancelled once `timeout_secs` have passed.
pub fn cancel_after(timeout_secs: Option<u64>) -> CancelToken {
    let token = CancelToken::new();
    if let Some(secs) = timeout_secs {
        let timer = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(secs));
            tracing::warn!(timeout_secs = secs, "parse timeout reached");
            timer.cancel();
        });
    }
    token
}

/// Parses an in-memory log, such as one downloaded from Travis CI.
pub fn parse_log<R: BufRead>(
    source: &str,
    meta: JobMeta,
    log: R,
    options: ParseOptions,
    cancel: &CancelToken,
) -> Result<JobReport> {
    let outcome = LogParser::new(options)
        .with_cancel(cancel.clone())
        .parse(log)
        .inspect_err(|err| {
            if let ParseError::Source { partial, .. } = err {
                tracing::warn!(source, substages = partial.len(), "discarding partial job log");
            }
        })
        .with_context(|| format!("failed to parse log of job {source}"))?;
    Ok(JobReport::new(source, meta, &outcome))
}

/// Writes reports as text or JSON and submits them when requested.
pub fn emit<W: Write>(
    writer: &mut W,
    reports: &[JobReport],
    output: OutputArgs,
    config: &Config,
) -> Result<()> {
    if output.json {
        writeln!(writer, "{}", serde_json::to_string_pretty(reports)?)?;
    } else {
        for report in reports {
            render_summary(writer, report)?;
        }
    }

    if output.submit {
        let count = submit(config, reports)?;
        if !output.json {
            writeln!(
                writer,
                "Submitted {count} events to {}",
                config.events_path.display()
            )?;
        }
    }
    Ok(())
}

fn render_summary<W: Write>(writer: &mut W, report: &JobReport) -> Result<()> {
    let job = &report.job;
    let result = serde_json::to_value(job.result)?;
    let result = result.as_str().unwrap_or_default();

    write!(
        writer,
        "{}: {} substages, {} ({result})",
        report.source,
        job.stages.len(),
        format_duration(job.duration),
    )?;
    if report.anomalies > 0 {
        write!(writer, ", {} anomalies", report.anomalies)?;
    }
    match report.stop {
        StopReason::Cancelled => write!(writer, " [cancelled]")?,
        StopReason::SizeLimit => write!(writer, " [truncated]")?,
        StopReason::EndOfStream | StopReason::EndOfJob { .. } => {}
    }
    writeln!(writer)?;

    let width = job
        .stages
        .iter()
        .map(|stage| stage.name.chars().count())
        .max()
        .unwrap_or(0);
    for stage in &job.stages {
        write!(
            writer,
            "  {:<width$}  {}",
            stage.name,
            format_duration(stage.duration)
        )?;
        if stage.finished_incomplete {
            write!(writer, " (incomplete)")?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Appends the events of every report to `config.events_path`.
fn submit(config: &Config, reports: &[JobReport]) -> Result<usize> {
    if let Some(parent) = config
        .events_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
    {
        fs::create_dir_all(parent).context("failed to create events directory")?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&config.events_path)
        .with_context(|| format!("failed to open {}", config.events_path.display()))?;
    let mut sink = JsonlSink::new(BufWriter::new(file));
    let info = ProjectInfo::new(&config.project_name);

    let mut total = 0;
    for report in reports {
        total += submit_build_job(&mut sink, &report.job, &info)
            .with_context(|| format!("failed to write events for {}", report.source))?;
    }
    sink.into_inner()
        .flush()
        .context("failed to flush events file")?;

    tracing::info!(events = total, path = %config.events_path.display(), "events submitted");
    Ok(total)
}
