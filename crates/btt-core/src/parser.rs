//! Single-pass reader that turns a job log into substages.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::anomaly::Anomaly;
use crate::stage::StageRecord;
use crate::substage::{Substage, SubstageTracker, TimestampUnit};
use crate::tags::{Tag, TagMatcher};

/// Buffer size for `BufReader` (64KB for optimal performance on large files)
const BUFFER_SIZE: usize = 64 * 1024;

/// Written by the worker after the last build command.
const END_OF_JOB_MARKER: &str = "Done. Your build exited with ";

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 64 * 1024 * 1024;

/// Limits and policies for one parse pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOptions {
    /// Longer lines are skipped.
    pub max_line_bytes: usize,
    /// The pass stops once this many bytes have been read.
    pub max_total_bytes: u64,
    /// Emit a substage left open at the end of the log as incomplete
    /// instead of dropping it.
    pub flush_unterminated: bool,
    pub timestamp_unit: TimestampUnit,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            flush_unterminated: true,
            timestamp_unit: TimestampUnit::Auto,
        }
    }
}

/// Cooperative cancellation flag, checked once per line.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why a parse pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    EndOfStream,
    EndOfJob { exit_code: i32 },
    Cancelled,
    SizeLimit,
}

/// Result of a parse pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Completed substages, in the order their end markers appeared.
    pub substages: Vec<Substage>,
    pub lines: usize,
    pub bytes: u64,
    pub stop: StopReason,
    pub anomalies: usize,
}

impl Default for ParseOutcome {
    fn default() -> Self {
        Self {
            substages: Vec::new(),
            lines: 0,
            bytes: 0,
            stop: StopReason::EndOfStream,
            anomalies: 0,
        }
    }
}

impl ParseOutcome {
    /// Sum of all substage durations, in seconds.
    pub fn total_duration(&self) -> u64 {
        self.substages.iter().map(|substage| substage.duration).sum()
    }

    pub fn records(&self) -> Vec<StageRecord> {
        self.substages.iter().map(StageRecord::from).collect()
    }

    pub const fn exit_code(&self) -> Option<i32> {
        match self.stop {
            StopReason::EndOfJob { exit_code } => Some(exit_code),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to open log {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Reading failed mid-stream. Substages completed before the failure are
    /// kept in `partial`.
    #[error("log source failed after {} substages: {source}", .partial.len())]
    Source {
        #[source]
        source: io::Error,
        partial: Vec<Substage>,
    },
}

/// Structured notification of parser progress.
#[derive(Debug, Clone, Copy)]
pub enum ParseEvent<'a> {
    Tag { line: usize, tag: &'a Tag },
    Substage { line: usize, substage: &'a Substage },
    Anomaly { line: usize, anomaly: &'a Anomaly },
}

type Observer<'o> = Box<dyn FnMut(&ParseEvent<'_>) + 'o>;

/// Drives the tag matcher and substage tracker over a log stream.
///
/// A parser can be reused; every pass gets a fresh tracker.
pub struct LogParser<'o> {
    options: ParseOptions,
    matcher: TagMatcher,
    cancel: Option<CancelToken>,
    observer: Option<Observer<'o>>,
}

impl std::fmt::Debug for LogParser<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogParser")
            .field("options", &self.options)
            .field("cancel", &self.cancel)
            .field("observer", &self.observer.is_some())
            .finish_non_exhaustive()
    }
}

impl Default for LogParser<'_> {
    fn default() -> Self {
        Self::new(ParseOptions::default())
    }
}

impl<'o> LogParser<'o> {
    pub fn new(options: ParseOptions) -> Self {
        Self {
            options,
            matcher: TagMatcher::new(),
            cancel: None,
            observer: None,
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Subscribes to tags, substages and anomalies as they are found.
    #[must_use]
    pub fn with_observer(mut self, observer: impl FnMut(&ParseEvent<'_>) + 'o) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    pub const fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Opens and parses a log file. The file is closed when the pass ends.
    pub fn parse_file(&mut self, path: &Path) -> Result<ParseOutcome, ParseError> {
        let file = File::open(path).map_err(|source| ParseError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse(BufReader::with_capacity(BUFFER_SIZE, file))
    }

    /// Parses a log held in memory.
    pub fn parse_str(&mut self, log: &str) -> Result<ParseOutcome, ParseError> {
        self.parse(log.as_bytes())
    }

    pub fn parse<R: BufRead>(&mut self, mut reader: R) -> Result<ParseOutcome, ParseError> {
        let mut tracker = SubstageTracker::new(self.options.timestamp_unit);
        let mut outcome = ParseOutcome::default();
        let mut buf = Vec::new();

        loop {
            if self.cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
                tracing::info!(lines = outcome.lines, "log parse cancelled");
                outcome.stop = StopReason::Cancelled;
                break;
            }

            buf.clear();
            // One byte past the remaining allowance so an overrun is detectable.
            let budget = self
                .options
                .max_total_bytes
                .saturating_sub(outcome.bytes)
                .saturating_add(1);
            let read = match read_bounded_line(
                &mut reader,
                &mut buf,
                self.options.max_line_bytes,
                budget,
                self.cancel.as_ref(),
            ) {
                Ok(Some(read)) => read,
                Ok(None) => break,
                Err(source) => {
                    tracing::warn!(
                        error = %source,
                        substages = outcome.substages.len(),
                        "log source failed mid-stream"
                    );
                    return Err(ParseError::Source {
                        source,
                        partial: outcome.substages,
                    });
                }
            };

            outcome.lines += 1;
            outcome.bytes = outcome.bytes.saturating_add(read.consumed);
            let line_no = outcome.lines;

            if outcome.bytes > self.options.max_total_bytes {
                tracing::warn!(
                    limit = self.options.max_total_bytes,
                    "log exceeds size limit, stopping"
                );
                outcome.stop = StopReason::SizeLimit;
                break;
            }

            if read.overflow {
                let limit = self.options.max_line_bytes;
                self.record_anomaly(&mut outcome, line_no, &Anomaly::LineTooLong { limit });
                continue;
            }

            let line = String::from_utf8_lossy(&buf);

            if let Some(exit_code) = end_of_job_exit_code(&line) {
                tracing::debug!(line = line_no, exit_code, "end of job marker");
                outcome.stop = StopReason::EndOfJob { exit_code };
                break;
            }

            for raw in self.matcher.match_all(&line) {
                let tag = match Tag::try_from(&raw) {
                    Ok(tag) => tag,
                    Err(err) => {
                        self.record_anomaly(&mut outcome, line_no, &Anomaly::from(err));
                        continue;
                    }
                };

                tracing::trace!(line = line_no, kind = %tag.kind(), "timing tag");
                self.notify(&ParseEvent::Tag {
                    line: line_no,
                    tag: &tag,
                });

                let step = tracker.process(&tag);
                if let Some(anomaly) = &step.anomaly {
                    self.record_anomaly(&mut outcome, line_no, anomaly);
                }
                if let Some(substage) = step.emitted {
                    self.record_substage(&mut outcome, line_no, substage);
                }
            }
        }

        if self.options.flush_unterminated {
            if let Some(substage) = tracker.flush() {
                tracing::warn!(
                    name = substage.display_name(),
                    "log ended inside a substage, closing it as incomplete"
                );
                let line = outcome.lines;
                self.record_substage(&mut outcome, line, substage);
            }
        } else if let Some(substage) = tracker.current() {
            tracing::debug!(
                name = substage.display_name(),
                "dropping unterminated substage"
            );
        }

        tracing::debug!(
            lines = outcome.lines,
            substages = outcome.substages.len(),
            anomalies = outcome.anomalies,
            total_duration = outcome.total_duration(),
            "log parsed"
        );
        Ok(outcome)
    }

    fn record_substage(&mut self, outcome: &mut ParseOutcome, line: usize, substage: Substage) {
        tracing::debug!(
            line,
            name = substage.display_name(),
            duration = substage.duration,
            incomplete = substage.finished_incomplete,
            "substage finished"
        );
        self.notify(&ParseEvent::Substage {
            line,
            substage: &substage,
        });
        outcome.substages.push(substage);
    }

    fn record_anomaly(&mut self, outcome: &mut ParseOutcome, line: usize, anomaly: &Anomaly) {
        tracing::warn!(line, %anomaly, "log anomaly");
        outcome.anomalies += 1;
        self.notify(&ParseEvent::Anomaly { line, anomaly });
    }

    fn notify(&mut self, event: &ParseEvent<'_>) {
        if let Some(observer) = self.observer.as_mut() {
            observer(event);
        }
    }
}

struct LineRead {
    consumed: u64,
    overflow: bool,
}

/// Reads one line of at most `limit` bytes into `buf`.
///
/// An overlong line is consumed up to its newline and reported as overflow,
/// without buffering the excess. At most `budget` bytes are consumed in
/// total, and skipping stops early once `cancel` fires. Returns `None` at end
/// of stream.
fn read_bounded_line<R: BufRead>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    limit: usize,
    budget: u64,
    cancel: Option<&CancelToken>,
) -> io::Result<Option<LineRead>> {
    let cap = u64::try_from(limit)
        .unwrap_or(u64::MAX)
        .saturating_add(1)
        .min(budget);
    let read = reader.by_ref().take(cap).read_until(b'\n', buf)?;
    if read == 0 {
        return Ok(None);
    }

    let mut consumed = read as u64;
    let overflow = buf.len() > limit && buf.last() != Some(&b'\n');
    if overflow {
        while consumed < budget && !cancel.is_some_and(CancelToken::is_cancelled) {
            let remaining = usize::try_from(budget - consumed).unwrap_or(usize::MAX);
            let (done, used) = {
                let available = reader.fill_buf()?;
                if available.is_empty() {
                    (true, 0)
                } else if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                    let used = (pos + 1).min(remaining);
                    (used == pos + 1, used)
                } else {
                    (false, available.len().min(remaining))
                }
            };
            reader.consume(used);
            consumed += used as u64;
            if done {
                break;
            }
        }
    }

    Ok(Some(LineRead { consumed, overflow }))
}

/// Parses the exit code out of `Done. Your build exited with <n>.`
fn end_of_job_exit_code(line: &str) -> Option<i32> {
    let rest = line.trim_start().strip_prefix(END_OF_JOB_MARKER)?;
    let digits: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '-')
        .collect();
    digits.parse().ok()
}
