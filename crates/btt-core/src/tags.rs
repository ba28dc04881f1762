//! Travis CI timing and fold marker recognition.
//!
//! The CI worker writes control markers into the job log, each terminated by a
//! carriage return and an escape sequence. A marker is only recognized when
//! those control characters are present, so program output that happens to
//! print `travis_fold:start:...` is not mistaken for a real marker.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Token shared by every timing and fold marker.
///
/// Lines without it are rejected before any pattern is tried.
pub const MARKER_PREFIX: &str = "travis_";

/// Kind of marker recognized in a log line.
///
/// Variants are listed in matching priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagKind {
    EndTime,
    EndStage,
    StartStage,
    StartTime,
    Command,
}

impl TagKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::EndTime => "end_time",
            Self::EndStage => "end_stage",
            Self::StartStage => "start_stage",
            Self::StartTime => "start_time",
            Self::Command => "command",
        }
    }
}

impl fmt::Display for TagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct TagPattern {
    kind: TagKind,
    regex: Regex,
}

/// Marker grammar, in priority order.
static TAG_PATTERNS: LazyLock<Vec<TagPattern>> = LazyLock::new(|| {
    [
        (
            TagKind::EndTime,
            r"travis_time:end:(?P<end_hash>[^:\r\x1b]+):start=(?P<start_timestamp>\d+),finish=(?P<finish_timestamp>\d+),duration=(?P<duration>\d+)\r\x1b",
        ),
        (
            TagKind::EndStage,
            r"travis_fold:end:(?P<end_stage>\w+)\.(?P<end_substage>\d+)\r\x1b",
        ),
        (
            TagKind::StartStage,
            r"travis_fold:start:(?P<start_stage>\w+)\.(?P<start_substage>\d+)\r\x1b",
        ),
        (
            TagKind::StartTime,
            r"travis_time:start:(?P<start_hash>[^:\r\x1b]+)\r\x1b\[0K",
        ),
        (TagKind::Command, r"\$ (?P<command>[^\r]*)\r"),
    ]
    .into_iter()
    .map(|(kind, pattern)| TagPattern {
        kind,
        regex: Regex::new(pattern).unwrap(),
    })
    .collect()
});

/// A marker found in a log line, with its named captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatch {
    kind: TagKind,
    fields: BTreeMap<String, String>,
    span: Range<usize>,
}

impl TagMatch {
    pub const fn kind(&self) -> TagKind {
        self.kind
    }

    /// Returns a named capture, e.g. `start_hash` or `duration`.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    pub const fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    /// Byte range of the whole marker within the scanned line.
    pub fn span(&self) -> Range<usize> {
        self.span.clone()
    }

    fn from_captures(pattern: &TagPattern, caps: &regex::Captures<'_>) -> Self {
        let fields = pattern
            .regex
            .capture_names()
            .flatten()
            .filter_map(|name| {
                caps.name(name)
                    .map(|value| (name.to_string(), value.as_str().to_string()))
            })
            .collect();
        let whole = caps.get(0).map_or(0..0, |m| m.range());

        Self {
            kind: pattern.kind,
            fields,
            span: whole,
        }
    }
}

/// Table-driven matcher over the fixed marker grammar.
#[derive(Clone, Copy)]
pub struct TagMatcher {
    patterns: &'static [TagPattern],
}

impl fmt::Debug for TagMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<TagKind> = self.patterns.iter().map(|p| p.kind).collect();
        f.debug_struct("TagMatcher").field("kinds", &kinds).finish()
    }
}

impl Default for TagMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl TagMatcher {
    pub fn new() -> Self {
        Self {
            patterns: TAG_PATTERNS.as_slice(),
        }
    }

    /// Returns the highest-priority marker found anywhere in `line`.
    pub fn match_line(&self, line: &str) -> Option<TagMatch> {
        if !line.contains(MARKER_PREFIX) {
            return None;
        }

        self.patterns.iter().find_map(|pattern| {
            pattern
                .regex
                .captures(line)
                .map(|caps| TagMatch::from_captures(pattern, &caps))
        })
    }

    /// Returns every marker in `line`, in the order they appear.
    ///
    /// The worker often writes `fold:start`, `time:start` and the command echo
    /// on a single physical line. At each position the earliest marker wins;
    /// markers starting at the same offset are resolved by priority.
    pub fn match_all(&self, line: &str) -> Vec<TagMatch> {
        let mut found = Vec::new();
        if !line.contains(MARKER_PREFIX) {
            return found;
        }

        let mut cursor = 0;
        while cursor < line.len() {
            let next = self
                .patterns
                .iter()
                .filter_map(|pattern| {
                    pattern
                        .regex
                        .captures_at(line, cursor)
                        .map(|caps| TagMatch::from_captures(pattern, &caps))
                })
                .min_by_key(|tag| tag.span.start);

            let Some(tag) = next else {
                break;
            };
            cursor = tag.span.end.max(cursor + 1);
            found.push(tag);
        }

        found
    }
}

/// Errors converting raw captures into a typed [`Tag`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("{kind} tag is missing field {field}")]
    MissingField { kind: TagKind, field: &'static str },

    #[error("{kind} tag field {field} is not a valid number: {value:?}")]
    InvalidNumber {
        kind: TagKind,
        field: &'static str,
        value: String,
    },
}

/// A marker with its captures converted to their expected types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    EndTime {
        hash: String,
        start: u64,
        finish: u64,
        duration: u64,
    },
    EndStage {
        name: String,
    },
    StartStage {
        name: String,
    },
    StartTime {
        hash: String,
    },
    Command {
        command: String,
    },
}

impl Tag {
    pub const fn kind(&self) -> TagKind {
        match self {
            Self::EndTime { .. } => TagKind::EndTime,
            Self::EndStage { .. } => TagKind::EndStage,
            Self::StartStage { .. } => TagKind::StartStage,
            Self::StartTime { .. } => TagKind::StartTime,
            Self::Command { .. } => TagKind::Command,
        }
    }
}

fn field<'a>(tag: &'a TagMatch, name: &'static str) -> Result<&'a str, TagError> {
    tag.get(name).ok_or(TagError::MissingField {
        kind: tag.kind,
        field: name,
    })
}

fn number(tag: &TagMatch, name: &'static str) -> Result<u64, TagError> {
    let value = field(tag, name)?;
    value.parse().map_err(|_| TagError::InvalidNumber {
        kind: tag.kind,
        field: name,
        value: value.to_string(),
    })
}

impl TryFrom<&TagMatch> for Tag {
    type Error = TagError;

    fn try_from(tag: &TagMatch) -> Result<Self, Self::Error> {
        match tag.kind {
            TagKind::EndTime => Ok(Self::EndTime {
                hash: field(tag, "end_hash")?.to_string(),
                start: number(tag, "start_timestamp")?,
                finish: number(tag, "finish_timestamp")?,
                duration: number(tag, "duration")?,
            }),
            TagKind::EndStage => Ok(Self::EndStage {
                name: format!(
                    "{}.{}",
                    field(tag, "end_stage")?,
                    field(tag, "end_substage")?
                ),
            }),
            TagKind::StartStage => Ok(Self::StartStage {
                name: format!(
                    "{}.{}",
                    field(tag, "start_stage")?,
                    field(tag, "start_substage")?
                ),
            }),
            TagKind::StartTime => Ok(Self::StartTime {
                hash: field(tag, "start_hash")?.to_string(),
            }),
            TagKind::Command => Ok(Self::Command {
                command: field(tag, "command")?.to_string(),
            }),
        }
    }
}
