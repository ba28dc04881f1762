//! Recoverable irregularities found while parsing a log.

use thiserror::Error;

use crate::tags::TagError;

/// A problem that is logged and counted but never aborts a parse.
///
/// Build logs are routinely truncated or interleaved, so none of these are
/// treated as errors of the whole pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Anomaly {
    /// An end-time marker closed a timer other than the one that is open.
    #[error("end time hash {found:?} does not match open timer {expected:?}")]
    CorrelationMismatch { expected: String, found: String },

    /// An end-time marker arrived while no timer was open.
    #[error("end time tag arrived in {state} state")]
    UnexpectedTagOrder { state: &'static str },

    /// A start-time marker arrived while another timer was still open.
    #[error("timer {previous:?} restarted as {current:?} before it ended")]
    TimerRestarted { previous: String, current: String },

    /// A command echo arrived with no substage open.
    #[error("command outside of any substage: {command:?}")]
    CommandOutsideSubstage { command: String },

    #[error("malformed tag: {0}")]
    MalformedTag(#[from] TagError),

    #[error("line longer than {limit} bytes skipped")]
    LineTooLong { limit: usize },
}
