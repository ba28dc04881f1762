//! Substage assembly from a sequence of timing tags.
//!
//! A substage is built up by one accumulator that tags mutate in arrival
//! order. The accumulator is modelled as [`SubstageState`] and driven by the
//! pure [`transition`] function, so the point where a substage completes can
//! be tested without a log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anomaly::Anomaly;
use crate::format::timestamp_to_datetime;
use crate::tags::Tag;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Timestamps above this are read as nanoseconds in [`TimestampUnit::Auto`].
///
/// 10^11 seconds is past the year 5000.
const AUTO_NANOS_THRESHOLD: u64 = 100_000_000_000;

/// Unit of the `start`, `finish` and `duration` values in end-time tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    /// Detect nanoseconds from the magnitude of the finish timestamp.
    #[default]
    Auto,
    Seconds,
    Nanoseconds,
}

impl TimestampUnit {
    /// Converts raw tag values to `(start, finish, duration)` in seconds.
    pub const fn normalize(self, start: u64, finish: u64, duration: u64) -> (u64, u64, u64) {
        match self {
            Self::Seconds => (start, finish, duration),
            Self::Nanoseconds => (
                start / NANOS_PER_SEC,
                finish / NANOS_PER_SEC,
                round_nanos(duration),
            ),
            Self::Auto => {
                if finish > AUTO_NANOS_THRESHOLD {
                    Self::Nanoseconds.normalize(start, finish, duration)
                } else {
                    (start, finish, duration)
                }
            }
        }
    }
}

const fn round_nanos(nanos: u64) -> u64 {
    let secs = nanos / NANOS_PER_SEC;
    if nanos % NANOS_PER_SEC >= NANOS_PER_SEC / 2 {
        secs + 1
    } else {
        secs
    }
}

/// A timed unit of work within a build stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Substage {
    /// Fold name, e.g. `install.2`. Empty for timers outside a fold.
    pub name: String,
    /// Correlation hash pairing the start and end timer tags.
    pub hash: String,
    pub command: String,
    /// Epoch seconds, 0 when unset.
    pub start_timestamp: u64,
    /// Epoch seconds, 0 when unset.
    pub finish_timestamp: u64,
    /// Seconds.
    pub duration: u64,
    /// Closed without a matching end-time tag.
    pub finished_incomplete: bool,
}

impl Substage {
    pub fn has_started(&self) -> bool {
        !self.name.is_empty() || !self.hash.is_empty()
    }

    pub const fn has_finished(&self) -> bool {
        self.finished_incomplete || self.finish_timestamp > 0
    }

    /// Name to report: the fold name, else the command, else the hash.
    pub fn display_name(&self) -> &str {
        [&self.name, &self.command, &self.hash]
            .into_iter()
            .find(|value| !value.is_empty())
            .map_or("", String::as_str)
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.start_timestamp)
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.finish_timestamp)
    }

    fn apply_end_time(&mut self, start: u64, finish: u64, duration: u64, unit: TimestampUnit) {
        let (start, finish, duration) = unit.normalize(start, finish, duration);
        self.start_timestamp = start;
        self.finish_timestamp = finish;
        self.duration = if duration == 0 {
            finish.saturating_sub(start)
        } else {
            duration
        };
    }
}

/// The single accumulator a log is assembled into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SubstageState {
    #[default]
    Empty,
    /// A fold opened, no timer yet.
    Started(Substage),
    /// A timer is open.
    TimedStarted(Substage),
}

impl SubstageState {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::Started(_) => "started",
            Self::TimedStarted(_) => "timed_started",
        }
    }

    pub const fn substage(&self) -> Option<&Substage> {
        match self {
            Self::Empty => None,
            Self::Started(substage) | Self::TimedStarted(substage) => Some(substage),
        }
    }

    fn into_substage(self) -> Option<Substage> {
        match self {
            Self::Empty => None,
            Self::Started(substage) | Self::TimedStarted(substage) => Some(substage),
        }
    }
}

/// Side effects of one transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// A substage that reached its finished state.
    pub emitted: Option<Substage>,
    pub anomaly: Option<Anomaly>,
}

impl Step {
    const fn none() -> Self {
        Self {
            emitted: None,
            anomaly: None,
        }
    }

    const fn anomaly(anomaly: Anomaly) -> Self {
        Self {
            emitted: None,
            anomaly: Some(anomaly),
        }
    }
}

/// Applies one tag to the accumulator.
///
/// A finished substage is returned in [`Step::emitted`] and the returned
/// state is [`SubstageState::Empty`]. Emitted substages always satisfy
/// [`Substage::has_finished`].
pub fn transition(state: SubstageState, tag: &Tag, unit: TimestampUnit) -> (SubstageState, Step) {
    use SubstageState::{Empty, Started, TimedStarted};

    match (state, tag) {
        (Empty, Tag::StartStage { name }) => (
            Started(Substage {
                name: name.clone(),
                ..Substage::default()
            }),
            Step::none(),
        ),
        (Started(mut substage), Tag::StartStage { name }) => {
            substage.name.clone_from(name);
            (Started(substage), Step::none())
        }
        (TimedStarted(mut substage), Tag::StartStage { name }) => {
            substage.name.clone_from(name);
            (TimedStarted(substage), Step::none())
        }

        (Empty, Tag::StartTime { hash }) => (
            TimedStarted(Substage {
                hash: hash.clone(),
                ..Substage::default()
            }),
            Step::none(),
        ),
        (Started(mut substage), Tag::StartTime { hash }) => {
            substage.hash.clone_from(hash);
            (TimedStarted(substage), Step::none())
        }
        (TimedStarted(mut substage), Tag::StartTime { hash }) => {
            let previous = std::mem::replace(&mut substage.hash, hash.clone());
            (
                TimedStarted(substage),
                Step::anomaly(Anomaly::TimerRestarted {
                    previous,
                    current: hash.clone(),
                }),
            )
        }

        (Empty, Tag::Command { command }) => (
            Empty,
            Step::anomaly(Anomaly::CommandOutsideSubstage {
                command: command.clone(),
            }),
        ),
        (Started(mut substage), Tag::Command { command }) => {
            substage.command.clone_from(command);
            (Started(substage), Step::none())
        }
        (TimedStarted(mut substage), Tag::Command { command }) => {
            substage.command.clone_from(command);
            (TimedStarted(substage), Step::none())
        }

        (
            state,
            Tag::EndTime {
                hash,
                start,
                finish,
                duration,
            },
        ) => {
            let state_name = state.name();
            let timed = matches!(state, TimedStarted(_));
            let mut substage = state.into_substage().unwrap_or_else(|| Substage {
                hash: hash.clone(),
                ..Substage::default()
            });
            substage.apply_end_time(*start, *finish, *duration, unit);

            let anomaly = if !timed {
                Some(Anomaly::UnexpectedTagOrder { state: state_name })
            } else if substage.hash != *hash {
                Some(Anomaly::CorrelationMismatch {
                    expected: substage.hash.clone(),
                    found: hash.clone(),
                })
            } else {
                None
            };
            if anomaly.is_some() || !substage.has_finished() {
                substage.finished_incomplete = true;
            }

            (
                Empty,
                Step {
                    emitted: Some(substage),
                    anomaly,
                },
            )
        }

        // Folds group output visually and can nest around several timers.
        (state, Tag::EndStage { .. }) => (state, Step::none()),
    }
}

/// Owns the accumulator for one log.
#[derive(Debug, Default)]
pub struct SubstageTracker {
    state: SubstageState,
    unit: TimestampUnit,
}

impl SubstageTracker {
    pub fn new(unit: TimestampUnit) -> Self {
        Self {
            state: SubstageState::Empty,
            unit,
        }
    }

    pub const fn state(&self) -> &SubstageState {
        &self.state
    }

    /// The substage being assembled, if any.
    pub const fn current(&self) -> Option<&Substage> {
        self.state.substage()
    }

    pub fn process(&mut self, tag: &Tag) -> Step {
        let state = std::mem::take(&mut self.state);
        let (state, step) = transition(state, tag, self.unit);
        self.state = state;
        step
    }

    /// Closes a started substage as incomplete and resets the accumulator.
    pub fn flush(&mut self) -> Option<Substage> {
        let mut substage = std::mem::take(&mut self.state).into_substage()?;
        if !substage.has_started() {
            return None;
        }
        substage.finished_incomplete = true;
        Some(substage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_time(hash: &str) -> Tag {
        Tag::StartTime {
            hash: hash.to_string(),
        }
    }

    fn end_time(hash: &str, start: u64, finish: u64, duration: u64) -> Tag {
        Tag::EndTime {
            hash: hash.to_string(),
            start,
            finish,
            duration,
        }
    }

    fn start_stage(name: &str) -> Tag {
        Tag::StartStage {
            name: name.to_string(),
        }
    }

    #[test]
    fn fresh_substage_has_not_started() {
        let substage = Substage::default();
        assert!(!substage.has_started());
        assert!(!substage.has_finished());
    }

    #[test]
    fn start_time_starts_substage() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_time("abc"));
        assert!(tracker.current().unwrap().has_started());
        assert_eq!(tracker.state().name(), "timed_started");
    }

    #[test]
    fn start_stage_starts_substage() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_stage("install.1"));
        let current = tracker.current().unwrap();
        assert!(current.has_started());
        assert_eq!(current.name, "install.1");
        assert_eq!(tracker.state().name(), "started");
    }

    #[test]
    fn has_finished_tracks_incomplete_flag_and_finish_time() {
        let substage = Substage {
            finished_incomplete: true,
            ..Substage::default()
        };
        assert!(substage.has_finished());

        let substage = Substage {
            finish_timestamp: 1,
            ..Substage::default()
        };
        assert!(substage.has_finished());
    }

    #[test]
    fn matching_end_time_completes_substage() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        assert_eq!(tracker.process(&start_time("abc")), Step::default());

        let step = tracker.process(&end_time("abc", 1000, 1045, 45));
        let substage = step.emitted.unwrap();

        assert_eq!(substage.duration, 45);
        assert_eq!(substage.start_timestamp, 1000);
        assert_eq!(substage.finish_timestamp, 1045);
        assert!(!substage.finished_incomplete);
        assert!(step.anomaly.is_none());
        assert_eq!(tracker.state(), &SubstageState::Empty);
    }

    #[test]
    fn mismatched_hash_finishes_incomplete() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_time("abc"));

        let step = tracker.process(&end_time("xyz", 1000, 1045, 45));
        let substage = step.emitted.unwrap();

        assert!(substage.finished_incomplete);
        assert_eq!(substage.hash, "abc");
        assert_eq!(
            step.anomaly,
            Some(Anomaly::CorrelationMismatch {
                expected: "abc".to_string(),
                found: "xyz".to_string(),
            })
        );
    }

    #[test]
    fn end_time_without_start_is_incomplete() {
        let (state, step) = transition(
            SubstageState::Empty,
            &end_time("abc", 10, 20, 10),
            TimestampUnit::Seconds,
        );

        assert_eq!(state, SubstageState::Empty);
        let substage = step.emitted.unwrap();
        assert!(substage.finished_incomplete);
        assert_eq!(substage.name, "");
        assert_eq!(substage.duration, 10);
        assert_eq!(
            step.anomaly,
            Some(Anomaly::UnexpectedTagOrder { state: "empty" })
        );
    }

    #[test]
    fn end_time_after_fold_only_is_incomplete() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_stage("install.1"));
        let step = tracker.process(&end_time("abc", 10, 20, 10));

        let substage = step.emitted.unwrap();
        assert_eq!(substage.name, "install.1");
        assert!(substage.finished_incomplete);
    }

    #[test]
    fn fold_and_timer_build_one_substage() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_stage("install.2"));
        tracker.process(&start_time("f00d"));
        tracker.process(&Tag::Command {
            command: "pip install .".to_string(),
        });
        let step = tracker.process(&end_time("f00d", 100, 112, 12));

        let substage = step.emitted.unwrap();
        assert_eq!(
            substage,
            Substage {
                name: "install.2".to_string(),
                hash: "f00d".to_string(),
                command: "pip install .".to_string(),
                start_timestamp: 100,
                finish_timestamp: 112,
                duration: 12,
                finished_incomplete: false,
            }
        );

        let step = tracker.process(&Tag::EndStage {
            name: "install.2".to_string(),
        });
        assert_eq!(step, Step::default());
        assert_eq!(tracker.state(), &SubstageState::Empty);
    }

    #[test]
    fn end_stage_keeps_open_substage() {
        let (state, step) = transition(
            SubstageState::TimedStarted(Substage {
                hash: "abc".to_string(),
                ..Substage::default()
            }),
            &Tag::EndStage {
                name: "script.1".to_string(),
            },
            TimestampUnit::Seconds,
        );
        assert_eq!(state.name(), "timed_started");
        assert!(step.emitted.is_none());
    }

    #[test]
    fn restarted_timer_overwrites_hash() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_time("one"));
        let step = tracker.process(&start_time("two"));

        assert!(matches!(step.anomaly, Some(Anomaly::TimerRestarted { .. })));
        assert_eq!(tracker.current().unwrap().hash, "two");

        let step = tracker.process(&end_time("two", 1, 3, 2));
        assert!(!step.emitted.unwrap().finished_incomplete);
    }

    #[test]
    fn command_without_substage_is_dropped() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        let step = tracker.process(&Tag::Command {
            command: "export CI=true".to_string(),
        });
        assert!(matches!(
            step.anomaly,
            Some(Anomaly::CommandOutsideSubstage { .. })
        ));
        assert_eq!(tracker.state(), &SubstageState::Empty);
    }

    #[test]
    fn zero_finish_time_is_incomplete() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_time("abc"));
        let substage = tracker.process(&end_time("abc", 0, 0, 0)).emitted.unwrap();
        assert!(substage.finished_incomplete);
        assert!(substage.has_finished());
    }

    #[test]
    fn missing_duration_is_computed() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_time("abc"));
        let substage = tracker.process(&end_time("abc", 50, 80, 0)).emitted.unwrap();
        assert_eq!(substage.duration, 30);
    }

    #[test]
    fn flush_closes_started_substage() {
        let mut tracker = SubstageTracker::new(TimestampUnit::Seconds);
        tracker.process(&start_time("abc"));

        let substage = tracker.flush().unwrap();
        assert!(substage.finished_incomplete);
        assert_eq!(substage.hash, "abc");
        assert!(tracker.flush().is_none());
    }

    #[test]
    fn flush_of_empty_tracker_is_none() {
        assert!(SubstageTracker::default().flush().is_none());
    }

    #[test]
    fn nanosecond_timestamps_are_normalized() {
        let unit = TimestampUnit::Auto;
        assert_eq!(
            unit.normalize(1_418_665_435_484_484_017, 1_418_665_436_009_412_521, 524_928_504),
            (1_418_665_435, 1_418_665_436, 1)
        );
        assert_eq!(unit.normalize(1000, 1045, 45), (1000, 1045, 45));
        assert_eq!(
            TimestampUnit::Nanoseconds.normalize(0, 2_000_000_000, 1_400_000_000),
            (0, 2, 1)
        );
    }

    #[test]
    fn display_name_falls_back_to_command_then_hash() {
        let mut substage = Substage {
            hash: "abc".to_string(),
            ..Substage::default()
        };
        assert_eq!(substage.display_name(), "abc");
        substage.command = "make test".to_string();
        assert_eq!(substage.display_name(), "make test");
        substage.name = "script.1".to_string();
        assert_eq!(substage.display_name(), "script.1");
    }

    #[test]
    fn timestamps_convert_to_datetimes() {
        let substage = Substage {
            start_timestamp: 1_418_665_435,
            ..Substage::default()
        };
        assert_eq!(
            substage.started_at().unwrap().to_rfc3339(),
            "2014-12-15T17:43:55+00:00"
        );
        assert!(substage.finished_at().is_none());
    }
}
