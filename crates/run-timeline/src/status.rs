//! Run status state machine and the policy derived from it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::TimelineItem;

/// Poll cadence for run and timeline queries while a run is live.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Created,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Terminated,
    TimedOut,
    Canceled,
}

/// Exactly one class per status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusClass {
    Finalized,
    RunningOrQueued,
    Idle,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        Self::Created,
        Self::Queued,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Terminated,
        Self::TimedOut,
        Self::Canceled,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }

    #[must_use]
    pub fn is_finalized(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Terminated | Self::TimedOut | Self::Canceled
        )
    }

    #[must_use]
    pub fn is_running_or_queued(self) -> bool {
        matches!(self, Self::Running | Self::Queued)
    }

    #[must_use]
    pub fn class(self) -> StatusClass {
        if self.is_finalized() {
            StatusClass::Finalized
        } else if self.is_running_or_queued() {
            StatusClass::RunningOrQueued
        } else {
            StatusClass::Idle
        }
    }

    /// Whether `next` may follow `self`. Re-observing the same status is allowed.
    ///
    /// `Paused` is only entered from `Running` and only left for `Running`
    /// (approval) or `Canceled` (rejection). Finalized statuses are absorbing.
    #[must_use]
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self == next {
            return true;
        }
        match self {
            Self::Created => next == Self::Queued,
            Self::Queued => next == Self::Running,
            Self::Running => next == Self::Paused || next.is_finalized(),
            Self::Paused => matches!(next, Self::Running | Self::Canceled),
            Self::Completed | Self::Failed | Self::Terminated | Self::TimedOut | Self::Canceled => {
                false
            }
        }
    }

    /// Whether `next` can be observed after `self`, possibly with intermediate
    /// statuses missed between two polls.
    #[must_use]
    pub fn can_reach(self, next: RunStatus) -> bool {
        let mut frontier = vec![self];
        let mut visited = vec![self];
        while let Some(current) = frontier.pop() {
            if current == next {
                return true;
            }
            for candidate in Self::ALL {
                if current.can_transition_to(candidate) && !visited.contains(&candidate) {
                    visited.push(candidate);
                    frontier.push(candidate);
                }
            }
        }
        false
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == normalized)
            .ok_or_else(|| format!("unknown run status: {raw}"))
    }
}

#[must_use]
pub fn is_finalized(status: RunStatus) -> bool {
    status.is_finalized()
}

#[must_use]
pub fn is_running_or_queued(status: RunStatus) -> bool {
    status.is_running_or_queued()
}

/// Refetch interval for run and timeline queries.
///
/// An unknown status (nothing fetched yet) keeps polling; a finalized run stops.
#[must_use]
pub fn poll_interval(status: Option<RunStatus>, base: Duration) -> Option<Duration> {
    match status {
        Some(status) if status.is_finalized() => None,
        _ => Some(base),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusRegression {
    #[error("block {block_id} status reverted from {previous} to unset")]
    Cleared {
        block_id: String,
        previous: RunStatus,
    },
    #[error("block {block_id} status moved backwards from {previous} to {next}")]
    Backwards {
        block_id: String,
        previous: RunStatus,
        next: RunStatus,
    },
}

/// Remembers the last status seen per block across wholesale tree replacements
/// and reports statuses that move against the state machine.
#[derive(Debug, Default)]
pub struct BlockStatusTracker {
    seen: HashMap<String, RunStatus>,
}

impl BlockStatusTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn last_seen(&self, block_id: &str) -> Option<RunStatus> {
        self.seen.get(block_id).copied()
    }

    pub fn observe(
        &mut self,
        block_id: &str,
        status: Option<RunStatus>,
    ) -> Result<(), StatusRegression> {
        let previous = self.seen.get(block_id).copied();
        match (previous, status) {
            (None, None) => Ok(()),
            (Some(previous), None) => Err(StatusRegression::Cleared {
                block_id: block_id.to_string(),
                previous,
            }),
            (Some(previous), Some(next)) if !previous.can_reach(next) => {
                Err(StatusRegression::Backwards {
                    block_id: block_id.to_string(),
                    previous,
                    next,
                })
            }
            (_, Some(next)) => {
                self.seen.insert(block_id.to_string(), next);
                Ok(())
            }
        }
    }

    /// Observe every block in a freshly fetched tree.
    pub fn observe_tree(&mut self, tree: &[TimelineItem]) -> Vec<StatusRegression> {
        let mut regressions = Vec::new();
        let mut stack: Vec<&TimelineItem> = tree.iter().collect();
        while let Some(item) = stack.pop() {
            if let Some(block) = item.as_block()
                && let Err(regression) = self.observe(&block.id, block.status)
            {
                regressions.push(regression);
            }
            stack.extend(item.children.iter());
        }
        regressions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_partition_every_status() {
        for status in RunStatus::ALL {
            let finalized = is_finalized(status);
            let active = is_running_or_queued(status);
            assert!(
                !(finalized && active),
                "{status} is both finalized and running"
            );
            let expected = match (finalized, active) {
                (true, _) => StatusClass::Finalized,
                (false, true) => StatusClass::RunningOrQueued,
                (false, false) => StatusClass::Idle,
            };
            assert_eq!(status.class(), expected);
        }

        let idle: Vec<RunStatus> = RunStatus::ALL
            .into_iter()
            .filter(|status| status.class() == StatusClass::Idle)
            .collect();
        assert_eq!(idle, vec![RunStatus::Created, RunStatus::Paused]);
    }

    #[test]
    fn wire_names_round_through_serde_and_from_str() {
        for status in RunStatus::ALL {
            let encoded = serde_json::to_string(&status).expect("encode status");
            assert_eq!(encoded, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<RunStatus>(), Ok(status));
        }
        assert!("finished".parse::<RunStatus>().is_err());
        assert_eq!(" Timed_Out ".parse::<RunStatus>(), Ok(RunStatus::TimedOut));
    }

    #[test]
    fn paused_only_reachable_from_running() {
        for status in RunStatus::ALL {
            let allowed = status.can_transition_to(RunStatus::Paused);
            assert_eq!(
                allowed,
                matches!(status, RunStatus::Running | RunStatus::Paused),
                "{status} -> paused"
            );
        }
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Canceled));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Queued));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Created));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn finalized_statuses_are_absorbing() {
        for from in RunStatus::ALL.into_iter().filter(|s| s.is_finalized()) {
            for to in RunStatus::ALL.into_iter().filter(|s| *s != from) {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn reachability_skips_missed_intermediate_statuses() {
        assert!(RunStatus::Created.can_reach(RunStatus::Running));
        assert!(RunStatus::Queued.can_reach(RunStatus::Completed));
        assert!(RunStatus::Paused.can_reach(RunStatus::Failed));
        assert!(!RunStatus::Running.can_reach(RunStatus::Queued));
        assert!(!RunStatus::Completed.can_reach(RunStatus::Running));
    }

    #[test]
    fn poll_interval_stops_once_finalized() {
        assert_eq!(poll_interval(None, DEFAULT_POLL_INTERVAL), Some(DEFAULT_POLL_INTERVAL));
        assert_eq!(
            poll_interval(Some(RunStatus::Paused), DEFAULT_POLL_INTERVAL),
            Some(DEFAULT_POLL_INTERVAL)
        );
        assert_eq!(poll_interval(Some(RunStatus::Failed), DEFAULT_POLL_INTERVAL), None);
    }

    #[test]
    fn tracker_rejects_reverting_block_status() {
        let mut tracker = BlockStatusTracker::new();
        assert!(tracker.observe("wrb_1", None).is_ok());
        assert!(tracker.observe("wrb_1", Some(RunStatus::Running)).is_ok());
        assert!(tracker.observe("wrb_1", Some(RunStatus::Running)).is_ok());
        assert_eq!(
            tracker.observe("wrb_1", None),
            Err(StatusRegression::Cleared {
                block_id: "wrb_1".to_string(),
                previous: RunStatus::Running,
            })
        );
        assert!(tracker.observe("wrb_1", Some(RunStatus::Completed)).is_ok());
        assert!(matches!(
            tracker.observe("wrb_1", Some(RunStatus::Running)),
            Err(StatusRegression::Backwards { .. })
        ));
        assert_eq!(tracker.last_seen("wrb_1"), Some(RunStatus::Completed));
    }
}
