//! Task status enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a Task.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed, Failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task recorded but not yet claimed by a worker.
    #[default]
    Pending,
    /// Task claimed by a worker and executing (or waiting for a retry).
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed permanently.
    Failed,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if a transition from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_forward_transitions_are_allowed() {
        use TaskStatus::*;
        for from in TaskStatus::ALL {
            for to in TaskStatus::ALL {
                let expected = matches!(
                    (from, to),
                    (Pending, Running) | (Running, Completed) | (Running, Failed)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for to in TaskStatus::ALL {
            assert!(!TaskStatus::Completed.can_transition_to(to));
            assert!(!TaskStatus::Failed.can_transition_to(to));
        }
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
