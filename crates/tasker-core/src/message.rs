//! Queue message envelope.

use serde::{Deserialize, Serialize};

use crate::{ClaimToken, TaskId, TaskType};

/// Message carried by the broker for one execution attempt of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Task to execute.
    pub task_id: TaskId,

    /// Type of the task, so workers can resolve the handler without a read.
    pub task_name: TaskType,

    /// 1-based execution attempt this message stands for.
    pub attempt: u32,

    /// Claim that scheduled this message, set on retries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<ClaimToken>,
}

impl TaskMessage {
    /// First attempt of a freshly submitted task.
    pub fn initial(task_id: TaskId, task_name: TaskType) -> Self {
        Self {
            task_id,
            task_name,
            attempt: 1,
            claim_token: None,
        }
    }

    /// Next attempt, scheduled by the holder of `token`.
    pub fn retry(&self, token: ClaimToken) -> Self {
        Self {
            task_id: self.task_id,
            task_name: self.task_name,
            attempt: self.attempt + 1,
            claim_token: Some(token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_increments_attempt_and_carries_token() {
        let msg = TaskMessage::initial(TaskId::generate(), TaskType::Weather);
        let token = ClaimToken::generate();
        let next = msg.retry(token);

        assert_eq!(next.task_id, msg.task_id);
        assert_eq!(next.attempt, 2);
        assert_eq!(next.claim_token, Some(token));
    }

    #[test]
    fn test_initial_message_omits_token_on_the_wire() {
        let msg = TaskMessage::initial(TaskId::generate(), TaskType::Sum);
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("claim_token").is_none());
        assert_eq!(json["task_name"], "sum");
    }
}
