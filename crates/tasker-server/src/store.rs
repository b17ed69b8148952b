//! Task store - the source of truth for every task record.
//!
//! The store owns the lifecycle state machine: every mutation goes through a
//! compare-and-set on the record's current status and claim, so concurrent
//! workers can never both drive a task to a terminal state.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use tasker_core::{ClaimToken, CoreError, Task, TaskError, TaskId, TaskStatus};

/// Task store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task store unavailable: {0}")]
    Unavailable(String),

    #[error("Task already exists: {0}")]
    Duplicate(TaskId),

    #[error("Task not found: {0}")]
    NotFound(TaskId),

    #[error(transparent)]
    Transition(#[from] CoreError),
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now owns the task and must execute it.
    Claimed {
        /// Snapshot of the task after the claim.
        task: Task,
        /// Token to present on the terminal write.
        token: ClaimToken,
        /// True if the claim replaced an earlier one on a running task.
        resumed: bool,
    },
    /// The task already reached a terminal state.
    AlreadyTerminal(TaskStatus),
    /// Another worker holds a live claim.
    HeldElsewhere,
}

/// Result of a terminal write.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    /// The transition was applied; carries the terminal record.
    Applied(Task),
    /// The caller's claim is no longer current; nothing was written.
    Superseded,
}

/// Repository of task records.
///
/// Implementations must make `claim` and `finish` atomic with respect to each
/// other for the same task id.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new pending task.
    async fn create(&self, task: Task) -> Result<(), StoreError>;

    /// Read a task by id.
    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError>;

    /// Claim a task for execution.
    ///
    /// Succeeds when the task is pending, when `presented` matches the current
    /// claim of a running task, or when the current claim's lease has expired.
    /// A successful claim mints a new token whose lease runs until
    /// `lease_until`. Workers pass the delivery's redelivery deadline, so a
    /// redelivered message always finds the lease expired.
    async fn claim(
        &self,
        id: &TaskId,
        presented: Option<ClaimToken>,
        lease_until: Instant,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Move a running task to `completed` (Ok) or `failed` (Err).
    ///
    /// Only applied if `token` is the task's current claim.
    async fn finish(
        &self,
        id: &TaskId,
        token: ClaimToken,
        result: Result<serde_json::Value, TaskError>,
    ) -> Result<FinishOutcome, StoreError>;

    /// Number of tasks per status.
    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError>;
}

/// Live claim on a running task.
#[derive(Debug, Clone, Copy)]
struct Lease {
    token: ClaimToken,
    expires_at: Instant,
}

#[derive(Debug)]
struct StoredTask {
    task: Task,
    lease: Option<Lease>,
}

/// In-process task store.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, StoredTask>>,
}

impl InMemoryTaskStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of tasks.
    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// Whether the store holds no tasks.
    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn create(&self, task: Task) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        tasks.insert(task.id, StoredTask { task, lease: None });
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.read().await.get(id).map(|row| row.task.clone()))
    }

    async fn claim(
        &self,
        id: &TaskId,
        presented: Option<ClaimToken>,
        lease_until: Instant,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut tasks = self.tasks.write().await;
        let row = tasks.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let now = Instant::now();

        let resumed = match row.task.status {
            status @ (TaskStatus::Completed | TaskStatus::Failed) => {
                return Ok(ClaimOutcome::AlreadyTerminal(status));
            }
            TaskStatus::Pending => {
                row.task.start()?;
                false
            }
            TaskStatus::Running => {
                let live_elsewhere = row
                    .lease
                    .is_some_and(|l| presented != Some(l.token) && l.expires_at > now);
                if live_elsewhere {
                    return Ok(ClaimOutcome::HeldElsewhere);
                }
                row.task.resume()?;
                true
            }
        };

        let token = ClaimToken::generate();
        row.lease = Some(Lease {
            token,
            expires_at: lease_until,
        });
        debug!(task_id = %id, token = %token, resumed, "Task claimed");

        Ok(ClaimOutcome::Claimed {
            task: row.task.clone(),
            token,
            resumed,
        })
    }

    async fn finish(
        &self,
        id: &TaskId,
        token: ClaimToken,
        result: Result<serde_json::Value, TaskError>,
    ) -> Result<FinishOutcome, StoreError> {
        let mut tasks = self.tasks.write().await;
        let row = tasks.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        let current = row.lease.map(|l| l.token);
        if row.task.status != TaskStatus::Running || current != Some(token) {
            return Ok(FinishOutcome::Superseded);
        }

        match result {
            Ok(output) => row.task.complete(output)?,
            Err(error) => row.task.fail(error)?,
        }
        row.lease = None;

        Ok(FinishOutcome::Applied(row.task.clone()))
    }

    async fn count_by_status(&self) -> Result<HashMap<TaskStatus, u64>, StoreError> {
        let tasks = self.tasks.read().await;
        let mut counts: HashMap<TaskStatus, u64> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for row in tasks.values() {
            *counts.entry(row.task.status).or_default() += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;
    use tasker_core::{ErrorKind, Parameters, TaskType};

    use std::time::Duration;

    const LEASE: Duration = Duration::from_secs(300);

    fn lease() -> Instant {
        Instant::now() + LEASE
    }

    fn expired() -> Instant {
        Instant::now()
    }

    async fn pending_task(store: &InMemoryTaskStore) -> TaskId {
        let task = Task::new(TaskType::Sum, Parameters::new());
        let id = task.id;
        store.create(task).await.unwrap();
        id
    }

    fn token_of(outcome: &ClaimOutcome) -> ClaimToken {
        match outcome {
            ClaimOutcome::Claimed { token, .. } => *token,
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = InMemoryTaskStore::new();
        let task = Task::new(TaskType::Sum, Parameters::new());
        store.create(task.clone()).await.unwrap();
        assert!(matches!(
            store.create(task).await,
            Err(StoreError::Duplicate(_))
        ));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let store = InMemoryTaskStore::new();
        assert!(store.get(&TaskId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_pending_moves_to_running() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;

        let outcome = store.claim(&id, None, lease()).await.unwrap();
        match outcome {
            ClaimOutcome::Claimed { task, resumed, .. } => {
                assert_eq!(task.status, TaskStatus::Running);
                assert_eq!(task.attempts, 1);
                assert!(!resumed);
            }
            other => panic!("expected Claimed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_claim_under_live_lease_is_refused() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;

        store.claim(&id, None, lease()).await.unwrap();
        let second = store.claim(&id, None, lease()).await.unwrap();
        assert_eq!(second, ClaimOutcome::HeldElsewhere);
    }

    #[tokio::test]
    async fn test_claim_on_terminal_task_is_noop() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;
        let token = token_of(&store.claim(&id, None, lease()).await.unwrap());
        store.finish(&id, token, Ok(json!(1))).await.unwrap();
        let before = store.get(&id).await.unwrap().unwrap();

        let outcome = store.claim(&id, None, expired()).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::AlreadyTerminal(TaskStatus::Completed));
        assert_eq!(store.get(&id).await.unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_holder_can_reclaim_with_its_token() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;
        let first = token_of(&store.claim(&id, None, lease()).await.unwrap());

        let outcome = store.claim(&id, Some(first), lease()).await.unwrap();
        let second = token_of(&outcome);
        assert_ne!(first, second);

        // The old token is no longer valid for a terminal write.
        let stale = store.finish(&id, first, Ok(json!(0))).await.unwrap();
        assert_eq!(stale, FinishOutcome::Superseded);

        let applied = store.finish(&id, second, Ok(json!(1))).await.unwrap();
        assert!(matches!(applied, FinishOutcome::Applied(ref t) if t.attempts == 2));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;
        let crashed = token_of(&store.claim(&id, None, expired()).await.unwrap());

        let outcome = store.claim(&id, None, lease()).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed { resumed: true, .. }));

        let late = store.finish(&id, crashed, Ok(json!("late"))).await.unwrap();
        assert_eq!(late, FinishOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_finish_writes_error_on_failure() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;
        let token = token_of(&store.claim(&id, None, lease()).await.unwrap());

        let error = TaskError::new(ErrorKind::Permanent, "bad upstream");
        let outcome = store.finish(&id, token, Err(error.clone())).await.unwrap();
        let FinishOutcome::Applied(task) = outcome else {
            panic!("expected Applied");
        };
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error, Some(error));
        assert!(task.is_consistent());

        // First terminal transition wins.
        let again = store.finish(&id, token, Ok(json!(1))).await.unwrap();
        assert_eq!(again, FinishOutcome::Superseded);
    }

    #[tokio::test]
    async fn test_claim_unknown_task_is_not_found() {
        let store = InMemoryTaskStore::new();
        assert!(matches!(
            store.claim(&TaskId::generate(), None, lease()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_have_single_winner() {
        let store = Arc::new(InMemoryTaskStore::new());
        let id = pending_task(&store).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim(&id, None, lease()).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ClaimOutcome::Claimed { .. } => winners += 1,
                ClaimOutcome::HeldElsewhere => {}
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_count_by_status_includes_zeroes() {
        let store = InMemoryTaskStore::new();
        let id = pending_task(&store).await;
        pending_task(&store).await;
        store.claim(&id, None, lease()).await.unwrap();

        let counts = store.count_by_status().await.unwrap();
        assert_eq!(counts[&TaskStatus::Pending], 1);
        assert_eq!(counts[&TaskStatus::Running], 1);
        assert_eq!(counts[&TaskStatus::Completed], 0);
        assert_eq!(counts[&TaskStatus::Failed], 0);
    }
}
