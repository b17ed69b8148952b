//! Worker pool - consumes queues and drives tasks to a terminal state.
//!
//! Each worker loops on one queue: receive a message, claim the task in the
//! store, run the handler, then either write the terminal state or schedule a
//! retry. The message is acknowledged only after the store and cache writes,
//! so a crash at any point leads to redelivery rather than loss.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tasker_core::{ClaimToken, ErrorKind, Task, TaskError, TaskMessage};

use crate::broker::{BrokerError, Delivery};
use crate::config::RetryPolicy;
use crate::metrics::{ClaimResult, ExecutionResult};
use crate::registry::HandlerError;
use crate::state::AppState;
use crate::store::{ClaimOutcome, FinishOutcome, StoreError};

/// Pause after a failed receive before polling again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// Errors that leave a message unacknowledged for redelivery.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Running set of workers across all configured queues.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Spawn `workers` consumers for every configured queue.
    pub fn start(state: Arc<AppState>) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        for queue in &state.config.queues {
            for n in 0..queue.workers {
                let worker = Worker {
                    id: format!("{}-{n}", queue.name),
                    queue: queue.name.clone(),
                    retry: queue.retry,
                    state: state.clone(),
                };
                handles.push(tokio::spawn(worker.run(shutdown.child_token())));
            }
        }

        info!(workers = handles.len(), "Worker pool started");
        Self { handles, shutdown }
    }

    /// Number of spawned workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop receiving and wait for in-progress tasks to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

/// One consumer bound to one queue.
pub struct Worker {
    id: String,
    queue: String,
    retry: RetryPolicy,
    state: Arc<AppState>,
}

impl Worker {
    /// Create a worker for a declared queue. Returns None for unknown queues.
    pub fn for_queue(state: Arc<AppState>, queue: &str) -> Option<Self> {
        let config = state.config.queue(queue)?;
        Some(Self {
            id: format!("{queue}-0"),
            queue: config.name.clone(),
            retry: config.retry,
            state,
        })
    }

    /// Receive and process messages until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.id, queue = %self.queue, "Worker started");

        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.state.broker.receive(&self.queue) => received,
            };

            match received {
                Ok(delivery) => {
                    if let Err(e) = self.process(&delivery).await {
                        warn!(
                            worker_id = %self.id,
                            task_id = %delivery.message.task_id,
                            error = %e,
                            "Message left for redelivery"
                        );
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, queue = %self.queue, error = %e, "Receive failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_BACKOFF) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Handle one delivery end to end.
    pub async fn process(&self, delivery: &Delivery) -> Result<(), WorkerError> {
        let message = &delivery.message;
        let state = &self.state;

        let outcome = match state
            .store
            .claim(&message.task_id, message.claim_token, delivery.redeliver_at())
            .await
        {
            Ok(outcome) => outcome,
            Err(StoreError::NotFound(id)) => {
                warn!(task_id = %id, "Message for unknown task, dropping");
                state.broker.ack(delivery).await?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match outcome {
            ClaimOutcome::AlreadyTerminal(status) => {
                state.metrics.record_claim(ClaimResult::Duplicate);
                debug!(task_id = %message.task_id, %status, "Task already terminal, skipping");
            }
            ClaimOutcome::HeldElsewhere => {
                state.metrics.record_claim(ClaimResult::HeldElsewhere);
                debug!(task_id = %message.task_id, "Task claimed by another worker, skipping");
            }
            ClaimOutcome::Claimed {
                task,
                token,
                resumed,
            } => {
                state.metrics.record_claim(if resumed {
                    ClaimResult::Resumed
                } else {
                    ClaimResult::Claimed
                });
                self.execute(delivery, task, token).await?;
            }
        }

        state.broker.ack(delivery).await?;
        Ok(())
    }

    async fn execute(
        &self,
        delivery: &Delivery,
        task: Task,
        token: ClaimToken,
    ) -> Result<(), WorkerError> {
        let state = &self.state;
        info!(
            worker_id = %self.id,
            task_id = %task.id,
            task_name = %task.name,
            attempt = task.attempts,
            "Executing task"
        );

        let handler = match state.registry.get(task.name) {
            Ok(handler) => handler,
            Err(e) => {
                let error = TaskError::new(ErrorKind::Permanent, e.to_string());
                return self
                    .finish(&task, token, Err(error), ExecutionResult::Failure, Duration::ZERO)
                    .await;
            }
        };

        let started = Instant::now();
        let result = handler.execute(&task.parameters, &state.metrics).await;
        let elapsed = started.elapsed();

        match result {
            Ok(output) => {
                self.finish(&task, token, Ok(output), ExecutionResult::Success, elapsed)
                    .await
            }
            Err(e) if e.is_transient() && self.retry.allows_retry_after(task.attempts) => {
                self.schedule_retry(&delivery.message, &task, token, &e).await?;
                state
                    .metrics
                    .record_execution(task.name, ExecutionResult::Retry, elapsed);
                Ok(())
            }
            Err(e) => {
                let error = TaskError::new(e.kind(), e.to_string());
                self.finish(&task, token, Err(error), ExecutionResult::Failure, elapsed)
                    .await
            }
        }
    }

    async fn schedule_retry(
        &self,
        message: &TaskMessage,
        task: &Task,
        token: ClaimToken,
        error: &HandlerError,
    ) -> Result<(), WorkerError> {
        let delay = self.retry.backoff(task.attempts);
        self.state
            .broker
            .enqueue_after(&self.queue, message.retry(token), delay)
            .await?;

        warn!(
            task_id = %task.id,
            task_name = %task.name,
            attempt = task.attempts,
            max_attempts = self.retry.max_attempts,
            delay_secs = delay.as_secs_f64(),
            error = %error,
            "Transient failure, retry scheduled"
        );
        Ok(())
    }

    async fn finish(
        &self,
        task: &Task,
        token: ClaimToken,
        result: Result<serde_json::Value, TaskError>,
        execution: ExecutionResult,
        elapsed: Duration,
    ) -> Result<(), WorkerError> {
        let state = &self.state;

        match state.store.finish(&task.id, token, result).await? {
            FinishOutcome::Applied(done) => {
                state.cache.put(&done).await;
                state.metrics.record_execution(done.name, execution, elapsed);
                match &done.error {
                    None => info!(
                        task_id = %done.id,
                        task_name = %done.name,
                        duration_ms = elapsed.as_millis() as u64,
                        "Task completed"
                    ),
                    Some(error) => warn!(
                        task_id = %done.id,
                        task_name = %done.name,
                        error_kind = %error.kind,
                        error = %error.message,
                        "Task failed"
                    ),
                }
            }
            FinishOutcome::Superseded => {
                warn!(task_id = %task.id, "Claim superseded, discarding result");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DEFAULT_QUEUE, EXTERNAL_API_QUEUE};
    use crate::tasks::testing::serve;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tasker_core::{Parameters, TaskId, TaskStatus, TaskType};

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn fast_retry_config() -> Config {
        let mut config = Config::default();
        for queue in &mut config.queues {
            queue.workers = 1;
            queue.retry.base_delay = Duration::ZERO;
            queue.retry.max_delay = Duration::ZERO;
        }
        config
    }

    async fn submit(state: &AppState, task_type: TaskType, parameters: Parameters) -> TaskId {
        let task = Task::new(task_type, parameters);
        let id = task.id;
        state.store.create(task.clone()).await.unwrap();
        state.router.dispatch(&task).await.unwrap();
        id
    }

    async fn process_next(state: &Arc<AppState>, queue: &str) {
        let worker = Worker::for_queue(state.clone(), queue).unwrap();
        let delivery = state.broker.receive(queue).await.unwrap();
        worker.process(&delivery).await.unwrap();
    }

    async fn stored(state: &AppState, id: TaskId) -> Task {
        state.store.get(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_sum_task_completes() {
        let state = AppState::in_memory(fast_retry_config()).unwrap();
        let id = submit(&state, TaskType::Sum, params(json!({"a": 5, "b": 3}))).await;

        process_next(&state, DEFAULT_QUEUE).await;

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output.unwrap()["result"], json!(8));
        assert_eq!(task.attempts, 1);
        assert!(task.completed_at.is_some());
        assert_eq!(state.cache.get(&id).await.unwrap().status, TaskStatus::Completed);
        assert_eq!(state.broker.depth(DEFAULT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_message_executes_once() {
        let state = AppState::in_memory(fast_retry_config()).unwrap();
        let id = submit(&state, TaskType::Sum, params(json!({"a": 1, "b": 2}))).await;
        state
            .broker
            .enqueue(DEFAULT_QUEUE, TaskMessage::initial(id, TaskType::Sum))
            .await
            .unwrap();

        process_next(&state, DEFAULT_QUEUE).await;
        let first = stored(&state, id).await;
        process_next(&state, DEFAULT_QUEUE).await;

        assert_eq!(stored(&state, id).await, first);
        assert_eq!(
            state.metrics.executions(TaskType::Sum, ExecutionResult::Success),
            1
        );
        assert_eq!(state.metrics.claims(ClaimResult::Duplicate), 1);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let state = AppState::in_memory(fast_retry_config()).unwrap();
        let id = submit(&state, TaskType::ChatGpt, params(json!({"prompt": "hi"}))).await;

        process_next(&state, EXTERNAL_API_QUEUE).await;

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        let error = task.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Permanent);
        assert_eq!(error.message, "OpenAI API key is not configured");
        assert_eq!(state.broker.depth(EXTERNAL_API_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_input_at_execution_fails_without_retry() {
        let state = AppState::in_memory(fast_retry_config()).unwrap();
        // Bypass submission-time validation.
        let id = submit(&state, TaskType::Sum, params(json!({"a": 1}))).await;

        process_next(&state, DEFAULT_QUEUE).await;

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.unwrap().kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_retry_budget() {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/search",
                get(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(hits.clone());
        let base = serve(router).await;

        let mut config = fast_retry_config();
        config.external.geocoding_url = format!("{base}/search");
        let state = AppState::in_memory(config).unwrap();
        let id = submit(&state, TaskType::Weather, params(json!({"city": "London"}))).await;

        for _ in 0..3 {
            process_next(&state, EXTERNAL_API_QUEUE).await;
        }

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        assert_eq!(task.error.unwrap().kind, ErrorKind::TransientExhausted);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(
            state.metrics.executions(TaskType::Weather, ExecutionResult::Retry),
            2
        );
        assert_eq!(
            state.metrics.executions(TaskType::Weather, ExecutionResult::Failure),
            1
        );
        assert_eq!(state.broker.depth(EXTERNAL_API_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_retry_keeps_task_running() {
        let router = Router::new().route("/search", get(|| async { StatusCode::BAD_GATEWAY }));
        let base = serve(router).await;

        let mut config = fast_retry_config();
        config.external.geocoding_url = format!("{base}/search");
        let state = AppState::in_memory(config).unwrap();
        let id = submit(&state, TaskType::Weather, params(json!({"city": "London"}))).await;

        process_next(&state, EXTERNAL_API_QUEUE).await;

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.attempts, 1);
        let retry = state.broker.receive(EXTERNAL_API_QUEUE).await.unwrap();
        assert_eq!(retry.message.attempt, 2);
        assert!(retry.message.claim_token.is_some());
    }

    #[tokio::test]
    async fn test_live_claim_elsewhere_is_skipped_then_taken_over() {
        let mut config = fast_retry_config();
        config.visibility_timeout = Duration::from_millis(100);
        let state = AppState::in_memory(config).unwrap();
        let id = submit(&state, TaskType::Sum, params(json!({"a": 2, "b": 2}))).await;

        // Another worker claimed the task and then went away.
        state
            .store
            .claim(&id, None, Instant::now() + Duration::from_millis(100))
            .await
            .unwrap();

        process_next(&state, DEFAULT_QUEUE).await;
        assert_eq!(stored(&state, id).await.status, TaskStatus::Running);
        assert_eq!(state.metrics.claims(ClaimResult::HeldElsewhere), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        state
            .broker
            .enqueue(DEFAULT_QUEUE, TaskMessage::initial(id, TaskType::Sum))
            .await
            .unwrap();
        process_next(&state, DEFAULT_QUEUE).await;

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 2);
        assert_eq!(state.metrics.claims(ClaimResult::Resumed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_worker_is_recovered_by_redelivery() {
        let state = AppState::in_memory(Config::default()).unwrap();
        let id = submit(&state, TaskType::Sum, params(json!({"a": 4, "b": 5}))).await;

        // A worker receives and claims the task, then dies without acking.
        let abandoned = state.broker.receive(DEFAULT_QUEUE).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        let outcome = state
            .store
            .claim(&id, None, abandoned.redeliver_at())
            .await
            .unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed { resumed: false, .. }));

        // The broker's visibility timeout brings the message back.
        process_next(&state, DEFAULT_QUEUE).await;

        let task = stored(&state, id).await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.output.unwrap()["result"], json!(9));
        assert_eq!(task.attempts, 2);
        assert_eq!(state.metrics.claims(ClaimResult::Resumed), 1);
        assert_eq!(state.metrics.claims(ClaimResult::HeldElsewhere), 0);
        assert_eq!(state.broker.depth(DEFAULT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_message_for_unknown_task_is_dropped() {
        let state = AppState::in_memory(fast_retry_config()).unwrap();
        state
            .broker
            .enqueue(DEFAULT_QUEUE, TaskMessage::initial(TaskId::generate(), TaskType::Sum))
            .await
            .unwrap();

        process_next(&state, DEFAULT_QUEUE).await;
        assert_eq!(state.broker.depth(DEFAULT_QUEUE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pool_processes_until_shutdown() {
        let state = AppState::in_memory(fast_retry_config()).unwrap();
        let pool = WorkerPool::start(state.clone());
        assert_eq!(pool.len(), 2);

        let id = submit(&state, TaskType::Sum, params(json!({"a": 20, "b": 22}))).await;

        let task = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let task = stored(&state, id).await;
                if task.is_terminal() {
                    break task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(task.output.unwrap()["result"], json!(42));

        tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
    }
}
