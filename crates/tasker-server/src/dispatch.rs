//! Dispatch router - routes tasks to queues by type.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use tasker_core::{Task, TaskMessage, TaskType};

use crate::broker::{Broker, BrokerError};
use crate::config::Config;

/// Routes task types to queues and enqueues their messages.
pub struct DispatchRouter {
    broker: Arc<dyn Broker>,
    routes: HashMap<TaskType, String>,
}

impl DispatchRouter {
    /// Create a router with the routing table resolved from `config`.
    pub fn new(config: &Config, broker: Arc<dyn Broker>) -> Self {
        let routes = TaskType::ALL
            .into_iter()
            .map(|t| (t, config.queue_for(t).to_string()))
            .collect();
        Self { broker, routes }
    }

    /// Queue a task type is dispatched to.
    pub fn route(&self, task_type: TaskType) -> &str {
        // Every type is in the table; the profile default is a fallback only.
        self.routes
            .get(&task_type)
            .map(String::as_str)
            .unwrap_or(crate::config::DEFAULT_QUEUE)
    }

    /// Enqueue the first attempt of a task on its routed queue.
    pub async fn dispatch(&self, task: &Task) -> Result<(), BrokerError> {
        let queue = self.route(task.name);
        self.broker
            .enqueue(queue, TaskMessage::initial(task.id, task.name))
            .await?;

        info!(
            task_id = %task.id,
            task_name = %task.name,
            queue = %queue,
            "Dispatched task"
        );
        Ok(())
    }
}
