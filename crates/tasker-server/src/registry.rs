//! Task registry - maps task type names to their handlers.
//!
//! The set of handlers is closed: each task type is one [`TaskHandler`]
//! variant bundling its parameter validator and its execution logic. The
//! registry is built once at startup and never mutated afterwards.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use tasker_core::{ErrorKind, Parameters, TaskType};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::tasks::{ChatGptTask, SumTask, WeatherTask};

/// Registry lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Unknown task: {0}")]
    UnknownTaskType(String),
}

/// A parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    /// Name of the offending parameter.
    pub field: String,

    /// Human-readable explanation.
    pub message: String,
}

impl ValidationError {
    /// Create a new ValidationError.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Errors a handler can fail with while executing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Worth retrying: timeouts, rate limits, upstream outages.
    #[error("{0}")]
    Transient(String),

    /// Not worth retrying: malformed upstream responses, missing config.
    #[error("{0}")]
    Permanent(String),

    /// The input was rejected at execution time.
    #[error("{0}")]
    InvalidInput(String),
}

impl HandlerError {
    /// Whether the failure may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Error kind recorded when this failure becomes terminal.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientExhausted,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
        }
    }
}

impl From<ValidationError> for HandlerError {
    fn from(e: ValidationError) -> Self {
        Self::InvalidInput(e.message)
    }
}

/// One registered task type.
#[derive(Debug, Clone)]
pub enum TaskHandler {
    Sum(SumTask),
    Weather(WeatherTask),
    ChatGpt(ChatGptTask),
}

impl TaskHandler {
    /// Task type this handler executes.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::Sum(_) => TaskType::Sum,
            Self::Weather(_) => TaskType::Weather,
            Self::ChatGpt(_) => TaskType::ChatGpt,
        }
    }

    /// Check parameters before a task is accepted.
    pub fn validate(&self, parameters: &Parameters) -> Result<(), ValidationError> {
        match self {
            Self::Sum(task) => task.validate(parameters),
            Self::Weather(task) => task.validate(parameters),
            Self::ChatGpt(task) => task.validate(parameters),
        }
    }

    /// Run the handler.
    pub async fn execute(
        &self,
        parameters: &Parameters,
        metrics: &Metrics,
    ) -> Result<Value, HandlerError> {
        match self {
            Self::Sum(task) => task.execute(parameters),
            Self::Weather(task) => task.execute(parameters, metrics).await,
            Self::ChatGpt(task) => task.execute(parameters, metrics).await,
        }
    }
}

/// Immutable map of task types to handlers.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<TaskType, TaskHandler>,
}

impl TaskRegistry {
    /// Start building a registry.
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in task type, configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.external.http_timeout)
            .build()?;

        Ok(Self::builder()
            .register(TaskHandler::Sum(SumTask::new(config.limits.max_number_value)))
            .register(TaskHandler::Weather(WeatherTask::new(
                client.clone(),
                &config.external,
                config.limits.max_city_length,
            )))
            .register(TaskHandler::ChatGpt(ChatGptTask::new(
                client,
                &config.external,
                config.limits.max_prompt_length,
            )))
            .build())
    }

    /// Resolve a task name to its type and handler.
    pub fn resolve(&self, name: &str) -> Result<(TaskType, &TaskHandler), RegistryError> {
        let task_type: TaskType = name
            .parse()
            .map_err(|_| RegistryError::UnknownTaskType(name.to_string()))?;
        self.get(task_type).map(|handler| (task_type, handler))
    }

    /// Handler for an already-parsed task type.
    pub fn get(&self, task_type: TaskType) -> Result<&TaskHandler, RegistryError> {
        self.handlers
            .get(&task_type)
            .ok_or_else(|| RegistryError::UnknownTaskType(task_type.to_string()))
    }

    /// Registered task types.
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }
}

/// Builder for [`TaskRegistry`].
pub struct TaskRegistryBuilder {
    handlers: HashMap<TaskType, TaskHandler>,
}

impl TaskRegistryBuilder {
    /// Register a handler under its task type's name.
    pub fn register(mut self, handler: TaskHandler) -> Self {
        let task_type = handler.task_type();
        if self.handlers.insert(task_type, handler).is_some() {
            warn!(task_name = %task_type, "Handler registered twice, keeping the last one");
        }
        self
    }

    /// Freeze the registry.
    pub fn build(self) -> TaskRegistry {
        let mut names: Vec<&str> = self.handlers.keys().map(|t| t.as_str()).collect();
        names.sort_unstable();
        info!(tasks = ?names, "Task registry built");
        TaskRegistry {
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_resolve_registered_types() {
        let registry = TaskRegistry::from_config(&Config::default()).unwrap();
        assert_eq!(
            registry.task_types(),
            vec![TaskType::Sum, TaskType::Weather, TaskType::ChatGpt]
        );
        let (task_type, handler) = registry.resolve("weather").unwrap();
        assert_eq!(task_type, TaskType::Weather);
        assert_eq!(handler.task_type(), TaskType::Weather);
    }

    #[test]
    fn test_resolve_unknown_name() {
        let registry = TaskRegistry::from_config(&Config::default()).unwrap();
        assert_eq!(
            registry.resolve("invalid").unwrap_err(),
            RegistryError::UnknownTaskType("invalid".to_string())
        );
    }

    #[test]
    fn test_known_but_unregistered_type_is_unknown() {
        let registry = TaskRegistry::builder()
            .register(TaskHandler::Sum(SumTask::new(1e15)))
            .build();
        assert!(registry.resolve("sum").is_ok());
        assert_eq!(
            registry.resolve("chatgpt").unwrap_err(),
            RegistryError::UnknownTaskType("chatgpt".to_string())
        );
    }

    #[tokio::test]
    async fn test_dispatches_to_variant() {
        let registry = TaskRegistry::from_config(&Config::default()).unwrap();
        let (_, handler) = registry.resolve("sum").unwrap();
        let input = params(json!({"a": 2, "b": 40}));

        handler.validate(&input).unwrap();
        let output = handler.execute(&input, &Metrics::new()).await.unwrap();
        assert_eq!(output["result"], json!(42));
    }

    #[test]
    fn test_handler_error_kinds() {
        assert!(HandlerError::Transient("t".into()).is_transient());
        assert_eq!(
            HandlerError::Transient("t".into()).kind(),
            ErrorKind::TransientExhausted
        );
        assert_eq!(HandlerError::Permanent("p".into()).kind(), ErrorKind::Permanent);
        assert_eq!(
            HandlerError::from(ValidationError::new("city", "City 'x' not found")).kind(),
            ErrorKind::InvalidInput
        );
    }
}
