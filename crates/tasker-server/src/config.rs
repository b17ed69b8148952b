//! Server configuration.

use std::collections::HashMap;
use std::time::Duration;

use tasker_core::{ResourceProfile, TaskType};
use thiserror::Error;

/// Queue for handlers that only compute locally.
pub const DEFAULT_QUEUE: &str = "default";

/// Queue for handlers that call external services.
pub const EXTERNAL_API_QUEUE: &str = "external-api";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Task type '{task}' is routed to undeclared queue '{queue}'")]
    UndeclaredQueue { task: TaskType, queue: String },

    #[error("Queue '{0}' is declared more than once")]
    DuplicateQueue(String),

    #[error("Queue '{0}' must allow at least one attempt")]
    NoAttempts(String),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server bind address.
    pub http_addr: String,

    /// Result cache settings.
    pub cache: CacheConfig,

    /// How long a delivered message stays invisible before redelivery.
    /// Claims are leases of the same length.
    pub visibility_timeout: Duration,

    /// Declared queues with their worker and retry settings.
    pub queues: Vec<QueueConfig>,

    /// Per task type queue overrides. Types not listed are routed by profile.
    pub routes: HashMap<TaskType, String>,

    /// Parameter validation limits.
    pub limits: ValidationLimits,

    /// External API settings.
    pub external: ExternalApiConfig,

    /// Emit logs as JSON lines.
    pub log_json: bool,
}

impl Config {
    /// Queue a task type is dispatched to.
    pub fn queue_for(&self, task_type: TaskType) -> &str {
        if let Some(queue) = self.routes.get(&task_type) {
            return queue;
        }
        match task_type.profile() {
            ResourceProfile::Cpu => DEFAULT_QUEUE,
            ResourceProfile::ExternalIo => EXTERNAL_API_QUEUE,
        }
    }

    /// Look up a declared queue.
    pub fn queue(&self, name: &str) -> Option<&QueueConfig> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Check that queue declarations and routes agree.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (i, queue) in self.queues.iter().enumerate() {
            if self.queues[..i].iter().any(|q| q.name == queue.name) {
                return Err(ConfigError::DuplicateQueue(queue.name.clone()));
            }
            if queue.retry.max_attempts == 0 {
                return Err(ConfigError::NoAttempts(queue.name.clone()));
            }
        }
        for task in TaskType::ALL {
            let queue = self.queue_for(task);
            if self.queue(queue).is_none() {
                return Err(ConfigError::UndeclaredQueue {
                    task,
                    queue: queue.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8000".to_string(),
            cache: CacheConfig::default(),
            visibility_timeout: Duration::from_secs(300),
            queues: vec![
                QueueConfig {
                    name: DEFAULT_QUEUE.to_string(),
                    workers: 4,
                    retry: RetryPolicy {
                        max_attempts: 3,
                        base_delay: Duration::from_secs(60),
                        max_delay: Duration::from_secs(600),
                    },
                },
                QueueConfig {
                    name: EXTERNAL_API_QUEUE.to_string(),
                    workers: 4,
                    retry: RetryPolicy::default(),
                },
            ],
            routes: HashMap::new(),
            limits: ValidationLimits::default(),
            external: ExternalApiConfig::default(),
            log_json: false,
        }
    }
}

/// Result cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Disable to always read through to the store.
    pub enabled: bool,

    /// Time-to-live of cached terminal records.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(3600),
        }
    }
}

/// One named queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue name.
    pub name: String,

    /// Number of concurrent workers pulling from this queue.
    pub workers: usize,

    /// Retry policy for transient handler failures.
    pub retry: RetryPolicy,
}

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total executions allowed, the first one included.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Whether a transient failure of `attempt` may be retried.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
        }
    }
}

/// Limits applied when validating parameters.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    /// Largest absolute value accepted for numeric inputs.
    pub max_number_value: f64,

    /// Longest accepted chat prompt, in characters.
    pub max_prompt_length: usize,

    /// Longest accepted city name, in characters.
    pub max_city_length: usize,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self {
            max_number_value: 1e15,
            max_prompt_length: 10_000,
            max_city_length: 100,
        }
    }
}

/// External API settings.
#[derive(Debug, Clone)]
pub struct ExternalApiConfig {
    /// OpenAI API key. Empty disables the chatgpt task at execution time.
    pub openai_api_key: String,

    /// OpenAI API base URL.
    pub openai_base_url: String,

    /// Open-Meteo geocoding endpoint.
    pub geocoding_url: String,

    /// Open-Meteo forecast endpoint.
    pub forecast_url: String,

    /// Per-request timeout for outbound calls.
    pub http_timeout: Duration,
}

impl Default for ExternalApiConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            geocoding_url: "https://geocoding-api.open-meteo.com/v1/search".to_string(),
            forecast_url: "https://api.open-meteo.com/v1/forecast".to_string(),
            http_timeout: Duration::from_secs(30),
        }
    }
}
