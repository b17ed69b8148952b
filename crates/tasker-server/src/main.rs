//! Tasker Server
//!
//! HTTP API plus the worker pool, in one process.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tasker_core::TaskType;
use tasker_server::config::{QueueConfig, EXTERNAL_API_QUEUE};
use tasker_server::{http, AppState, Config, WorkerPool};

/// Tasker asynchronous task server.
#[derive(Parser, Debug)]
#[command(name = "tasker-server", about = "Tasker asynchronous task server", version)]
struct Args {
    /// HTTP server address
    #[arg(long, env = "TASKER_HTTP_ADDR", default_value = "0.0.0.0:8000")]
    http_addr: String,

    /// Result cache TTL in seconds
    #[arg(long, env = "TASKER_CACHE_TTL_SECS", default_value = "3600")]
    cache_ttl_secs: u64,

    /// Disable the result cache
    #[arg(long, env = "TASKER_CACHE_DISABLED")]
    no_cache: bool,

    /// Seconds before an unacknowledged message is redelivered
    #[arg(long, env = "TASKER_VISIBILITY_TIMEOUT_SECS", default_value = "300")]
    visibility_timeout_secs: u64,

    /// Workers on the `default` queue
    #[arg(long, env = "TASKER_DEFAULT_WORKERS", default_value = "4")]
    default_workers: usize,

    /// Workers on the `external-api` queue
    #[arg(long, env = "TASKER_EXTERNAL_API_WORKERS", default_value = "4")]
    external_api_workers: usize,

    /// Total executions allowed per task, the first one included
    #[arg(long, env = "TASKER_MAX_ATTEMPTS", default_value = "3")]
    max_attempts: u32,

    /// Extra queue as NAME=WORKERS (repeatable)
    #[arg(long = "queue", value_parser = parse_queue)]
    queues: Vec<(String, usize)>,

    /// Route a task type to a queue as TASK=QUEUE (repeatable)
    #[arg(long = "route", value_parser = parse_route)]
    routes: Vec<(TaskType, String)>,

    /// Largest absolute value accepted for numeric inputs
    #[arg(long, env = "TASKER_MAX_NUMBER_VALUE", default_value = "1e15")]
    max_number_value: f64,

    /// Longest accepted chat prompt, in characters
    #[arg(long, env = "TASKER_MAX_PROMPT_LENGTH", default_value = "10000")]
    max_prompt_length: usize,

    /// Longest accepted city name, in characters
    #[arg(long, env = "TASKER_MAX_CITY_LENGTH", default_value = "100")]
    max_city_length: usize,

    /// OpenAI API key
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    openai_api_key: String,

    /// OpenAI API base URL
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    /// Open-Meteo geocoding endpoint
    #[arg(long, env = "TASKER_GEOCODING_URL", default_value = "https://geocoding-api.open-meteo.com/v1/search")]
    geocoding_url: String,

    /// Open-Meteo forecast endpoint
    #[arg(long, env = "TASKER_FORECAST_URL", default_value = "https://api.open-meteo.com/v1/forecast")]
    forecast_url: String,

    /// Timeout for outbound API calls in seconds
    #[arg(long, env = "TASKER_HTTP_TIMEOUT_SECS", default_value = "30")]
    http_timeout_secs: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "TASKER_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> Config {
        let mut config = Config {
            http_addr: self.http_addr,
            visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
            log_json: self.log_json,
            ..Config::default()
        };

        config.cache.enabled = !self.no_cache;
        config.cache.ttl = Duration::from_secs(self.cache_ttl_secs);

        for queue in &mut config.queues {
            queue.workers = if queue.name == EXTERNAL_API_QUEUE {
                self.external_api_workers
            } else {
                self.default_workers
            };
            queue.retry.max_attempts = self.max_attempts;
        }

        let external_retry = config
            .queue(EXTERNAL_API_QUEUE)
            .map(|q| q.retry)
            .unwrap_or_default();
        for (name, workers) in self.queues {
            config.queues.push(QueueConfig {
                name,
                workers,
                retry: external_retry,
            });
        }
        config.routes.extend(self.routes);

        config.limits.max_number_value = self.max_number_value;
        config.limits.max_prompt_length = self.max_prompt_length;
        config.limits.max_city_length = self.max_city_length;

        config.external.openai_api_key = self.openai_api_key;
        config.external.openai_base_url = self.openai_base_url;
        config.external.geocoding_url = self.geocoding_url;
        config.external.forecast_url = self.forecast_url;
        config.external.http_timeout = Duration::from_secs(self.http_timeout_secs);

        config
    }
}

fn parse_queue(s: &str) -> Result<(String, usize), String> {
    let (name, workers) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=WORKERS, got '{s}'"))?;
    let workers = workers
        .parse()
        .map_err(|e| format!("invalid worker count '{workers}': {e}"))?;
    Ok((name.to_string(), workers))
}

fn parse_route(s: &str) -> Result<(TaskType, String), String> {
    let (task, queue) = s
        .split_once('=')
        .ok_or_else(|| format!("expected TASK=QUEUE, got '{s}'"))?;
    let task = task.parse::<TaskType>().map_err(|e| e.to_string())?;
    Ok((task, queue.to_string()))
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("tasker=info,tasker_server=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = args.into_config();
    let http_addr: SocketAddr = config.http_addr.parse()?;

    let state = AppState::in_memory(config)?;
    info!(
        http_addr = %http_addr,
        queues = state.config.queues.len(),
        cache_ttl_secs = state.cache.ttl().as_secs(),
        "Starting Tasker server"
    );

    let workers = WorkerPool::start(state.clone());

    let listener = TcpListener::bind(http_addr).await?;
    info!("HTTP server listening on {}", http_addr);

    axum::serve(listener, http::create_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
        })
        .await?;

    workers.shutdown().await;
    info!("Tasker server stopped");
    Ok(())
}
