//! Tasker CLI - Command line interface for the Tasker HTTP API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::{json, Value};

use tasker_core::{TaskId, TaskStatus};

/// Tasker CLI - submit and inspect tasks
#[derive(Parser)]
#[command(name = "tasker")]
#[command(about = "CLI for the Tasker task server", long_about = None)]
struct Cli {
    /// Server base URL
    #[arg(short, long, env = "TASKER_URL", default_value = "http://127.0.0.1:8000")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a task
    Run {
        /// Task type name (sum, weather, chatgpt)
        #[arg(short, long)]
        task: String,

        /// Task parameters as a JSON object
        #[arg(short, long, default_value = "{}")]
        params: String,

        /// Poll until the task reaches a terminal state
        #[arg(short, long)]
        wait: bool,
    },

    /// Get task status
    Status {
        /// Task UUID
        id: TaskId,
    },

    /// Get task output
    Output {
        /// Task UUID
        id: TaskId,
    },

    /// Check server health
    Health,
}

#[derive(Debug, Deserialize)]
struct Submitted {
    task_uuid: TaskId,
    message: String,
}

#[derive(Debug, Deserialize)]
struct StatusView {
    status: TaskStatus,
}

#[derive(Debug, Deserialize)]
struct OutputView {
    task_uuid: TaskId,
    task_name: String,
    status: TaskStatus,
    task_output: Option<Value>,
    error_message: Option<String>,
    error_kind: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    detail: String,
    error_code: String,
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let base = cli.url.trim_end_matches('/');

    match cli.command {
        Commands::Run { task, params, wait } => {
            run_task(&client, base, task, &params, wait).await?;
        }
        Commands::Status { id } => {
            let status = get_status(&client, base, id).await?;
            println!("{id}  {status}");
        }
        Commands::Output { id } => {
            let output = get_output(&client, base, id).await?;
            print_output(&output);
        }
        Commands::Health => {
            let body: Value = checked(client.get(format!("{base}/health")).send().await?).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    Ok(())
}

async fn run_task(
    client: &reqwest::Client,
    base: &str,
    task_name: String,
    params: &str,
    wait: bool,
) -> CliResult<()> {
    let task_parameters: Value = serde_json::from_str(params)?;
    if !task_parameters.is_object() {
        return Err("--params must be a JSON object".into());
    }

    let response = client
        .post(format!("{base}/run-task"))
        .json(&json!({"task_name": task_name, "task_parameters": task_parameters}))
        .send()
        .await?;
    let submitted: Submitted = checked(response).await?;

    println!("{}: {}", submitted.message, submitted.task_uuid);

    if wait {
        loop {
            if get_status(client, base, submitted.task_uuid).await?.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        print_output(&get_output(client, base, submitted.task_uuid).await?);
    }

    Ok(())
}

async fn get_status(client: &reqwest::Client, base: &str, id: TaskId) -> CliResult<TaskStatus> {
    let response = client
        .get(format!("{base}/tasks/{id}/status"))
        .send()
        .await?;
    let view: StatusView = checked(response).await?;
    Ok(view.status)
}

async fn get_output(client: &reqwest::Client, base: &str, id: TaskId) -> CliResult<OutputView> {
    let response = client
        .get(format!("{base}/get-task-output"))
        .query(&[("task_uuid", id.to_string())])
        .send()
        .await?;
    checked(response).await
}

/// Decode a success body, or turn an error body into an error.
async fn checked<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> CliResult<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    match response.json::<ApiError>().await {
        Ok(e) => Err(format!("{status} {}: {}", e.error_code, e.detail).into()),
        Err(_) => Err(format!("request failed with {status}").into()),
    }
}

fn print_output(task: &OutputView) {
    println!("  ID:         {}", task.task_uuid);
    println!("  Task:       {}", task.task_name);
    println!("  Status:     {}", task.status);
    println!("  Created:    {}", format_timestamp(&task.created_at));
    if let Some(completed_at) = &task.completed_at {
        println!("  Completed:  {}", format_timestamp(completed_at));
    }

    if let Some(output) = &task.task_output {
        let pretty = serde_json::to_string_pretty(output).unwrap_or_else(|_| output.to_string());
        println!("  Output:");
        for line in pretty.lines() {
            println!("    {line}");
        }
    }
    if let Some(message) = &task.error_message {
        let kind = task.error_kind.as_deref().unwrap_or("error");
        println!("  Error:      [{kind}] {message}");
    }
}

fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}
