//! Built-in task handlers and shared parameter helpers.

mod chatgpt;
mod sum;
mod weather;

pub use chatgpt::ChatGptTask;
pub use sum::SumTask;
pub use weather::{Units, WeatherTask};

use serde_json::Value;
use tasker_core::Parameters;

use crate::registry::{HandlerError, ValidationError};

/// Fetch a required parameter.
fn required<'a>(
    parameters: &'a Parameters,
    field: &str,
    task: &str,
) -> Result<&'a Value, ValidationError> {
    parameters.get(field).ok_or_else(|| {
        ValidationError::new(
            field,
            format!("Parameter '{field}' is required for {task} task"),
        )
    })
}

/// Fetch a required, trimmed, non-empty string no longer than `max_len` chars.
fn required_text<'a>(
    parameters: &'a Parameters,
    field: &str,
    task: &str,
    max_len: usize,
) -> Result<&'a str, ValidationError> {
    let value = required(parameters, field, task)?
        .as_str()
        .ok_or_else(|| ValidationError::new(field, format!("Parameter '{field}' must be a string")))?;

    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new(
            field,
            format!("Parameter '{field}' must be a non-empty string"),
        ));
    }
    if trimmed.chars().count() > max_len {
        return Err(ValidationError::new(
            field,
            format!("Parameter '{field}' exceeds maximum length of {max_len} characters"),
        ));
    }
    Ok(trimmed)
}

/// Classify an outbound request failure and give it a metrics status label.
fn classify_request_error(api: &str, e: &reqwest::Error) -> (&'static str, HandlerError) {
    if e.is_timeout() {
        ("timeout", HandlerError::Transient(format!("{api} request timed out")))
    } else if e.is_decode() {
        ("error", HandlerError::Permanent(format!("{api} returned a malformed response: {e}")))
    } else if e.is_connect() || e.is_request() || e.is_body() {
        ("error", HandlerError::Transient(format!("{api} request failed: {e}")))
    } else {
        ("error", HandlerError::Permanent(format!("{api} request failed: {e}")))
    }
}

/// Classify a non-success HTTP status.
fn classify_status(api: &str, status: reqwest::StatusCode) -> HandlerError {
    let message = format!("{api} API error: {status}");
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        HandlerError::Transient(message)
    } else {
        HandlerError::Permanent(message)
    }
}
