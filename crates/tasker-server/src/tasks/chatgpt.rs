//! Single chat completion against the OpenAI API.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use tasker_core::Parameters;

use super::{classify_request_error, classify_status, required_text};
use crate::config::ExternalApiConfig;
use crate::metrics::Metrics;
use crate::registry::{HandlerError, ValidationError};

const TASK: &str = "chatgpt";
const API: &str = "openai";
const API_NAME: &str = "OpenAI";

const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_MAX_TOKENS: u64 = 1000;
const DEFAULT_TEMPERATURE: f64 = 0.7;
const MAX_TOKENS_LIMIT: u64 = 4000;
const MAX_TEMPERATURE: f64 = 2.0;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u64,
    temperature: f64,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

/// Validated chat request parameters.
struct ChatInputs<'a> {
    prompt: &'a str,
    model: &'a str,
    max_tokens: u64,
    temperature: f64,
}

/// Sends parameter `prompt` to a chat model.
#[derive(Debug, Clone)]
pub struct ChatGptTask {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    max_prompt_length: usize,
}

impl ChatGptTask {
    pub fn new(client: reqwest::Client, external: &ExternalApiConfig, max_prompt_length: usize) -> Self {
        Self {
            client,
            base_url: external.openai_base_url.trim_end_matches('/').to_string(),
            api_key: external.openai_api_key.clone(),
            max_prompt_length,
        }
    }

    pub fn validate(&self, parameters: &Parameters) -> Result<(), ValidationError> {
        self.inputs(parameters).map(|_| ())
    }

    pub async fn execute(
        &self,
        parameters: &Parameters,
        metrics: &Metrics,
    ) -> Result<Value, HandlerError> {
        let inputs = self.inputs(parameters)?;
        if self.api_key.is_empty() {
            return Err(HandlerError::Permanent(
                "OpenAI API key is not configured".to_string(),
            ));
        }
        info!(
            prompt_length = inputs.prompt.chars().count(),
            model = inputs.model,
            "Chat completion started"
        );

        let started = Instant::now();
        let result = self.complete(&inputs).await;
        let elapsed = started.elapsed();

        match result {
            Ok((content, usage)) => {
                metrics.record_external_call(API, "success", elapsed);
                info!(
                    model = inputs.model,
                    duration_ms = elapsed.as_millis() as u64,
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    "Chat completion finished"
                );
                Ok(json!({
                    "prompt": inputs.prompt,
                    "response": content,
                    "model": inputs.model,
                    "usage": {
                        "prompt_tokens": usage.prompt_tokens,
                        "completion_tokens": usage.completion_tokens,
                        "total_tokens": usage.total_tokens,
                    },
                }))
            }
            Err((status, e)) => {
                metrics.record_external_call(API, status, elapsed);
                warn!(error = %e, duration_ms = elapsed.as_millis() as u64, "Chat completion failed");
                Err(e)
            }
        }
    }

    fn inputs<'a>(&self, parameters: &'a Parameters) -> Result<ChatInputs<'a>, ValidationError> {
        required_text(parameters, "prompt", TASK, self.max_prompt_length)?;
        // Send the prompt as given; only validation looks at the trimmed form.
        let prompt = parameters
            .get("prompt")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let model = match parameters.get("model") {
            None | Some(Value::Null) => DEFAULT_MODEL,
            Some(value) => value
                .as_str()
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .ok_or_else(|| {
                    ValidationError::new("model", "Parameter 'model' must be a non-empty string")
                })?,
        };

        let max_tokens = match parameters.get("max_tokens") {
            None | Some(Value::Null) => DEFAULT_MAX_TOKENS,
            Some(value) => value
                .as_u64()
                .filter(|n| (1..=MAX_TOKENS_LIMIT).contains(n))
                .ok_or_else(|| {
                    ValidationError::new(
                        "max_tokens",
                        format!("Parameter 'max_tokens' must be an integer between 1 and {MAX_TOKENS_LIMIT}"),
                    )
                })?,
        };

        let temperature = match parameters.get("temperature") {
            None | Some(Value::Null) => DEFAULT_TEMPERATURE,
            Some(value) => value
                .as_f64()
                .filter(|t| (0.0..=MAX_TEMPERATURE).contains(t))
                .ok_or_else(|| {
                    ValidationError::new(
                        "temperature",
                        format!("Parameter 'temperature' must be a number between 0 and {MAX_TEMPERATURE}"),
                    )
                })?,
        };

        Ok(ChatInputs {
            prompt,
            model,
            max_tokens,
            temperature,
        })
    }

    async fn complete(
        &self,
        inputs: &ChatInputs<'_>,
    ) -> Result<(Option<String>, Usage), (&'static str, HandlerError)> {
        let body = ChatRequest {
            model: inputs.model,
            messages: [ChatMessage {
                role: "user",
                content: inputs.prompt,
            }],
            max_tokens: inputs.max_tokens,
            temperature: inputs.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_request_error(API_NAME, &e))?;

        if !response.status().is_success() {
            return Err(("error", classify_status(API_NAME, response.status())));
        }
        let completion: ChatResponse = response
            .json()
            .await
            .map_err(|e| classify_request_error(API_NAME, &e))?;

        let choice = completion.choices.into_iter().next().ok_or_else(|| {
            (
                "error",
                HandlerError::Permanent("OpenAI response contained no choices".to_string()),
            )
        })?;
        Ok((choice.message.content, completion.usage.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::testing::serve;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    fn task_for(base: &str, api_key: &str) -> ChatGptTask {
        let external = ExternalApiConfig {
            openai_api_key: api_key.to_string(),
            openai_base_url: base.to_string(),
            ..ExternalApiConfig::default()
        };
        ChatGptTask::new(reqwest::Client::new(), &external, 10_000)
    }

    async fn completions(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
        if headers.get("authorization").and_then(|v| v.to_str().ok()) != Some("Bearer sk-test") {
            return (StatusCode::UNAUTHORIZED, Json(json!({"error": "bad key"})));
        }
        let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();
        (
            StatusCode::OK,
            Json(json!({
                "model": body["model"],
                "choices": [{"index": 0, "message": {"role": "assistant", "content": format!("echo: {prompt}")}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 4, "total_tokens": 7}
            })),
        )
    }

    #[test]
    fn test_validate_prompt() {
        let task = task_for("http://127.0.0.1:9", "sk-test");
        assert!(task.validate(&params(json!({"prompt": "Hello"}))).is_ok());

        let err = task.validate(&params(json!({}))).unwrap_err();
        assert_eq!(err.field, "prompt");
        let err = task.validate(&params(json!({"prompt": ""}))).unwrap_err();
        assert_eq!(err.field, "prompt");
        let err = task
            .validate(&params(json!({"prompt": "a".repeat(10_001)})))
            .unwrap_err();
        assert!(err.message.contains("maximum length of 10000"));
    }

    #[test]
    fn test_validate_optional_parameters() {
        let task = task_for("http://127.0.0.1:9", "sk-test");
        assert!(task
            .validate(&params(json!({"prompt": "hi", "max_tokens": 4000, "temperature": 2})))
            .is_ok());
        assert_eq!(
            task.validate(&params(json!({"prompt": "hi", "max_tokens": 0})))
                .unwrap_err()
                .field,
            "max_tokens"
        );
        assert_eq!(
            task.validate(&params(json!({"prompt": "hi", "max_tokens": 4001})))
                .unwrap_err()
                .field,
            "max_tokens"
        );
        assert_eq!(
            task.validate(&params(json!({"prompt": "hi", "temperature": 2.5})))
                .unwrap_err()
                .field,
            "temperature"
        );
        assert_eq!(
            task.validate(&params(json!({"prompt": "hi", "model": ""})))
                .unwrap_err()
                .field,
            "model"
        );
    }

    #[tokio::test]
    async fn test_completion() {
        let base = serve(Router::new().route("/chat/completions", post(completions))).await;
        let task = task_for(&base, "sk-test");
        let metrics = Metrics::new();

        let output = task
            .execute(&params(json!({"prompt": "Hello"})), &metrics)
            .await
            .unwrap();

        assert_eq!(output["prompt"], "Hello");
        assert_eq!(output["response"], "echo: Hello");
        assert_eq!(output["model"], DEFAULT_MODEL);
        assert_eq!(output["usage"]["total_tokens"], 7);
        assert_eq!(metrics.external_requests("openai", "success"), 1);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_permanent() {
        let task = task_for("http://127.0.0.1:9", "");
        let err = task
            .execute(&params(json!({"prompt": "Hello"})), &Metrics::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HandlerError::Permanent("OpenAI API key is not configured".into())
        );
    }

    #[tokio::test]
    async fn test_rejected_key_is_permanent() {
        let base = serve(Router::new().route("/chat/completions", post(completions))).await;
        let task = task_for(&base, "sk-wrong");
        let metrics = Metrics::new();

        let err = task
            .execute(&params(json!({"prompt": "Hello"})), &metrics)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
        assert_eq!(metrics.external_requests("openai", "error"), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { StatusCode::TOO_MANY_REQUESTS }),
        );
        let base = serve(router).await;
        let task = task_for(&base, "sk-test");

        let err = task
            .execute(&params(json!({"prompt": "Hello"})), &Metrics::new())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_choices_is_permanent() {
        let router = Router::new().route(
            "/chat/completions",
            post(|| async { Json(json!({"choices": []})) }),
        );
        let base = serve(router).await;
        let task = task_for(&base, "sk-test");

        let err = task
            .execute(&params(json!({"prompt": "Hello"})), &Metrics::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Permanent(_)));
    }
}
