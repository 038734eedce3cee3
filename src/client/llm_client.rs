//! Model client for OpenAI-compatible endpoints.
//!
//! Every request is a metered call: it is registered with the job's reporter
//! before sending and finished once the response (or the error) is in, so the
//! usage ledger sees exactly one finish per request. No retries.

use crate::models::{
    ClientConfig, ModelCallRequest, ProviderError, Result, StagerunError, TokenTotals, UsageChunk,
};
use crate::progress::{MeteredCall, ProgressReporter};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Message in a chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// One completion to run.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    /// Overrides the client default
    pub max_tokens: Option<u32>,
    /// Overrides the client default
    pub temperature: Option<f64>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// Result of a completion.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Generated content
    pub content: String,
    /// Model that served the request (may differ from requested)
    pub model: String,
    /// Tokens as accounted by the ledger
    pub tokens: Option<TokenTotals>,
    /// Cost as accounted by the ledger
    pub cost_usd: f64,
    pub duration: Duration,
}

/// Generative-model boundary used by pipeline stages.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run one completion as a metered call reported through `reporter`.
    async fn complete(
        &self,
        reporter: &dyn ProgressReporter,
        request: CompletionRequest,
    ) -> Result<Completion>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
    prompt_tokens_details: Option<PromptTokensDetails>,
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CompletionTokensDetails {
    reasoning_tokens: Option<i64>,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Usage reported by the endpoint, in ledger terms.
///
/// Reasoning tokens are counted inside `completion_tokens` by the API, so
/// they are split out of the response count.
fn usage_chunk(usage: Option<&ChatUsage>, served_model: Option<&str>) -> UsageChunk {
    let mut chunk = UsageChunk {
        model_version: served_model.map(str::to_string),
        ..Default::default()
    };

    if let Some(usage) = usage {
        let thinking = usage
            .completion_tokens_details
            .as_ref()
            .and_then(|d| d.reasoning_tokens);

        chunk.prompt_tokens = usage.prompt_tokens;
        chunk.cached_tokens = usage.prompt_tokens_details.as_ref().and_then(|d| d.cached_tokens);
        chunk.response_tokens = usage
            .completion_tokens
            .map(|completion| completion - thinking.unwrap_or(0));
        chunk.thinking_tokens = thinking;
        chunk.total_tokens = usage.total_tokens;
    }

    chunk
}

fn classify_error(status: u16, body: &str, model: &str) -> ProviderError {
    let message = serde_json::from_str::<ApiErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string());

    match status {
        401 | 403 => ProviderError::AuthenticationFailed,
        404 => ProviderError::ModelNotFound(model.to_string()),
        429 => ProviderError::RateLimited { message },
        _ => ProviderError::ApiError { status, message },
    }
}

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct LlmClient {
    client: reqwest::Client,
    /// API key (None for local endpoints without auth)
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
    max_tokens: u32,
    temperature: f64,
}

impl LlmClient {
    pub fn new(
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout_secs: u64,
    ) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(StagerunError::Network)?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
            max_tokens: 4096,
            temperature: 0.7,
        })
    }

    /// Build from the `[client]` section with an already resolved key.
    pub fn from_config(config: &ClientConfig, api_key: String) -> Result<Self> {
        let mut client = Self::new(Some(api_key), &config.base_url, config.timeout_secs)?;
        client.max_tokens = config.max_tokens;
        client.temperature = config.temperature;
        Ok(client)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn send(&self, body: &[u8], model: &str) -> Result<ChatCompletionResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StagerunError::Timeout(self.timeout)
            } else {
                StagerunError::Network(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &body, model).into());
        }

        response
            .json()
            .await
            .map_err(|e| StagerunError::ParseError(format!("Failed to parse response: {e}")))
    }
}

#[async_trait]
impl ModelClient for LlmClient {
    async fn complete(
        &self,
        reporter: &dyn ProgressReporter,
        request: CompletionRequest,
    ) -> Result<Completion> {
        let start = Instant::now();
        let payload = ChatCompletionRequest {
            model: &request.model,
            messages: &request.messages,
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens),
            temperature: request.temperature.unwrap_or(self.temperature),
        };
        let body = serde_json::to_vec(&payload)
            .map_err(|e| StagerunError::Internal(format!("Serializing request: {e}")))?;

        let call = MeteredCall::start(
            reporter,
            ModelCallRequest::new(request.model.clone(), body.len() as u64),
        );
        let response = self.send(&body, &request.model).await?;
        call.record(&usage_chunk(response.usage.as_ref(), response.model.as_deref()));
        let finished = call.finish();

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::InvalidResponse("No content in response".to_string()))?;
        reporter.report_chars(content.chars().count() as u64);

        let duration = start.elapsed();
        debug!(
            job = reporter.job_id(),
            model = %request.model,
            duration_ms = duration.as_millis() as u64,
            "Completion finished"
        );

        Ok(Completion {
            content,
            model: response.model.unwrap_or(request.model),
            tokens: finished.as_ref().and_then(|f| f.tokens),
            cost_usd: finished.map_or(0.0, |f| f.cost_usd),
            duration,
        })
    }
}
