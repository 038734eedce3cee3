//! Usage accounting types.
//!
//! These types flow from a metered call (chunks), through the ledger (call
//! usage), into the persisted summary (totals).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Opaque identity of one in-flight metered call.
///
/// Allocated by the ledger from a single counter and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelCallHandle(u64);

impl ModelCallHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for ModelCallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "call#{}", self.0)
    }
}

/// Parameters describing a metered call when it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelCallRequest {
    /// Model requested from the provider
    pub model_id: String,
    /// Size of the request payload in bytes
    pub upload_bytes: u64,
    /// Requested image size for image-producing calls ("1K", "2K", ...)
    pub image_size: Option<String>,
}

impl ModelCallRequest {
    pub fn new(model_id: impl Into<String>, upload_bytes: u64) -> Self {
        Self {
            model_id: model_id.into(),
            upload_bytes,
            image_size: None,
        }
    }

    pub fn with_image_size(mut self, image_size: impl Into<String>) -> Self {
        self.image_size = Some(image_size.into());
        self
    }
}

/// Partial update to a call's counters.
///
/// Token fields carry the latest observed cumulative value: a present field
/// replaces the call's value, an absent field keeps it. `response_images` is
/// added to the call's running image count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageChunk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_image_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_images: Option<i64>,
}

/// Token counters accumulated for one open call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallUsage {
    pub prompt_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub response_tokens: Option<u64>,
    pub response_image_tokens: Option<u64>,
    pub thinking_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub tool_use_prompt_tokens: Option<u64>,
    pub model_version: Option<String>,
    pub response_images: u64,
}

fn clamp(value: i64) -> u64 {
    value.max(0) as u64
}

fn latest(slot: &mut Option<u64>, observed: Option<i64>) {
    if let Some(v) = observed {
        *slot = Some(clamp(v));
    }
}

impl CallUsage {
    /// Merge a chunk into this call, latest value wins per field.
    pub fn merge(&mut self, chunk: &UsageChunk) {
        latest(&mut self.prompt_tokens, chunk.prompt_tokens);
        latest(&mut self.cached_tokens, chunk.cached_tokens);
        latest(&mut self.response_tokens, chunk.response_tokens);
        latest(&mut self.response_image_tokens, chunk.response_image_tokens);
        latest(&mut self.thinking_tokens, chunk.thinking_tokens);
        latest(&mut self.total_tokens, chunk.total_tokens);
        latest(&mut self.tool_use_prompt_tokens, chunk.tool_use_prompt_tokens);

        if let Some(version) = chunk.model_version.as_deref().map(str::trim) {
            if !version.is_empty() {
                self.model_version = Some(version.to_string());
            }
        }
        if let Some(images) = chunk.response_images {
            self.response_images = self.response_images.saturating_add(clamp(images));
        }
    }

    fn has_tokens(&self) -> bool {
        [
            self.prompt_tokens,
            self.cached_tokens,
            self.response_tokens,
            self.response_image_tokens,
            self.thinking_tokens,
            self.total_tokens,
            self.tool_use_prompt_tokens,
        ]
        .iter()
        .any(Option::is_some)
    }

    /// Final token counts, or `None` if no token field was ever observed.
    pub fn token_totals(&self) -> Option<TokenTotals> {
        if !self.has_tokens() {
            return None;
        }

        let prompt = self.prompt_tokens.unwrap_or(0);
        let tool_use_prompt = self.tool_use_prompt_tokens.unwrap_or(0);
        let response = self.response_tokens.unwrap_or(0);
        let thinking = self.thinking_tokens.unwrap_or(0);
        let input = prompt.saturating_add(tool_use_prompt);
        let output = response.saturating_add(thinking);

        Some(TokenTotals {
            input,
            prompt,
            cached: self.cached_tokens.unwrap_or(0),
            tool_use_prompt,
            output,
            response,
            response_image_tokens: self.response_image_tokens.unwrap_or(0),
            thinking,
            total: self.total_tokens.unwrap_or(input.saturating_add(output)),
        })
    }
}

/// Token breakdown for one call or an aggregate of calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTotals {
    /// prompt + tool-use prompt
    pub input: u64,
    pub prompt: u64,
    pub cached: u64,
    pub tool_use_prompt: u64,
    /// response + thinking
    pub output: u64,
    pub response: u64,
    pub response_image_tokens: u64,
    pub thinking: u64,
    pub total: u64,
}

impl TokenTotals {
    /// Add another breakdown into this one.
    pub fn absorb(&mut self, other: &TokenTotals) {
        self.input = self.input.saturating_add(other.input);
        self.prompt = self.prompt.saturating_add(other.prompt);
        self.cached = self.cached.saturating_add(other.cached);
        self.tool_use_prompt = self.tool_use_prompt.saturating_add(other.tool_use_prompt);
        self.output = self.output.saturating_add(other.output);
        self.response = self.response.saturating_add(other.response);
        self.response_image_tokens = self
            .response_image_tokens
            .saturating_add(other.response_image_tokens);
        self.thinking = self.thinking.saturating_add(other.thinking);
        self.total = self.total.saturating_add(other.total);
    }
}

/// Aggregated consumption for a model or for the whole run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    pub calls: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenTotals>,
}

impl UsageTotals {
    /// Fold one finished call into the totals.
    pub fn fold(&mut self, cost_usd: f64, tokens: Option<&TokenTotals>) {
        self.calls = self.calls.saturating_add(1);
        self.cost_usd += cost_usd.max(0.0);
        if let Some(tokens) = tokens {
            self.tokens.get_or_insert_with(TokenTotals::default).absorb(tokens);
        }
    }
}

/// Point-in-time usage report, persisted as the usage summary artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub generated_at: DateTime<Utc>,
    pub totals: UsageTotals,
    pub models: BTreeMap<String, UsageTotals>,
}

impl Default for UsageSummary {
    fn default() -> Self {
        Self {
            generated_at: Utc::now(),
            totals: UsageTotals::default(),
            models: BTreeMap::new(),
        }
    }
}

/// What the ledger recorded when a call finished.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedCall {
    pub handle: ModelCallHandle,
    /// Model requested when the call started
    pub requested_model: String,
    /// Model the call was billed as (observed version if reported)
    pub model_id: String,
    pub tokens: Option<TokenTotals>,
    pub response_images: u64,
    pub cost_usd: f64,
    pub duration: Duration,
}
