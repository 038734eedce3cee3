//! Error types for stagerun.
//!
//! Taxonomy:
//! - Validation: a checkpoint or response failed its schema (absorbed by stages)
//! - Transient: a metered call failed in flight (network, provider)
//! - Fatal: configuration is missing or wrong, the run cannot continue
//! - Item: one job's handler failed

use std::time::Duration;
use thiserror::Error;

/// Top-level error type for stagerun.
#[derive(Debug, Error)]
pub enum StagerunError {
    // ═══════════════════════════════════════════════════════════════════
    // FATAL: abort the whole run
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    // ═══════════════════════════════════════════════════════════════════
    // VALIDATION: absorbed at the stage boundary
    // ═══════════════════════════════════════════════════════════════════

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // TRANSIENT: a metered call failed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    // ═══════════════════════════════════════════════════════════════════
    // ITEM: a single job failed
    // ═══════════════════════════════════════════════════════════════════

    #[error("Job {id} failed: {message}")]
    Item { id: String, message: String },

    #[error("Job {id} panicked")]
    JobPanicked { id: String },

    // ═══════════════════════════════════════════════════════════════════
    // STAGE GRAPH: rejected at construction
    // ═══════════════════════════════════════════════════════════════════

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Stage declared twice: {0}")]
    DuplicateStage(String),

    #[error("Stage '{stage}' depends on undeclared stage '{dependency}'")]
    MissingDependency { stage: String, dependency: String },

    #[error("Stage dependency cycle through '{0}'")]
    StageCycle(String),

    // ═══════════════════════════════════════════════════════════════════
    // INFRASTRUCTURE
    // ═══════════════════════════════════════════════════════════════════

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors reported by a model provider endpoint.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Rate limited by provider: {message}")]
    RateLimited { message: String },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl StagerunError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create an item error for a failed job.
    pub fn item(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Item {
            id: id.into(),
            message: message.into(),
        }
    }

    /// Whether this error must abort the entire run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Provider(ProviderError::AuthenticationFailed)
        )
    }
}

/// Result type alias for stagerun.
pub type Result<T> = std::result::Result<T, StagerunError>;
