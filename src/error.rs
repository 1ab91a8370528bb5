//! Error types for the consensys engine.
//!
//! Two layers of errors exist:
//! - `LlmError` covers the provider transport (HTTP failures, rate limits,
//!   unparseable responses).
//! - `EngineError` covers engine-fatal conditions, which are configuration
//!   problems rejected before any network call is made.
//!
//! Per-call degradation (transient failures, malformed output) is not an
//! error at the engine level: it is recorded as `CallStatus` on the affected
//! `AgentReview`, and a quorum failure is recorded on the session itself.

use thiserror::Error;

/// Errors that can occur during LLM provider operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API base URL: CONSENSYS_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Whether a retry could plausibly succeed.
    ///
    /// Network failures, rate limits and server-side (5xx) errors are
    /// transient; malformed responses and client-side (4xx) errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RequestFailed(_) | Self::RateLimited(_) => true,
            Self::ApiError { code, .. } => *code >= 500,
            Self::MissingApiBase | Self::ParseError(_) => false,
        }
    }
}

/// Errors surfaced by the debate engine to its caller.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request carried no source text to review.
    #[error("Source text is empty: there is nothing to review")]
    EmptySource,

    /// The request named no personas at all.
    #[error("Persona set is empty: at least one reviewer persona is required")]
    EmptyPersonaSet,

    /// The request named a persona id the registry does not know.
    #[error("Unknown persona id: '{0}'")]
    UnknownPersona(String),

    /// A coalesced request attached to an in-flight computation that died
    /// without publishing a session.
    #[error("Coalesced review computation failed before producing a session")]
    InFlightFailed,
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
