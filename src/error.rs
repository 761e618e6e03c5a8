//! Error types for the financial agent router

use crate::models::FailureKind;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

#[derive(Error, Debug)]
pub enum OrchestrationError {

    // =============================
    // Routing Errors
    // =============================

    #[error("Could not determine which agent should handle the request: {0}. Please clarify or pick an agent explicitly.")]
    RoutingAmbiguous(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    // =============================
    // Turn Execution Errors
    // =============================

    #[error("Capability '{capability}' is not allowed for agent '{agent}'")]
    CapabilityNotAllowed { agent: String, capability: String },

    #[error("{}", upstream_message(.kind, .message, .attempts))]
    Upstream {
        kind: FailureKind,
        message: String,
        attempts: u32,
    },

    #[error("Context overflow could not be resolved by compaction: {0}")]
    ContextOverflow(String),

    #[error("Execution budget exceeded ({0}). Please narrow the request.")]
    ExecutionBudgetExceeded(String),

    #[error("Turn cancelled")]
    Cancelled,

    #[error("No elicitation is pending for session {0}")]
    NoPendingElicitation(String),

    #[error("Turn aborted: {0}")]
    TurnAborted(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

fn upstream_message(kind: &FailureKind, message: &str, attempts: &u32) -> String {
    if kind.is_retryable() {
        format!(
            "Upstream {} after {} attempt(s): {}. Please retry later.",
            kind, attempts, message
        )
    } else {
        format!("Upstream {} failure: {}", kind, message)
    }
}

impl OrchestrationError {
    /// Stable machine-readable name of the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestrationError::RoutingAmbiguous(_) => "routing_ambiguous",
            OrchestrationError::UnknownAgent(_) => "unknown_agent",
            OrchestrationError::CapabilityNotAllowed { .. } => "capability_not_allowed",
            OrchestrationError::Upstream { kind, .. } => kind.as_str(),
            OrchestrationError::ContextOverflow(_) => "context_overflow",
            OrchestrationError::ExecutionBudgetExceeded(_) => "execution_budget_exceeded",
            OrchestrationError::Cancelled => "cancelled",
            OrchestrationError::NoPendingElicitation(_) => "no_pending_elicitation",
            OrchestrationError::TurnAborted(_) => "turn_aborted",
            OrchestrationError::ConfigError(_) => "config",
            OrchestrationError::DatabaseError(_) => "database",
            OrchestrationError::SerializationError(_) => "serialization",
            OrchestrationError::HttpError(_) => "http",
            OrchestrationError::IoError(_) => "io",
        }
    }

    /// Whether retrying the same request later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            OrchestrationError::Upstream { kind, .. } => kind.is_retryable(),
            _ => false,
        }
    }
}
