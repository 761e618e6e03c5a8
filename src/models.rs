//! Core data models shared by the router, executor and collaborators

use crate::memory::Turn;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

//
// ================= Failure Kinds =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Upstream at capacity (rate limit, 503, 529)
    Overloaded,
    Timeout,
    /// Tool server or provider unreachable
    Unavailable,
    /// Bad credentials, malformed request. Never retried.
    Fatal,
    /// Provider rejected the prompt as too long
    ContextOverflow,
    Cancelled,
    /// Model asked for a capability outside its agent's allow-list
    CapabilityNotAllowed,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::Overloaded | FailureKind::Timeout | FailureKind::Unavailable
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Overloaded => "overloaded",
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::Fatal => "fatal",
            FailureKind::ContextOverflow => "context_overflow",
            FailureKind::Cancelled => "cancelled",
            FailureKind::CapabilityNotAllowed => "capability_not_allowed",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure recorded in a tool-result turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailureDescriptor {
    pub kind: FailureKind,
    pub message: String,
}

/// Raw failure reported by a model provider or tool server.
///
/// `kind` is an optional hint from the collaborator; the retry controller's
/// classifier has the final word.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamFailure {
    pub kind: Option<FailureKind>,
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            status: None,
            message: message.into(),
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: None,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            status: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "[{}] {}", status, self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<reqwest::Error> for UpstreamFailure {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            Some(FailureKind::Timeout)
        } else if err.is_connect() {
            Some(FailureKind::Unavailable)
        } else {
            None
        };

        let status = err.status().map(|s| s.as_u16());

        // request urls may carry credentials in their query string
        Self {
            kind,
            status,
            message: err.without_url().to_string(),
        }
    }
}

//
// ================= Capabilities =================
//

/// A capability invocation requested by the model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub capability: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum CapabilityOutcome {
    Success { data: serde_json::Value },
    Failure { error: FailureDescriptor },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityResult {
    pub call: ToolCall,
    pub outcome: CapabilityOutcome,
    /// Attempts spent by the retry controller (0 when never sent)
    pub attempts: u32,
    /// Backoff slept before each retry, in attempt order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_delays_ms: Vec<u64>,
}

impl CapabilityResult {
    pub fn success(call: ToolCall, data: serde_json::Value, attempts: u32) -> Self {
        Self {
            call,
            outcome: CapabilityOutcome::Success { data },
            attempts,
            retry_delays_ms: Vec::new(),
        }
    }

    pub fn failure(
        call: ToolCall,
        kind: FailureKind,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            call,
            outcome: CapabilityOutcome::Failure {
                error: FailureDescriptor {
                    kind,
                    message: message.into(),
                },
            },
            attempts,
            retry_delays_ms: Vec::new(),
        }
    }

    pub fn with_retry_delays(mut self, delays: &[Duration]) -> Self {
        self.retry_delays_ms = delays.iter().map(|d| d.as_millis() as u64).collect();
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CapabilityOutcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            CapabilityOutcome::Failure { error } => Some(error.kind),
            CapabilityOutcome::Success { .. } => None,
        }
    }

    /// JSON payload handed back to the model
    pub fn to_payload(&self) -> serde_json::Value {
        match &self.outcome {
            CapabilityOutcome::Success { data } => data.clone(),
            CapabilityOutcome::Failure { error } => serde_json::json!({
                "error": error.message,
                "kind": error.kind,
            }),
        }
    }
}

/// Tool declaration sent to the model provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: serde_json::Value,
}

//
// ================= Model Provider I/O =================
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestPurpose {
    Turn,
    Summary,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub purpose: RequestPurpose,
    pub model: String,
    pub temperature: f32,
    pub system_instruction: String,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDeclaration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelResponse {
    Text(String),
    ToolCalls(Vec<ToolCall>),
    Elicitation(String),
}

//
// ================= Sessions & Turns =================
//

/// One session per agent per conversation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub conversation: String,
    pub agent: String,
}

impl SessionKey {
    pub fn new(conversation: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            conversation: conversation.into(),
            agent: agent.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.conversation, self.agent)
    }
}

/// Input that opens (or resumes) an agent turn
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    Text(String),
    ElicitationAnswer(String),
}

impl TurnInput {
    pub fn text(&self) -> &str {
        match self {
            TurnInput::Text(t) | TurnInput::ElicitationAnswer(t) => t,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ElicitationRequest {
    pub session: SessionKey,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnOutcome {
    FinalAnswer { agent: String, answer: String },
    Elicitation { agent: String, prompt: String },
}

impl TurnOutcome {
    pub fn agent(&self) -> &str {
        match self {
            TurnOutcome::FinalAnswer { agent, .. } | TurnOutcome::Elicitation { agent, .. } => {
                agent
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TurnOutcome::FinalAnswer { .. } => "final_answer",
            TurnOutcome::Elicitation { .. } => "elicitation",
        }
    }
}
