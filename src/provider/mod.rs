//! Model provider trait and implementations
//!
//! The executor and the compactor only depend on [`ModelProvider`]; the
//! wire protocol stays inside each implementation.

use crate::memory::store::TurnKind;
use crate::models::{CompletionRequest, ModelResponse, RequestPurpose, UpstreamFailure};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

pub mod gemini;
pub use gemini::GeminiProvider;

/// Language-model completion capability
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelResponse, UpstreamFailure>;
}

/// Offline provider that answers from the conversation itself.
/// Keeps the binaries usable without an API key.
#[derive(Debug, Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelResponse, UpstreamFailure> {
        if request.purpose == RequestPurpose::Summary {
            let requests: Vec<&str> = request
                .turns
                .iter()
                .flat_map(|t| t.content.lines())
                .filter_map(|line| line.strip_prefix("User: "))
                .collect();
            return Ok(ModelResponse::Text(format!(
                "Earlier conversation ({} requests): {}",
                requests.len(),
                requests.join(" | ")
            )));
        }

        let last = request.turns.last();
        let answer = match last {
            Some(turn) if matches!(turn.kind, TurnKind::ToolResult { .. }) => {
                format!("Tool output: {}", turn.content)
            }
            Some(turn) if turn.kind == TurnKind::ElicitationCancelled => {
                "Understood, continuing without that input.".to_string()
            }
            Some(turn) => format!("Echo: {}", turn.content),
            None => "(no input)".to_string(),
        };

        Ok(ModelResponse::Text(answer))
    }
}

/// Replays queued responses and records every request it receives.
///
/// Turn and summary requests have separate queues so compaction can be
/// scripted independently of the tool loop.
pub struct ScriptedProvider {
    turn_responses: Mutex<VecDeque<Result<ModelResponse, UpstreamFailure>>>,
    summary_responses: Mutex<VecDeque<Result<ModelResponse, UpstreamFailure>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            turn_responses: Mutex::new(VecDeque::new()),
            summary_responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_responses(
        responses: impl IntoIterator<Item = Result<ModelResponse, UpstreamFailure>>,
    ) -> Self {
        let provider = Self::new();
        for response in responses {
            provider.push(response);
        }
        provider
    }

    pub fn push(&self, response: Result<ModelResponse, UpstreamFailure>) {
        self.turn_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn push_summary(&self, response: Result<ModelResponse, UpstreamFailure>) {
        self.summary_responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn request_count(&self, purpose: RequestPurpose) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.purpose == purpose)
            .count()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelResponse, UpstreamFailure> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let queue = match request.purpose {
            RequestPurpose::Turn => &self.turn_responses,
            RequestPurpose::Summary => &self.summary_responses,
        };

        let next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        next.unwrap_or_else(|| {
            Ok(ModelResponse::Text(match request.purpose {
                RequestPurpose::Turn => "(no scripted response)".to_string(),
                RequestPurpose::Summary => "Summary of earlier conversation.".to_string(),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::Turn;
    use crate::models::FailureKind;

    fn request(purpose: RequestPurpose, turns: Vec<Turn>) -> CompletionRequest {
        CompletionRequest {
            purpose,
            model: "test-model".to_string(),
            temperature: 0.2,
            system_instruction: "You are a test agent.".to_string(),
            turns,
            tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_echo_provider() {
        let provider = EchoProvider;
        let response = provider
            .complete(&request(RequestPurpose::Turn, vec![Turn::user("What is RSI?")]))
            .await
            .unwrap();
        assert_eq!(response, ModelResponse::Text("Echo: What is RSI?".to_string()));

        let transcript = "User: price of TSLA?\nAgent: 250\nUser: and NVDA?\n";
        let summary = provider
            .complete(&request(RequestPurpose::Summary, vec![Turn::user(transcript)]))
            .await
            .unwrap();
        assert_eq!(
            summary,
            ModelResponse::Text("Earlier conversation (2 requests): price of TSLA? | and NVDA?".to_string())
        );
    }

    #[tokio::test]
    async fn test_scripted_queues_are_separate() {
        let provider = ScriptedProvider::with_responses(vec![Err(UpstreamFailure::new(
            FailureKind::Overloaded,
            "busy",
        ))]);
        provider.push_summary(Ok(ModelResponse::Text("short".to_string())));

        let summary = provider
            .complete(&request(RequestPurpose::Summary, vec![]))
            .await
            .unwrap();
        assert_eq!(summary, ModelResponse::Text("short".to_string()));

        let turn = provider.complete(&request(RequestPurpose::Turn, vec![])).await;
        assert!(turn.is_err());
        assert_eq!(provider.request_count(RequestPurpose::Turn), 1);
        assert_eq!(provider.request_count(RequestPurpose::Summary), 1);
    }
}
