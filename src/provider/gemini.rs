//! Gemini provider
//!
//! Maps sessions onto `generateContent`: turns become `contents`, tool
//! results become `functionCall`/`functionResponse` pairs, and tool
//! declarations become `functionDeclarations`.
//! Uses a long-lived reqwest::Client for connection pooling.

use super::ModelProvider;
use crate::memory::store::{Turn, TurnKind, TurnRole};
use crate::models::{
    CompletionRequest, FailureKind, ModelResponse, ToolCall, ToolDeclaration, UpstreamFailure,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::time::Duration;
use tracing::{debug, error};
use uuid::Uuid;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";

pub struct GeminiProvider {
    client: Client,
    api_key: String,
    base_url: String,
    default_model: String,
    max_output_tokens: u32,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            default_model: DEFAULT_GEMINI_MODEL.to_string(),
            max_output_tokens: 8192,
        })
    }

    /// `GEMINI_API_KEY` (required), `GEMINI_MODEL` and `GEMINI_BASE_URL` (optional)
    pub fn from_env() -> Option<Self> {
        let api_key = env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty())?;
        let mut provider = Self::new(api_key).ok()?;

        if let Ok(model) = env::var("GEMINI_MODEL") {
            provider.default_model = model;
        }
        if let Ok(base_url) = env::var("GEMINI_BASE_URL") {
            provider.base_url = base_url.trim_end_matches('/').to_string();
        }

        Some(provider)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    /// Agent aliases that are not Gemini models fall back to the default
    fn resolve_model<'a>(&'a self, alias: &'a str) -> &'a str {
        if alias.starts_with("gemini-") {
            alias
        } else {
            &self.default_model
        }
    }
}

#[async_trait]
impl ModelProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<ModelResponse, UpstreamFailure> {
        if self.api_key.is_empty() {
            return Err(UpstreamFailure::new(
                FailureKind::Fatal,
                "GEMINI_API_KEY not configured",
            ));
        }

        let model = self.resolve_model(&request.model);
        let url = format!("{}/models/{}:generateContent", self.base_url, model);

        let body = build_request(request, self.max_output_tokens);
        debug!(
            model,
            purpose = ?request.purpose,
            turns = request.turns.len(),
            tools = request.tools.len(),
            "Calling Gemini API"
        );

        // key travels in a header so transport errors never echo it
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!(status = status.as_u16(), "Gemini API error response: {}", error_text);
            return Err(classify_error(status.as_u16(), error_text));
        }

        let parsed: GeminiResponse = response.json().await.map_err(|e| {
            UpstreamFailure::new(FailureKind::Fatal, format!("Gemini parse error: {}", e))
        })?;

        if let Some(usage) = &parsed.usage_metadata {
            debug!(
                prompt_tokens = usage.prompt_token_count,
                candidate_tokens = usage.candidates_token_count,
                "Gemini usage"
            );
        }

        parse_response(parsed)
    }
}

fn classify_error(status: u16, body: String) -> UpstreamFailure {
    let lowered = body.to_lowercase();
    if status == 400 && lowered.contains("token") && lowered.contains("exceed") {
        return UpstreamFailure {
            kind: Some(FailureKind::ContextOverflow),
            status: Some(status),
            message: format!("Gemini API error: {}", body),
        };
    }
    UpstreamFailure::from_status(status, format!("Gemini API error: {}", body))
}

//
// ================= Wire types =================
//

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolSet>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolSet {
    function_declarations: Vec<ToolDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
    top_k: i32,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Content,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
}

//
// ================= Mapping =================
//

fn push_part(contents: &mut Vec<Content>, role: &str, part: Part) {
    match contents.last_mut() {
        Some(last) if last.role.as_deref() == Some(role) => last.parts.push(part),
        _ => contents.push(Content {
            role: Some(role.to_string()),
            parts: vec![part],
        }),
    }
}

fn turn_to_parts(turn: &Turn, contents: &mut Vec<Content>) {
    match &turn.kind {
        TurnKind::ToolResult { result } => {
            push_part(
                contents,
                "model",
                Part {
                    function_call: Some(FunctionCall {
                        name: result.call.capability.clone(),
                        args: result.call.arguments.clone(),
                    }),
                    ..Default::default()
                },
            );

            // functionResponse.response must be an object
            let payload = result.to_payload();
            let response = if payload.is_object() {
                payload
            } else {
                json!({ "result": payload })
            };
            push_part(
                contents,
                "user",
                Part {
                    function_response: Some(FunctionResponse {
                        name: result.call.capability.clone(),
                        response,
                    }),
                    ..Default::default()
                },
            );
        }
        TurnKind::Summary => push_part(
            contents,
            "user",
            Part::text(format!("Summary of earlier conversation:\n{}", turn.content)),
        ),
        _ => {
            let role = match turn.role {
                TurnRole::Agent => "model",
                _ => "user",
            };
            push_part(contents, role, Part::text(turn.content.clone()));
        }
    }
}

fn build_request(request: &CompletionRequest, max_output_tokens: u32) -> GeminiRequest {
    let mut contents = Vec::with_capacity(request.turns.len());
    for turn in &request.turns {
        turn_to_parts(turn, &mut contents);
    }

    let system_instruction = if request.system_instruction.is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![Part::text(request.system_instruction.clone())],
        })
    };

    let tools = if request.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolSet {
            function_declarations: request.tools.clone(),
        }]
    };

    GeminiRequest {
        contents,
        system_instruction,
        tools,
        generation_config: GenerationConfig {
            temperature: request.temperature,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens,
        },
    }
}

fn parse_response(response: GeminiResponse) -> Result<ModelResponse, UpstreamFailure> {
    let candidate = match response.candidates.into_iter().next() {
        Some(candidate) => candidate,
        None => {
            let reason = response
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "no candidates".to_string());
            return Err(UpstreamFailure::new(
                FailureKind::Fatal,
                format!("No response from Gemini API: {}", reason),
            ));
        }
    };

    let mut calls = Vec::new();
    let mut text = String::new();

    for part in candidate.content.parts {
        if let Some(call) = part.function_call {
            calls.push(ToolCall {
                id: format!("call-{}", Uuid::new_v4()),
                capability: call.name,
                arguments: call.args,
            });
        } else if let Some(t) = part.text {
            text.push_str(&t);
        }
    }

    if !calls.is_empty() {
        return Ok(ModelResponse::ToolCalls(calls));
    }

    if text.trim().is_empty() {
        return Err(UpstreamFailure::new(
            FailureKind::Fatal,
            format!(
                "Empty response from Gemini (finish reason: {})",
                candidate.finish_reason.as_deref().unwrap_or("unknown")
            ),
        ));
    }

    Ok(ModelResponse::Text(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CapabilityResult, RequestPurpose};

    fn completion(turns: Vec<Turn>, tools: Vec<ToolDeclaration>) -> CompletionRequest {
        CompletionRequest {
            purpose: RequestPurpose::Turn,
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.25,
            system_instruction: "You are a trading advisor".to_string(),
            turns,
            tools,
        }
    }

    #[test]
    fn test_request_serialization() {
        let call = ToolCall {
            id: "call-1".to_string(),
            capability: "get_market_data".to_string(),
            arguments: json!({"symbol": "TSLA"}),
        };
        let turns = vec![
            Turn::user("Should I buy Tesla?"),
            Turn::tool_result(CapabilityResult::success(call, json!({"price": 250.0}), 1)),
        ];
        let tools = vec![ToolDeclaration {
            name: "get_market_data".to_string(),
            description: "quotes".to_string(),
            parameters: json!({"type": "object"}),
        }];

        let body = serde_json::to_value(build_request(&completion(turns, tools), 1024)).unwrap();

        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["functionCall"]["name"], "get_market_data");
        assert_eq!(body["contents"][2]["parts"][0]["functionResponse"]["response"]["price"], 250.0);
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "get_market_data");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 1024);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "You are a trading advisor");
    }

    #[test]
    fn test_parse_function_call() {
        let raw = json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "functionCall": { "name": "get_market_data", "args": { "symbol": "TSLA" } } }]
                },
                "finishReason": "STOP"
            }]
        });
        let parsed: GeminiResponse = serde_json::from_value(raw).unwrap();
        match parse_response(parsed).unwrap() {
            ModelResponse::ToolCalls(calls) => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].capability, "get_market_data");
                assert_eq!(calls[0].arguments["symbol"], "TSLA");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_parse_text_and_blocked() {
        let raw = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hold " }, { "text": "for now." }] } }]
        });
        let parsed: GeminiResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(
            parse_response(parsed).unwrap(),
            ModelResponse::Text("Hold for now.".to_string())
        );

        let blocked: GeminiResponse =
            serde_json::from_value(json!({ "promptFeedback": { "blockReason": "SAFETY" } })).unwrap();
        let err = parse_response(blocked).unwrap_err();
        assert_eq!(err.kind, Some(FailureKind::Fatal));
        assert!(err.message.contains("SAFETY"));
    }

    #[test]
    fn test_token_limit_is_context_overflow() {
        let failure = classify_error(
            400,
            "The input token count (1200000) exceeds the maximum number of tokens allowed".to_string(),
        );
        assert_eq!(failure.kind, Some(FailureKind::ContextOverflow));

        let overloaded = classify_error(503, "The model is overloaded".to_string());
        assert_eq!(overloaded.status, Some(503));
    }

    #[tokio::test]
    async fn test_transport_error_does_not_leak_key() {
        let provider = GeminiProvider::new("SECRET123".to_string())
            .unwrap()
            .with_base_url("http://127.0.0.1:9/");
        let request = completion(vec![Turn::user("Should I buy Tesla?")], Vec::new());

        let failure = provider.complete(&request).await.unwrap_err();
        assert!(!failure.message.contains("SECRET123"), "{}", failure.message);
        assert_eq!(failure.kind, Some(FailureKind::Unavailable));
    }

    #[test]
    fn test_non_gemini_alias_uses_default_model() {
        let provider = GeminiProvider::new("key".to_string()).unwrap();
        assert_eq!(provider.resolve_model("claude-sonnet-4-20250514"), DEFAULT_GEMINI_MODEL);
        assert_eq!(provider.resolve_model("gemini-1.5-pro"), "gemini-1.5-pro");
    }
}
