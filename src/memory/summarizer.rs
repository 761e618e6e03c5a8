//! Context Summarization
//!
//! Builds the dedicated "summarize" request the compactor sends through the
//! model provider, and clips the returned text to the space left in budget.

use crate::agents::AgentDefinition;
use crate::memory::store::{format_turns, Turn, TURN_OVERHEAD_TOKENS};
use crate::models::{CompletionRequest, ModelResponse, RequestPurpose};

const SUMMARY_INSTRUCTION: &str = r#"You are an expert financial conversation summarizer.

Your task is to create a concise, informative summary of the conversation you are given.
Focus on:
1. Key financial concepts discussed
2. Important questions and answers
3. Tool results (market data, positions, search findings) still relevant
4. Any decisions or recommendations made

Keep the summary structured and professional. Format as bullet points for clarity."#;

const SUMMARY_TEMPERATURE: f32 = 0.2;

pub struct ContextSummarizer;

impl ContextSummarizer {
    /// Summarize request for the given turns, using the agent's model
    pub fn build_request(agent: &AgentDefinition, turns: &[Turn]) -> CompletionRequest {
        let transcript = format_turns(turns.iter());
        let prompt = format!(
            "CONVERSATION:\n---\n{}---\n\nSUMMARY (focus on key insights and decisions):",
            transcript
        );

        CompletionRequest {
            purpose: RequestPurpose::Summary,
            model: agent.model.clone(),
            temperature: SUMMARY_TEMPERATURE,
            system_instruction: SUMMARY_INSTRUCTION.to_string(),
            turns: vec![Turn::user(prompt)],
            tools: Vec::new(),
        }
    }

    /// Text of a summary response; anything else is unusable
    pub fn summary_text(response: ModelResponse) -> Option<String> {
        match response {
            ModelResponse::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
            _ => None,
        }
    }

    /// Clip text so that a summary turn built from it costs at most `max_tokens`
    pub fn clip_to_budget(text: &str, max_tokens: usize) -> Option<String> {
        let content_tokens = max_tokens.checked_sub(TURN_OVERHEAD_TOKENS)?;
        if content_tokens == 0 {
            return None;
        }

        let max_chars = content_tokens * 4;
        if text.chars().count() <= max_chars {
            return Some(text.to_string());
        }

        Some(text.chars().take(max_chars).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::default_agents;

    #[test]
    fn test_summary_request_carries_transcript() {
        let agents = default_agents();
        let agent = agents.get("financial_analyst").unwrap();
        let turns = vec![Turn::user("What is RSI?"), Turn::agent("RSI is a momentum indicator...")];

        let request = ContextSummarizer::build_request(agent, &turns);
        assert_eq!(request.purpose, RequestPurpose::Summary);
        assert!(request.tools.is_empty());
        assert_eq!(request.turns.len(), 1);
        assert!(request.turns[0].content.contains("User: What is RSI?"));
        assert!(request.turns[0].content.contains("Agent: RSI"));
    }

    #[test]
    fn test_clip_respects_token_budget() {
        let text = "x".repeat(1000);
        let clipped = ContextSummarizer::clip_to_budget(&text, 20).unwrap();
        assert_eq!(Turn::summary(clipped).token_estimate, 20);

        assert_eq!(ContextSummarizer::clip_to_budget("short", 20).unwrap(), "short");
        assert!(ContextSummarizer::clip_to_budget("anything", TURN_OVERHEAD_TOKENS).is_none());
    }

    #[test]
    fn test_non_text_response_is_unusable() {
        assert!(ContextSummarizer::summary_text(ModelResponse::Elicitation("?".into())).is_none());
        assert!(ContextSummarizer::summary_text(ModelResponse::Text("  ".into())).is_none());
    }
}
