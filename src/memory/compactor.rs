//! Context Window Management
//!
//! Keeps a session within its model's context budget. Over budget, the
//! older prefix is replaced by one summary turn while the most recent
//! turns stay verbatim; if summarizing fails, the oldest turns are dropped.
//! Never removes the most recent user turn and never reorders.

use crate::agents::AgentDefinition;
use crate::memory::store::{estimate_tokens, Session, Turn, TURN_OVERHEAD_TOKENS};
use crate::memory::summarizer::ContextSummarizer;
use crate::models::ToolDeclaration;
use crate::provider::ModelProvider;
use crate::retry::{DefaultClassifier, RetryController};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Context windows of the models agents commonly reference
const KNOWN_CONTEXT_WINDOWS: &[(&str, usize)] = &[
    ("gemini-2.0-flash", 1_048_576),
    ("gemini-1.5-flash", 1_048_576),
    ("gemini-1.5-pro", 2_097_152),
    ("claude-sonnet-4-20250514", 200_000),
];

/// Configuration for context window management
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionConfig {
    /// Window assumed for models missing from the known table
    pub default_context_window: usize,
    /// Tokens kept free for the model's answer
    pub reserved_output_tokens: usize,
    /// Number of recent turns always preserved verbatim
    pub keep_recent_turns: usize,
    /// Per-model overrides of the known table
    pub context_windows: HashMap<String, usize>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            default_context_window: 200_000,
            reserved_output_tokens: 8192,
            keep_recent_turns: 4,
            context_windows: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompactionReport {
    WithinBudget {
        estimate: usize,
        budget: usize,
    },
    Summarized {
        removed: usize,
        estimate_before: usize,
        estimate_after: usize,
        budget: usize,
    },
    Truncated {
        removed: usize,
        estimate_before: usize,
        estimate_after: usize,
        budget: usize,
    },
}

impl CompactionReport {
    /// Whether any turn was removed
    pub fn compacted(&self) -> bool {
        match self {
            CompactionReport::WithinBudget { .. } => false,
            CompactionReport::Summarized { removed, .. }
            | CompactionReport::Truncated { removed, .. } => *removed > 0,
        }
    }
}

pub struct ContextCompactor {
    config: CompactionConfig,
    provider: Arc<dyn ModelProvider>,
    retry: RetryController,
}

impl ContextCompactor {
    pub fn new(
        config: CompactionConfig,
        provider: Arc<dyn ModelProvider>,
        retry: RetryController,
    ) -> Self {
        Self {
            config,
            provider,
            retry,
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn context_window(&self, model: &str) -> usize {
        if let Some(window) = self.config.context_windows.get(model) {
            return *window;
        }

        KNOWN_CONTEXT_WINDOWS
            .iter()
            .find(|(name, _)| *name == model)
            .map(|(_, window)| *window)
            .unwrap_or(self.config.default_context_window)
    }

    /// Tokens available to session turns: window minus output margin minus
    /// the instruction and tool declarations sent with every request.
    pub fn budget_for(&self, agent: &AgentDefinition, tools: &[ToolDeclaration]) -> usize {
        let instruction_cost = estimate_tokens(&agent.instruction) + TURN_OVERHEAD_TOKENS;
        let tools_cost: usize = tools
            .iter()
            .map(|t| {
                let schema = serde_json::to_string(&t.parameters).unwrap_or_default();
                estimate_tokens(&t.name) + estimate_tokens(&t.description) + estimate_tokens(&schema)
            })
            .sum();

        self.context_window(&agent.model)
            .saturating_sub(self.config.reserved_output_tokens)
            .saturating_sub(instruction_cost)
            .saturating_sub(tools_cost)
    }

    /// Pre-turn check; `incoming` is the cost of the turn about to be appended
    pub async fn ensure_budget(
        &self,
        session: &mut Session,
        agent: &AgentDefinition,
        tools: &[ToolDeclaration],
        incoming: usize,
        cancel: &CancellationToken,
    ) -> CompactionReport {
        let budget = self.budget_for(agent, tools);
        self.compact_to(session, agent, budget, incoming, cancel).await
    }

    /// Reactive compaction after the provider reported a context overflow.
    /// Targets half of the current estimate.
    pub async fn force_compact(
        &self,
        session: &mut Session,
        agent: &AgentDefinition,
        tools: &[ToolDeclaration],
        cancel: &CancellationToken,
    ) -> CompactionReport {
        let target = (session.total_tokens() / 2).min(self.budget_for(agent, tools));
        info!(
            agent = %agent.name,
            estimate = session.total_tokens(),
            target,
            "Provider reported context overflow, compacting"
        );
        self.compact_to(session, agent, target, 0, cancel).await
    }

    async fn compact_to(
        &self,
        session: &mut Session,
        agent: &AgentDefinition,
        budget: usize,
        incoming: usize,
        cancel: &CancellationToken,
    ) -> CompactionReport {
        let estimate_before = session.total_tokens() + incoming;
        if estimate_before <= budget {
            return CompactionReport::WithinBudget {
                estimate: estimate_before,
                budget,
            };
        }

        let tail_start = self.tail_start(session);
        if tail_start > 0 {
            let tail_tokens: usize = session.turns().skip(tail_start).map(|t| t.token_estimate).sum();
            let room = budget.saturating_sub(tail_tokens + incoming);

            if let Some(summary) = self.summarize(session, agent, tail_start, room, cancel).await {
                session.replace_prefix(tail_start, summary);
                let estimate_after = session.total_tokens() + incoming;

                info!(
                    agent = %agent.name,
                    removed = tail_start,
                    estimate_before,
                    estimate_after,
                    budget,
                    "Session compacted with summary"
                );

                return CompactionReport::Summarized {
                    removed: tail_start,
                    estimate_before,
                    estimate_after,
                    budget,
                };
            }
        }

        self.truncate(session, agent, budget, incoming, estimate_before)
    }

    /// First index of the preserved tail: the last K turns, extended back to
    /// the most recent user turn.
    fn tail_start(&self, session: &Session) -> usize {
        let by_count = session.len().saturating_sub(self.config.keep_recent_turns);
        match session.last_user_index() {
            Some(user) => by_count.min(user),
            None => by_count,
        }
    }

    async fn summarize(
        &self,
        session: &Session,
        agent: &AgentDefinition,
        prefix_len: usize,
        room: usize,
        cancel: &CancellationToken,
    ) -> Option<Turn> {
        if room <= TURN_OVERHEAD_TOKENS {
            warn!(agent = %agent.name, room, "No room left for a summary turn");
            return None;
        }

        let prefix: Vec<Turn> = session.turns().take(prefix_len).cloned().collect();
        let request = ContextSummarizer::build_request(agent, &prefix);

        let response = self
            .retry
            .invoke("summarize", &DefaultClassifier, cancel, || {
                self.provider.complete(&request)
            })
            .await;

        let text = match response {
            Ok(retried) => ContextSummarizer::summary_text(retried.value),
            Err(failure) => {
                warn!(
                    agent = %agent.name,
                    kind = %failure.kind,
                    attempts = failure.attempts(),
                    "Summarization failed, falling back to truncation: {}",
                    failure.message
                );
                None
            }
        }?;

        ContextSummarizer::clip_to_budget(&text, room).map(Turn::summary)
    }

    /// Drop oldest turns until under budget, stopping at the most recent user turn
    fn truncate(
        &self,
        session: &mut Session,
        agent: &AgentDefinition,
        budget: usize,
        incoming: usize,
        estimate_before: usize,
    ) -> CompactionReport {
        let protected = session
            .last_user_index()
            .unwrap_or_else(|| session.len().saturating_sub(1));

        let mut removed = 0;
        while removed < protected && session.total_tokens() + incoming > budget {
            if session.remove_oldest().is_none() {
                break;
            }
            removed += 1;
        }

        let estimate_after = session.total_tokens() + incoming;
        warn!(
            agent = %agent.name,
            removed,
            estimate_before,
            estimate_after,
            budget,
            "Session truncated"
        );

        CompactionReport::Truncated {
            removed,
            estimate_before,
            estimate_after,
            budget,
        }
    }
}
