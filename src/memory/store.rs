//! Session history storage
//!
//! Append-only turn sequences with token estimates and sequence numbers

use crate::models::{CapabilityResult, FailureKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fixed per-turn overhead added to every estimate (role markers, separators)
pub const TURN_OVERHEAD_TOKENS: usize = 4;

/// Conservative token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() + 3) / 4
}

/// Role of a turn's author
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Agent,
    ToolResult,
    System,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Agent => "agent",
            TurnRole::ToolResult => "tool_result",
            TurnRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "agent" => TurnRole::Agent,
            "tool_result" => TurnRole::ToolResult,
            "system" => TurnRole::System,
            _ => TurnRole::User,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnKind {
    Message,
    Summary,
    Elicitation,
    ElicitationAnswer,
    ElicitationCancelled,
    ToolResult { result: CapabilityResult },
    Cancelled,
}

/// A single immutable entry in a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub seq: u64,
    pub role: TurnRole,
    pub content: String,
    pub token_estimate: usize,
    pub timestamp: DateTime<Utc>,
    pub kind: TurnKind,
}

impl Turn {
    fn build(role: TurnRole, content: String, kind: TurnKind) -> Self {
        let token_estimate = estimate_tokens(&content) + TURN_OVERHEAD_TOKENS;

        Self {
            seq: 0,
            role,
            content,
            token_estimate,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::build(TurnRole::User, content.into(), TurnKind::Message)
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::build(TurnRole::Agent, content.into(), TurnKind::Message)
    }

    pub fn elicitation(prompt: impl Into<String>) -> Self {
        Self::build(TurnRole::Agent, prompt.into(), TurnKind::Elicitation)
    }

    pub fn elicitation_answer(answer: impl Into<String>) -> Self {
        Self::build(TurnRole::User, answer.into(), TurnKind::ElicitationAnswer)
    }

    pub fn elicitation_cancelled(content: impl Into<String>) -> Self {
        Self::build(TurnRole::User, content.into(), TurnKind::ElicitationCancelled)
    }

    pub fn cancelled(content: impl Into<String>) -> Self {
        Self::build(TurnRole::Agent, content.into(), TurnKind::Cancelled)
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::build(TurnRole::System, content.into(), TurnKind::Summary)
    }

    /// Tool-result turn; content covers both the call and the payload so
    /// the estimate accounts for what the provider will actually see.
    pub fn tool_result(result: CapabilityResult) -> Self {
        let content = format!(
            "{}({}) -> {}",
            result.call.capability,
            result.call.arguments,
            result.to_payload()
        );
        Self::build(TurnRole::ToolResult, content, TurnKind::ToolResult { result })
    }

    pub fn is_user_request(&self) -> bool {
        self.role == TurnRole::User
    }

    pub fn is_summary(&self) -> bool {
        matches!(self.kind, TurnKind::Summary)
    }

    pub fn capability_result(&self) -> Option<&CapabilityResult> {
        match &self.kind {
            TurnKind::ToolResult { result } => Some(result),
            _ => None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.capability_result().and_then(|r| r.failure_kind())
    }
}

/// Ordered conversation history for one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    turns: VecDeque<Turn>,
    next_seq: u64,
    total_tokens: usize,
}

impl Session {
    pub fn new() -> Self {
        Self {
            created_at: Utc::now(),
            updated_at: Utc::now(),
            turns: VecDeque::new(),
            next_seq: 1,
            total_tokens: 0,
        }
    }

    /// Append a turn, stamping the next sequence number. Returns the sequence.
    pub fn append(&mut self, mut turn: Turn) -> u64 {
        turn.seq = self.next_seq;
        self.next_seq += 1;
        self.total_tokens += turn.token_estimate;
        self.turns.push_back(turn);
        self.updated_at = Utc::now();
        self.next_seq - 1
    }

    /// Re-attach a turn loaded from persistent storage, keeping its sequence.
    pub fn restore(&mut self, turn: Turn) {
        self.next_seq = self.next_seq.max(turn.seq + 1);
        self.total_tokens += turn.token_estimate;
        self.turns.push_back(turn);
    }

    pub fn turns(&self) -> impl DoubleEndedIterator<Item = &Turn> + ExactSizeIterator {
        self.turns.iter()
    }

    pub fn turn(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn total_tokens(&self) -> usize {
        self.total_tokens
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Index of the most recent user turn
    pub fn last_user_index(&self) -> Option<usize> {
        self.turns.iter().rposition(|t| t.is_user_request())
    }

    pub fn to_vec(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }

    /// Replace the first `count` turns with a single summary turn.
    ///
    /// The summary takes the sequence number of the first replaced turn so
    /// the remaining order stays strictly increasing.
    pub fn replace_prefix(&mut self, count: usize, mut summary: Turn) {
        let count = count.min(self.turns.len());
        if count == 0 {
            return;
        }

        summary.seq = self.turns[0].seq;
        self.turns.drain(..count);
        self.turns.push_front(summary);
        self.recompute_total_tokens();
        self.updated_at = Utc::now();
    }

    /// Remove the oldest turn and return it
    pub fn remove_oldest(&mut self) -> Option<Turn> {
        let turn = self.turns.pop_front();

        if let Some(ref t) = turn {
            self.total_tokens = self.total_tokens.saturating_sub(t.token_estimate);
            self.updated_at = Utc::now();
        }

        turn
    }

    /// Whole-session reset; sequence numbers keep increasing.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.total_tokens = 0;
        self.updated_at = Utc::now();
    }

    fn recompute_total_tokens(&mut self) {
        self.total_tokens = self.turns.iter().map(|t| t.token_estimate).sum();
    }

    /// Formatted transcript (used for summaries and the terminal UI)
    pub fn get_formatted_context(&self) -> String {
        format_turns(self.turns.iter())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

pub fn format_turns<'a>(turns: impl Iterator<Item = &'a Turn>) -> String {
    let mut text = String::new();

    for turn in turns {
        let role = match turn.role {
            TurnRole::User => "User",
            TurnRole::Agent => "Agent",
            TurnRole::ToolResult => "Tool",
            TurnRole::System => "Summary",
        };

        text.push_str(&format!("{}: {}\n", role, turn.content));
    }

    text
}
