//! Domain Classifier
//!
//! Scores a request against every agent's declarative domain profile.
//! Pure and deterministic: no model calls, no state.
//!
//! - Multi-word cues ("stop loss") match as phrases
//! - Single-word cues match whole tokens; cues of five or more characters
//!   also match as token prefixes ("sector" matches "sectors")
//! - An uppercase ticker in the request adds the agent's symbol bonus once

use crate::agents::{AgentDefinition, AgentSet, Cue};
use std::cmp::Ordering;

const PREFIX_MATCH_MIN_LEN: usize = 5;

/// Uppercase words that are not tickers
const TICKER_STOPLIST: &[&str] = &[
    "AI", "AM", "AN", "AND", "ARE", "AS", "AT", "BE", "BY", "CEO", "CFO", "DO", "ETF", "FOR",
    "GDP", "IF", "IN", "IPO", "IS", "IT", "ME", "MY", "NO", "NOT", "OF", "OK", "ON", "OR",
    "PM", "SO", "THE", "TO", "UP", "US", "USD", "WE",
];

#[derive(Debug, Clone, Copy)]
pub struct AgentScore<'a> {
    pub agent: &'a AgentDefinition,
    pub score: u32,
}

/// Scores for every agent, best first
#[derive(Debug, Clone)]
pub struct Classification<'a> {
    scores: Vec<AgentScore<'a>>,
}

impl<'a> Classification<'a> {
    /// Highest-scoring agent, if any cue matched at all
    pub fn best(&self) -> Option<&AgentScore<'a>> {
        self.scores.first().filter(|s| s.score > 0)
    }

    pub fn score_of(&self, agent: &str) -> u32 {
        self.scores
            .iter()
            .find(|s| s.agent.name == agent)
            .map(|s| s.score)
            .unwrap_or(0)
    }

    pub fn scores(&self) -> &[AgentScore<'a>] {
        &self.scores
    }
}

/// Tokenized view of a request
struct Request {
    tokens: Vec<String>,
    /// Tokens joined by single spaces, padded, for phrase lookup
    padded: String,
    has_ticker: bool,
}

impl Request {
    fn parse(text: &str) -> Self {
        let tokens: Vec<String> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '-'))
            .map(|t| t.trim_matches('-'))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let padded = format!(" {} ", tokens.join(" "));

        Self {
            tokens,
            padded,
            has_ticker: contains_ticker(text),
        }
    }

    fn matches(&self, cue: &Cue) -> bool {
        let term = cue.term.as_str();
        if term.contains(' ') {
            return self.padded.contains(&format!(" {} ", term));
        }

        self.tokens.iter().any(|token| {
            token == term || (term.len() >= PREFIX_MATCH_MIN_LEN && token.starts_with(term))
        })
    }
}

/// `$TSLA` style mentions always count; bare words need 2 to 5
/// uppercase letters and must not be common uppercase words.
fn contains_ticker(text: &str) -> bool {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '$'))
        .any(|raw| {
            let (dollar, word) = match raw.strip_prefix('$') {
                Some(rest) => (true, rest),
                None => (false, raw),
            };

            let upper = !word.is_empty()
                && word.len() <= 5
                && word.chars().all(|c| c.is_ascii_uppercase());

            if dollar {
                upper
            } else {
                upper && word.len() >= 2 && !TICKER_STOPLIST.contains(&word)
            }
        })
}

fn score_agent(request: &Request, agent: &AgentDefinition) -> u32 {
    let cue_score: u32 = agent
        .domain
        .cues
        .iter()
        .filter(|cue| request.matches(cue))
        .map(|cue| cue.weight)
        .sum();

    if cue_score > 0 && request.has_ticker {
        cue_score + agent.domain.symbol_bonus
    } else {
        cue_score
    }
}

/// Highest score first, then lower priority, then name
fn rank(a: &AgentScore<'_>, b: &AgentScore<'_>) -> Ordering {
    b.score
        .cmp(&a.score)
        .then_with(|| a.agent.domain.priority.cmp(&b.agent.domain.priority))
        .then_with(|| a.agent.name.cmp(&b.agent.name))
}

pub struct DomainClassifier;

impl DomainClassifier {
    pub fn classify<'a>(request: &str, agents: &'a AgentSet) -> Classification<'a> {
        let parsed = Request::parse(request);

        let mut scores: Vec<AgentScore<'a>> = agents
            .iter()
            .map(|agent| AgentScore {
                agent,
                score: score_agent(&parsed, agent),
            })
            .collect();

        scores.sort_by(rank);

        Classification { scores }
    }
}
