//! Runtime configuration
//!
//! Everything is read from environment variables (a `.env` file is loaded
//! first when present). Unset variables keep their defaults; malformed
//! values are configuration errors.

use crate::agents::{default_agents, AgentSet};
use crate::error::OrchestrationError;
use crate::execution::{ElicitationConfig, ElicitationMode, ExecutorConfig};
use crate::memory::CompactionConfig;
use crate::retry::RetryPolicy;
use crate::router::DEFAULT_SWITCH_THRESHOLD;
use crate::Result;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub compaction: CompactionConfig,
    pub elicitation: ElicitationConfig,
    pub executor: ExecutorConfig,
    pub switch_threshold: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            compaction: CompactionConfig::default(),
            elicitation: ElicitationConfig::default(),
            executor: ExecutorConfig::default(),
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_var::<u32>(&lookup, "RETRY_MAX_ATTEMPTS")? {
            if v == 0 {
                return Err(OrchestrationError::ConfigError(
                    "RETRY_MAX_ATTEMPTS must be at least 1".to_string(),
                ));
            }
            config.retry.max_attempts = v;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "CALL_TIMEOUT_SECS")? {
            config.retry.call_timeout = Duration::from_secs(secs);
        }

        if let Some(v) = parse_var(&lookup, "DEFAULT_CONTEXT_WINDOW")? {
            config.compaction.default_context_window = v;
        }
        if let Some(v) = parse_var(&lookup, "RESERVED_OUTPUT_TOKENS")? {
            config.compaction.reserved_output_tokens = v;
        }
        if let Some(v) = parse_var(&lookup, "KEEP_RECENT_TURNS")? {
            config.compaction.keep_recent_turns = v;
        }

        if let Some(raw) = lookup("ELICITATION_MODE") {
            config.elicitation.mode = ElicitationMode::parse(&raw).ok_or_else(|| {
                OrchestrationError::ConfigError(format!("Invalid ELICITATION_MODE: {}", raw))
            })?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ELICITATION_TIMEOUT_SECS")? {
            config.elicitation.wait_budget = Duration::from_secs(secs);
        }

        if let Some(v) = parse_var(&lookup, "MAX_TOOL_INVOCATIONS")? {
            config.executor.max_tool_invocations = v;
        }
        if let Some(v) = parse_var(&lookup, "MAX_MODEL_CALLS")? {
            config.executor.max_model_calls = v;
        }
        if let Some(v) = parse_var(&lookup, "PARALLEL_TOOL_CALLS")? {
            config.executor.parallel_tool_calls = v;
        }

        if let Some(v) = parse_var(&lookup, "ROUTER_SWITCH_THRESHOLD")? {
            config.switch_threshold = v;
        }

        Ok(config)
    }
}

/// Agent set from `AGENTS_FILE` or the built-in roster, with per-agent
/// `AGENT_<NAME>_MODEL` / `AGENT_<NAME>_TEMPERATURE` overrides applied.
pub fn load_agents() -> Result<AgentSet> {
    dotenv::dotenv().ok();
    load_agents_from(|key| std::env::var(key).ok())
}

pub fn load_agents_from(lookup: impl Fn(&str) -> Option<String>) -> Result<AgentSet> {
    let agents = match lookup("AGENTS_FILE") {
        Some(path) => {
            info!(path = %path, "Loading agent definitions");
            AgentSet::from_file(&path)?
        }
        None => default_agents(),
    };

    let mut overrides = Vec::new();
    for agent in agents.iter() {
        let prefix = format!("AGENT_{}", agent.name.to_uppercase());
        let model = lookup(&format!("{}_MODEL", prefix)).filter(|m| !m.trim().is_empty());
        let temperature = parse_var::<f32>(&lookup, &format!("{}_TEMPERATURE", prefix))?;
        if model.is_some() || temperature.is_some() {
            overrides.push((agent.name.clone(), model, temperature));
        }
    }

    Ok(agents.map_agents(|mut agent| {
        if let Some((_, model, temperature)) = overrides.iter().find(|(n, _, _)| *n == agent.name) {
            if let Some(model) = model {
                agent.model = model.clone();
            }
            if let Some(temperature) = temperature {
                agent.temperature = *temperature;
            }
        }
        agent
    }))
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            OrchestrationError::ConfigError(format!("Invalid value for {}: {}", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = OrchestratorConfig::from_lookup(vars(&[])).unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.elicitation.mode, ElicitationMode::AutoCancel);
    }

    #[test]
    fn test_overrides_are_applied() {
        let config = OrchestratorConfig::from_lookup(vars(&[
            ("RETRY_MAX_ATTEMPTS", "5"),
            ("RETRY_BASE_DELAY_MS", "250"),
            ("KEEP_RECENT_TURNS", "6"),
            ("ELICITATION_MODE", "wait"),
            ("ELICITATION_TIMEOUT_SECS", "30"),
            ("PARALLEL_TOOL_CALLS", "true"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.compaction.keep_recent_turns, 6);
        assert_eq!(config.elicitation.mode, ElicitationMode::WaitIndefinitely);
        assert_eq!(config.elicitation.wait_budget, Duration::from_secs(30));
        assert!(config.executor.parallel_tool_calls);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = OrchestratorConfig::from_lookup(vars(&[("RETRY_MAX_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ConfigError(_)));

        assert!(OrchestratorConfig::from_lookup(vars(&[("RETRY_MAX_ATTEMPTS", "0")])).is_err());
        assert!(OrchestratorConfig::from_lookup(vars(&[("ELICITATION_MODE", "maybe")])).is_err());
    }

    #[test]
    fn test_agent_overrides() {
        let agents = load_agents_from(vars(&[
            ("AGENT_TRADING_ADVISOR_MODEL", "gemini-1.5-pro"),
            ("AGENT_PYTHON_ANALYST_TEMPERATURE", "0.0"),
        ]))
        .unwrap();

        assert_eq!(agents.get("trading_advisor").unwrap().model, "gemini-1.5-pro");
        assert_eq!(agents.get("python_analyst").unwrap().temperature, 0.0);
        assert_eq!(agents.len(), 6);
    }

    #[test]
    fn test_missing_agents_file() {
        let err = load_agents_from(vars(&[("AGENTS_FILE", "/nonexistent/agents.json")])).unwrap_err();
        assert!(matches!(err, OrchestrationError::IoError(_)));
    }
}
