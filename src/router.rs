//! Router
//!
//! Resolves each request to exactly one agent. The "current agent" pointer
//! lives in a `RouterState` owned by the conversation, never globally.

use crate::agents::AgentSet;
use crate::classifier::DomainClassifier;
use crate::error::OrchestrationError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Minimum score a different agent needs before it takes over a conversation
pub const DEFAULT_SWITCH_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouterState {
    current: Option<String>,
}

impl RouterState {
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteReason {
    Override,
    Classified,
    Continued,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub agent: String,
    pub reason: RouteReason,
    pub score: u32,
}

pub struct Router {
    agents: Arc<AgentSet>,
    switch_threshold: u32,
}

impl Router {
    pub fn new(agents: Arc<AgentSet>) -> Self {
        Self {
            agents,
            switch_threshold: DEFAULT_SWITCH_THRESHOLD,
        }
    }

    pub fn with_switch_threshold(mut self, threshold: u32) -> Self {
        self.switch_threshold = threshold;
        self
    }

    pub fn agents(&self) -> &AgentSet {
        &self.agents
    }

    /// Pick the agent for `request`, updating the conversation pointer
    pub fn route(
        &self,
        state: &mut RouterState,
        request: &str,
        override_agent: Option<&str>,
    ) -> crate::Result<RoutingDecision> {
        if let Some(name) = override_agent.map(str::trim).filter(|n| !n.is_empty()) {
            if !self.agents.contains(name) {
                return Err(OrchestrationError::UnknownAgent(name.to_string()));
            }
            return Ok(self.select(state, name, RouteReason::Override, 0));
        }

        if request.trim().is_empty() {
            return Err(OrchestrationError::RoutingAmbiguous(
                "Empty request; please describe what you need".to_string(),
            ));
        }

        let classification = DomainClassifier::classify(request, &self.agents);
        let current = state
            .current
            .clone()
            .filter(|name| self.agents.contains(name));

        let decision = match (classification.best(), current) {
            (Some(best), Some(current)) if best.agent.name != current => {
                let current_score = classification.score_of(&current);
                if best.score >= self.switch_threshold && best.score > current_score {
                    RoutingDecision {
                        agent: best.agent.name.clone(),
                        reason: RouteReason::Classified,
                        score: best.score,
                    }
                } else {
                    RoutingDecision {
                        agent: current,
                        reason: RouteReason::Continued,
                        score: current_score,
                    }
                }
            }
            (Some(best), _) => RoutingDecision {
                agent: best.agent.name.clone(),
                reason: RouteReason::Classified,
                score: best.score,
            },
            (None, Some(current)) => RoutingDecision {
                agent: current,
                reason: RouteReason::Continued,
                score: 0,
            },
            (None, None) => match self.agents.fallback() {
                Some(fallback) => RoutingDecision {
                    agent: fallback.name.clone(),
                    reason: RouteReason::Fallback,
                    score: 0,
                },
                None => {
                    return Err(OrchestrationError::RoutingAmbiguous(format!(
                        "No agent matches the request; available agents: {}",
                        self.agents.names().join(", ")
                    )))
                }
            },
        };

        debug!(
            agent = %decision.agent,
            reason = ?decision.reason,
            score = decision.score,
            "Request routed"
        );

        state.current = Some(decision.agent.clone());
        Ok(decision)
    }

    fn select(
        &self,
        state: &mut RouterState,
        name: &str,
        reason: RouteReason,
        score: u32,
    ) -> RoutingDecision {
        state.current = Some(name.to_string());
        RoutingDecision {
            agent: name.to_string(),
            reason,
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::default_agents;

    fn router() -> Router {
        Router::new(Arc::new(default_agents()))
    }

    #[test]
    fn test_tesla_request_goes_to_trading_advisor() {
        let router = router();
        let mut state = RouterState::default();
        let decision = router
            .route(&mut state, "Should I buy Tesla stock right now?", None)
            .unwrap();
        assert_eq!(decision.agent, "trading_advisor");
        assert_eq!(decision.reason, RouteReason::Classified);
        assert_eq!(state.current(), Some("trading_advisor"));
    }

    #[test]
    fn test_override_wins_and_updates_pointer() {
        let router = router();
        let mut state = RouterState::default();
        let decision = router
            .route(&mut state, "rebalance my portfolio", Some("neo4j_analyst"))
            .unwrap();
        assert_eq!(decision.agent, "neo4j_analyst");
        assert_eq!(decision.reason, RouteReason::Override);
        assert_eq!(state.current(), Some("neo4j_analyst"));
    }

    #[test]
    fn test_unknown_override_fails() {
        let router = router();
        let mut state = RouterState::default();
        let err = router
            .route(&mut state, "anything", Some("astrologer"))
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::UnknownAgent(_)));
        assert_eq!(state.current(), None);
    }

    #[test]
    fn test_follow_up_without_cue_continues() {
        let router = router();
        let mut state = RouterState::default();
        router
            .route(&mut state, "Rebalance my portfolio", None)
            .unwrap();

        let decision = router.route(&mut state, "and what about bonds?", None).unwrap();
        assert_eq!(decision.agent, "portfolio_manager");
        assert_eq!(decision.reason, RouteReason::Continued);
    }

    #[test]
    fn test_weak_cue_does_not_switch() {
        let router = router();
        let mut state = RouterState::default();
        router.route(&mut state, "Rebalance my portfolio", None).unwrap();

        // "stock" alone scores 1 for financial_analyst, below the threshold
        let decision = router.route(&mut state, "which stock first?", None).unwrap();
        assert_eq!(decision.agent, "portfolio_manager");
    }

    #[test]
    fn test_clear_cue_switches() {
        let router = router();
        let mut state = RouterState::default();
        router.route(&mut state, "Rebalance my portfolio", None).unwrap();

        let decision = router
            .route(&mut state, "Write python code to plot it", None)
            .unwrap();
        assert_eq!(decision.agent, "python_analyst");
        assert_eq!(state.current(), Some("python_analyst"));
    }

    #[test]
    fn test_fallback_and_ambiguity() {
        let router = router();
        let mut state = RouterState::default();
        let decision = router.route(&mut state, "hello", None).unwrap();
        assert_eq!(decision.agent, "financial_analyst");
        assert_eq!(decision.reason, RouteReason::Fallback);

        let err = router.route(&mut state, "   ", None).unwrap_err();
        assert!(matches!(err, OrchestrationError::RoutingAmbiguous(_)));

        let agents = default_agents();
        let only = agents.get("trading_advisor").unwrap().clone();
        let no_fallback = Router::new(Arc::new(AgentSet::new(vec![only], None).unwrap()));
        let err = no_fallback
            .route(&mut RouterState::default(), "hello", None)
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::RoutingAmbiguous(_)));
    }

    #[test]
    fn test_routing_is_deterministic() {
        let router = router();
        for request in ["sell NVDA now", "graph of sector networks", "hi"] {
            let a = router.route(&mut RouterState::default(), request, None).unwrap();
            let b = router.route(&mut RouterState::default(), request, None).unwrap();
            assert_eq!(a, b);
        }
    }
}
