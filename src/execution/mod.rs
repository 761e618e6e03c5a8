//! Agent executor
//!
//! Drives one agent turn: pre-turn compaction, model call, tool calls,
//! elicitation, until a final answer. Every outbound call goes through the
//! retry controller, and every requested tool call ends up as a tool-result
//! turn in the session whatever its outcome.

use crate::agents::{AgentDefinition, AgentSet};
use crate::audit::compute_context_hash;
use crate::error::OrchestrationError;
use crate::memory::{CompactionConfig, ContextCompactor, ContextStore, Session, Turn};
use crate::models::{
    CapabilityResult, CompletionRequest, ElicitationRequest, FailureKind, ModelResponse,
    RequestPurpose, SessionKey, ToolCall, ToolDeclaration, TurnInput, TurnOutcome,
    UpstreamFailure,
};
use crate::provider::ModelProvider;
use crate::retry::{DefaultClassifier, RetryController};
use crate::tools::{CapabilityRegistry, HUMAN_INPUT_CAPABILITY};
use crate::Result;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod elicitation;

pub use elicitation::{
    ElicitationBroker, ElicitationConfig, ElicitationHandler, ElicitationMode, TurnEvent,
};

/// Per-turn ceilings and tool fan-out
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    pub max_tool_invocations: u32,
    pub max_model_calls: u32,
    /// Run several tool calls from one model response concurrently
    pub parallel_tool_calls: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_tool_invocations: 16,
            max_model_calls: 24,
            parallel_tool_calls: false,
        }
    }
}

/// Caller-side hooks for one turn
#[derive(Clone, Default)]
pub struct TurnContext {
    pub elicitation: Option<Arc<dyn ElicitationHandler>>,
    pub cancel: CancellationToken,
}

impl TurnContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: Arc<dyn ElicitationHandler>) -> Self {
        self.elicitation = Some(handler);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// What a turn cost, reported whether or not it succeeded
#[derive(Debug, Clone, Default, Serialize)]
pub struct TurnStats {
    pub model_calls: u32,
    pub tool_invocations: u32,
    pub retry_attempts: u32,
    pub compactions: u32,
    pub context_hash: String,
}

enum ElicitStep {
    Resume,
    Return(TurnOutcome),
}

pub struct AgentExecutor {
    agents: Arc<AgentSet>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<ContextStore>,
    provider: Arc<dyn ModelProvider>,
    compactor: ContextCompactor,
    retry: RetryController,
    config: ExecutorConfig,
    elicitation: ElicitationConfig,
}

impl AgentExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agents: Arc<AgentSet>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<ContextStore>,
        provider: Arc<dyn ModelProvider>,
        retry: RetryController,
        compaction: CompactionConfig,
        config: ExecutorConfig,
        elicitation: ElicitationConfig,
    ) -> Self {
        let compactor = ContextCompactor::new(compaction, provider.clone(), retry.clone());

        Self {
            agents,
            registry,
            store,
            provider,
            compactor,
            retry,
            config,
            elicitation,
        }
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    pub async fn run_turn(
        &self,
        key: &SessionKey,
        input: TurnInput,
        ctx: &TurnContext,
    ) -> Result<TurnOutcome> {
        self.run_turn_with_stats(key, input, ctx).await.0
    }

    /// Run a turn and report its cost. The session lock is held for the
    /// whole turn and the session is persisted afterwards, even on error.
    pub async fn run_turn_with_stats(
        &self,
        key: &SessionKey,
        input: TurnInput,
        ctx: &TurnContext,
    ) -> (Result<TurnOutcome>, TurnStats) {
        let mut stats = TurnStats::default();

        let agent = match self.agents.get(&key.agent) {
            Some(agent) => agent,
            None => return (Err(OrchestrationError::UnknownAgent(key.agent.clone())), stats),
        };

        let shared = match self.store.session(key).await {
            Ok(shared) => shared,
            Err(e) => return (Err(e), stats),
        };
        let mut session = shared.lock().await;

        let tools = self.registry.declarations_for(agent);
        let result = self
            .drive(&mut session, key, agent, &tools, input, ctx, &mut stats)
            .await;

        if let Err(e) = self.store.persist(key, &session).await {
            warn!(session = %key, error = %e, "Failed to persist session");
        }
        stats.context_hash = compute_context_hash(session.turns());

        match &result {
            Ok(outcome) => info!(
                session = %key,
                outcome = outcome.kind(),
                model_calls = stats.model_calls,
                tool_invocations = stats.tool_invocations,
                "Turn completed"
            ),
            Err(e) => warn!(session = %key, kind = e.kind(), error = %e, "Turn failed"),
        }

        (result, stats)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        session: &mut Session,
        key: &SessionKey,
        agent: &AgentDefinition,
        tools: &[ToolDeclaration],
        input: TurnInput,
        ctx: &TurnContext,
        stats: &mut TurnStats,
    ) -> Result<TurnOutcome> {
        if ctx.cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled);
        }

        let opening = match input {
            TurnInput::Text(text) => Turn::user(text),
            TurnInput::ElicitationAnswer(answer) => Turn::elicitation_answer(answer),
        };

        let report = self
            .compactor
            .ensure_budget(session, agent, tools, opening.token_estimate, &ctx.cancel)
            .await;
        if report.compacted() {
            stats.compactions += 1;
        }
        session.append(opening);

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(cancel_turn(session));
            }

            if stats.model_calls >= self.config.max_model_calls {
                return Err(OrchestrationError::ExecutionBudgetExceeded(format!(
                    "{} model calls in one turn",
                    stats.model_calls
                )));
            }

            if stats.model_calls > 0 {
                let report = self
                    .compactor
                    .ensure_budget(session, agent, tools, 0, &ctx.cancel)
                    .await;
                if report.compacted() {
                    stats.compactions += 1;
                }
            }

            let response = self.call_model(session, agent, tools, ctx, stats).await?;

            match response {
                ModelResponse::Text(answer) => {
                    session.append(Turn::agent(answer.clone()));
                    return Ok(TurnOutcome::FinalAnswer {
                        agent: agent.name.clone(),
                        answer,
                    });
                }
                ModelResponse::Elicitation(prompt) => {
                    if let ElicitStep::Return(outcome) =
                        self.elicit(session, key, agent, prompt, ctx).await?
                    {
                        return Ok(outcome);
                    }
                }
                ModelResponse::ToolCalls(calls) => {
                    let (human, regular): (Vec<ToolCall>, Vec<ToolCall>) = calls
                        .into_iter()
                        .partition(|c| c.capability == HUMAN_INPUT_CAPABILITY);

                    let requested = stats.tool_invocations + regular.len() as u32;
                    if requested > self.config.max_tool_invocations {
                        return Err(OrchestrationError::ExecutionBudgetExceeded(format!(
                            "{} tool invocations requested, limit is {}",
                            requested, self.config.max_tool_invocations
                        )));
                    }

                    self.run_tool_calls(session, agent, regular, ctx, stats).await?;

                    let mut human = human.into_iter();
                    if let Some(call) = human.next() {
                        if !agent.human_input {
                            session.append(Turn::tool_result(not_allowed(agent, call)));
                        } else {
                            let prompt = call
                                .arguments
                                .get("prompt")
                                .and_then(|p| p.as_str())
                                .unwrap_or("Please provide more details.")
                                .to_string();

                            if let ElicitStep::Return(outcome) =
                                self.elicit(session, key, agent, prompt, ctx).await?
                            {
                                return Ok(outcome);
                            }
                        }
                    }
                    for extra in human {
                        session.append(Turn::tool_result(CapabilityResult::failure(
                            extra,
                            FailureKind::Fatal,
                            "Only one human-input request is handled per response",
                            0,
                        )));
                    }
                }
            }
        }
    }

    /// Model call through the retry controller. A context overflow gets one
    /// reactive compaction and one more try.
    async fn call_model(
        &self,
        session: &mut Session,
        agent: &AgentDefinition,
        tools: &[ToolDeclaration],
        ctx: &TurnContext,
        stats: &mut TurnStats,
    ) -> Result<ModelResponse> {
        let mut recovered = false;

        loop {
            let request = CompletionRequest {
                purpose: RequestPurpose::Turn,
                model: agent.model.clone(),
                temperature: agent.temperature,
                system_instruction: agent.instruction.clone(),
                turns: session.to_vec(),
                tools: tools.to_vec(),
            };

            stats.model_calls += 1;
            debug!(agent = %agent.name, turns = request.turns.len(), "Calling model");

            let result = self
                .retry
                .invoke("model_completion", &DefaultClassifier, &ctx.cancel, || {
                    self.provider.complete(&request)
                })
                .await;

            let failure = match result {
                Ok(retried) => {
                    stats.retry_attempts += retried.report.attempts;
                    return Ok(retried.value);
                }
                Err(failure) => failure,
            };
            stats.retry_attempts += failure.attempts();

            match failure.kind {
                FailureKind::Cancelled => return Err(cancel_turn(session)),
                FailureKind::ContextOverflow if !recovered => {
                    recovered = true;
                    let report = self
                        .compactor
                        .force_compact(session, agent, tools, &ctx.cancel)
                        .await;
                    if !report.compacted() {
                        return Err(OrchestrationError::ContextOverflow(format!(
                            "nothing left to compact: {}",
                            failure.message
                        )));
                    }
                    stats.compactions += 1;
                }
                FailureKind::ContextOverflow => {
                    return Err(OrchestrationError::ContextOverflow(failure.message));
                }
                kind => {
                    let attempts = failure.attempts();
                    return Err(OrchestrationError::Upstream {
                        kind,
                        message: failure.message,
                        attempts,
                    });
                }
            }
        }
    }

    /// Invoke requested capabilities and append one tool-result turn per call,
    /// in request order.
    async fn run_tool_calls(
        &self,
        session: &mut Session,
        agent: &AgentDefinition,
        calls: Vec<ToolCall>,
        ctx: &TurnContext,
        stats: &mut TurnStats,
    ) -> Result<()> {
        if calls.is_empty() {
            return Ok(());
        }

        stats.tool_invocations += calls.len() as u32;

        if self.config.parallel_tool_calls && calls.len() > 1 {
            let results = join_all(
                calls
                    .into_iter()
                    .map(|call| self.invoke_capability(agent, call, &ctx.cancel)),
            )
            .await;

            for result in results {
                stats.retry_attempts += result.attempts;
                session.append(Turn::tool_result(result));
            }
        } else {
            for call in calls {
                let result = self.invoke_capability(agent, call, &ctx.cancel).await;
                stats.retry_attempts += result.attempts;
                session.append(Turn::tool_result(result));
            }
        }

        if ctx.cancel.is_cancelled() {
            return Err(cancel_turn(session));
        }

        Ok(())
    }

    async fn invoke_capability(
        &self,
        agent: &AgentDefinition,
        call: ToolCall,
        cancel: &CancellationToken,
    ) -> CapabilityResult {
        if !agent.allows(&call.capability) {
            return not_allowed(agent, call);
        }

        if cancel.is_cancelled() {
            return CapabilityResult::failure(call, FailureKind::Cancelled, "Turn cancelled", 0);
        }

        let server = match self.registry.get(&call.capability) {
            Some(entry) => entry.server.clone(),
            None => {
                warn!(capability = %call.capability, "No tool server provides capability");
                let message = format!("No tool server provides capability '{}'", call.capability);
                return CapabilityResult::failure(call, FailureKind::Fatal, message, 0);
            }
        };

        let operation = format!("tool:{}", call.capability);
        let outcome = self
            .retry
            .invoke(&operation, &DefaultClassifier, cancel, || {
                let server = server.clone();
                let call = &call;
                async move {
                    if !server.is_available().await {
                        return Err(UpstreamFailure::new(
                            FailureKind::Unavailable,
                            format!("Tool server {} is not available", server.id()),
                        ));
                    }
                    server.invoke(&call.capability, &call.arguments).await
                }
            })
            .await;

        match outcome {
            Ok(retried) => CapabilityResult::success(call, retried.value, retried.report.attempts)
                .with_retry_delays(&retried.report.delays),
            Err(failure) => {
                let attempts = failure.attempts();
                CapabilityResult::failure(call, failure.kind, failure.message, attempts)
                    .with_retry_delays(&failure.report.delays)
            }
        }
    }

    /// Record the prompt, then either hand it back to the caller or wait for
    /// the attached handler.
    async fn elicit(
        &self,
        session: &mut Session,
        key: &SessionKey,
        agent: &AgentDefinition,
        prompt: String,
        ctx: &TurnContext,
    ) -> Result<ElicitStep> {
        session.append(Turn::elicitation(prompt.clone()));

        let handler = match &ctx.elicitation {
            Some(handler) => handler.clone(),
            None => {
                return Ok(ElicitStep::Return(TurnOutcome::Elicitation {
                    agent: agent.name.clone(),
                    prompt,
                }))
            }
        };

        let request = ElicitationRequest {
            session: key.clone(),
            prompt,
        };

        let answer = match self.elicitation.mode {
            ElicitationMode::AutoCancel => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(cancel_turn(session)),
                    answer = timeout(self.elicitation.wait_budget, handler.request_input(&request)) => {
                        answer.ok().flatten()
                    }
                }
            }
            ElicitationMode::WaitIndefinitely => {
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(cancel_turn(session)),
                    answer = handler.request_input(&request) => answer,
                }
            }
        };

        match answer {
            Some(answer) => {
                session.append(Turn::elicitation_answer(answer));
            }
            None => {
                info!(session = %key, "Elicitation unanswered, continuing with cancellation");
                session.append(Turn::elicitation_cancelled(
                    self.elicitation.cancellation_message.clone(),
                ));
            }
        }

        Ok(ElicitStep::Resume)
    }
}

fn not_allowed(agent: &AgentDefinition, call: ToolCall) -> CapabilityResult {
    let error = OrchestrationError::CapabilityNotAllowed {
        agent: agent.name.clone(),
        capability: call.capability.clone(),
    };
    warn!(agent = %agent.name, capability = %call.capability, "Capability not allowed");
    CapabilityResult::failure(call, FailureKind::CapabilityNotAllowed, error.to_string(), 0)
}

fn cancel_turn(session: &mut Session) -> OrchestrationError {
    session.append(Turn::cancelled("Turn cancelled by the user"));
    OrchestrationError::Cancelled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::default_agents;
    use crate::memory::{TurnKind, TurnRole};
    use crate::retry::RetryPolicy;
    use crate::provider::ScriptedProvider;
    use crate::tools::{catalog, ScriptedToolServer};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        executor: AgentExecutor,
        provider: Arc<ScriptedProvider>,
        ibkr: Arc<ScriptedToolServer>,
        store: Arc<ContextStore>,
    }

    fn harness_with(config: ExecutorConfig, elicitation: ElicitationConfig) -> Harness {
        let provider = Arc::new(ScriptedProvider::new());
        let ibkr = Arc::new(ScriptedToolServer::new(catalog::IBKR));
        let search = Arc::new(ScriptedToolServer::new(catalog::BRAVE_SEARCH));

        let mut registry = CapabilityRegistry::new();
        registry.register_catalog_server(ibkr.clone());
        registry.register_catalog_server(search);

        let store = Arc::new(ContextStore::new());
        let retry = RetryController::new(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(10),
        });

        let executor = AgentExecutor::new(
            Arc::new(default_agents()),
            Arc::new(registry),
            store.clone(),
            provider.clone(),
            retry,
            CompactionConfig::default(),
            config,
            elicitation,
        );

        Harness {
            executor,
            provider,
            ibkr,
            store,
        }
    }

    fn harness() -> Harness {
        harness_with(ExecutorConfig::default(), ElicitationConfig::default())
    }

    fn call(id: &str, capability: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            capability: capability.to_string(),
            arguments,
        }
    }

    fn trading_key() -> SessionKey {
        SessionKey::new("conv-1", "trading_advisor")
    }

    #[tokio::test(start_paused = true)]
    async fn test_tesla_scenario_unavailable_twice_then_success() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
            "c1",
            "get_market_data",
            json!({"symbol": "TSLA"}),
        )])));
        h.provider
            .push(Ok(ModelResponse::Text("TSLA is range-bound; wait for a pullback.".into())));

        for _ in 0..2 {
            h.ibkr.push(
                "get_market_data",
                Err(UpstreamFailure::new(FailureKind::Unavailable, "gateway restarting")),
            );
        }
        h.ibkr.push("get_market_data", Ok(json!({"symbol": "TSLA", "price": 250.0})));

        let (outcome, stats) = h
            .executor
            .run_turn_with_stats(
                &trading_key(),
                TurnInput::Text("Should I buy Tesla stock right now?".into()),
                &TurnContext::new(),
            )
            .await;

        assert!(matches!(outcome.unwrap(), TurnOutcome::FinalAnswer { .. }));
        assert_eq!(h.ibkr.call_count("get_market_data"), 3);
        assert_eq!(stats.tool_invocations, 1);

        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].role, TurnRole::User);
        assert_eq!(turns[1].role, TurnRole::ToolResult);
        let result = turns[1].capability_result().unwrap();
        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.retry_delays_ms, vec![100, 200]);
        assert_eq!(stats.retry_attempts, 3 + 2);
        assert_eq!(turns[2].role, TurnRole::Agent);
    }

    #[tokio::test]
    async fn test_request_includes_instruction_history_and_allowed_tools() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::Text("ok".into())));

        h.executor
            .run_turn(&trading_key(), TurnInput::Text("hi".into()), &TurnContext::new())
            .await
            .unwrap();

        let request = &h.provider.requests()[0];
        let agents = default_agents();
        let trading = agents.get("trading_advisor").unwrap();
        assert_eq!(request.system_instruction, trading.instruction);
        assert_eq!(request.turns.len(), 1);
        assert!(request.tools.iter().any(|t| t.name == "get_market_data"));
        assert!(request.tools.iter().any(|t| t.name == HUMAN_INPUT_CAPABILITY));
        assert!(!request.tools.iter().any(|t| t.name == "run_python_code"));
    }

    #[tokio::test]
    async fn test_disallowed_capability_is_recorded_not_invoked() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
            "c1",
            "run_python_code",
            json!({"code": "print(1)"}),
        )])));
        h.provider.push(Ok(ModelResponse::Text("I can't run code here.".into())));

        let outcome = h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("run code".into()), &TurnContext::new())
            .await
            .unwrap();

        assert!(matches!(outcome, TurnOutcome::FinalAnswer { .. }));
        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        let result = turns[1].capability_result().unwrap();
        assert_eq!(result.failure_kind(), Some(FailureKind::CapabilityNotAllowed));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_fatal_tool_failure_is_not_retried() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
            "c1",
            "place_order",
            json!({"symbol": "TSLA", "action": "BUY", "quantity": 1}),
        )])));
        h.provider.push(Ok(ModelResponse::Text("Order rejected.".into())));
        h.ibkr.push(
            "place_order",
            Err(UpstreamFailure::from_status(401, "not authenticated")),
        );

        h.executor
            .run_turn(&trading_key(), TurnInput::Text("buy 1 TSLA".into()), &TurnContext::new())
            .await
            .unwrap();

        assert_eq!(h.ibkr.call_count("place_order"), 1);
        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        assert_eq!(turns[1].failure_kind(), Some(FailureKind::Fatal));
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_overload_exhaustion_surfaces_upstream_error() {
        let h = harness();
        for _ in 0..3 {
            h.provider
                .push(Err(UpstreamFailure::from_status(529, "overloaded_error")));
        }

        let err = h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("sell?".into()), &TurnContext::new())
            .await
            .unwrap_err();

        match err {
            OrchestrationError::Upstream { kind, attempts, .. } => {
                assert_eq!(kind, FailureKind::Overloaded);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }

        // session survives with the user turn
        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[tokio::test]
    async fn test_tool_loop_ceiling() {
        let config = ExecutorConfig {
            max_tool_invocations: 2,
            ..Default::default()
        };
        let h = harness_with(config, ElicitationConfig::default());
        for i in 0..3 {
            h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
                &format!("c{}", i),
                "get_positions",
                json!({}),
            )])));
        }

        let err = h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("positions".into()), &TurnContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::ExecutionBudgetExceeded(_)));
        assert_eq!(h.ibkr.call_count("get_positions"), 2);
    }

    #[tokio::test]
    async fn test_parallel_calls_append_in_request_order() {
        let config = ExecutorConfig {
            parallel_tool_calls: true,
            ..Default::default()
        };
        let h = harness_with(config, ElicitationConfig::default());
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![
            call("c1", "get_positions", json!({})),
            call("c2", "get_market_data", json!({"symbol": "AAPL"})),
            call("c3", "get_account_summary", json!({})),
        ])));
        h.provider.push(Ok(ModelResponse::Text("done".into())));

        h.executor
            .run_turn(&trading_key(), TurnInput::Text("overview".into()), &TurnContext::new())
            .await
            .unwrap();

        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        let ids: Vec<&str> = turns
            .iter()
            .filter_map(|t| t.capability_result())
            .map(|r| r.call.id.as_str())
            .collect();
        assert_eq!(ids, vec!["c1", "c2", "c3"]);
    }

    #[tokio::test]
    async fn test_context_overflow_compacts_and_retries_once() {
        let h = harness();
        let key = trading_key();
        {
            let shared = h.store.session(&key).await.unwrap();
            let mut session = shared.lock().await;
            for i in 0..10 {
                session.append(Turn::user(format!("old question {}", i)));
                session.append(Turn::agent(format!("old answer {}", i)));
            }
        }

        h.provider
            .push(Err(UpstreamFailure::from_status(400, "prompt is too long: context length exceeded")));
        h.provider.push(Ok(ModelResponse::Text("fits now".into())));

        let (outcome, stats) = h
            .executor
            .run_turn_with_stats(&key, TurnInput::Text("latest".into()), &TurnContext::new())
            .await;

        assert!(outcome.is_ok());
        assert_eq!(stats.compactions, 1);
        assert_eq!(h.provider.request_count(RequestPurpose::Summary), 1);

        let turns = h.store.snapshot(&key).await.unwrap();
        assert!(turns[0].is_summary());
        assert!(turns.iter().any(|t| t.content == "latest"));
    }

    #[tokio::test]
    async fn test_second_overflow_is_surfaced() {
        let h = harness();
        let key = trading_key();
        {
            let shared = h.store.session(&key).await.unwrap();
            let mut session = shared.lock().await;
            for i in 0..10 {
                session.append(Turn::user(format!("old question {}", i)));
                session.append(Turn::agent(format!("old answer {}", i)));
            }
        }

        for _ in 0..2 {
            h.provider
                .push(Err(UpstreamFailure::from_status(400, "context length exceeded")));
        }

        let err = h
            .executor
            .run_turn(&key, TurnInput::Text("latest".into()), &TurnContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::ContextOverflow(_)));
    }

    #[tokio::test]
    async fn test_elicitation_without_handler_returns_prompt_and_resumes() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
            "c1",
            HUMAN_INPUT_CAPABILITY,
            json!({"prompt": "How many shares?"}),
        )])));
        h.provider.push(Ok(ModelResponse::Text("Buy 10 shares at the open.".into())));

        let outcome = h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("buy TSLA".into()), &TurnContext::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Elicitation {
                agent: "trading_advisor".into(),
                prompt: "How many shares?".into()
            }
        );

        let outcome = h
            .executor
            .run_turn(
                &trading_key(),
                TurnInput::ElicitationAnswer("10".into()),
                &TurnContext::new(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::FinalAnswer { .. }));

        let kinds: Vec<TurnKind> = h
            .store
            .snapshot(&trading_key())
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                TurnKind::Message,
                TurnKind::Elicitation,
                TurnKind::ElicitationAnswer,
                TurnKind::Message
            ]
        );
    }

    struct SilentHandler;

    #[async_trait::async_trait]
    impl ElicitationHandler for SilentHandler {
        async fn request_input(&self, _request: &ElicitationRequest) -> Option<String> {
            std::future::pending().await
        }
    }

    struct FixedAnswer(&'static str);

    #[async_trait::async_trait]
    impl ElicitationHandler for FixedAnswer {
        async fn request_input(&self, _request: &ElicitationRequest) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_elicitation_auto_cancel_resumes_turn() {
        let elicitation = ElicitationConfig {
            wait_budget: Duration::from_secs(30),
            ..Default::default()
        };
        let h = harness_with(ExecutorConfig::default(), elicitation);
        h.provider
            .push(Ok(ModelResponse::Elicitation("Confirm the order?".into())));
        h.provider.push(Ok(ModelResponse::Text("No order placed.".into())));

        let ctx = TurnContext::new().with_handler(Arc::new(SilentHandler));
        let outcome = h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("sell TSLA".into()), &ctx)
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::FinalAnswer { .. }));

        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        assert_eq!(turns[2].kind, TurnKind::ElicitationCancelled);

        // session stays usable
        h.provider.push(Ok(ModelResponse::Text("Still here.".into())));
        assert!(h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("and now?".into()), &ctx)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_elicitation_answer_from_handler() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::Elicitation("Risk tolerance?".into())));
        h.provider.push(Ok(ModelResponse::Text("Conservative plan.".into())));

        let ctx = TurnContext::new().with_handler(Arc::new(FixedAnswer("low")));
        h.executor
            .run_turn(&trading_key(), TurnInput::Text("plan a trade".into()), &ctx)
            .await
            .unwrap();

        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        assert_eq!(turns[2].kind, TurnKind::ElicitationAnswer);
        assert_eq!(turns[2].content, "low");
    }

    #[tokio::test]
    async fn test_human_input_not_available_to_portfolio_manager() {
        let h = harness();
        let key = SessionKey::new("conv-1", "portfolio_manager");
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
            "c1",
            HUMAN_INPUT_CAPABILITY,
            json!({"prompt": "?"}),
        )])));
        h.provider.push(Ok(ModelResponse::Text("Proceeding.".into())));

        let outcome = h
            .executor
            .run_turn(&key, TurnInput::Text("rebalance".into()), &TurnContext::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::FinalAnswer { .. }));

        let turns = h.store.snapshot(&key).await.unwrap();
        assert_eq!(turns[1].failure_kind(), Some(FailureKind::CapabilityNotAllowed));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_session_untouched() {
        let h = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h
            .executor
            .run_turn(
                &trading_key(),
                TurnInput::Text("buy".into()),
                &TurnContext::new().with_cancel(cancel),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestrationError::Cancelled));
        assert!(h.store.snapshot(&trading_key()).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_retry_records_cancelled_result() {
        let h = harness();
        h.provider.push(Ok(ModelResponse::ToolCalls(vec![call(
            "c1",
            "get_market_data",
            json!({"symbol": "TSLA"}),
        )])));
        for _ in 0..3 {
            h.ibkr.push(
                "get_market_data",
                Err(UpstreamFailure::new(FailureKind::Unavailable, "down")),
            );
        }

        let cancel = CancellationToken::new();
        let ctx = TurnContext::new().with_cancel(cancel.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let err = h
            .executor
            .run_turn(&trading_key(), TurnInput::Text("buy TSLA".into()), &ctx)
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, OrchestrationError::Cancelled));
        assert_eq!(h.ibkr.call_count("get_market_data"), 1);

        let turns = h.store.snapshot(&trading_key()).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[1].failure_kind(), Some(FailureKind::Cancelled));
        assert_eq!(turns[2].kind, TurnKind::Cancelled);
    }
}
