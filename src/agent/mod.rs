//! Session entry point
//!
//! SUBMIT → ROUTE → EXECUTE (spawned) → FINAL ANSWER | ELICITATION PROMPT
//!
//! Each conversation owns its router state and at most one in-flight turn.
//! A turn that asks for human input stays parked on its elicitation broker;
//! the next submission on the conversation is delivered as the answer.

use crate::agents::AgentSet;
use crate::audit::{AuditLog, TurnRecord};
use crate::config::{load_agents, OrchestratorConfig};
use crate::error::OrchestrationError;
use crate::execution::{AgentExecutor, ElicitationBroker, TurnContext, TurnEvent, TurnStats};
use crate::memory::{ContextStore, Turn};
use crate::models::{SessionKey, TurnInput, TurnOutcome};
use crate::provider::{EchoProvider, GeminiProvider, ModelProvider};
use crate::retry::RetryController;
use crate::router::{RouteReason, Router, RouterState};
use crate::state::create_persistence;
use crate::tools::{create_default_registry, CapabilityRegistry};
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

const EVENT_BUFFER: usize = 4;

/// A turn that has been spawned and not yet reported as finished
struct InflightTurn {
    agent: String,
    input: String,
    route_reason: RouteReason,
    events: mpsc::Receiver<TurnEvent>,
    broker: Arc<ElicitationBroker>,
    cancel: CancellationToken,
    handle: JoinHandle<TurnStats>,
    started: Instant,
}

impl InflightTurn {
    /// Drop prompts queued while nobody was listening. A turn parked on the
    /// broker sends nothing but elicitations, and the answer about to be
    /// delivered settles the pending one.
    fn discard_queued_prompts(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let TurnEvent::Elicitation(request) = event {
                debug!(
                    session = %request.session,
                    prompt = %request.prompt,
                    "Discarding queued prompt"
                );
            }
        }
    }
}

#[derive(Default)]
struct Conversation {
    router_state: RouterState,
    inflight: Option<InflightTurn>,
}

/// Coordinates routing, turn execution and auditing across conversations
pub struct Orchestrator {
    router: Router,
    executor: Arc<AgentExecutor>,
    audit_log: AuditLog,
    conversations: RwLock<HashMap<String, Arc<Mutex<Conversation>>>>,
    cancels: StdMutex<HashMap<String, CancellationToken>>,
}

impl Orchestrator {
    pub fn new(
        agents: Arc<AgentSet>,
        registry: Arc<CapabilityRegistry>,
        provider: Arc<dyn ModelProvider>,
        store: Arc<ContextStore>,
        config: OrchestratorConfig,
    ) -> Self {
        for agent in agents.iter() {
            let missing = registry.missing_for(agent);
            if !missing.is_empty() {
                warn!(agent = %agent.name, ?missing, "Capabilities without a tool server");
            }
        }

        let router = Router::new(agents.clone()).with_switch_threshold(config.switch_threshold);
        let executor = AgentExecutor::new(
            agents,
            registry,
            store,
            provider,
            RetryController::new(config.retry),
            config.compaction,
            config.executor,
            config.elicitation,
        );

        Self {
            router,
            executor: Arc::new(executor),
            audit_log: AuditLog::new(),
            conversations: RwLock::new(HashMap::new()),
            cancels: StdMutex::new(HashMap::new()),
        }
    }

    /// Wire everything from the environment: agent set, tool servers,
    /// persistence, and Gemini when `GEMINI_API_KEY` is set (offline echo
    /// provider otherwise).
    pub fn from_env() -> Result<Self> {
        let config = OrchestratorConfig::from_env()?;
        let agents = Arc::new(load_agents()?);
        let registry = Arc::new(create_default_registry());
        let store = Arc::new(ContextStore::with_persistence(create_persistence()));

        let provider: Arc<dyn ModelProvider> = match GeminiProvider::from_env() {
            Some(gemini) => Arc::new(gemini),
            None => {
                warn!("GEMINI_API_KEY not set, using the offline echo provider");
                Arc::new(EchoProvider)
            }
        };
        info!(provider = provider.name(), agents = agents.len(), "Orchestrator configured");

        Ok(Self::new(agents, registry, provider, store, config))
    }

    pub fn agents(&self) -> &AgentSet {
        self.router.agents()
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        self.executor.store()
    }

    /// Submit user input to a conversation.
    ///
    /// While a turn is parked on an elicitation, `text` is delivered as the
    /// answer (`override_agent` is ignored). `answer = true` insists on that
    /// and fails with `NoPendingElicitation` when nothing is waiting.
    pub async fn submit(
        &self,
        session_id: &str,
        text: &str,
        override_agent: Option<&str>,
        answer: bool,
    ) -> Result<TurnOutcome> {
        let conversation = self.conversation(session_id).await;
        let mut conversation = conversation.lock().await;

        if let Some(mut inflight) = conversation.inflight.take() {
            if inflight.broker.is_waiting() && !inflight.cancel.is_cancelled() {
                inflight.discard_queued_prompts();
                debug!(session_id, agent = %inflight.agent, "Delivering elicitation answer");
                inflight.broker.answer(text);
                return self.await_event(session_id, &mut conversation, inflight).await;
            }

            // The turn stopped waiting (auto-cancel or cancel); let it finish
            // and treat this submission as a new request.
            let previous = self.await_event(session_id, &mut conversation, inflight).await;
            if conversation.inflight.is_some() {
                // it asked for input again before this submission arrived
                return previous;
            }
        }

        if answer {
            return Err(OrchestrationError::NoPendingElicitation(session_id.to_string()));
        }

        let decision = self
            .router
            .route(&mut conversation.router_state, text, override_agent)?;

        info!(
            session_id,
            agent = %decision.agent,
            reason = ?decision.reason,
            score = decision.score,
            "Request routed"
        );

        let inflight = self.spawn_turn(session_id, &decision.agent, decision.reason, text);
        self.await_event(session_id, &mut conversation, inflight).await
    }

    /// Cancel the in-flight turn of a conversation. Returns false when
    /// nothing is running.
    pub fn cancel(&self, session_id: &str) -> bool {
        let token = self
            .cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(session_id)
            .cloned();

        match token {
            Some(token) => {
                info!(session_id, "Cancelling in-flight turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel whatever is running and clear every agent session plus the
    /// router pointer of the conversation
    pub async fn reset(&self, session_id: &str) -> Result<()> {
        self.cancel(session_id);

        let conversation = self.conversation(session_id).await;
        let mut conversation = conversation.lock().await;

        if let Some(inflight) = conversation.inflight.take() {
            let _ = self.await_event(session_id, &mut conversation, inflight).await;
            if let Some(stale) = conversation.inflight.take() {
                stale.handle.abort();
            }
        }
        conversation.router_state.clear();

        for agent in self.agents().names() {
            self.store().reset(&SessionKey::new(session_id, agent)).await?;
        }

        info!(session_id, "Conversation reset");
        Ok(())
    }

    /// Agent currently holding the conversation, if any
    pub async fn current_agent(&self, session_id: &str) -> Option<String> {
        let conversation = {
            let conversations = self.conversations.read().await;
            conversations.get(session_id).cloned()
        }?;
        let conversation = conversation.lock().await;
        conversation.router_state.current().map(str::to_string)
    }

    /// Turns of one agent's session in a conversation
    pub async fn history(&self, session_id: &str, agent: &str) -> Vec<Turn> {
        self.store()
            .snapshot(&SessionKey::new(session_id, agent))
            .await
            .unwrap_or_default()
    }

    pub async fn audit(&self, session_id: &str) -> Vec<TurnRecord> {
        self.audit_log.for_conversation(session_id).await
    }

    async fn conversation(&self, session_id: &str) -> Arc<Mutex<Conversation>> {
        {
            let conversations = self.conversations.read().await;
            if let Some(conversation) = conversations.get(session_id) {
                return conversation.clone();
            }
        }

        let mut conversations = self.conversations.write().await;
        conversations
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn spawn_turn(
        &self,
        session_id: &str,
        agent: &str,
        route_reason: RouteReason,
        text: &str,
    ) -> InflightTurn {
        let (tx, events) = mpsc::channel(EVENT_BUFFER);
        let broker = Arc::new(ElicitationBroker::new(tx.clone()));
        let cancel = CancellationToken::new();

        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id.to_string(), cancel.clone());

        let executor = self.executor.clone();
        let key = SessionKey::new(session_id, agent);
        let input = TurnInput::Text(text.to_string());
        let ctx = TurnContext::new()
            .with_handler(broker.clone())
            .with_cancel(cancel.clone());

        let handle = tokio::spawn(async move {
            let (result, stats) = executor.run_turn_with_stats(&key, input, &ctx).await;
            if tx.send(TurnEvent::Finished(result)).await.is_err() {
                debug!(session = %key, "Turn finished after its submitter went away");
            }
            stats
        });

        InflightTurn {
            agent: agent.to_string(),
            input: text.to_string(),
            route_reason,
            events,
            broker,
            cancel,
            handle,
            started: Instant::now(),
        }
    }

    /// Wait for the next event of a spawned turn. An elicitation parks the
    /// turn back on the conversation; completion records the audit entry.
    async fn await_event(
        &self,
        session_id: &str,
        conversation: &mut Conversation,
        mut inflight: InflightTurn,
    ) -> Result<TurnOutcome> {
        let mut joined: Option<TurnStats> = None;

        let event = tokio::select! {
            biased;
            event = inflight.events.recv() => event,
            result = &mut inflight.handle => {
                joined = Some(result.unwrap_or_else(|e| {
                    warn!(session_id, error = %e, "Turn task failed");
                    TurnStats::default()
                }));
                // Finished is always the last event a turn sends
                let mut last = None;
                while let Ok(event) = inflight.events.try_recv() {
                    last = Some(event);
                }
                last
            }
        };

        match event {
            Some(TurnEvent::Elicitation(request)) if joined.is_none() => {
                info!(session = %request.session, "Turn waiting for human input");
                let agent = inflight.agent.clone();
                conversation.inflight = Some(inflight);
                Ok(TurnOutcome::Elicitation {
                    agent,
                    prompt: request.prompt,
                })
            }
            Some(TurnEvent::Finished(result)) => {
                let stats = match joined {
                    Some(stats) => stats,
                    None => (&mut inflight.handle).await.unwrap_or_else(|e| {
                        warn!(session_id, error = %e, "Turn task did not report stats");
                        TurnStats::default()
                    }),
                };
                self.finish(session_id, inflight, result, stats).await
            }
            _ => {
                let result = Err(OrchestrationError::TurnAborted(
                    "turn ended without an outcome".to_string(),
                ));
                let stats = joined.unwrap_or_default();
                self.finish(session_id, inflight, result, stats).await
            }
        }
    }

    async fn finish(
        &self,
        session_id: &str,
        inflight: InflightTurn,
        result: Result<TurnOutcome>,
        stats: TurnStats,
    ) -> Result<TurnOutcome> {
        self.cancels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(session_id);

        let (outcome, error) = match &result {
            Ok(outcome) => (outcome.kind().to_string(), None),
            Err(e) => (e.kind().to_string(), Some(e.to_string())),
        };

        let record = TurnRecord {
            record_id: Uuid::new_v4(),
            conversation: session_id.to_string(),
            agent: inflight.agent,
            route_reason: serde_json::to_value(inflight.route_reason)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string)),
            input: inflight.input,
            outcome,
            error,
            model_calls: stats.model_calls,
            tool_invocations: stats.tool_invocations,
            retry_attempts: stats.retry_attempts,
            compactions: stats.compactions,
            context_hash: stats.context_hash,
            duration_ms: inflight.started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };
        self.audit_log.record(record).await;

        result
    }
}
