//! Human-input elicitation
//!
//! An agent turn that needs confirmation or missing input asks an
//! [`ElicitationHandler`]. The [`ElicitationBroker`] implementation parks
//! the turn on a oneshot channel and announces the prompt on the turn's
//! event channel, so the session entry point can hand the prompt to the
//! user and route the next submission back as the answer.

use crate::models::{ElicitationRequest, TurnOutcome};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationMode {
    /// Silence past the wait budget becomes a synthetic cancellation
    AutoCancel,
    WaitIndefinitely,
}

impl ElicitationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto_cancel" | "auto-cancel" | "autocancel" => Some(ElicitationMode::AutoCancel),
            "wait" | "wait_indefinitely" | "indefinite" => Some(ElicitationMode::WaitIndefinitely),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ElicitationConfig {
    pub mode: ElicitationMode,
    pub wait_budget: Duration,
    /// Text recorded when a prompt goes unanswered
    pub cancellation_message: String,
}

impl Default for ElicitationConfig {
    fn default() -> Self {
        Self {
            mode: ElicitationMode::AutoCancel,
            wait_budget: Duration::from_secs(120),
            cancellation_message:
                "No response was received; the request for input was cancelled. Continue without it."
                    .to_string(),
        }
    }
}

/// Delivers an elicitation prompt and waits for the human's answer.
/// `None` means the prompt was declined or the channel went away.
#[async_trait::async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn request_input(&self, request: &ElicitationRequest) -> Option<String>;
}

/// Progress of a running turn, as seen by the session entry point
#[derive(Debug)]
pub enum TurnEvent {
    Elicitation(ElicitationRequest),
    Finished(crate::Result<TurnOutcome>),
}

pub struct ElicitationBroker {
    events: mpsc::Sender<TurnEvent>,
    pending: Mutex<Option<oneshot::Sender<String>>>,
}

impl ElicitationBroker {
    pub fn new(events: mpsc::Sender<TurnEvent>) -> Self {
        Self {
            events,
            pending: Mutex::new(None),
        }
    }

    /// Whether a turn is currently parked waiting for an answer.
    /// False once the executor stopped waiting (auto-cancel).
    pub fn is_waiting(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Deliver an answer. Returns false when nobody is waiting.
    pub fn answer(&self, text: impl Into<String>) -> bool {
        let sender = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        match sender {
            Some(tx) => tx.send(text.into()).is_ok(),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl ElicitationHandler for ElicitationBroker {
    async fn request_input(&self, request: &ElicitationRequest) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        if self
            .events
            .send(TurnEvent::Elicitation(request.clone()))
            .await
            .is_err()
        {
            debug!(session = %request.session, "Nobody listening for elicitation");
            return None;
        }

        rx.await.ok()
    }
}
