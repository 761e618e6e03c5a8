//! Scripted tool server for tests and demos

use super::ToolServer;
use crate::models::UpstreamFailure;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Replays queued responses per capability and records every call.
///
/// When a capability's queue is empty the fallback response is returned.
pub struct ScriptedToolServer {
    id: String,
    queues: Mutex<HashMap<String, VecDeque<Result<Value, UpstreamFailure>>>>,
    calls: Mutex<Vec<(String, Value)>>,
    fallback: Value,
    available: AtomicBool,
}

impl ScriptedToolServer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            queues: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            fallback: serde_json::json!({ "ok": true }),
            available: AtomicBool::new(true),
        }
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn push(&self, capability: &str, response: Result<Value, UpstreamFailure>) {
        self.queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(capability.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self, capability: &str) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(c, _)| c == capability)
            .count()
    }
}

#[async_trait::async_trait]
impl ToolServer for ScriptedToolServer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, capability: &str, arguments: &Value) -> Result<Value, UpstreamFailure> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((capability.to_string(), arguments.clone()));

        let next = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(capability)
            .and_then(|q| q.pop_front());

        next.unwrap_or_else(|| Ok(self.fallback.clone()))
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureKind;
    use serde_json::json;

    #[tokio::test]
    async fn test_replays_queue_then_fallback() {
        let server = ScriptedToolServer::new("ibkr").with_fallback(json!({"price": 1.0}));
        server.push(
            "get_market_data",
            Err(UpstreamFailure::new(FailureKind::Unavailable, "down")),
        );

        let first = server.invoke("get_market_data", &json!({})).await;
        let second = server.invoke("get_market_data", &json!({})).await;

        assert!(first.is_err());
        assert_eq!(second.unwrap()["price"], 1.0);
        assert_eq!(server.call_count("get_market_data"), 2);
    }
}
