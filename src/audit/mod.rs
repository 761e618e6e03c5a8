//! Audit logging
//!
//! One record per submitted turn: which agent ran it, how it ended, how
//! many model calls, tool invocations and retry attempts it cost, and a
//! SHA-256 hash of the session afterwards.

use crate::memory::Turn;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub record_id: Uuid,
    pub conversation: String,
    pub agent: String,
    pub route_reason: Option<String>,
    pub input: String,
    /// `final_answer`, `elicitation`, or the error kind
    pub outcome: String,
    pub error: Option<String>,
    pub model_calls: u32,
    pub tool_invocations: u32,
    pub retry_attempts: u32,
    pub compactions: u32,
    pub context_hash: String,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Audit trail storage
pub struct AuditLog {
    records: Arc<RwLock<Vec<TurnRecord>>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn record(&self, record: TurnRecord) -> Uuid {
        let id = record.record_id;
        let mut records = self.records.write().await;
        records.push(record);
        id
    }

    pub async fn get(&self, record_id: Uuid) -> Option<TurnRecord> {
        let records = self.records.read().await;
        records.iter().find(|r| r.record_id == record_id).cloned()
    }

    /// Records of a conversation, oldest first
    pub async fn for_conversation(&self, conversation: &str) -> Vec<TurnRecord> {
        let records = self.records.read().await;
        records
            .iter()
            .filter(|r| r.conversation == conversation)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-256 over the JSON form of a turn sequence.
/// Streams JSON straight into the hasher, no intermediate String.
pub fn compute_context_hash<'a>(turns: impl Iterator<Item = &'a Turn>) -> String {
    let mut hasher = Sha256::new();

    for turn in turns {
        if serde_json::to_writer(&mut HashWriter(&mut hasher), turn).is_err() {
            return String::new();
        }
    }

    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
