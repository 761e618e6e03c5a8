//! Session persistence layer
//!
//! The context store keeps live sessions in memory; a persistence backend
//! restores them on first access and stores them after every turn.
//! In-memory by default, Postgres when `POSTGRES_URL`/`DATABASE_URL` is set.

use crate::memory::Turn;
use crate::models::SessionKey;
use crate::Result;
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod postgres;
pub use postgres::PostgresSessionPersistence;

/// Trait for session persistence
#[async_trait::async_trait]
pub trait SessionPersistence: Send + Sync {
    async fn load(&self, key: &SessionKey) -> Result<Option<Vec<Turn>>>;
    /// Replace the stored turns of a session
    async fn save(&self, key: &SessionKey, turns: &[Turn]) -> Result<()>;
    async fn delete(&self, key: &SessionKey) -> Result<()>;
}

/// In-memory persistence for development and tests
pub struct InMemorySessionPersistence {
    sessions: Arc<RwLock<HashMap<SessionKey, Vec<Turn>>>>,
}

impl InMemorySessionPersistence {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemorySessionPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SessionPersistence for InMemorySessionPersistence {
    async fn load(&self, key: &SessionKey) -> Result<Option<Vec<Turn>>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(key).cloned())
    }

    async fn save(&self, key: &SessionKey, turns: &[Turn]) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(key.clone(), turns.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &SessionKey) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(key);
        Ok(())
    }
}

/// Postgres when a database URL is configured, in-memory otherwise
pub fn create_persistence() -> Arc<dyn SessionPersistence> {
    let database_url = env::var("POSTGRES_URL")
        .or_else(|_| env::var("DATABASE_URL"))
        .ok();

    if let Some(url) = database_url {
        match PostgresSessionPersistence::connect_lazy(&url) {
            Ok(backend) => {
                info!("Session persistence backend: postgres");
                return Arc::new(backend);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres session backend, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Session persistence backend: in-memory");
    Arc::new(InMemorySessionPersistence::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_round_trip_and_delete() {
        let store = InMemorySessionPersistence::new();
        let key = SessionKey::new("conv-1", "trading_advisor");

        assert!(store.load(&key).await.unwrap().is_none());

        let mut first = Turn::user("Should I buy Tesla stock right now?");
        first.seq = 1;
        store.save(&key, &[first.clone()]).await.unwrap();

        let loaded = store.load(&key).await.unwrap().unwrap();
        assert_eq!(loaded, vec![first]);

        store.delete(&key).await.unwrap();
        assert!(store.load(&key).await.unwrap().is_none());
    }
}
