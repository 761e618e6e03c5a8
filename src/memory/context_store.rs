//! Context Store
//!
//! Owns every live session. Each session sits behind its own async mutex;
//! the executing turn holds that lock for its whole duration, so turns on
//! one session are sequential while different sessions run concurrently.

use crate::memory::store::{Session, Turn};
use crate::models::SessionKey;
use crate::state::SessionPersistence;
use crate::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

pub type SharedSession = Arc<Mutex<Session>>;

pub struct ContextStore {
    sessions: RwLock<HashMap<SessionKey, SharedSession>>,
    persistence: Option<Arc<dyn SessionPersistence>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence: None,
        }
    }

    pub fn with_persistence(persistence: Arc<dyn SessionPersistence>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            persistence: Some(persistence),
        }
    }

    /// Live session for `key`, restored from persistence on first access
    pub async fn session(&self, key: &SessionKey) -> Result<SharedSession> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(key) {
                return Ok(session.clone());
            }
        }

        let restored = match &self.persistence {
            Some(persistence) => persistence.load(key).await?,
            None => None,
        };

        let mut sessions = self.sessions.write().await;
        // Another task may have created it while we were loading
        if let Some(session) = sessions.get(key) {
            return Ok(session.clone());
        }

        let mut session = Session::new();
        if let Some(turns) = restored {
            debug!(session = %key, turns = turns.len(), "Session restored");
            for turn in turns {
                session.restore(turn);
            }
        }

        let shared = Arc::new(Mutex::new(session));
        sessions.insert(key.clone(), shared.clone());
        Ok(shared)
    }

    /// Store the current turns of a session (no-op without persistence)
    pub async fn persist(&self, key: &SessionKey, session: &Session) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            persistence.save(key, &session.to_vec()).await?;
        }
        Ok(())
    }

    /// Whole-session reset. Waits for an executing turn to release the session.
    pub async fn reset(&self, key: &SessionKey) -> Result<()> {
        let existing = {
            let sessions = self.sessions.read().await;
            sessions.get(key).cloned()
        };

        if let Some(session) = existing {
            session.lock().await.clear();
        }

        if let Some(persistence) = &self.persistence {
            persistence.delete(key).await?;
        }

        info!(session = %key, "Session reset");
        Ok(())
    }

    /// Copy of a session's turns, if the session is live
    pub async fn snapshot(&self, key: &SessionKey) -> Option<Vec<Turn>> {
        let session = {
            let sessions = self.sessions.read().await;
            sessions.get(key).cloned()
        }?;
        let locked = session.lock().await;
        Some(locked.to_vec())
    }

    pub async fn keys_for_conversation(&self, conversation: &str) -> Vec<SessionKey> {
        let sessions = self.sessions.read().await;
        let mut keys: Vec<SessionKey> = sessions
            .keys()
            .filter(|k| k.conversation == conversation)
            .cloned()
            .collect();
        keys.sort_by(|a, b| a.agent.cmp(&b.agent));
        keys
    }
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemorySessionPersistence;

    #[tokio::test]
    async fn test_same_key_same_session() {
        let store = ContextStore::new();
        let key = SessionKey::new("conv", "trading_advisor");

        let a = store.session(&key).await.unwrap();
        a.lock().await.append(Turn::user("hello"));
        let b = store.session(&key).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_are_per_agent() {
        let store = ContextStore::new();
        let trading = store.session(&SessionKey::new("conv", "trading_advisor")).await.unwrap();
        let portfolio = store.session(&SessionKey::new("conv", "portfolio_manager")).await.unwrap();

        trading.lock().await.append(Turn::user("buy?"));
        assert!(portfolio.lock().await.is_empty());
        assert_eq!(store.keys_for_conversation("conv").await.len(), 2);
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let persistence = Arc::new(InMemorySessionPersistence::new());
        let key = SessionKey::new("conv", "financial_analyst");

        {
            let store = ContextStore::with_persistence(persistence.clone());
            let session = store.session(&key).await.unwrap();
            let mut locked = session.lock().await;
            locked.append(Turn::user("What is the S&P 500?"));
            locked.append(Turn::agent("An index of 500 large US companies."));
            store.persist(&key, &locked).await.unwrap();
        }

        let store = ContextStore::with_persistence(persistence);
        let session = store.session(&key).await.unwrap();
        let mut locked = session.lock().await;
        assert_eq!(locked.len(), 2);
        assert_eq!(locked.append(Turn::user("and the Nasdaq?")), 3);
    }

    #[tokio::test]
    async fn test_reset_clears_live_and_stored() {
        let persistence = Arc::new(InMemorySessionPersistence::new());
        let store = ContextStore::with_persistence(persistence.clone());
        let key = SessionKey::new("conv", "research_analyst");

        let session = store.session(&key).await.unwrap();
        {
            let mut locked = session.lock().await;
            locked.append(Turn::user("research chips"));
            store.persist(&key, &locked).await.unwrap();
        }

        store.reset(&key).await.unwrap();
        assert_eq!(store.snapshot(&key).await.unwrap().len(), 0);
        assert!(persistence.load(&key).await.unwrap().is_none());
    }
}
