//! # Session Registry
//!
//! Tracks every live session by id and enforces the concurrent session limit.
//!
//! ## Thread Safety:
//! A `std::sync::RwLock` guards the map. It is only held for map operations, never across an
//! `.await`, so the blocking lock is fine inside async handlers. A poisoned lock is recovered
//! with `PoisonError::into_inner`: the map itself cannot be left half-updated.

use crate::adapters::Providers;
use crate::error::{AppError, AppResult};
use crate::pipeline::{spawn_pipeline, OutboundReceiver, PipelineSettings};
use crate::session::{SessionHandle, SessionInfo};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionHandle>>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Start a pipeline for a new session.
    ///
    /// ## Returns:
    /// - **Ok**: The session handle and the receiver for its outbound traffic
    /// - **Err(ServiceUnavailable)**: The session limit is reached
    pub fn create(
        &self,
        settings: PipelineSettings,
        providers: Providers,
    ) -> AppResult<(Arc<SessionHandle>, OutboundReceiver)> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_sessions {
            return Err(AppError::ServiceUnavailable(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_sessions
            )));
        }

        let id = Uuid::new_v4().to_string();
        let description = providers.describe();
        let (pipeline, outbound) = spawn_pipeline(id.clone(), settings, providers);
        let handle = Arc::new(SessionHandle::new(id.clone(), description, pipeline));
        sessions.insert(id.clone(), handle.clone());

        info!(session_id = %id, active = sessions.len(), "Session created");
        Ok((handle, outbound))
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(id).cloned()
    }

    /// Remove a session and shut its pipeline down. Returns `false` if it was already gone.
    pub fn remove(&self, id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            sessions.remove(id)
        };

        match removed {
            Some(handle) => {
                handle.shutdown();
                info!(session_id = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut infos: Vec<SessionInfo> = sessions.values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Remove sessions with no inbound traffic for longer than `max_idle`.
    pub fn remove_idle(&self, max_idle: Duration) -> Vec<String> {
        let expired: Vec<String> = {
            let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            sessions
                .values()
                .filter(|s| s.idle_for() > max_idle)
                .map(|s| s.id.clone())
                .collect()
        };

        expired.into_iter().filter(|id| self.remove(id)).collect()
    }

    /// Shut every session down (server exit).
    pub fn shutdown_all(&self) {
        let drained: Vec<Arc<SessionHandle>> = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{ScriptedLlm, ScriptedStt, ScriptedTts};
    use crate::config::AppConfig;
    use crate::session::TurnState;

    fn providers() -> Providers {
        Providers {
            stt: Arc::new(ScriptedStt::new("hi", 0)),
            llm: Arc::new(ScriptedLlm::new(None)),
            tts: Arc::new(ScriptedTts::new()),
        }
    }

    fn settings() -> PipelineSettings {
        AppConfig::default().pipeline.to_pipeline_settings()
    }

    #[tokio::test]
    async fn test_create_get_remove() {
        let registry = SessionRegistry::new(4);
        let (handle, _rx) = registry.create(settings(), providers()).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.get(&handle.id).is_some());
        assert_eq!(registry.list()[0].snapshot.state, TurnState::Idle);

        assert!(registry.remove(&handle.id));
        assert!(!registry.remove(&handle.id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_session_limit() {
        let registry = SessionRegistry::new(2);
        let _a = registry.create(settings(), providers()).unwrap();
        let _b = registry.create(settings(), providers()).unwrap();

        assert!(matches!(
            registry.create(settings(), providers()),
            Err(AppError::ServiceUnavailable(_))
        ));

        let (a, _) = _a;
        registry.remove(&a.id);
        assert!(registry.create(settings(), providers()).is_ok());
    }

    #[tokio::test]
    async fn test_remove_idle() {
        let registry = SessionRegistry::new(4);
        let (handle, _rx) = registry.create(settings(), providers()).unwrap();

        assert!(registry.remove_idle(Duration::from_secs(60)).is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let removed = registry.remove_idle(Duration::from_millis(1));
        assert_eq!(removed, vec![handle.id.clone()]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_removed_session_pipeline_stops() {
        let registry = SessionRegistry::new(4);
        let (handle, mut rx) = registry.create(settings(), providers()).unwrap();
        registry.remove(&handle.id);

        // The pipeline exits and drops its sink, closing the receiver
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(closed, Ok(None)));
    }
}
