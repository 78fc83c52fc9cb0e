//! Session lifecycle management.
//!
//! A session is the unit of liveness the store uses to arbitrate
//! ownership: keys are bound to sessions, and a session that stops
//! renewing within its TTL is invalidated server-side. One session may
//! back several coordination objects, so the periodic renewal task is
//! bound to the session, not to any lock or semaphore instance.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::model::SessionEntry;
use crate::store::Store;

/// Client for the store's session endpoints plus the background
/// renewal loop.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn Store>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create a session from `entry`; returns the new session id.
    pub async fn create(&self, entry: &SessionEntry) -> Result<String, SessionError> {
        let id = self
            .store
            .session_create(entry)
            .await
            .map_err(SessionError::Create)?;
        debug!(session = %id, name = %entry.name, "created session");
        Ok(id)
    }

    /// Destroy a session. Idempotent; returns whether it existed.
    ///
    /// Destroying a session that backs held locks or semaphore permits
    /// immediately applies its invalidation behavior to the bound keys.
    pub async fn destroy(&self, id: &str) -> Result<bool, SessionError> {
        let existed = self.store.session_destroy(id).await?;
        debug!(session = %id, existed, "destroyed session");
        Ok(existed)
    }

    /// Renew a session's TTL once.
    pub async fn renew(&self, id: &str) -> Result<SessionEntry, SessionError> {
        match self.store.session_renew(id).await? {
            Some(entry) => Ok(entry),
            None => Err(SessionError::NotFound(id.to_string())),
        }
    }

    /// Look up a session.
    pub async fn info(&self, id: &str) -> Result<Option<SessionEntry>, SessionError> {
        Ok(self.store.session_info(id).await?)
    }

    /// Renew `id` every `interval` until `stop_rx` fires (or its sender
    /// is dropped) or the server reports the session gone.
    ///
    /// `interval` must be strictly less than the session TTL. Transient
    /// store errors are logged and retried on the next tick; a
    /// definitive not-found stops the loop and is returned so
    /// dependents can treat it as loss of ownership.
    pub async fn renew_periodic(
        &self,
        interval: Duration,
        id: String,
        mut stop_rx: mpsc::Receiver<()>,
    ) -> Result<(), SessionError> {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; the session was just created.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.store.session_renew(&id).await {
                        Ok(Some(_)) => {}
                        Ok(None) => {
                            warn!(session = %id, "session no longer exists, stopping renewal");
                            return Err(SessionError::NotFound(id));
                        }
                        Err(e) => {
                            warn!(session = %id, error = %e, "session renewal failed, will retry");
                        }
                    }
                }
                _ = stop_rx.recv() => {
                    debug!(session = %id, "renewal stopped");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::model::SessionBehavior;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_create_info_destroy() {
        let sessions = manager();

        let entry = SessionEntry::named("worker")
            .with_ttl(Duration::from_secs(15))
            .with_behavior(SessionBehavior::Delete);
        let id = sessions.create(&entry).await.unwrap();
        assert!(!id.is_empty());

        let info = sessions.info(&id).await.unwrap().unwrap();
        assert_eq!(info.name, "worker");
        assert_eq!(info.behavior, SessionBehavior::Delete);

        assert!(sessions.destroy(&id).await.unwrap());
        assert!(!sessions.destroy(&id).await.unwrap());
        assert!(sessions.info(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_renew_missing_session_is_not_found() {
        let sessions = manager();
        let err = sessions.renew("no-such-session").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_renew_periodic_stops_on_signal() {
        let sessions = manager();
        let id = sessions
            .create(&SessionEntry::named("w").with_ttl(Duration::from_secs(10)))
            .await
            .unwrap();

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn({
            let sessions = sessions.clone();
            let id = id.clone();
            async move {
                sessions
                    .renew_periodic(Duration::from_millis(10), id, stop_rx)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(()).await.unwrap();
        assert!(task.await.unwrap().is_ok());

        // Renewal stopping does not destroy the session.
        assert!(sessions.info(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_renew_periodic_terminates_on_session_loss() {
        let sessions = manager();
        let id = sessions
            .create(&SessionEntry::named("w").with_ttl(Duration::from_secs(10)))
            .await
            .unwrap();

        let (_stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn({
            let sessions = sessions.clone();
            let id = id.clone();
            async move {
                sessions
                    .renew_periodic(Duration::from_millis(10), id, stop_rx)
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        sessions.destroy(&id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SessionError::NotFound(_))));
    }
}
