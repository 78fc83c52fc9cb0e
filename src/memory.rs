//! In-process store implementation.
//!
//! `MemoryStore` implements the full [`Store`](crate::store::Store)
//! surface — conditional writes, session binding with TTL expiry and
//! invalidation behaviors, lock-delay windows, and blocking reads —
//! without a server. It backs the crate's test suite and is usable as a
//! single-process stand-in for the real store.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{KvPair, SessionBehavior, SessionEntry};
use crate::store::{KvApi, SessionApi};

/// A registered session and its bookkeeping.
struct MemSession {
    entry: SessionEntry,
    /// Expiry deadline; `None` when the session has no TTL.
    deadline: parking_lot::Mutex<Option<Instant>>,
    /// Keys currently bound to this session.
    keys: parking_lot::Mutex<HashSet<String>>,
}

struct Shared {
    /// Key-value storage.
    store: DashMap<String, KvPair>,
    /// Index at which a key was last deleted, so blocking reads
    /// observe deletions.
    tombstones: DashMap<String, u64>,
    /// Live sessions.
    sessions: DashMap<String, MemSession>,
    /// Keys under a lock-delay window and the instant it ends.
    lock_delays: DashMap<String, Instant>,
    /// Global modification index.
    index: AtomicU64,
    /// Woken on every mutation.
    notify: Notify,
}

impl Shared {
    fn next_index(&self) -> u64 {
        self.index.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn touch(&self) {
        self.notify.notify_waiters();
    }

    /// Current observable index for a single key.
    fn key_index(&self, key: &str) -> u64 {
        if let Some(pair) = self.store.get(key) {
            pair.modify_index
        } else {
            self.tombstones.get(key).map(|t| *t).unwrap_or(0)
        }
    }

    /// Current observable index for a prefix.
    fn prefix_index(&self, prefix: &str) -> u64 {
        let mut idx = 0;
        for entry in self.store.iter() {
            if entry.key().starts_with(prefix) {
                idx = idx.max(entry.modify_index);
            }
        }
        for entry in self.tombstones.iter() {
            if entry.key().starts_with(prefix) {
                idx = idx.max(*entry.value());
            }
        }
        idx
    }

    fn bind_key(&self, session: &str, key: &str) {
        if let Some(s) = self.sessions.get(session) {
            s.keys.lock().insert(key.to_string());
        }
    }

    fn unbind_key(&self, session: &str, key: &str) {
        if let Some(s) = self.sessions.get(session) {
            s.keys.lock().remove(key);
        }
    }

    /// Apply a dead session's invalidation behavior to its bound keys.
    fn invalidate(&self, session: MemSession) {
        let keys: Vec<String> = session.keys.lock().drain().collect();
        let entry = &session.entry;

        for key in keys {
            match entry.behavior {
                SessionBehavior::Release => {
                    if let Some(mut pair) = self.store.get_mut(&key) {
                        if pair.session.as_deref() == Some(entry.id.as_str()) {
                            pair.session = None;
                            pair.modify_index = self.next_index();
                            if !entry.lock_delay.is_zero() {
                                self.lock_delays
                                    .insert(key.clone(), Instant::now() + entry.lock_delay);
                            }
                        }
                    }
                }
                SessionBehavior::Delete => {
                    if let Some((_, pair)) = self.store.remove(&key) {
                        if pair.session.as_deref() == Some(entry.id.as_str()) {
                            self.tombstones.insert(key.clone(), self.next_index());
                            if !entry.lock_delay.is_zero() {
                                self.lock_delays
                                    .insert(key.clone(), Instant::now() + entry.lock_delay);
                            }
                        } else {
                            // Rebound by someone else since bookkeeping; put it back.
                            self.store.insert(key.clone(), pair);
                        }
                    }
                }
            }
        }

        debug!(session = %entry.id, "session invalidated");
        self.touch();
    }

    /// Remove and invalidate a session if it exists. Returns whether it
    /// existed.
    fn remove_session(&self, id: &str) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                self.invalidate(session);
                true
            }
            None => false,
        }
    }

    /// Lazily expire a session whose deadline has passed. Returns
    /// whether the session is alive afterwards.
    fn check_alive(&self, id: &str) -> bool {
        let expired = match self.sessions.get(id) {
            Some(s) => match *s.deadline.lock() {
                Some(deadline) => Instant::now() >= deadline,
                None => false,
            },
            None => return false,
        };
        if expired {
            self.remove_session(id);
            return false;
        }
        true
    }

    fn expired_sessions(&self) -> Vec<String> {
        let now = Instant::now();
        self.sessions
            .iter()
            .filter(|s| matches!(*s.deadline.lock(), Some(d) if now >= d))
            .map(|s| s.key().clone())
            .collect()
    }
}

/// In-memory Consul-compatible store.
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                store: DashMap::new(),
                tombstones: DashMap::new(),
                sessions: DashMap::new(),
                lock_delays: DashMap::new(),
                index: AtomicU64::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Run a background sweeper that expires overdue sessions every
    /// `interval`. Without it, expiry is still applied lazily whenever
    /// a session is used, but blocked readers are only woken by the
    /// sweeper.
    pub fn with_expiry(self, interval: Duration) -> Self {
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                for id in shared.expired_sessions() {
                    debug!(session = %id, "session ttl expired");
                    shared.remove_session(&id);
                }
            }
        });
        self
    }

    /// Wait until the observed index for `state` advances past `since`
    /// or `wait` elapses.
    async fn wait_past<F>(&self, since: u64, wait: Duration, current: F) -> u64
    where
        F: Fn(&Shared) -> u64,
    {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idx = current(&self.shared);
            if idx > since {
                return idx;
            }
            let now = Instant::now();
            if now >= deadline {
                return idx;
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvApi for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        Ok(self.shared.store.get(key).map(|p| p.clone()))
    }

    async fn get_blocking(
        &self,
        key: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Option<KvPair>, u64), StoreError> {
        let idx = self
            .wait_past(since, wait, |shared| shared.key_index(key))
            .await;
        Ok((self.shared.store.get(key).map(|p| p.clone()), idx))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let mut pairs: Vec<KvPair> = self
            .shared
            .store
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.value().clone())
            .collect();
        pairs.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(pairs)
    }

    async fn list_blocking(
        &self,
        prefix: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64), StoreError> {
        let idx = self
            .wait_past(since, wait, |shared| shared.prefix_index(prefix))
            .await;
        Ok((self.list(prefix).await?, idx))
    }

    async fn put(&self, key: &str, value: &[u8], flags: u64) -> Result<bool, StoreError> {
        let shared = &self.shared;
        let index = shared.next_index();
        match shared.store.get_mut(key) {
            Some(mut pair) => {
                pair.set_value(value);
                pair.flags = flags;
                pair.modify_index = index;
            }
            None => {
                let mut pair = KvPair::new(key, value);
                pair.flags = flags;
                pair.create_index = index;
                pair.modify_index = index;
                shared.store.insert(key.to_string(), pair);
            }
        }
        shared.touch();
        Ok(true)
    }

    async fn cas(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        index: u64,
    ) -> Result<bool, StoreError> {
        let shared = &self.shared;
        let ok = match shared.store.get_mut(key) {
            Some(mut pair) => {
                if pair.modify_index != index {
                    false
                } else {
                    pair.set_value(value);
                    pair.flags = flags;
                    pair.modify_index = shared.next_index();
                    true
                }
            }
            None => {
                // index 0 means "create only if absent".
                if index != 0 {
                    false
                } else {
                    let next = shared.next_index();
                    let mut pair = KvPair::new(key, value);
                    pair.flags = flags;
                    pair.create_index = next;
                    pair.modify_index = next;
                    shared.store.insert(key.to_string(), pair);
                    true
                }
            }
        };
        if ok {
            shared.touch();
        }
        Ok(ok)
    }

    async fn acquire(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        session: &str,
    ) -> Result<bool, StoreError> {
        let shared = &self.shared;
        if !shared.check_alive(session) {
            return Err(StoreError::SessionNotFound(session.to_string()));
        }

        // Lock-delay: the key is not acquirable until the window ends.
        if let Some(until) = shared.lock_delays.get(key).map(|e| *e.value()) {
            if Instant::now() < until {
                return Ok(false);
            }
            shared.lock_delays.remove(key);
        }

        let acquired = match shared.store.get_mut(key) {
            Some(mut pair) => match pair.session.as_deref() {
                Some(owner) if owner != session => false,
                Some(_) => true, // already bound to this session
                None => {
                    pair.session = Some(session.to_string());
                    pair.set_value(value);
                    pair.flags = flags;
                    pair.lock_index += 1;
                    pair.modify_index = shared.next_index();
                    true
                }
            },
            None => {
                let index = shared.next_index();
                let mut pair = KvPair::new(key, value);
                pair.flags = flags;
                pair.session = Some(session.to_string());
                pair.lock_index = 1;
                pair.create_index = index;
                pair.modify_index = index;
                shared.store.insert(key.to_string(), pair);
                true
            }
        };

        if acquired {
            shared.bind_key(session, key);
            shared.touch();
        }
        Ok(acquired)
    }

    async fn release(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        session: &str,
    ) -> Result<bool, StoreError> {
        let shared = &self.shared;
        let released = match shared.store.get_mut(key) {
            Some(mut pair) if pair.session.as_deref() == Some(session) => {
                pair.session = None;
                pair.set_value(value);
                pair.flags = flags;
                pair.modify_index = shared.next_index();
                true
            }
            _ => false,
        };
        if released {
            shared.unbind_key(session, key);
            shared.touch();
        }
        Ok(released)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let shared = &self.shared;
        match shared.store.remove(key) {
            Some((_, pair)) => {
                if let Some(session) = &pair.session {
                    shared.unbind_key(session, key);
                }
                shared.tombstones.insert(key.to_string(), shared.next_index());
                shared.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_cas(&self, key: &str, index: u64) -> Result<bool, StoreError> {
        let shared = &self.shared;
        match shared
            .store
            .remove_if(key, |_, pair| pair.modify_index == index)
        {
            Some((_, pair)) => {
                if let Some(session) = &pair.session {
                    shared.unbind_key(session, key);
                }
                shared.tombstones.insert(key.to_string(), shared.next_index());
                shared.touch();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl SessionApi for MemoryStore {
    async fn session_create(&self, entry: &SessionEntry) -> Result<String, StoreError> {
        let shared = &self.shared;
        let id = Uuid::new_v4().to_string();
        let mut entry = entry.clone();
        entry.id = id.clone();

        let deadline = entry.ttl.map(|ttl| Instant::now() + ttl);
        shared.sessions.insert(
            id.clone(),
            MemSession {
                entry,
                deadline: parking_lot::Mutex::new(deadline),
                keys: parking_lot::Mutex::new(HashSet::new()),
            },
        );
        debug!(session = %id, "session created");
        Ok(id)
    }

    async fn session_destroy(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.shared.remove_session(id))
    }

    async fn session_renew(&self, id: &str) -> Result<Option<SessionEntry>, StoreError> {
        let shared = &self.shared;
        if !shared.check_alive(id) {
            return Ok(None);
        }
        match shared.sessions.get(id) {
            Some(session) => {
                if let Some(ttl) = session.entry.ttl {
                    *session.deadline.lock() = Some(Instant::now() + ttl);
                }
                Ok(Some(session.entry.clone()))
            }
            None => Ok(None),
        }
    }

    async fn session_info(&self, id: &str) -> Result<Option<SessionEntry>, StoreError> {
        let shared = &self.shared;
        if !shared.check_alive(id) {
            return Ok(None);
        }
        Ok(shared.sessions.get(id).map(|s| s.entry.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LOCK_FLAG;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStore::new();

        assert!(store.put("config/db", b"mysql://localhost", 0).await.unwrap());
        let pair = store.get("config/db").await.unwrap().unwrap();
        assert_eq!(pair.decoded_value(), Some("mysql://localhost".to_string()));

        assert!(store.delete("config/db").await.unwrap());
        assert!(store.get("config/db").await.unwrap().is_none());
        assert!(!store.delete("config/db").await.unwrap());
    }

    #[tokio::test]
    async fn test_cas_semantics() {
        let store = MemoryStore::new();

        // cas=0 creates only if absent.
        assert!(store.cas("key1", b"v1", 0, 0).await.unwrap());
        assert!(!store.cas("key1", b"v2", 0, 0).await.unwrap());

        let index = store.get("key1").await.unwrap().unwrap().modify_index;
        assert!(store.cas("key1", b"v2", 0, index).await.unwrap());
        assert!(!store.cas("key1", b"v3", 0, index).await.unwrap());
        assert_eq!(
            store.get("key1").await.unwrap().unwrap().decoded_value(),
            Some("v2".to_string())
        );
    }

    #[tokio::test]
    async fn test_acquire_release_binding() {
        let store = MemoryStore::new();
        let s1 = store
            .session_create(&SessionEntry::named("a"))
            .await
            .unwrap();
        let s2 = store
            .session_create(&SessionEntry::named("b"))
            .await
            .unwrap();

        assert!(store.acquire("svc/lock", b"", LOCK_FLAG, &s1).await.unwrap());
        // Held by s1; s2 cannot bind.
        assert!(!store.acquire("svc/lock", b"", LOCK_FLAG, &s2).await.unwrap());
        // Re-acquire by the same session is idempotent.
        assert!(store.acquire("svc/lock", b"", LOCK_FLAG, &s1).await.unwrap());

        // Only the owner can release.
        assert!(!store.release("svc/lock", b"", LOCK_FLAG, &s2).await.unwrap());
        assert!(store.release("svc/lock", b"", LOCK_FLAG, &s1).await.unwrap());

        // Value survives the release, ownership does not.
        let pair = store.get("svc/lock").await.unwrap().unwrap();
        assert!(pair.session.is_none());
        assert!(store.acquire("svc/lock", b"", LOCK_FLAG, &s2).await.unwrap());
    }

    #[tokio::test]
    async fn test_acquire_unknown_session() {
        let store = MemoryStore::new();
        let err = store.acquire("k", b"", 0, "missing").await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_release_behavior_keeps_value() {
        let store = MemoryStore::new();
        let sid = store
            .session_create(&SessionEntry::named("a"))
            .await
            .unwrap();
        store.acquire("k", b"payload", LOCK_FLAG, &sid).await.unwrap();

        assert!(store.session_destroy(&sid).await.unwrap());
        assert!(!store.session_destroy(&sid).await.unwrap());

        let pair = store.get("k").await.unwrap().unwrap();
        assert!(pair.session.is_none());
        assert_eq!(pair.decoded_value(), Some("payload".to_string()));
    }

    #[tokio::test]
    async fn test_destroy_delete_behavior_removes_key() {
        let store = MemoryStore::new();
        let sid = store
            .session_create(&SessionEntry::named("a").with_behavior(SessionBehavior::Delete))
            .await
            .unwrap();
        store.acquire("k", b"payload", LOCK_FLAG, &sid).await.unwrap();

        store.session_destroy(&sid).await.unwrap();
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lock_delay_blocks_reacquisition() {
        let store = MemoryStore::new();
        let s1 = store
            .session_create(
                &SessionEntry::named("a").with_lock_delay(Duration::from_millis(80)),
            )
            .await
            .unwrap();
        let s2 = store
            .session_create(&SessionEntry::named("b"))
            .await
            .unwrap();

        store.acquire("k", b"", LOCK_FLAG, &s1).await.unwrap();
        store.session_destroy(&s1).await.unwrap();

        // The vacated key is under a grace period.
        assert!(!store.acquire("k", b"", LOCK_FLAG, &s2).await.unwrap());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.acquire("k", b"", LOCK_FLAG, &s2).await.unwrap());
    }

    #[tokio::test]
    async fn test_session_ttl_expiry() {
        let store = MemoryStore::new().with_expiry(Duration::from_millis(20));
        let sid = store
            .session_create(&SessionEntry::named("a").with_ttl(Duration::from_millis(60)))
            .await
            .unwrap();
        store.acquire("k", b"", LOCK_FLAG, &sid).await.unwrap();

        // Renewal pushes the deadline out.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.session_renew(&sid).await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.session_info(&sid).await.unwrap().is_some());

        // Without renewal the session dies and the key is released.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(store.session_renew(&sid).await.unwrap().is_none());
        assert!(store.get("k").await.unwrap().unwrap().session.is_none());
    }

    #[tokio::test]
    async fn test_blocking_get_wakes_on_change() {
        let store = Arc::new(MemoryStore::new());

        let (pair, idx) = store
            .get_blocking("watched", 0, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(pair.is_none());
        assert_eq!(idx, 0);

        let writer = Arc::clone(&store);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.put("watched", b"v", 0).await.unwrap();
        });

        let started = Instant::now();
        let (pair, idx) = store
            .get_blocking("watched", 0, Duration::from_secs(5))
            .await
            .unwrap();
        handle.await.unwrap();

        assert!(pair.is_some());
        assert!(idx > 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_blocking_get_observes_delete() {
        let store = Arc::new(MemoryStore::new());
        store.put("k", b"v", 0).await.unwrap();
        let since = store.get("k").await.unwrap().unwrap().modify_index;

        let deleter = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            deleter.delete("k").await.unwrap();
        });

        let (pair, idx) = store
            .get_blocking("k", since, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(pair.is_none());
        assert!(idx > since);
    }

    #[tokio::test]
    async fn test_list_blocking_sees_new_contender() {
        let store = Arc::new(MemoryStore::new());
        store.put("sema/.lock", b"{}", 0).await.unwrap();
        let (_, since) = store
            .list_blocking("sema/", 0, Duration::from_millis(10))
            .await
            .unwrap();

        let writer = Arc::clone(&store);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.put("sema/contender", b"", 0).await.unwrap();
        });

        let (pairs, idx) = store
            .list_blocking("sema/", since, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(idx > since);
    }
}
