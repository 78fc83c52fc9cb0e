//! Bounded-concurrency coordination over a key prefix.
//!
//! A semaphore with limit N admits at most N concurrent holders. The
//! holder set and the limit live in a shared coordination record at
//! `<prefix>/.lock`; each holder additionally owns a contender key
//! `<prefix>/<session>` bound to its session. Membership changes go
//! through compare-and-swap on the coordination record, so races
//! between contenders are arbitrated entirely by the store, never by
//! client-side counting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{LockError, StoreError};
use crate::model::{
    KvPair, SemaphoreRecord, SessionBehavior, SessionEntry, SEMAPHORE_FLAG, SEMAPHORE_RECORD_KEY,
};
use crate::session::SessionManager;
use crate::store::Store;

/// Default name for sessions created by a semaphore.
pub const DEFAULT_SEMAPHORE_SESSION_NAME: &str = "cerrojo semaphore";

/// Default TTL for sessions created by a semaphore.
pub const DEFAULT_SEMAPHORE_SESSION_TTL: Duration = Duration::from_secs(15);

/// Default per-iteration wait for blocking reads during contention.
pub const DEFAULT_SEMAPHORE_WAIT_TIME: Duration = Duration::from_secs(15);

/// Default sleep between retries after a CAS conflict.
pub const DEFAULT_SEMAPHORE_RETRY_TIME: Duration = Duration::from_millis(500);

/// Transient-error tolerance of the held-permit monitor.
pub const DEFAULT_SEMAPHORE_MONITOR_RETRIES: u32 = 3;

/// Long-poll budget used by the held-permit monitor between checks.
const MONITOR_WAIT: Duration = Duration::from_secs(60);

/// Configuration for a [`Semaphore`].
#[derive(Debug, Clone)]
pub struct SemaphoreOptions {
    /// Key prefix to coordinate under. Must not begin with '/'.
    pub prefix: String,
    /// Permit limit; at most this many concurrent holders.
    pub limit: u32,
    /// Value stored in this holder's contender key.
    pub value: Vec<u8>,
    /// Pre-existing session to bind; `None` creates one per acquire.
    pub session: Option<String>,
    pub session_name: String,
    pub session_ttl: Option<Duration>,
    pub session_behavior: SessionBehavior,
    /// Per-iteration blocking-read budget; with `try_once`, the budget
    /// for the whole acquisition.
    pub semaphore_wait_time: Duration,
    pub semaphore_try_once: bool,
    pub monitor_retries: u32,
    pub monitor_retry_time: Duration,
}

impl SemaphoreOptions {
    pub fn new(prefix: impl Into<String>, limit: u32) -> Self {
        Self {
            prefix: prefix.into(),
            limit,
            value: Vec::new(),
            session: None,
            session_name: DEFAULT_SEMAPHORE_SESSION_NAME.to_string(),
            session_ttl: Some(DEFAULT_SEMAPHORE_SESSION_TTL),
            session_behavior: SessionBehavior::Release,
            semaphore_wait_time: DEFAULT_SEMAPHORE_WAIT_TIME,
            semaphore_try_once: false,
            monitor_retries: DEFAULT_SEMAPHORE_MONITOR_RETRIES,
            monitor_retry_time: DEFAULT_SEMAPHORE_RETRY_TIME,
        }
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = value.into();
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    pub fn with_session_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.session_behavior = behavior;
        self
    }

    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.semaphore_wait_time = wait;
        self
    }

    pub fn try_once(mut self) -> Self {
        self.semaphore_try_once = true;
        self
    }

    fn validate(&self) -> Result<(), LockError> {
        if self.prefix.is_empty() {
            return Err(LockError::InvalidOptions("prefix must not be empty"));
        }
        if self.prefix.starts_with('/') {
            return Err(LockError::InvalidOptions("prefix must not begin with '/'"));
        }
        if self.limit == 0 {
            return Err(LockError::InvalidOptions("limit must be at least 1"));
        }
        Ok(())
    }

    fn record_key(&self) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), SEMAPHORE_RECORD_KEY)
    }

    fn contender_key(&self, session: &str) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), session)
    }

    fn list_prefix(&self) -> String {
        format!("{}/", self.prefix.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unlocked,
    Acquiring,
    Held,
    Destroyed,
}

struct Inner {
    state: State,
    epoch: u64,
    session: Option<String>,
    owns_session: bool,
    renew_stop: Option<mpsc::Sender<()>>,
    monitor_stop: Option<mpsc::Sender<()>>,
}

/// A handle contending for one permit of a distributed semaphore.
pub struct Semaphore {
    store: Arc<dyn Store>,
    sessions: SessionManager,
    opts: SemaphoreOptions,
    inner: Arc<parking_lot::Mutex<Inner>>,
}

impl Semaphore {
    pub fn new(store: Arc<dyn Store>, opts: SemaphoreOptions) -> Self {
        let sessions = SessionManager::new(Arc::clone(&store));
        Self {
            store,
            sessions,
            opts,
            inner: Arc::new(parking_lot::Mutex::new(Inner {
                state: State::Unlocked,
                epoch: 0,
                session: None,
                owns_session: false,
                renew_stop: None,
                monitor_stop: None,
            })),
        }
    }

    /// Whether this instance currently holds a permit.
    pub fn is_held(&self) -> bool {
        self.inner.lock().state == State::Held
    }

    /// The session backing the current (or last) hold, if any.
    pub fn session(&self) -> Option<String> {
        self.inner.lock().session.clone()
    }

    /// Acquire a permit, blocking while the holder set is full.
    ///
    /// Returns a watch receiver that stays `true` while the permit is
    /// held and flips to `false` once it is lost or released.
    pub async fn acquire(
        &self,
        cancel: Option<mpsc::Receiver<()>>,
    ) -> Result<watch::Receiver<bool>, LockError> {
        self.opts.validate()?;
        {
            let mut inner = self.inner.lock();
            match inner.state {
                State::Held | State::Acquiring => return Err(LockError::Held),
                State::Destroyed => return Err(LockError::Destroyed),
                State::Unlocked => inner.state = State::Acquiring,
            }
        }

        match self.acquire_inner(cancel).await {
            Ok(rx) => Ok(rx),
            Err(e) => {
                self.inner.lock().state = State::Unlocked;
                Err(e)
            }
        }
    }

    async fn acquire_inner(
        &self,
        mut cancel: Option<mpsc::Receiver<()>>,
    ) -> Result<watch::Receiver<bool>, LockError> {
        let (session, created, renew_stop) = self.ensure_session().await?;

        match self.acquire_loop(&session, &mut cancel).await {
            Ok(()) => {
                let (held_tx, held_rx) = watch::channel(true);
                let (monitor_tx, monitor_rx) = mpsc::channel(1);
                let epoch = {
                    let mut inner = self.inner.lock();
                    inner.state = State::Held;
                    inner.epoch += 1;
                    inner.session = Some(session.clone());
                    inner.owns_session = created;
                    inner.renew_stop = renew_stop;
                    inner.monitor_stop = Some(monitor_tx);
                    inner.epoch
                };
                debug!(prefix = %self.opts.prefix, session = %session, "permit acquired");
                self.spawn_monitor(session, held_tx, monitor_rx, epoch);
                Ok(held_rx)
            }
            Err(e) => {
                // Best-effort cleanup of the contender key; the session
                // teardown below would reclaim it anyway.
                let _ = self.store.delete(&self.opts.contender_key(&session)).await;
                drop(renew_stop);
                if created {
                    if let Err(err) = self.sessions.destroy(&session).await {
                        warn!(session = %session, error = %err, "failed to clean up session");
                    }
                }
                Err(e)
            }
        }
    }

    async fn ensure_session(
        &self,
    ) -> Result<(String, bool, Option<mpsc::Sender<()>>), LockError> {
        if let Some(session) = &self.opts.session {
            return Ok((session.clone(), false, None));
        }

        let entry = SessionEntry {
            id: String::new(),
            name: self.opts.session_name.clone(),
            ttl: self.opts.session_ttl,
            behavior: self.opts.session_behavior,
            lock_delay: Duration::ZERO,
        };
        let id = self.sessions.create(&entry).await?;

        let renew_stop = match self.opts.session_ttl {
            Some(ttl) => {
                let (stop_tx, stop_rx) = mpsc::channel(1);
                let sessions = self.sessions.clone();
                let session = id.clone();
                tokio::spawn(async move {
                    let _ = sessions.renew_periodic(ttl / 2, session, stop_rx).await;
                });
                Some(stop_tx)
            }
            None => None,
        };

        Ok((id, true, renew_stop))
    }

    /// Contend for a slot in the holder set until admitted, out of
    /// budget, or cancelled.
    async fn acquire_loop(
        &self,
        session: &str,
        cancel: &mut Option<mpsc::Receiver<()>>,
    ) -> Result<(), LockError> {
        let opts = &self.opts;
        let start = Instant::now();

        // Announce ourselves with a session-bound contender key.
        match self
            .store
            .acquire(&opts.contender_key(session), &opts.value, 0, session)
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(LockError::SessionExpired),
            Err(StoreError::SessionNotFound(_)) => return Err(LockError::SessionExpired),
            Err(e) => return Err(e.into()),
        }

        let record_key = opts.record_key();
        let list_prefix = opts.list_prefix();
        let mut wait_index: u64 = 0;

        loop {
            let pairs = if wait_index == 0 {
                match self.store.list(&list_prefix).await {
                    Ok(pairs) => pairs,
                    Err(e) => {
                        self.retry_pause(start, cancel, &e).await?;
                        continue;
                    }
                }
            } else {
                let budget = self.wait_budget(start)?;
                let read = self.store.list_blocking(&list_prefix, wait_index, budget);
                let result = match cancel {
                    Some(rx) => tokio::select! {
                        r = read => r,
                        _ = rx.recv() => return Err(LockError::Cancelled),
                    },
                    None => read.await,
                };
                match result {
                    Ok((pairs, idx)) => {
                        wait_index = wait_index.max(idx);
                        pairs
                    }
                    Err(e) => {
                        self.retry_pause(start, cancel, &e).await?;
                        continue;
                    }
                }
            };

            let record_pair = pairs.iter().find(|p| p.key == record_key);
            if let Some(pair) = record_pair {
                if pair.flags != SEMAPHORE_FLAG {
                    return Err(LockError::Conflict);
                }
            }

            let mut record = match record_pair {
                Some(pair) => SemaphoreRecord::from_pair(pair).map_err(StoreError::from)?,
                None => SemaphoreRecord::new(opts.limit),
            };
            let record_index = record_pair.map(|p| p.modify_index).unwrap_or(0);

            prune_dead_holders(&mut record, &pairs, &record_key);

            if record.holders.contains(session) {
                // Already admitted (another instance on our session).
                return Ok(());
            }

            if record.holders.len() as u32 >= record.limit {
                // Full; wait for the holder set to change.
                wait_index = wait_index.max(max_index(&pairs));
                self.check_budget(start)?;
                continue;
            }

            record.holders.insert(session.to_string());
            let encoded = record.to_json().map_err(StoreError::from)?;
            match self
                .store
                .cas(&record_key, &encoded, SEMAPHORE_FLAG, record_index)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // Concurrent modification; re-read and retry.
                    self.check_budget(start)?;
                    self.sleep_retry(cancel).await?;
                    wait_index = 0;
                }
                Err(e) => self.retry_pause(start, cancel, &e).await?,
            }
        }
    }

    fn wait_budget(&self, start: Instant) -> Result<Duration, LockError> {
        if self.opts.semaphore_try_once {
            self.opts
                .semaphore_wait_time
                .checked_sub(start.elapsed())
                .ok_or(LockError::Timeout)
        } else {
            Ok(self.opts.semaphore_wait_time)
        }
    }

    fn check_budget(&self, start: Instant) -> Result<(), LockError> {
        if self.opts.semaphore_try_once && start.elapsed() >= self.opts.semaphore_wait_time {
            return Err(LockError::Timeout);
        }
        Ok(())
    }

    async fn sleep_retry(&self, cancel: &mut Option<mpsc::Receiver<()>>) -> Result<(), LockError> {
        let base = self.opts.monitor_retry_time;
        let jitter = if base.is_zero() {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random_range(0..=base.as_millis().max(1) as u64 / 2))
        };
        let dur = base + jitter;
        match cancel {
            Some(rx) => tokio::select! {
                _ = tokio::time::sleep(dur) => Ok(()),
                _ = rx.recv() => Err(LockError::Cancelled),
            },
            None => {
                tokio::time::sleep(dur).await;
                Ok(())
            }
        }
    }

    async fn retry_pause(
        &self,
        start: Instant,
        cancel: &mut Option<mpsc::Receiver<()>>,
        err: &StoreError,
    ) -> Result<(), LockError> {
        warn!(prefix = %self.opts.prefix, error = %err, "store error during acquisition, retrying");
        self.check_budget(start)?;
        self.sleep_retry(cancel).await
    }

    /// Watch the prefix and flip the watch channel once this session is
    /// no longer in the (pruned) holder set.
    fn spawn_monitor(
        &self,
        session: String,
        held_tx: watch::Sender<bool>,
        mut stop_rx: mpsc::Receiver<()>,
        epoch: u64,
    ) {
        let store = Arc::clone(&self.store);
        let inner = Arc::clone(&self.inner);
        let record_key = self.opts.record_key();
        let list_prefix = self.opts.list_prefix();
        let retries = self.opts.monitor_retries;
        let retry_time = self.opts.monitor_retry_time;

        tokio::spawn(async move {
            let mut wait_index: u64 = 0;
            let mut failures: u32 = 0;
            loop {
                let read = store.list_blocking(&list_prefix, wait_index, MONITOR_WAIT);
                let result = tokio::select! {
                    r = read => r,
                    _ = stop_rx.recv() => break,
                };
                let lost = match result {
                    Ok((pairs, idx)) => {
                        failures = 0;
                        wait_index = wait_index.max(idx);
                        let holding = pairs
                            .iter()
                            .find(|p| p.key == record_key)
                            .and_then(|p| SemaphoreRecord::from_pair(p).ok())
                            .map(|mut record| {
                                prune_dead_holders(&mut record, &pairs, &record_key);
                                record.holders.contains(&session)
                            })
                            .unwrap_or(false);
                        !holding
                    }
                    Err(e) => {
                        failures += 1;
                        if failures <= retries {
                            tokio::time::sleep(retry_time).await;
                            continue;
                        }
                        warn!(error = %e, "monitor giving up, treating permit as lost");
                        true
                    }
                };
                if lost {
                    let mut inner = inner.lock();
                    if inner.epoch == epoch && inner.state == State::Held {
                        inner.state = State::Unlocked;
                        inner.monitor_stop = None;
                    }
                    drop(inner);
                    warn!(session = %session, "semaphore permit lost");
                    break;
                }
            }
            let _ = held_tx.send(false);
        });
    }

    /// Give the permit back: remove this session from the holder set
    /// and delete the contender key.
    pub async fn release(&self) -> Result<(), LockError> {
        let (session, owns, renew_stop, monitor_stop) = {
            let mut inner = self.inner.lock();
            if inner.state != State::Held {
                return Err(LockError::NotHeld);
            }
            inner.state = State::Unlocked;
            inner.epoch += 1;
            let session = inner.session.clone().unwrap_or_default();
            (
                session,
                inner.owns_session,
                inner.renew_stop.take(),
                inner.monitor_stop.take(),
            )
        };

        drop(monitor_stop);

        // CAS-remove ourselves from the holder set, retrying against
        // concurrent membership changes.
        let record_key = self.opts.record_key();
        loop {
            let pair = self.store.get(&record_key).await?;
            let Some(pair) = pair else { break };

            let mut record = SemaphoreRecord::from_pair(&pair).map_err(StoreError::from)?;
            if !record.holders.remove(&session) {
                break;
            }
            let encoded = record.to_json().map_err(StoreError::from)?;
            if self
                .store
                .cas(&record_key, &encoded, SEMAPHORE_FLAG, pair.modify_index)
                .await?
            {
                break;
            }
            debug!(prefix = %self.opts.prefix, "holder set changed during release, retrying");
        }

        let _ = self
            .store
            .delete(&self.opts.contender_key(&session))
            .await?;

        drop(renew_stop);
        if owns {
            if let Err(e) = self.sessions.destroy(&session).await {
                warn!(session = %session, error = %e, "failed to destroy session on release");
            }
        }
        debug!(prefix = %self.opts.prefix, "permit released");
        Ok(())
    }

    /// Delete the coordination record and any residual contender keys.
    /// Fails while any live holder remains.
    pub async fn destroy(&self) -> Result<(), LockError> {
        {
            let inner = self.inner.lock();
            match inner.state {
                State::Held | State::Acquiring => return Err(LockError::Held),
                State::Destroyed => return Ok(()),
                State::Unlocked => {}
            }
        }

        let list_prefix = self.opts.list_prefix();
        let record_key = self.opts.record_key();
        let pairs = self.store.list(&list_prefix).await?;

        let Some(record_pair) = pairs.iter().find(|p| p.key == record_key) else {
            self.mark_destroyed();
            return Ok(());
        };
        if record_pair.flags != SEMAPHORE_FLAG {
            return Err(LockError::Conflict);
        }

        let mut record = SemaphoreRecord::from_pair(record_pair).map_err(StoreError::from)?;
        prune_dead_holders(&mut record, &pairs, &record_key);
        if !record.holders.is_empty() {
            return Err(LockError::InUse);
        }

        if !self
            .store
            .delete_cas(&record_key, record_pair.modify_index)
            .await?
        {
            // Someone got admitted between the read and the delete.
            return Err(LockError::InUse);
        }

        // Residual contender keys belong to dead sessions; clean them up.
        for pair in pairs.iter().filter(|p| p.key != record_key) {
            if pair.session.is_none() {
                let _ = self.store.delete(&pair.key).await?;
            }
        }

        self.mark_destroyed();
        debug!(prefix = %self.opts.prefix, "semaphore destroyed");
        Ok(())
    }

    fn mark_destroyed(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Unlocked {
            inner.state = State::Destroyed;
        }
    }
}

/// Drop holders whose contender key is gone: their session died and
/// the invalidation behavior already removed or unbound the key.
fn prune_dead_holders(record: &mut SemaphoreRecord, pairs: &[KvPair], record_key: &str) {
    record.holders.retain(|holder| {
        pairs.iter().any(|p| {
            p.key != record_key && p.session.as_deref() == Some(holder.as_str())
        })
    });
}

fn max_index(pairs: &[KvPair]) -> u64 {
    pairs.iter().map(|p| p.modify_index).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{Lock, LockOptions};
    use crate::memory::MemoryStore;
    use crate::store::KvApi;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_acquire_release_cycle() {
        let store = store();
        let sema = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 2));

        let held = sema.acquire(None).await.unwrap();
        assert!(sema.is_held());
        assert!(*held.borrow());

        sema.release().await.unwrap();
        assert!(!sema.is_held());
        assert!(matches!(sema.release().await, Err(LockError::NotHeld)));
    }

    #[tokio::test]
    async fn test_limit_admits_at_most_k() {
        let store = store();
        let a = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 2));
        let b = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 2));
        let c = Semaphore::new(
            Arc::clone(&store),
            SemaphoreOptions::new("svc/sema", 2)
                .with_wait_time(Duration::from_millis(100))
                .try_once(),
        );

        let _ha = a.acquire(None).await.unwrap();
        let _hb = b.acquire(None).await.unwrap();
        assert!(a.is_held() && b.is_held());

        let err = c.acquire(None).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout));
        assert!(!c.is_held());
    }

    #[tokio::test]
    async fn test_blocked_contender_admitted_after_release() {
        let store = store();
        let a = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 1));
        let _ha = a.acquire(None).await.unwrap();

        let b = Arc::new(Semaphore::new(
            Arc::clone(&store),
            SemaphoreOptions::new("svc/sema", 1),
        ));
        let task = {
            let b = Arc::clone(&b);
            tokio::spawn(async move { b.acquire(None).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!b.is_held());
        a.release().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert!(b.is_held());
    }

    #[tokio::test]
    async fn test_conflict_with_lock_key() {
        let store = store();
        // A Lock already owns the coordination record's key.
        let lock = Lock::new(Arc::clone(&store), LockOptions::new("svc/sema/.lock"));
        let _held = lock.acquire(None).await.unwrap();

        let sema = Semaphore::new(
            Arc::clone(&store),
            SemaphoreOptions::new("svc/sema", 1).try_once(),
        );
        let err = sema.acquire(None).await.unwrap_err();
        assert!(matches!(err, LockError::Conflict));
    }

    #[tokio::test]
    async fn test_session_destroy_evicts_holder() {
        let store = store();
        let sema = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 1));
        let mut held = sema.acquire(None).await.unwrap();
        let sid = sema.session().unwrap();

        let sessions = SessionManager::new(Arc::clone(&store));
        sessions.destroy(&sid).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), held.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(!*held.borrow());
        assert!(!sema.is_held());

        // The freed permit is acquirable by another contender.
        let other = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 1));
        let _h = other.acquire(None).await.unwrap();
        assert!(other.is_held());
    }

    #[tokio::test]
    async fn test_destroy_lifecycle() {
        let store = store();
        let sema = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 1));

        let _held = sema.acquire(None).await.unwrap();
        assert!(matches!(sema.destroy().await, Err(LockError::Held)));

        // A second holder still in the set blocks destruction.
        sema.release().await.unwrap();
        let other = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 1));
        let _h = other.acquire(None).await.unwrap();
        assert!(matches!(sema.destroy().await, Err(LockError::InUse)));

        other.release().await.unwrap();
        sema.destroy().await.unwrap();
        assert!(store.list("svc/sema/").await.unwrap().is_empty());
        assert!(matches!(sema.acquire(None).await, Err(LockError::Destroyed)));
    }

    #[tokio::test]
    async fn test_zero_limit_rejected() {
        let store = store();
        let sema = Semaphore::new(Arc::clone(&store), SemaphoreOptions::new("svc/sema", 0));
        assert!(matches!(
            sema.acquire(None).await,
            Err(LockError::InvalidOptions(_))
        ));
    }
}
