//! Single-owner distributed mutual exclusion over one key.
//!
//! A lock is a session-bound KV entry: whichever session is bound to
//! the key owns the lock. The store's atomic acquire/release writes are
//! the sole source of truth; the local state machine only mirrors what
//! this instance last observed.
//!
//! Ownership is tracked by session, not by instance. Two `Lock`
//! instances configured with the same session id never contend with
//! each other (reclaim), while instances on different sessions are
//! arbitrated entirely by the store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::{LockError, StoreError};
use crate::model::{SessionBehavior, SessionEntry, LOCK_FLAG};
use crate::session::SessionManager;
use crate::store::Store;

/// Default name for sessions created by a lock.
pub const DEFAULT_LOCK_SESSION_NAME: &str = "cerrojo lock";

/// Default TTL for sessions created by a lock.
pub const DEFAULT_LOCK_SESSION_TTL: Duration = Duration::from_secs(15);

/// Default per-iteration wait for blocking reads during contention.
pub const DEFAULT_LOCK_WAIT_TIME: Duration = Duration::from_secs(15);

/// Default sleep between retries after a failed acquire write
/// (lock-delay or write race).
pub const DEFAULT_LOCK_RETRY_TIME: Duration = Duration::from_secs(5);

/// Default number of transient store errors the held-lock monitor
/// tolerates before declaring the lock lost.
pub const DEFAULT_MONITOR_RETRIES: u32 = 3;

/// Long-poll budget used by the held-lock monitor between checks.
const MONITOR_WAIT: Duration = Duration::from_secs(60);

/// Configuration for a [`Lock`].
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Key to coordinate on. Must not begin with '/'.
    pub key: String,
    /// Value stored in the lock record.
    pub value: Vec<u8>,
    /// Pre-existing session to bind; `None` creates one per acquire.
    pub session: Option<String>,
    /// Name for self-created sessions.
    pub session_name: String,
    /// TTL for self-created sessions; `None` means no expiry.
    pub session_ttl: Option<Duration>,
    /// Invalidation behavior for self-created sessions.
    pub session_behavior: SessionBehavior,
    /// Per-iteration blocking-read budget; with `lock_try_once`, the
    /// budget for the whole acquisition.
    pub lock_wait_time: Duration,
    /// Bound the whole acquisition by `lock_wait_time` instead of
    /// retrying indefinitely.
    pub lock_try_once: bool,
    /// Transient-error tolerance of the held-lock monitor.
    pub monitor_retries: u32,
    /// Sleep between acquire retries and monitor error retries.
    pub monitor_retry_time: Duration,
}

impl LockOptions {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: Vec::new(),
            session: None,
            session_name: DEFAULT_LOCK_SESSION_NAME.to_string(),
            session_ttl: Some(DEFAULT_LOCK_SESSION_TTL),
            session_behavior: SessionBehavior::Release,
            lock_wait_time: DEFAULT_LOCK_WAIT_TIME,
            lock_try_once: false,
            monitor_retries: DEFAULT_MONITOR_RETRIES,
            monitor_retry_time: DEFAULT_LOCK_RETRY_TIME,
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

    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = name.into();
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
        self.lock_wait_time = wait;
        self
    }

    pub fn try_once(mut self) -> Self {
        self.lock_try_once = true;
        self
    }

    pub fn with_retry_time(mut self, retry: Duration) -> Self {
        self.monitor_retry_time = retry;
        self
    }

    fn validate(&self) -> Result<(), LockError> {
        if self.key.is_empty() {
            return Err(LockError::InvalidOptions("key must not be empty"));
        }
        if self.key.starts_with('/') {
            return Err(LockError::InvalidOptions("key must not begin with '/'"));
        }
        Ok(())
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
    /// Bumped on every transition out of `Held` so a stale monitor
    /// cannot clobber a newer acquisition.
    epoch: u64,
    session: Option<String>,
    owns_session: bool,
    renew_stop: Option<mpsc::Sender<()>>,
    monitor_stop: Option<mpsc::Sender<()>>,
}

/// A distributed lock over a single key.
///
/// One instance owns at most one outstanding acquisition attempt.
/// `is_held` is safe to read concurrently with `acquire`/`release`
/// running on another task.
pub struct Lock {
    store: Arc<dyn Store>,
    sessions: SessionManager,
    opts: LockOptions,
    inner: Arc<parking_lot::Mutex<Inner>>,
}

impl Lock {
    pub fn new(store: Arc<dyn Store>, opts: LockOptions) -> Self {
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

    /// Whether this instance currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner.lock().state == State::Held
    }

    /// The session backing the current (or last) hold, if any.
    pub fn session(&self) -> Option<String> {
        self.inner.lock().session.clone()
    }

    /// Acquire the lock, blocking on contention.
    ///
    /// Returns a watch receiver that stays `true` while the lock is
    /// held and flips to `false` once it is lost or released. `cancel`
    /// aborts the attempt at any suspension point; sending on it or
    /// dropping its sender both count as cancellation.
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
                debug!(key = %self.opts.key, session = %session, "lock acquired");
                self.spawn_monitor(session, held_tx, monitor_rx, epoch);
                Ok(held_rx)
            }
            Err(e) => {
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

    /// Create a session if none was configured. Returns the session
    /// id, whether this instance created it, and the stop handle of
    /// the renewal task (if one was spawned).
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

    /// Contend for the key until bound, out of budget, or cancelled.
    async fn acquire_loop(
        &self,
        session: &str,
        cancel: &mut Option<mpsc::Receiver<()>>,
    ) -> Result<(), LockError> {
        let opts = &self.opts;
        let start = Instant::now();
        let mut wait_index: u64 = 0;

        loop {
            // Read the current lock record, long-polling once contended.
            let pair = if wait_index == 0 {
                match self.store.get(&opts.key).await {
                    Ok(pair) => pair,
                    Err(e) => {
                        self.retry_pause(start, cancel, &e).await?;
                        continue;
                    }
                }
            } else {
                let budget = self.wait_budget(start)?;
                let read = self.store.get_blocking(&opts.key, wait_index, budget);
                let result = match cancel {
                    Some(rx) => tokio::select! {
                        r = read => r,
                        _ = rx.recv() => return Err(LockError::Cancelled),
                    },
                    None => read.await,
                };
                match result {
                    Ok((pair, idx)) => {
                        wait_index = idx.max(wait_index);
                        pair
                    }
                    Err(e) => {
                        self.retry_pause(start, cancel, &e).await?;
                        continue;
                    }
                }
            };

            if let Some(pair) = &pair {
                if pair.flags != LOCK_FLAG {
                    return Err(LockError::Conflict);
                }
                if pair.session.as_deref() == Some(session) {
                    // Already bound to our session: reclaim.
                    return Ok(());
                }
                if pair.session.is_some() {
                    // Contended; wait for the key's index to move.
                    wait_index = wait_index.max(pair.modify_index);
                    self.check_budget(start)?;
                    continue;
                }
            }

            // Key absent or unowned: try to bind it.
            match self
                .store
                .acquire(&opts.key, &opts.value, LOCK_FLAG, session)
                .await
            {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    // Lost a race or the key is inside its lock-delay
                    // window; back off and re-read from scratch.
                    self.check_budget(start)?;
                    self.sleep_retry(cancel).await?;
                    wait_index = 0;
                }
                Err(StoreError::SessionNotFound(_)) => return Err(LockError::SessionExpired),
                Err(e) => self.retry_pause(start, cancel, &e).await?,
            }
        }
    }

    /// Remaining blocking-read budget for this iteration.
    fn wait_budget(&self, start: Instant) -> Result<Duration, LockError> {
        if self.opts.lock_try_once {
            self.opts
                .lock_wait_time
                .checked_sub(start.elapsed())
                .ok_or(LockError::Timeout)
        } else {
            Ok(self.opts.lock_wait_time)
        }
    }

    fn check_budget(&self, start: Instant) -> Result<(), LockError> {
        if self.opts.lock_try_once && start.elapsed() >= self.opts.lock_wait_time {
            return Err(LockError::Timeout);
        }
        Ok(())
    }

    /// Jittered sleep between acquire retries.
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

    /// Transient store failure inside the acquisition loop: retried
    /// within the configured budget, surfaced past it.
    async fn retry_pause(
        &self,
        start: Instant,
        cancel: &mut Option<mpsc::Receiver<()>>,
        err: &StoreError,
    ) -> Result<(), LockError> {
        warn!(key = %self.opts.key, error = %err, "store error during acquisition, retrying");
        self.check_budget(start)?;
        self.sleep_retry(cancel).await
    }

    /// Watch the held key and flip the watch channel when ownership is
    /// lost. Exits when told to stop (clean release) or on loss.
    fn spawn_monitor(
        &self,
        session: String,
        held_tx: watch::Sender<bool>,
        mut stop_rx: mpsc::Receiver<()>,
        epoch: u64,
    ) {
        let store = Arc::clone(&self.store);
        let inner = Arc::clone(&self.inner);
        let key = self.opts.key.clone();
        let retries = self.opts.monitor_retries;
        let retry_time = self.opts.monitor_retry_time;

        tokio::spawn(async move {
            let mut wait_index: u64 = 0;
            let mut failures: u32 = 0;
            loop {
                let read = store.get_blocking(&key, wait_index, MONITOR_WAIT);
                let result = tokio::select! {
                    r = read => r,
                    _ = stop_rx.recv() => break,
                };
                match result {
                    Ok((pair, idx)) => {
                        failures = 0;
                        let lost = match &pair {
                            Some(p) => p.session.as_deref() != Some(session.as_str()),
                            None => true,
                        };
                        if lost {
                            let mut inner = inner.lock();
                            if inner.epoch == epoch && inner.state == State::Held {
                                inner.state = State::Unlocked;
                                inner.monitor_stop = None;
                            }
                            drop(inner);
                            warn!(key = %key, session = %session, "lock ownership lost");
                            break;
                        }
                        wait_index = wait_index.max(idx);
                    }
                    Err(e) => {
                        failures += 1;
                        if failures > retries {
                            let mut inner = inner.lock();
                            if inner.epoch == epoch && inner.state == State::Held {
                                inner.state = State::Unlocked;
                                inner.monitor_stop = None;
                            }
                            drop(inner);
                            warn!(key = %key, error = %e, "monitor giving up, treating lock as lost");
                            break;
                        }
                        tokio::time::sleep(retry_time).await;
                    }
                }
            }
            let _ = held_tx.send(false);
        });
    }

    /// Release the lock. The key's value is preserved; only ownership
    /// is cleared. A session this instance created is destroyed
    /// afterwards.
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

        // Dropping the stop handle makes the monitor exit and flip the
        // watch channel.
        drop(monitor_stop);

        let released = self
            .store
            .release(&self.opts.key, &self.opts.value, LOCK_FLAG, &session)
            .await?;
        if !released {
            // The session died underneath us and the store already
            // cleared ownership; local state is consistent either way.
            debug!(key = %self.opts.key, "release write was a no-op");
        }

        drop(renew_stop);
        if owns {
            if let Err(e) = self.sessions.destroy(&session).await {
                warn!(session = %session, error = %e, "failed to destroy session on release");
            }
        }
        debug!(key = %self.opts.key, "lock released");
        Ok(())
    }

    /// Delete the lock key entirely. Fails while any live holder owns
    /// it; destruction never removes a key another party believes it
    /// owns.
    pub async fn destroy(&self) -> Result<(), LockError> {
        {
            let inner = self.inner.lock();
            match inner.state {
                State::Held | State::Acquiring => return Err(LockError::Held),
                State::Destroyed => return Ok(()),
                State::Unlocked => {}
            }
        }

        let pair = match self.store.get(&self.opts.key).await? {
            Some(pair) => pair,
            None => {
                self.mark_destroyed();
                return Ok(());
            }
        };

        if pair.flags != LOCK_FLAG {
            return Err(LockError::Conflict);
        }
        if pair.session.is_some() {
            return Err(LockError::InUse);
        }
        if !self.store.delete_cas(&self.opts.key, pair.modify_index).await? {
            // Someone (re)acquired or rewrote the key in between.
            return Err(LockError::InUse);
        }

        self.mark_destroyed();
        debug!(key = %self.opts.key, "lock key destroyed");
        Ok(())
    }

    fn mark_destroyed(&self) {
        let mut inner = self.inner.lock();
        if inner.state == State::Unlocked {
            inner.state = State::Destroyed;
        }
    }
}
