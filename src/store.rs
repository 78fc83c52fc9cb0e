//! Store interface consumed by the coordination primitives.
//!
//! The remote key-value store is the sole arbiter of ownership: every
//! primitive in this crate talks to it through these traits and never
//! caches remote state as authoritative. Two implementations ship with
//! the crate: [`crate::http::HttpStore`] for a real server and
//! [`crate::memory::MemoryStore`] for in-process use and tests.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{KvPair, SessionEntry};

/// Key-value operations, including conditional writes and blocking
/// (long-poll) reads.
#[async_trait]
pub trait KvApi: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError>;

    /// Read a single key, blocking until its index advances past
    /// `since` or `wait` elapses. Returns the pair (if any) and the
    /// index to use as the next wait index.
    async fn get_blocking(
        &self,
        key: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Option<KvPair>, u64), StoreError>;

    /// List all keys under a prefix.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError>;

    /// List all keys under a prefix, blocking until the prefix's index
    /// advances past `since` or `wait` elapses.
    async fn list_blocking(
        &self,
        prefix: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64), StoreError>;

    /// Unconditional write.
    async fn put(&self, key: &str, value: &[u8], flags: u64) -> Result<bool, StoreError>;

    /// Conditional write: succeeds only if the key's current modify
    /// index equals `index` (0 means "create only if absent").
    async fn cas(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        index: u64,
    ) -> Result<bool, StoreError>;

    /// Atomically bind `session` to the key. Fails (returns `false`)
    /// if the key is bound to a different session or a lock-delay
    /// window is in effect.
    async fn acquire(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        session: &str,
    ) -> Result<bool, StoreError>;

    /// Atomically unbind `session` from the key, keeping the value.
    async fn release(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        session: &str,
    ) -> Result<bool, StoreError>;

    /// Delete a key.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Delete a key only if its modify index equals `index`.
    async fn delete_cas(&self, key: &str, index: u64) -> Result<bool, StoreError>;
}

/// Session endpoint operations.
#[async_trait]
pub trait SessionApi: Send + Sync {
    /// Create a session; returns its id.
    async fn session_create(&self, entry: &SessionEntry) -> Result<String, StoreError>;

    /// Destroy a session. Returns whether it existed.
    async fn session_destroy(&self, id: &str) -> Result<bool, StoreError>;

    /// Renew a session's TTL. `None` means the session no longer exists.
    async fn session_renew(&self, id: &str) -> Result<Option<SessionEntry>, StoreError>;

    /// Look up a session. `None` means it does not exist.
    async fn session_info(&self, id: &str) -> Result<Option<SessionEntry>, StoreError>;
}

/// Combined store surface used by the coordination primitives.
pub trait Store: KvApi + SessionApi {}

impl<T: KvApi + SessionApi> Store for T {}
