//! Cerrojo - client-side distributed coordination primitives
//!
//! This crate provides:
//! - Lock: single-owner mutual exclusion bound to an ephemeral session
//! - Semaphore: bounded concurrency with a shared holder-set record
//! - SessionManager: session lifecycle plus background TTL renewal
//! - Execution helpers that run an action under a lock and optionally
//!   abort it the moment ownership is lost
//! - Two store backends: an HTTP client for a Consul-compatible server
//!   and an in-process memory store for tests and single-node use

pub mod error;
pub mod exec;
pub mod http;
pub mod lock;
pub mod memory;
pub mod model;
pub mod semaphore;
pub mod session;
pub mod store;

// Primitive re-exports
pub use exec::{execute_abortable_locked, execute_locked};
pub use lock::{Lock, LockOptions};
pub use semaphore::{Semaphore, SemaphoreOptions};
pub use session::SessionManager;

// Store and model re-exports
pub use error::{LockError, SessionError, StoreError};
pub use http::{HttpStore, HttpStoreConfig};
pub use memory::MemoryStore;
pub use model::*;
pub use store::{KvApi, SessionApi, Store};
