//! Wire data models for the Consul-compatible KV and session APIs.
//!
//! These models match the Consul API specification: PascalCase JSON
//! field names, base64-encoded values, and numeric modification indexes.

use std::collections::BTreeSet;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

/// Flags value marking a key written by the Lock protocol.
pub const LOCK_FLAG: u64 = 0x2ddc_cbc0_58a5_0c18;

/// Flags value marking a key written by the Semaphore protocol.
pub const SEMAPHORE_FLAG: u64 = 0xe0f6_9a2b_aa41_4de0;

/// Name of the coordination record key under a semaphore prefix.
pub const SEMAPHORE_RECORD_KEY: &str = ".lock";

/// A single key-value pair as returned by the KV endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvPair {
    #[serde(rename = "Key")]
    pub key: String,

    #[serde(rename = "CreateIndex")]
    pub create_index: u64,

    #[serde(rename = "ModifyIndex")]
    pub modify_index: u64,

    #[serde(rename = "LockIndex")]
    pub lock_index: u64,

    #[serde(rename = "Flags")]
    pub flags: u64,

    /// Base64 encoded value.
    #[serde(rename = "Value", skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Session currently bound to the key, if any.
    #[serde(rename = "Session", skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

impl KvPair {
    /// Create a pair with an encoded value and no index metadata.
    pub fn new(key: impl Into<String>, value: &[u8]) -> Self {
        Self {
            key: key.into(),
            create_index: 0,
            modify_index: 0,
            lock_index: 0,
            flags: 0,
            value: Some(BASE64.encode(value)),
            session: None,
        }
    }

    /// Decode the base64 value into raw bytes.
    pub fn raw_value(&self) -> Option<Vec<u8>> {
        self.value.as_ref().and_then(|v| BASE64.decode(v).ok())
    }

    /// Decode the base64 value into a UTF-8 string.
    pub fn decoded_value(&self) -> Option<String> {
        self.raw_value()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    /// Encode and replace the value.
    pub fn set_value(&mut self, value: &[u8]) {
        self.value = Some(BASE64.encode(value));
    }
}

/// What the store does to a session's bound keys when the session is
/// destroyed or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SessionBehavior {
    /// Ownership is cleared but the value is kept.
    #[default]
    #[serde(rename = "release")]
    Release,
    /// Bound keys are deleted outright.
    #[serde(rename = "delete")]
    Delete,
}

/// An ephemeral session registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionEntry {
    /// Session identifier; empty means "none yet".
    pub id: String,
    /// Human-readable session name.
    pub name: String,
    /// Time-to-live; `None` means the session never expires on its own.
    pub ttl: Option<Duration>,
    /// Invalidation behavior applied to bound keys.
    pub behavior: SessionBehavior,
    /// Grace period before forcibly vacated keys become acquirable again.
    pub lock_delay: Duration,
}

impl SessionEntry {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_behavior(mut self, behavior: SessionBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_lock_delay(mut self, delay: Duration) -> Self {
        self.lock_delay = delay;
        self
    }
}

/// The shared coordination record a semaphore keeps at
/// `<prefix>/.lock`, holding the permit limit and the holder set.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SemaphoreRecord {
    #[serde(rename = "Limit")]
    pub limit: u32,

    /// Session ids currently holding a permit.
    #[serde(rename = "Holders", default)]
    pub holders: BTreeSet<String>,
}

impl SemaphoreRecord {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            holders: BTreeSet::new(),
        }
    }

    /// Serialize the record to its stored JSON form.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a record from a coordination key's value.
    pub fn from_pair(pair: &KvPair) -> Result<Self, serde_json::Error> {
        let bytes = pair.raw_value().unwrap_or_default();
        serde_json::from_slice(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_pair_value_roundtrip() {
        let pair = KvPair::new("service/leader", b"node-1");
        assert_eq!(pair.decoded_value(), Some("node-1".to_string()));
        assert_eq!(pair.raw_value(), Some(b"node-1".to_vec()));
    }

    #[test]
    fn test_kv_pair_serde_field_names() {
        let pair = KvPair::new("a/b", b"x");
        let json = serde_json::to_value(&pair).unwrap();
        assert!(json.get("Key").is_some());
        assert!(json.get("ModifyIndex").is_some());
        assert!(json.get("Session").is_none());
    }

    #[test]
    fn test_session_behavior_wire_names() {
        assert_eq!(
            serde_json::to_string(&SessionBehavior::Release).unwrap(),
            "\"release\""
        );
        assert_eq!(
            serde_json::to_string(&SessionBehavior::Delete).unwrap(),
            "\"delete\""
        );
    }

    #[test]
    fn test_semaphore_record_roundtrip() {
        let mut record = SemaphoreRecord::new(3);
        record.holders.insert("s1".to_string());
        record.holders.insert("s2".to_string());

        let mut pair = KvPair::new("svc/sema/.lock", b"");
        pair.set_value(&record.to_json().unwrap());

        let decoded = SemaphoreRecord::from_pair(&pair).unwrap();
        assert_eq!(decoded, record);
    }
}
