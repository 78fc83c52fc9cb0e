//! HTTP store client with failover across servers.
//!
//! Talks the Consul-compatible KV and session wire protocol: raw-body
//! PUTs with `cas`/`acquire`/`release` query parameters, long-poll
//! reads driven by `index` and `wait`, and the `X-Consul-Index`
//! response header as the change cursor.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::model::{KvPair, SessionBehavior, SessionEntry};
use crate::store::{KvApi, SessionApi};

const INDEX_HEADER: &str = "X-Consul-Index";
const TOKEN_HEADER: &str = "X-Consul-Token";

/// Extra per-request slack on top of the server-side wait so a
/// long-poll is never cut off by the client timeout.
const BLOCKING_SLACK: Duration = Duration::from_secs(5);

/// Configuration for the HTTP store client.
#[derive(Clone, Debug)]
pub struct HttpStoreConfig {
    /// List of server addresses to connect to.
    pub server_addrs: Vec<String>,
    /// ACL token sent with every request, if any.
    pub token: Option<String>,
    /// Datacenter query parameter, if any.
    pub datacenter: Option<String>,
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Read timeout in milliseconds for non-blocking requests.
    pub read_timeout_ms: u64,
}

impl Default for HttpStoreConfig {
    fn default() -> Self {
        Self {
            server_addrs: vec!["http://127.0.0.1:8500".to_string()],
            token: None,
            datacenter: None,
            connect_timeout_ms: 5000,
            read_timeout_ms: 30000,
        }
    }
}

impl HttpStoreConfig {
    /// Create a new config with a single server address.
    pub fn new(server_addr: &str) -> Self {
        Self {
            server_addrs: vec![server_addr.to_string()],
            ..Default::default()
        }
    }

    /// Create a config with multiple server addresses.
    pub fn with_servers(server_addrs: Vec<String>) -> Self {
        Self {
            server_addrs,
            ..Default::default()
        }
    }

    /// Set the ACL token.
    pub fn with_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    /// Set the datacenter.
    pub fn with_datacenter(mut self, dc: &str) -> Self {
        self.datacenter = Some(dc.to_string());
        self
    }

    /// Set timeouts.
    pub fn with_timeouts(mut self, connect_ms: u64, read_ms: u64) -> Self {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
        self
    }
}

/// [`crate::store::Store`] implementation backed by a remote server.
pub struct HttpStore {
    client: Client,
    config: HttpStoreConfig,
    current_server_index: RwLock<usize>,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            config,
            current_server_index: RwLock::new(0),
        })
    }

    /// Get the current server URL.
    fn current_server(&self) -> String {
        let index = *self
            .current_server_index
            .read()
            .unwrap_or_else(|e| e.into_inner());
        self.config.server_addrs[index].clone()
    }

    /// Switch to the next server (for failover).
    fn switch_to_next_server(&self) {
        let mut index = self
            .current_server_index
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *index = (*index + 1) % self.config.server_addrs.len();
        debug!("switched to server index {}", *index);
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.current_server(), path)
    }

    /// Issue a request, failing over to the next server on transport
    /// errors. Non-2xx statuses are returned to the caller untouched.
    async fn request_with_retry<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&Client, String) -> reqwest::RequestBuilder,
    {
        let max_retries = self.config.server_addrs.len();
        let mut last_error = None;

        for _ in 0..max_retries {
            let url = self.build_url("");
            let mut builder = build(&self.client, url);
            if let Some(token) = &self.config.token {
                builder = builder.header(TOKEN_HEADER, token);
            }
            if let Some(dc) = &self.config.datacenter {
                builder = builder.query(&[("dc", dc)]);
            }

            match builder.send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!(error = %e, "request failed, switching to next server");
                    self.switch_to_next_server();
                    last_error = Some(StoreError::Http(e));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| StoreError::Other(anyhow::anyhow!("no servers configured"))))
    }

    /// Read the change cursor from a response.
    fn response_index(response: &Response) -> u64 {
        response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    async fn status_error(response: Response) -> StoreError {
        let code = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        // The server reports writes against a dead session as a plain
        // error; surface them as the dedicated variant.
        if message.to_ascii_lowercase().contains("invalid session") {
            StoreError::SessionNotFound(message)
        } else {
            StoreError::Status { code, message }
        }
    }

    /// Shared body of the plain and blocking single-key reads.
    async fn get_with_query(
        &self,
        key: &str,
        query: &[(&str, String)],
    ) -> Result<(Option<KvPair>, u64), StoreError> {
        let path = format!("/v1/kv/{key}");
        let query = query.to_vec();
        let response = self
            .request_with_retry(move |client, base| {
                client.get(format!("{base}{path}")).query(&query)
            })
            .await?;

        let index = Self::response_index(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok((None, index)),
            status if status.is_success() => {
                let mut pairs: Vec<KvPair> = response.json().await?;
                let first = pairs.drain(..).next();
                Ok((first, index))
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn list_with_query(
        &self,
        prefix: &str,
        mut query: Vec<(&'static str, String)>,
    ) -> Result<(Vec<KvPair>, u64), StoreError> {
        query.push(("recurse", "true".to_string()));
        let path = format!("/v1/kv/{prefix}");
        let response = self
            .request_with_retry(move |client, base| {
                client.get(format!("{base}{path}")).query(&query)
            })
            .await?;

        let index = Self::response_index(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok((Vec::new(), index)),
            status if status.is_success() => Ok((response.json().await?, index)),
            _ => Err(Self::status_error(response).await),
        }
    }

    /// PUT against a KV path; the server answers `true` or `false`.
    async fn put_bool(
        &self,
        key: &str,
        value: Vec<u8>,
        query: Vec<(&'static str, String)>,
    ) -> Result<bool, StoreError> {
        let path = format!("/v1/kv/{key}");
        let response = self
            .request_with_retry(move |client, base| {
                client
                    .put(format!("{base}{path}"))
                    .query(&query)
                    .body(value.clone())
            })
            .await?;

        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::status_error(response).await)
        }
    }
}

/// Format a duration the way the wire protocol expects ("15s").
fn format_wait(wait: Duration) -> String {
    format!("{}ms", wait.as_millis())
}

#[derive(Deserialize)]
struct SessionIdResponse {
    #[serde(rename = "ID")]
    id: String,
}

/// Session entry as it appears on the wire. Durations travel as Go
/// duration strings on writes and as nanosecond counts on reads.
#[derive(Deserialize)]
struct WireSession {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "TTL", default)]
    ttl: Option<String>,
    #[serde(rename = "Behavior", default)]
    behavior: Option<SessionBehavior>,
    #[serde(rename = "LockDelay", default)]
    lock_delay_ns: u64,
}

impl WireSession {
    fn into_entry(self) -> SessionEntry {
        SessionEntry {
            id: self.id,
            name: self.name,
            ttl: self.ttl.as_deref().and_then(parse_go_duration),
            behavior: self.behavior.unwrap_or_default(),
            lock_delay: Duration::from_nanos(self.lock_delay_ns),
        }
    }
}

fn session_create_body(entry: &SessionEntry) -> serde_json::Value {
    let mut body = serde_json::json!({
        "Name": entry.name,
        "Behavior": entry.behavior,
        "LockDelay": format!("{}ms", entry.lock_delay.as_millis()),
    });
    if let Some(ttl) = entry.ttl {
        body["TTL"] = serde_json::Value::String(format!("{}s", ttl.as_secs()));
    }
    body
}

/// Parse a Go duration string; only the units the server emits for
/// session TTLs are supported.
fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(v) = s.strip_suffix("ms") {
        return v.parse().ok().map(Duration::from_millis);
    }
    if let Some(v) = s.strip_suffix('s') {
        return v.parse().ok().map(Duration::from_secs);
    }
    if let Some(v) = s.strip_suffix('m') {
        return v.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60));
    }
    if let Some(v) = s.strip_suffix('h') {
        return v.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600));
    }
    None
}

#[async_trait]
impl KvApi for HttpStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        Ok(self.get_with_query(key, &[]).await?.0)
    }

    async fn get_blocking(
        &self,
        key: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Option<KvPair>, u64), StoreError> {
        // Blocking reads run past the client read timeout on purpose.
        let path = format!("/v1/kv/{key}");
        let query = vec![("index", since.to_string()), ("wait", format_wait(wait))];
        let timeout = wait + BLOCKING_SLACK;
        let response = self
            .request_with_retry(move |client, base| {
                client
                    .get(format!("{base}{path}"))
                    .query(&query)
                    .timeout(timeout)
            })
            .await?;

        let index = Self::response_index(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok((None, index)),
            status if status.is_success() => {
                let mut pairs: Vec<KvPair> = response.json().await?;
                let first = pairs.drain(..).next();
                Ok((first, index))
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        Ok(self.list_with_query(prefix, Vec::new()).await?.0)
    }

    async fn list_blocking(
        &self,
        prefix: &str,
        since: u64,
        wait: Duration,
    ) -> Result<(Vec<KvPair>, u64), StoreError> {
        let mut query = vec![("recurse", "true".to_string())];
        query.push(("index", since.to_string()));
        query.push(("wait", format_wait(wait)));
        let path = format!("/v1/kv/{prefix}");
        let timeout = wait + BLOCKING_SLACK;
        let response = self
            .request_with_retry(move |client, base| {
                client
                    .get(format!("{base}{path}"))
                    .query(&query)
                    .timeout(timeout)
            })
            .await?;

        let index = Self::response_index(&response);
        match response.status() {
            StatusCode::NOT_FOUND => Ok((Vec::new(), index)),
            status if status.is_success() => Ok((response.json().await?, index)),
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn put(&self, key: &str, value: &[u8], flags: u64) -> Result<bool, StoreError> {
        self.put_bool(key, value.to_vec(), vec![("flags", flags.to_string())])
            .await
    }

    async fn cas(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        index: u64,
    ) -> Result<bool, StoreError> {
        self.put_bool(
            key,
            value.to_vec(),
            vec![("flags", flags.to_string()), ("cas", index.to_string())],
        )
        .await
    }

    async fn acquire(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        session: &str,
    ) -> Result<bool, StoreError> {
        self.put_bool(
            key,
            value.to_vec(),
            vec![
                ("flags", flags.to_string()),
                ("acquire", session.to_string()),
            ],
        )
        .await
    }

    async fn release(
        &self,
        key: &str,
        value: &[u8],
        flags: u64,
        session: &str,
    ) -> Result<bool, StoreError> {
        self.put_bool(
            key,
            value.to_vec(),
            vec![
                ("flags", flags.to_string()),
                ("release", session.to_string()),
            ],
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = format!("/v1/kv/{key}");
        let response = self
            .request_with_retry(move |client, base| client.delete(format!("{base}{path}")))
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn delete_cas(&self, key: &str, index: u64) -> Result<bool, StoreError> {
        let path = format!("/v1/kv/{key}");
        let query = vec![("cas", index.to_string())];
        let response = self
            .request_with_retry(move |client, base| {
                client.delete(format!("{base}{path}")).query(&query)
            })
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::status_error(response).await)
        }
    }
}

#[async_trait]
impl SessionApi for HttpStore {
    async fn session_create(&self, entry: &SessionEntry) -> Result<String, StoreError> {
        let body = session_create_body(entry);
        let response = self
            .request_with_retry(move |client, base| {
                client.put(format!("{base}/v1/session/create")).json(&body)
            })
            .await?;

        if response.status().is_success() {
            let created: SessionIdResponse = response.json().await?;
            Ok(created.id)
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn session_destroy(&self, id: &str) -> Result<bool, StoreError> {
        let path = format!("/v1/session/destroy/{id}");
        let response = self
            .request_with_retry(move |client, base| client.put(format!("{base}{path}")))
            .await?;
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::status_error(response).await)
        }
    }

    async fn session_renew(&self, id: &str) -> Result<Option<SessionEntry>, StoreError> {
        let path = format!("/v1/session/renew/{id}");
        let response = self
            .request_with_retry(move |client, base| client.put(format!("{base}{path}")))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let mut sessions: Vec<WireSession> = response.json().await?;
                let first = sessions.drain(..).next();
                Ok(first.map(WireSession::into_entry))
            }
            _ => Err(Self::status_error(response).await),
        }
    }

    async fn session_info(&self, id: &str) -> Result<Option<SessionEntry>, StoreError> {
        let path = format!("/v1/session/info/{id}");
        let response = self
            .request_with_retry(move |client, base| client.get(format!("{base}{path}")))
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let mut sessions: Vec<WireSession> = response.json().await?;
                let first = sessions.drain(..).next();
                Ok(first.map(WireSession::into_entry))
            }
            _ => Err(Self::status_error(response).await),
        }
    }
}
