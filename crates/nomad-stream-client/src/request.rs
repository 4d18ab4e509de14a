//! Per-request options and response metadata.

use std::time::Duration;

use reqwest::header::HeaderMap;

/// Options for read requests.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the configured region.
    pub region: Option<String>,
    /// Overrides the configured namespace.
    pub namespace: Option<String>,
    /// Overrides the configured ACL token.
    pub auth_token: Option<String>,
    /// Allow any server, not just the leader, to answer.
    pub allow_stale: bool,
    /// Blocking-query index.
    pub wait_index: u64,
    /// Maximum time a blocking query may wait.
    pub wait_time: Option<Duration>,
    pub prefix: Option<String>,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl QueryOptions {
    /// Query string pairs these options contribute to a request URL.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(region) = &self.region {
            pairs.push(("region".to_string(), region.clone()));
        }
        if let Some(namespace) = &self.namespace {
            pairs.push(("namespace".to_string(), namespace.clone()));
        }
        if self.allow_stale {
            pairs.push(("stale".to_string(), String::new()));
        }
        if self.wait_index != 0 {
            pairs.push(("index".to_string(), self.wait_index.to_string()));
        }
        if let Some(wait) = self.wait_time {
            pairs.push(("wait".to_string(), format!("{}ms", wait.as_millis())));
        }
        if let Some(prefix) = &self.prefix {
            pairs.push(("prefix".to_string(), prefix.clone()));
        }
        pairs.extend(self.params.iter().cloned());
        pairs
    }
}

/// Options for write requests.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub region: Option<String>,
    pub namespace: Option<String>,
    pub auth_token: Option<String>,
    /// Client-chosen token making the write idempotent on the server.
    pub idempotency_token: Option<String>,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
}

impl WriteOptions {
    /// Query string pairs these options contribute to a request URL.
    #[must_use]
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(region) = &self.region {
            pairs.push(("region".to_string(), region.clone()));
        }
        if let Some(namespace) = &self.namespace {
            pairs.push(("namespace".to_string(), namespace.clone()));
        }
        if let Some(token) = &self.idempotency_token {
            pairs.push(("idempotency_token".to_string(), token.clone()));
        }
        pairs.extend(self.params.iter().cloned());
        pairs
    }
}

/// Metadata returned with a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryMeta {
    /// Raft index the result was read at.
    pub last_index: u64,
    /// Time since the answering server last contacted the leader.
    pub last_contact: Duration,
    pub known_leader: bool,
    /// Wall-clock time of the request.
    pub request_time: Duration,
}

impl QueryMeta {
    pub(crate) fn from_headers(headers: &HeaderMap, request_time: Duration) -> Self {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
        Self {
            last_index: header("X-Nomad-Index")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            last_contact: header("X-Nomad-LastContact")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or_default(),
            known_leader: header("X-Nomad-KnownLeader") == Some("true"),
            request_time,
        }
    }
}

/// Metadata returned with a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteMeta {
    /// Raft index the write was applied at.
    pub last_index: u64,
    /// Wall-clock time of the request.
    pub request_time: Duration,
}

impl WriteMeta {
    pub(crate) fn from_headers(headers: &HeaderMap, request_time: Duration) -> Self {
        Self {
            last_index: headers
                .get("X-Nomad-Index")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            request_time,
        }
    }
}
