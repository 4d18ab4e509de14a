//! Client configuration.

use std::{collections::BTreeMap, fmt, time::Duration};

use nomad_stream_core::RetryOptions;
use serde::{Deserialize, Serialize};

/// Default agent address.
pub const DEFAULT_ADDRESS: &str = "http://127.0.0.1:4646";

/// Client configuration.
///
/// Fields left unset fall back to the agent's own defaults.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base address of the HTTP API, e.g. `http://127.0.0.1:4646`.
    pub address: String,
    pub region: Option<String>,
    pub namespace: Option<String>,
    /// ACL token sent as `X-Nomad-Token`.
    pub secret_id: Option<String>,
    /// Extra headers sent with every request.
    pub headers: BTreeMap<String, String>,
    /// Timeout for non-streaming requests. Streams never time out.
    #[serde(with = "nomad_stream_core::encoding::opt_duration_ms")]
    pub timeout: Option<Duration>,
    /// Backoff policy for `Client::retry_put`.
    pub retry: RetryOptions,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            region: None,
            namespace: None,
            secret_id: None,
            headers: BTreeMap::new(),
            timeout: None,
            retry: RetryOptions::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("address", &self.address)
            .field("region", &self.region)
            .field("namespace", &self.namespace)
            .field("secret_id", &self.secret_id.as_ref().map(|_| "<redacted>"))
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// Reads `NOMAD_ADDR`, `NOMAD_REGION`, `NOMAD_NAMESPACE` and `NOMAD_TOKEN`.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = Self::default();
        if let Some(addr) = get("NOMAD_ADDR") {
            config.address = addr;
        }
        config.region = get("NOMAD_REGION");
        config.namespace = get("NOMAD_NAMESPACE");
        config.secret_id = get("NOMAD_TOKEN");
        config
    }

    /// Set the API address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Set the ACL token.
    #[must_use]
    pub fn with_secret_id(mut self, secret_id: impl Into<String>) -> Self {
        self.secret_id = Some(secret_id.into());
        self
    }

    /// Set the region.
    #[must_use]
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the timeout for non-streaming requests.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry policy for retried writes.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Address without a trailing slash.
    #[must_use]
    pub fn base_address(&self) -> &str {
        self.address.trim_end_matches('/')
    }
}
