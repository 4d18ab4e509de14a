//! Establishing the exec WebSocket, directly to the node or through the servers.

use std::time::Duration;

use async_trait::async_trait;
use nomad_stream_client::{Client, QueryOptions};
use nomad_stream_core::{DialError, WebSocketDialer};
use reqwest::{
    Url,
    header::{HeaderName, HeaderValue},
};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, client::IntoClientRequest},
};

use crate::error::ExecError;

/// Default bound on the direct-to-node connection attempt.
pub const DEFAULT_DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// What to run and where.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub alloc_id: String,
    pub task: String,
    /// Command and arguments; sent as a JSON array.
    pub command: Vec<String>,
    /// Allocate a pseudo-terminal for the command.
    pub tty: bool,
    /// HTTP address of the node running the allocation. Looked up from
    /// the allocation when unset.
    pub node_address: Option<String>,
    pub query: QueryOptions,
}

impl ExecRequest {
    #[must_use]
    pub fn new(alloc_id: impl Into<String>, task: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            alloc_id: alloc_id.into(),
            task: task.into(),
            command,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn tty(mut self, tty: bool) -> Self {
        self.tty = tty;
        self
    }

    #[must_use]
    pub fn node_address(mut self, address: impl Into<String>) -> Self {
        self.node_address = Some(address.into());
        self
    }
}

/// WebSocket URL of the exec endpoint on the configured (server) address.
///
/// # Errors
/// Returns error if the URL cannot be built.
pub fn exec_url(client: &Client, request: &ExecRequest) -> Result<Url, ExecError> {
    let command = serde_json::to_string(&request.command)?;
    let mut params = request.query.query_pairs();
    params.push(("task".to_string(), request.task.clone()));
    params.push(("tty".to_string(), request.tty.to_string()));
    params.push(("command".to_string(), command));

    let path = format!("/v1/client/allocation/{}/exec", request.alloc_id);
    let mut url = client.url(&path, &params)?;
    to_websocket(&mut url)?;
    Ok(url)
}

/// Point `proxy_url` at a node's own HTTP address instead.
///
/// `node_address` may omit the scheme, in which case the proxy's is kept.
///
/// # Errors
/// Returns error if the address is not a valid URL.
pub fn direct_url(proxy_url: &Url, node_address: &str) -> Result<Url, ExecError> {
    let base = if node_address.contains("://") {
        node_address.to_string()
    } else {
        format!("{}://{node_address}", proxy_url.scheme())
    };
    let mut url = Url::parse(&base).map_err(|e| invalid_url(&base, e))?;
    to_websocket(&mut url)?;
    url.set_path(proxy_url.path());
    url.set_query(proxy_url.query());
    Ok(url)
}

fn to_websocket(url: &mut Url) -> Result<(), ExecError> {
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid_url(url.as_str(), format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| invalid_url(url.as_str(), "cannot change scheme"))
}

fn invalid_url(url: &str, reason: impl std::fmt::Display) -> ExecError {
    ExecError::Request(nomad_stream_client::ClientError::InvalidUrl(format!(
        "{url}: {reason}"
    )))
}

#[derive(Deserialize)]
struct AllocationNode {
    #[serde(rename = "NodeID", default)]
    node_id: String,
}

#[derive(Deserialize)]
struct NodeAddress {
    #[serde(rename = "HTTPAddr", default)]
    http_addr: String,
}

/// Look up the HTTP address of the node running `request.alloc_id`.
///
/// Returns `None` when the allocation or node cannot be read, or the
/// node has no address; the caller then goes through the servers.
pub async fn resolve_node_address(client: &Client, request: &ExecRequest) -> Option<String> {
    let q = &request.query;
    let alloc_path = format!("/v1/allocation/{}", request.alloc_id);
    let (alloc, _) = match client.query::<AllocationNode>(&alloc_path, q).await {
        Ok(found) => found,
        Err(e) => {
            tracing::debug!(error = %e, "failed to look up allocation node");
            return None;
        }
    };
    if alloc.node_id.is_empty() {
        return None;
    }

    let node_path = format!("/v1/node/{}", alloc.node_id);
    match client.query::<NodeAddress>(&node_path, q).await {
        Ok((node, _)) if !node.http_addr.is_empty() => Some(node.http_addr),
        Ok(_) => None,
        Err(e) => {
            tracing::debug!(error = %e, node_id = %alloc.node_id, "failed to look up node address");
            None
        }
    }
}

/// Open the exec WebSocket for `request`, preferring the owning node.
///
/// An explicit `request.node_address` is used as is; otherwise the node
/// is looked up, and a failed lookup goes straight to the servers.
///
/// # Errors
/// Returns error if the URLs cannot be built or no connection succeeds;
/// see [`connect_with_fallback`].
pub async fn dial_exec<D: WebSocketDialer>(
    client: &Client,
    request: &ExecRequest,
    dialer: &D,
    timeout: Duration,
) -> Result<D::Connection, ExecError> {
    let proxy = exec_url(client, request)?;
    let direct = match request.node_address.as_deref() {
        Some(addr) => Some(direct_url(&proxy, addr)?),
        None => match resolve_node_address(client, request).await {
            Some(addr) => direct_url(&proxy, &addr)
                .inspect_err(|e| tracing::debug!(error = %e, "ignoring node address"))
                .ok(),
            None => None,
        },
    };
    connect_with_fallback(dialer, direct.as_ref().map(Url::as_str), proxy.as_str(), timeout).await
}

/// Dial `direct` first, falling back to `proxy` when the node is unreachable.
///
/// The direct attempt is bounded by `timeout`. Any failure other than an
/// unreachable node is returned as is. Exactly one connection is returned.
///
/// # Errors
/// Returns the direct failure when it is not an unreachable node, or the
/// proxy failure.
pub async fn connect_with_fallback<D: WebSocketDialer>(
    dialer: &D,
    direct: Option<&str>,
    proxy: &str,
    timeout: Duration,
) -> Result<D::Connection, ExecError> {
    if let Some(direct) = direct {
        match tokio::time::timeout(timeout, dialer.dial(direct)).await {
            Ok(Ok(conn)) => return Ok(conn),
            Ok(Err(err)) if err.is_node_unreachable() => {
                tracing::info!(error = %err, "node unreachable, connecting through servers");
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => {
                tracing::info!(?timeout, "direct connection timed out, connecting through servers");
            }
        }
    }
    Ok(dialer.dial(proxy).await?)
}

/// WebSocket connection produced by [`TungsteniteDialer`].
pub type ExecSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dialer over `tokio-tungstenite` sending the client's headers.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteDialer {
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl TungsteniteDialer {
    #[must_use]
    pub const fn new(headers: Vec<(HeaderName, HeaderValue)>) -> Self {
        Self { headers }
    }

    /// Dialer carrying the token and headers `client` would send for `q`.
    ///
    /// # Errors
    /// Returns error if a configured header is invalid.
    pub fn for_client(client: &Client, q: &QueryOptions) -> Result<Self, ExecError> {
        Ok(Self::new(
            client.default_headers(q.auth_token.as_deref(), &q.headers)?,
        ))
    }
}

#[async_trait]
impl WebSocketDialer for TungsteniteDialer {
    type Connection = ExecSocket;

    async fn dial(&self, url: &str) -> Result<Self::Connection, DialError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| DialError::InvalidRequest(e.to_string()))?;
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        let (socket, response) = connect_async(request).await.map_err(classify)?;
        tracing::debug!(status = %response.status(), "exec websocket connected");
        Ok(socket)
    }
}

/// Sort a handshake failure into unreachable (fall back) or rejected.
fn classify(err: tungstenite::Error) -> DialError {
    match err {
        tungstenite::Error::Io(_) => DialError::Unreachable(Box::new(err)),
        tungstenite::Error::Http(ref response)
            if matches!(response.status().as_u16(), 502..=504) =>
        {
            DialError::Unreachable(Box::new(err))
        }
        tungstenite::Error::Url(_) => DialError::InvalidRequest(err.to_string()),
        other => DialError::Rejected(Box::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use nomad_stream_client::Config;
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    enum Outcome {
        Connect,
        Unreachable,
        Rejected,
        Hang,
    }

    struct FakeDialer {
        outcomes: HashMap<String, Outcome>,
        dialed: Mutex<Vec<String>>,
    }

    impl FakeDialer {
        fn new<K: Into<String>>(outcomes: impl IntoIterator<Item = (K, Outcome)>) -> Self {
            Self {
                outcomes: outcomes.into_iter().map(|(k, o)| (k.into(), o)).collect(),
                dialed: Mutex::new(Vec::new()),
            }
        }

        fn dialed(&self) -> Vec<String> {
            self.dialed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebSocketDialer for FakeDialer {
        type Connection = String;

        async fn dial(&self, url: &str) -> Result<String, DialError> {
            self.dialed.lock().unwrap().push(url.to_string());
            match self.outcomes.get(url) {
                Some(Outcome::Connect) => Ok(url.to_string()),
                Some(Outcome::Unreachable) => Err(DialError::Unreachable("connection refused".into())),
                Some(Outcome::Rejected) | None => Err(DialError::Rejected("403 Forbidden".into())),
                Some(Outcome::Hang) => std::future::pending().await,
            }
        }
    }

    const DIRECT: &str = "ws://10.0.0.5:4646/exec";
    const PROXY: &str = "ws://127.0.0.1:4646/exec";

    #[tokio::test]
    async fn test_direct_connection_preferred() {
        let dialer = FakeDialer::new([(DIRECT, Outcome::Connect), (PROXY, Outcome::Connect)]);
        let conn = connect_with_fallback(&dialer, Some(DIRECT), PROXY, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn, DIRECT);
        assert_eq!(dialer.dialed(), vec![DIRECT]);
    }

    #[tokio::test]
    async fn test_unreachable_node_falls_back_to_proxy() {
        let dialer = FakeDialer::new([(DIRECT, Outcome::Unreachable), (PROXY, Outcome::Connect)]);
        let conn = connect_with_fallback(&dialer, Some(DIRECT), PROXY, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn, PROXY);
        assert_eq!(dialer.dialed(), vec![DIRECT, PROXY]);
    }

    #[tokio::test]
    async fn test_rejected_direct_connection_does_not_fall_back() {
        let dialer = FakeDialer::new([(DIRECT, Outcome::Rejected), (PROXY, Outcome::Connect)]);
        let err = connect_with_fallback(&dialer, Some(DIRECT), PROXY, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Connect(DialError::Rejected(_))));
        assert_eq!(dialer.dialed(), vec![DIRECT]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_timeout_falls_back() {
        let dialer = FakeDialer::new([(DIRECT, Outcome::Hang), (PROXY, Outcome::Connect)]);
        let start = tokio::time::Instant::now();
        let conn = connect_with_fallback(&dialer, Some(DIRECT), PROXY, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn, PROXY);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_node_address_uses_proxy() {
        let dialer = FakeDialer::new([(PROXY, Outcome::Connect)]);
        let conn = connect_with_fallback(&dialer, None, PROXY, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn, PROXY);
    }

    fn web_request() -> ExecRequest {
        ExecRequest::new("a1", "web", vec!["/bin/sh".to_string()])
    }

    async fn mount_node_lookup(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/v1/allocation/a1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ID": "a1", "NodeID": "n1"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/node/n1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"ID": "n1", "HTTPAddr": "10.0.0.5:4646"})),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_owning_node_dialed_first() {
        let server = MockServer::start().await;
        mount_node_lookup(&server).await;
        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let request = web_request();

        let proxy = exec_url(&client, &request).unwrap();
        let direct = direct_url(&proxy, "10.0.0.5:4646").unwrap();
        let dialer = FakeDialer::new([
            (direct.to_string(), Outcome::Connect),
            (proxy.to_string(), Outcome::Connect),
        ]);

        let conn = dial_exec(&client, &request, &dialer, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn, direct.as_str());
        assert_eq!(dialer.dialed(), vec![direct.to_string()]);
    }

    #[tokio::test]
    async fn test_unreachable_owning_node_falls_back_to_servers() {
        let server = MockServer::start().await;
        mount_node_lookup(&server).await;
        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let request = web_request();

        let proxy = exec_url(&client, &request).unwrap();
        let direct = direct_url(&proxy, "10.0.0.5:4646").unwrap();
        let dialer = FakeDialer::new([
            (direct.to_string(), Outcome::Unreachable),
            (proxy.to_string(), Outcome::Connect),
        ]);

        let conn = dial_exec(&client, &request, &dialer, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn, proxy.as_str());
        assert_eq!(dialer.dialed(), vec![direct.to_string(), proxy.to_string()]);
    }

    #[tokio::test]
    async fn test_failed_node_lookup_uses_servers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/allocation/a1"))
            .respond_with(ResponseTemplate::new(404).set_body_string("alloc not found"))
            .mount(&server)
            .await;
        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let request = web_request();

        assert_eq!(resolve_node_address(&client, &request).await, None);

        let proxy = exec_url(&client, &request).unwrap();
        let dialer = FakeDialer::new([(proxy.to_string(), Outcome::Connect)]);
        let conn = dial_exec(&client, &request, &dialer, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(conn, proxy.as_str());
        assert_eq!(dialer.dialed(), vec![proxy.to_string()]);
    }

    #[tokio::test]
    async fn test_explicit_node_address_skips_lookup() {
        let server = MockServer::start().await;
        let client = Client::new(Config::default().with_address(server.uri())).unwrap();
        let request = web_request().node_address("10.0.0.9:4646");

        let proxy = exec_url(&client, &request).unwrap();
        let direct = direct_url(&proxy, "10.0.0.9:4646").unwrap();
        let dialer = FakeDialer::new([(direct.to_string(), Outcome::Connect)]);
        dial_exec(&client, &request, &dialer, DEFAULT_DIRECT_CONNECT_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(dialer.dialed(), vec![direct.to_string()]);
        assert!(server.received_requests().await.unwrap().is_empty());
    }

    #[test]
    fn test_exec_url() {
        let client = Client::new(
            Config::default()
                .with_address("https://nomad.example:4646")
                .with_namespace("prod"),
        )
        .unwrap();
        let request = ExecRequest::new(
            "5f2c",
            "web",
            vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()],
        )
        .tty(true);

        let url = exec_url(&client, &request).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), "/v1/client/allocation/5f2c/exec");
        let pairs: HashMap<String, String> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs["task"], "web");
        assert_eq!(pairs["tty"], "true");
        assert_eq!(pairs["namespace"], "prod");
        assert_eq!(pairs["command"], r#"["/bin/sh","-c","echo hi"]"#);
    }

    #[test]
    fn test_direct_url_keeps_path_and_query() {
        let proxy = Url::parse("ws://127.0.0.1:4646/v1/client/allocation/a/exec?task=web").unwrap();
        let url = direct_url(&proxy, "10.0.0.5:4646").unwrap();
        assert_eq!(url.as_str(), "ws://10.0.0.5:4646/v1/client/allocation/a/exec?task=web");

        let url = direct_url(&proxy, "https://10.0.0.5:4646").unwrap();
        assert_eq!(url.scheme(), "wss");
    }

    #[test]
    fn test_gateway_errors_are_unreachable() {
        let response = |code: u16| {
            tungstenite::http::Response::builder()
                .status(code)
                .body(None)
                .unwrap()
        };
        assert!(classify(tungstenite::Error::Http(response(503).into())).is_node_unreachable());
        assert!(!classify(tungstenite::Error::Http(response(403).into())).is_node_unreachable());
        assert!(
            classify(tungstenite::Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused
            )))
            .is_node_unreachable()
        );
    }
}
