//! HTTP request executor.

use std::{sync::Arc, time::Instant};

use nomad_stream_core::retry;
use reqwest::{
    Method, RequestBuilder, Response, Url,
    header::{HeaderName, HeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::sync::CancellationToken;

use crate::{
    Config,
    error::ClientError,
    request::{QueryMeta, QueryOptions, WriteMeta, WriteOptions},
};

/// Header carrying the ACL token.
pub const TOKEN_HEADER: &str = "X-Nomad-Token";

/// HTTP API client.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    config: Arc<Config>,
}

impl Client {
    /// Create a new client.
    ///
    /// # Errors
    /// Returns error if the address is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(config: Config) -> Result<Self, ClientError> {
        Url::parse(config.base_address())
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", config.address)))?;
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a URL for `path` with the configured region/namespace and `params`.
    ///
    /// Per-request pairs override the configured ones.
    ///
    /// # Errors
    /// Returns error if the resulting URL is invalid.
    pub fn url(&self, path: &str, params: &[(String, String)]) -> Result<Url, ClientError> {
        let raw = format!("{}{path}", self.config.base_address());
        let mut url = Url::parse(&raw).map_err(|e| ClientError::InvalidUrl(format!("{raw}: {e}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            let overridden = |key: &str| params.iter().any(|(k, _)| k == key);
            if let Some(region) = &self.config.region {
                if !overridden("region") {
                    pairs.append_pair("region", region);
                }
            }
            if let Some(namespace) = &self.config.namespace {
                if !overridden("namespace") {
                    pairs.append_pair("namespace", namespace);
                }
            }
            for (key, value) in params {
                pairs.append_pair(key, value);
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }
        Ok(url)
    }

    /// Headers every request carries: configured headers plus the token.
    ///
    /// # Errors
    /// Returns error if a header name or value is invalid.
    pub fn default_headers(
        &self,
        auth_token: Option<&str>,
        extra: &[(String, String)],
    ) -> Result<Vec<(HeaderName, HeaderValue)>, ClientError> {
        let mut headers = Vec::new();
        let configured = self.config.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        let requested = extra.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        for (name, value) in configured.chain(requested) {
            headers.push(header(name, value)?);
        }
        if let Some(token) = auth_token.or(self.config.secret_id.as_deref()) {
            headers.push(header(TOKEN_HEADER, token)?);
        }
        Ok(headers)
    }

    fn request(
        &self,
        method: Method,
        url: Url,
        auth_token: Option<&str>,
        extra_headers: &[(String, String)],
        timeout: bool,
    ) -> Result<RequestBuilder, ClientError> {
        let mut builder = self.http.request(method, url);
        for (name, value) in self.default_headers(auth_token, extra_headers)? {
            builder = builder.header(name, value);
        }
        if timeout {
            if let Some(timeout) = self.config.timeout {
                builder = builder.timeout(timeout);
            }
        }
        Ok(builder)
    }

    /// Perform a GET and decode the JSON response.
    ///
    /// # Errors
    /// Returns error on transport failure, a non-2xx status, or a decode failure.
    pub async fn query<T: DeserializeOwned>(
        &self,
        path: &str,
        q: &QueryOptions,
    ) -> Result<(T, QueryMeta), ClientError> {
        let url = self.url(path, &q.query_pairs())?;
        let start = Instant::now();
        let response = self
            .request(Method::GET, url, q.auth_token.as_deref(), &q.headers, true)?
            .send()
            .await?;
        let response = require_ok(response).await?;
        let meta = QueryMeta::from_headers(response.headers(), start.elapsed());
        let body = response.bytes().await?;
        Ok((serde_json::from_slice(&body)?, meta))
    }

    /// Perform a PUT with a JSON body and decode the response.
    ///
    /// An empty response body decodes as JSON `null`, so `O = ()` works
    /// for endpoints that return nothing.
    ///
    /// # Errors
    /// Returns error on transport failure, a non-2xx status, or a decode failure.
    pub async fn put<I, O>(
        &self,
        path: &str,
        body: &I,
        w: &WriteOptions,
    ) -> Result<(O, WriteMeta), ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.write(Method::PUT, path, Some(serde_json::to_vec(body)?), w)
            .await
    }

    /// Perform a DELETE and decode the response.
    ///
    /// # Errors
    /// Returns error on transport failure, a non-2xx status, or a decode failure.
    pub async fn delete<O: DeserializeOwned>(
        &self,
        path: &str,
        w: &WriteOptions,
    ) -> Result<(O, WriteMeta), ClientError> {
        self.write(Method::DELETE, path, None, w).await
    }

    async fn write<O: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
        w: &WriteOptions,
    ) -> Result<(O, WriteMeta), ClientError> {
        let url = self.url(path, &w.query_pairs())?;
        let start = Instant::now();
        let mut builder = self.request(method, url, w.auth_token.as_deref(), &w.headers, true)?;
        if let Some(body) = body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }
        let response = require_ok(builder.send().await?).await?;
        let meta = WriteMeta::from_headers(response.headers(), start.elapsed());
        let body = response.bytes().await?;
        let body: &[u8] = if body.is_empty() { b"null" } else { &body };
        Ok((serde_json::from_slice(body)?, meta))
    }

    /// PUT with the configured backoff policy.
    ///
    /// Retries only when the server answered 429 or a 5xx other than 501.
    ///
    /// # Errors
    /// Returns the last attempt's error, or [`ClientError::Cancelled`] if
    /// `cancel` fires while waiting between attempts.
    pub async fn retry_put<I, O>(
        &self,
        cancel: &CancellationToken,
        path: &str,
        body: &I,
        w: &WriteOptions,
    ) -> Result<(O, WriteMeta), ClientError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)?;
        retry(&self.config.retry, cancel, |attempt| {
            tracing::trace!(path, attempt, "PUT attempt");
            self.write(Method::PUT, path, Some(payload.clone()), w)
        })
        .await
    }

    /// Open a long-lived GET whose body is consumed as a stream.
    ///
    /// No request timeout is applied. A key in `params` replaces the same
    /// key from `q`, so `q.wait_index` never doubles the stream's `index`.
    pub(crate) async fn stream_get(
        &self,
        path: &str,
        q: &QueryOptions,
        params: Vec<(String, String)>,
    ) -> Result<Response, ClientError> {
        let mut pairs = q.query_pairs();
        pairs.retain(|(key, _)| !params.iter().any(|(k, _)| k == key));
        pairs.extend(params);
        let url = self.url(path, &pairs)?;
        let response = self
            .request(Method::GET, url, q.auth_token.as_deref(), &q.headers, false)?
            .send()
            .await?;
        require_ok(response).await
    }
}

fn header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ClientError> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ClientError::InvalidHeader(format!("{name}: {e}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|e| ClientError::InvalidHeader(format!("{name}: {e}")))?;
    Ok((name, value))
}

async fn require_ok(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::UnexpectedResponse { status, body })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nomad_stream_core::RetryOptions;
    use serde_json::{Value, json};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, header, method, path, query_param},
    };

    use super::*;

    fn client(server: &MockServer, retry: RetryOptions) -> Client {
        Client::new(
            Config::default()
                .with_address(server.uri())
                .with_secret_id("token-1")
                .with_region("global")
                .with_retry(retry),
        )
        .unwrap()
    }

    fn fast_retry() -> RetryOptions {
        RetryOptions::new()
            .with_max_retries(10)
            .with_delay_base(Duration::from_millis(10))
            .with_max_backoff_delay(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn test_query_sends_token_and_reads_meta() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/jobs"))
            .and(query_param("region", "global"))
            .and(header(TOKEN_HEADER, "token-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Nomad-Index", "19")
                    .set_body_json(json!([{"ID": "example"}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let (jobs, meta): (Vec<Value>, _) = client(&server, fast_retry())
            .query("/v1/jobs", &QueryOptions::default())
            .await
            .unwrap();

        assert_eq!(jobs[0]["ID"], "example");
        assert_eq!(meta.last_index, 19);
    }

    #[tokio::test]
    async fn test_put_with_empty_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/var/app"))
            .and(body_json(json!({"Items": {"k": "v"}})))
            .respond_with(ResponseTemplate::new(200).insert_header("X-Nomad-Index", "5"))
            .mount(&server)
            .await;

        let ((), meta) = client(&server, fast_retry())
            .put("/v1/var/app", &json!({"Items": {"k": "v"}}), &WriteOptions::default())
            .await
            .unwrap();
        assert_eq!(meta.last_index, 5);
    }

    #[tokio::test]
    async fn test_retry_put_stops_at_first_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/v1/job/example"))
            .respond_with(ResponseTemplate::new(503).set_body_string("no leader"))
            .up_to_n_times(6)
            .expect(6)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v1/job/example"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Nomad-Index", "42")
                    .set_body_json(json!({"EvalID": "e1"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let started = Instant::now();
        let (out, meta): (Value, _) = client(&server, fast_retry())
            .retry_put(
                &CancellationToken::new(),
                "/v1/job/example",
                &json!({"Job": {"ID": "example"}}),
                &WriteOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(out["EvalID"], "e1");
        assert_eq!(meta.last_index, 42);
        // 10 + 20 + 40 + 80 + 100 + 100 ms of backoff before the 7th call.
        assert!(started.elapsed() >= Duration::from_millis(350));
        assert_eq!(server.received_requests().await.unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_retry_put_does_not_retry_client_errors() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid job"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, fast_retry())
            .retry_put::<_, Value>(
                &CancellationToken::new(),
                "/v1/jobs",
                &json!({}),
                &WriteOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(reqwest::StatusCode::BAD_REQUEST));
        assert!(err.to_string().contains("invalid job"));
    }

    #[tokio::test]
    async fn test_retry_put_returns_last_error_when_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let retry = fast_retry().with_max_retries(3);
        let err = client(&server, retry)
            .retry_put::<_, Value>(
                &CancellationToken::new(),
                "/v1/jobs",
                &json!({}),
                &WriteOptions::default(),
            )
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(reqwest::StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn test_url_request_params_override_config() {
        let client = Client::new(
            Config::default()
                .with_address("http://127.0.0.1:4646/")
                .with_region("global"),
        )
        .unwrap();
        let url = client
            .url("/v1/jobs", &[("region".into(), "eu".into())])
            .unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:4646/v1/jobs?region=eu");

        let bare = Client::new(Config::default()).unwrap();
        let url = bare.url("/v1/agent/self", &[]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:4646/v1/agent/self");
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = Client::new(Config::default().with_address("not a url")).unwrap_err();
        assert!(matches!(err, ClientError::InvalidUrl(_)));
    }
}
