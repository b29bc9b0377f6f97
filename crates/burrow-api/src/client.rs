//! Resilient remote-call layer.
//!
//! A deliberately small HTTP client built straight on hyper + rustls,
//! shared by the instance and mesh clients. Every JSON call goes through
//! the same policy:
//!
//! - up to [`RETRY_MAX_ATTEMPTS`] attempts, exponential backoff starting
//!   at [`RETRY_INITIAL_DELAY`] and doubling each retry
//! - 2xx responses are decoded; a 2xx body that fails to decode is an
//!   [`ApiError::InvalidResponse`] and is not retried
//! - 401/403 map to [`ApiError::AuthenticationFailed`] and short-circuit
//!   the retry budget (retrying a rejected credential cannot succeed)
//! - remaining 4xx/5xx map to [`ApiError::Server`] carrying the body text
//! - transport failures map to [`ApiError::Network`] and are retried

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};
use url::Url;

/// Total attempts per logical call, including the first.
pub const RETRY_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the second attempt; doubles each retry after that.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const CLIENT_USER_AGENT: &str = "burrow/0.1";

/// Remote-call errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("server error: {0}")]
    Server(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Transient failures are retried; a rejected credential or an
    /// undecodable success body cannot improve on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_) | ApiError::Timeout | ApiError::Server(_)
        )
    }
}

/// How requests authenticate to the remote service.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    /// No credential attached (public endpoints, reachability probes).
    None,
    /// Static key sent as an `x-api-key` header (instance provisioner).
    ApiKey(String),
    /// Bearer token in the `Authorization` header (mesh coordinator).
    Bearer(String),
}

/// Retry `op` with exponential backoff until it succeeds, exhausts
/// [`RETRY_MAX_ATTEMPTS`], or fails non-retryably. The last error
/// encountered is the one surfaced.
pub async fn with_retry<T, Fut>(label: &str, mut op: impl FnMut() -> Fut) -> Result<T, ApiError>
where
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() || attempt >= RETRY_MAX_ATTEMPTS {
                    return Err(err);
                }
                let delay = RETRY_INITIAL_DELAY * 2u32.pow(attempt - 1);
                warn!(
                    "{label} failed (attempt {attempt}/{RETRY_MAX_ATTEMPTS}), \
                     retrying in {delay:?}: {err}"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Map a raw response to either its body (2xx) or an error class.
fn classify_response(status: StatusCode, body: Vec<u8>) -> Result<Vec<u8>, ApiError> {
    match status {
        s if s.is_success() => Ok(body),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiError::AuthenticationFailed),
        s if s.is_client_error() || s.is_server_error() => {
            Err(ApiError::Server(String::from_utf8_lossy(&body).into_owned()))
        }
        s => Err(ApiError::InvalidResponse(format!("unexpected status {s}"))),
    }
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
}

/// Minimal HTTP/1.1 client over rustls with uniform retry semantics.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    auth: AuthScheme,
    timeout: Duration,
}

impl ApiClient {
    /// Create a client rooted at `base_url`. The base path is normalized
    /// to end with `/` so relative endpoint paths join underneath it.
    pub fn new(mut base_url: Url, auth: AuthScheme) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            auth,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// GET an endpoint and decode its JSON body, with retries.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        with_retry(path, || self.execute_json(Method::GET, path, None)).await
    }

    /// POST a JSON body (or nothing) and decode the response, with retries.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ApiError> {
        let encoded = match body {
            Some(b) => {
                Some(serde_json::to_vec(b).map_err(|e| ApiError::InvalidResponse(e.to_string()))?)
            }
            None => None,
        };
        with_retry(path, || {
            self.execute_json(Method::POST, path, encoded.clone())
        })
        .await
    }

    /// Single-attempt GET that only reports the status code. Used by
    /// health polls, which carry their own outer polling loop and a
    /// shorter timeout.
    pub async fn get_status(&self, path: &str, timeout: Duration) -> Result<StatusCode, ApiError> {
        let url = self.endpoint(path)?;
        let (status, _) = tokio::time::timeout(timeout, self.send(Method::GET, &url, None))
            .await
            .map_err(|_| ApiError::Timeout)??;
        Ok(status)
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<T, ApiError> {
        let url = self.endpoint(path)?;
        let (status, raw) = tokio::time::timeout(
            self.timeout,
            self.send(method, &url, body.as_deref()),
        )
        .await
        .map_err(|_| ApiError::Timeout)??;

        debug!("{} -> {status}", url.path());
        let raw = classify_response(status, raw)?;
        decode_body(&raw)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path)
            .map_err(|e| ApiError::InvalidResponse(format!("invalid endpoint path: {e}")))
    }

    /// One raw request/response exchange. A fresh connection per call;
    /// call volume here is a handful of requests per connect attempt, so
    /// pooling buys nothing.
    async fn send(
        &self,
        method: Method,
        url: &Url,
        body: Option<&[u8]>,
    ) -> Result<(StatusCode, Vec<u8>), ApiError> {
        let host = url
            .host_str()
            .ok_or_else(|| ApiError::InvalidResponse("URL has no host".into()))?;
        let port = url.port_or_known_default().unwrap_or(443);
        let is_https = url.scheme() == "https";

        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        let target = &url[url::Position::BeforePath..];
        let mut builder = Request::builder()
            .method(method)
            .uri(target)
            .header(HOST, host)
            .header(USER_AGENT, CLIENT_USER_AGENT);
        builder = match &self.auth {
            AuthScheme::None => builder,
            AuthScheme::ApiKey(key) => builder.header("x-api-key", key),
            AuthScheme::Bearer(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
        };
        let request = match body {
            Some(bytes) => builder
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::copy_from_slice(bytes))),
            None => builder.body(Full::new(Bytes::new())),
        }
        .map_err(|e| ApiError::Network(e.to_string()))?;

        let response = if is_https {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls));
            let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                .map_err(|_| ApiError::Network("invalid server name".into()))?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("connection closed: {e}");
                }
            });
            sender.send_request(request).await
        } else {
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| ApiError::Network(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("connection closed: {e}");
                }
            });
            sender.send_request(request).await
        }
        .map_err(|e| ApiError::Network(e.to_string()))?;

        let status = response.status();
        let collected = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;
        Ok((status, collected.to_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sample {
        name: String,
    }

    #[test]
    fn test_success_body_passes_through() {
        let body = br#"{"name":"exit-1"}"#.to_vec();
        let raw = classify_response(StatusCode::OK, body).unwrap();
        let decoded: Sample = decode_body(&raw).unwrap();
        assert_eq!(decoded.name, "exit-1");
    }

    #[test]
    fn test_undecodable_success_is_invalid_response() {
        let raw = classify_response(StatusCode::OK, b"not json".to_vec()).unwrap();
        let result: Result<Sample, _> = decode_body(&raw);
        let err = result.unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_auth_status_codes() {
        for status in [StatusCode::UNAUTHORIZED, StatusCode::FORBIDDEN] {
            let err = classify_response(status, Vec::new()).unwrap_err();
            assert!(matches!(err, ApiError::AuthenticationFailed));
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_client_and_server_errors_carry_body() {
        let err = classify_response(StatusCode::NOT_FOUND, b"no such instance".to_vec())
            .unwrap_err();
        assert!(matches!(err, ApiError::Server(ref m) if m == "no such instance"));

        let err = classify_response(StatusCode::BAD_GATEWAY, b"upstream down".to_vec())
            .unwrap_err();
        assert!(matches!(err, ApiError::Server(ref m) if m == "upstream down"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_unexpected_status_is_invalid_response() {
        let err = classify_response(StatusCode::PERMANENT_REDIRECT, Vec::new()).unwrap_err();
        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_makes_three_attempts_with_backoff() {
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;
        let result: Result<(), ApiError> = with_retry("op", || {
            attempts += 1;
            async { Err(ApiError::Network("refused".into())) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::Network(_))));
        assert_eq!(attempts, 3);
        // 1s before the second attempt, 2s before the third.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_short_circuits_non_retryable() {
        let start = tokio::time::Instant::now();
        let mut attempts = 0u32;
        let result: Result<(), ApiError> = with_retry("op", || {
            attempts += 1;
            async { Err(ApiError::AuthenticationFailed) }
        })
        .await;

        assert!(matches!(result, Err(ApiError::AuthenticationFailed)));
        assert_eq!(attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let mut attempts = 0u32;
        let result = with_retry("op", || {
            attempts += 1;
            let outcome = if attempts < 2 {
                Err(ApiError::Server("flaky".into()))
            } else {
                Ok(attempts)
            };
            async move { outcome }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_base_path_normalized() {
        let client = ApiClient::new(
            Url::parse("https://api.example.com/prod").unwrap(),
            AuthScheme::ApiKey("k".into()),
        );
        let url = client.endpoint("instance/start").unwrap();
        assert_eq!(url.as_str(), "https://api.example.com/prod/instance/start");
    }
}
