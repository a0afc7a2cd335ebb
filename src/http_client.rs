//! Pooled outgoing HTTP.
//!
//! [`HttpClient`] wraps the platform connection pool with fixed timeouts,
//! optional per-request logging, configured default headers and optional
//! TLS public-key pinning. [`ApiClient`] layers structured error decoding
//! on top for endpoints speaking the [`ApiError`] wire shape.

mod api;
mod tls;

pub use api::{ApiClient, ApiError, ApiErrorData, ApiRequestError};
pub use tls::{TlsClientCfg, TlsError};

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::{Checker, Object};
use crate::units::format_elapsed;

/// End-to-end request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection establishment timeout.
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Idle connection lifetime.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum idle connections kept per host.
const MAX_IDLE_CONNECTIONS: usize = 100;

/// Errors from client construction and request execution.
#[derive(Debug, Error)]
pub enum HttpClientError {
    /// The underlying client could not be built.
    #[error("cannot build http client: {0}")]
    Build(#[source] reqwest::Error),

    /// A configured default header is not a valid header name or value.
    #[error("invalid header {0:?}")]
    InvalidHeader(String),

    /// TLS configuration failure.
    #[error(transparent)]
    Tls(#[from] TlsError),

    /// Request could not be created or sent.
    #[error("cannot send request: {0}")]
    Send(#[from] reqwest::Error),

    /// The request body could not be encoded.
    #[error("cannot encode request body: {0}")]
    EncodeBody(#[source] serde_json::Error),

    /// The server replied with a non-2xx status.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// The server replied with a non-2xx status carrying a structured error.
    #[error(transparent)]
    Api(#[from] ApiRequestError),
}

/// A non-2xx reply, with the raw response body folded into the message.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct RequestError {
    pub status: StatusCode,
    pub message: String,
}

/// Client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpClientCfg {
    #[serde(default)]
    pub log_requests: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsClientCfg>,

    /// Headers added to every outgoing request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<HashMap<String, Vec<String>>>,
}

impl Object for HttpClientCfg {
    fn check(&self, c: &mut Checker) {
        c.check_optional_object("tls", self.tls.as_ref());
    }
}

/// A pooled outgoing-request factory.
pub struct HttpClient {
    cfg: HttpClientCfg,
    inner: reqwest::Client,
}

impl HttpClient {
    /// Build a client from its configuration.
    ///
    /// Standard proxy environment variables are honored by the underlying
    /// pool.
    pub fn new(cfg: HttpClientCfg) -> Result<Self, HttpClientError> {
        let mut builder = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(DIAL_TIMEOUT)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNECTIONS);

        if let Some(header) = &cfg.header {
            builder = builder.default_headers(default_headers(header)?);
        }

        if let Some(tls_cfg) = &cfg.tls {
            builder = builder.use_preconfigured_tls(tls::client_config(tls_cfg)?);
        }

        let inner = builder.build().map_err(HttpClientError::Build)?;

        Ok(Self { cfg, inner })
    }

    /// Start building a request going through this client's pool.
    pub fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        self.inner.request(method, url)
    }

    /// Execute a prepared request, logging one line per attempt when
    /// `log_requests` is set.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, HttpClientError> {
        let method = request.method().clone();
        let url = request.url().clone();

        let start = Instant::now();
        let result = self.inner.execute(request).await;

        if self.cfg.log_requests {
            if let Ok(response) = &result {
                tracing::info!(
                    "{} {} {} {}",
                    method,
                    url,
                    response.status().as_u16(),
                    format_elapsed(start.elapsed()),
                );
            }
        }

        Ok(result?)
    }

    /// Send a request and fail on any non-2xx reply, attaching the raw
    /// response body to the error message.
    pub async fn send_request(
        &self,
        method: Method,
        url: Url,
        header: Option<&HashMap<String, String>>,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, HttpClientError> {
        let mut builder = self.request(method, url);

        if let Some(header) = header {
            for (name, value) in header {
                builder = builder.header(name, value);
            }
        }

        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = self.execute(builder.build()?).await?;

        let status = response.status();
        if !status.is_success() {
            let mut message = format!("request failed with status {}", status.as_u16());

            match response.text().await {
                Ok(body) if !body.is_empty() => {
                    message.push_str(": ");
                    message.push_str(&body);
                }
                Ok(_) => {}
                Err(err) => tracing::error!("cannot read response body: {err}"),
            }

            return Err(RequestError { status, message }.into());
        }

        Ok(response)
    }

    /// Send a request with a JSON body.
    pub async fn send_json_request<T: Serialize>(
        &self,
        method: Method,
        url: Url,
        header: Option<&HashMap<String, String>>,
        value: Option<&T>,
    ) -> Result<reqwest::Response, HttpClientError> {
        let body = match value {
            Some(value) => {
                Some(serde_json::to_vec(value).map_err(HttpClientError::EncodeBody)?)
            }
            None => None,
        };

        let mut header = header.cloned().unwrap_or_default();
        header
            .entry("Content-Type".to_string())
            .or_insert_with(|| "application/json".to_string());

        self.send_request(method, url, Some(&header), body).await
    }

    /// Release pooled idle connections.
    ///
    /// The pool closes its idle connections when the last handle is dropped;
    /// this is the explicit hook called by the daemon at terminate time.
    pub fn terminate(&self) {}
}

fn default_headers(header: &HashMap<String, Vec<String>>) -> Result<HeaderMap, HttpClientError> {
    let mut map = HeaderMap::new();

    for (name, values) in header {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpClientError::InvalidHeader(name.clone()))?;

        for value in values {
            let header_value = HeaderValue::from_str(value)
                .map_err(|_| HttpClientError::InvalidHeader(name.clone()))?;

            map.append(header_name.clone(), header_value);
        }
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers() {
        let header = HashMap::from([
            ("X-Api-Key".to_string(), vec!["secret".to_string()]),
            (
                "Accept".to_string(),
                vec!["text/plain".to_string(), "application/json".to_string()],
            ),
        ]);

        let map = default_headers(&header).unwrap();
        assert_eq!(map.get_all("accept").iter().count(), 2);
        assert_eq!(map.get("x-api-key").unwrap(), "secret");

        let invalid = HashMap::from([("bad header".to_string(), vec!["x".to_string()])]);
        assert!(default_headers(&invalid).is_err());
    }

    #[test]
    fn test_client_build_defaults() {
        let client = HttpClient::new(HttpClientCfg::default()).unwrap();
        let req = client
            .request(Method::GET, Url::parse("http://localhost:1/x").unwrap())
            .build()
            .unwrap();
        assert_eq!(req.method(), Method::GET);
    }
}
