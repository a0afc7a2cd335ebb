//! Structured API error decoding.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{HttpClient, HttpClientError};

/// Free-form data attached to an API error.
pub type ApiErrorData = HashMap<String, Value>;

/// The error wire shape: `{"error": ..., "code": ..., "data": ...}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(rename = "error")]
    pub message: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ApiErrorData>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ApiError {}

/// A non-2xx reply from an API endpoint, with the decoded error when the
/// response body carried one.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ApiRequestError {
    pub status: reqwest::StatusCode,
    pub api_error: Option<ApiError>,
    pub message: String,
}

/// A thin extension of [`HttpClient`] for endpoints replying with
/// [`ApiError`] bodies.
pub struct ApiClient {
    client: Arc<HttpClient>,
}

impl ApiClient {
    pub fn new(client: Arc<HttpClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Send a request; non-2xx replies with an `application/json` body are
    /// decoded into an [`ApiError`] and attached to the returned error.
    pub async fn send_request(
        &self,
        method: Method,
        url: Url,
        header: Option<&HashMap<String, String>>,
        body: Option<Vec<u8>>,
    ) -> Result<reqwest::Response, HttpClientError> {
        let mut builder = self.client.request(method, url);

        if let Some(header) = header {
            for (name, value) in header {
                builder = builder.header(name, value);
            }
        }

        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = self.client.execute(builder.build()?).await?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.decode_error(response).await.into());
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

    async fn decode_error(&self, response: reqwest::Response) -> ApiRequestError {
        let status = response.status();

        let mut err = ApiRequestError {
            status,
            api_error: None,
            message: format!("request failed with status {}", status.as_u16()),
        };

        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        match response.bytes().await {
            Ok(body) => {
                if is_json {
                    match serde_json::from_slice::<ApiError>(&body) {
                        Ok(api_error) => {
                            err.message.push_str(": ");
                            err.message.push_str(&api_error.message);
                            err.api_error = Some(api_error);
                        }
                        Err(decode_err) => {
                            tracing::error!("cannot decode api error response: {decode_err}");
                        }
                    }
                }

                if err.api_error.is_none() && !body.is_empty() {
                    err.message.push_str(": ");
                    err.message.push_str(&String::from_utf8_lossy(&body));
                }
            }
            Err(read_err) => tracing::error!("cannot read response body: {read_err}"),
        }

        err
    }
}
