//! Per-request handler state and reply methods.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, RawPathParams};
use axum::http::header::{CONTENT_TYPE, LOCATION};
use axum::http::{request::Parts, HeaderMap, Method, Request, StatusCode};
use axum::response::Response;
use axum::RequestExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::check::{Checker, Object, ValidationErrors};
use crate::http_client::{ApiError, ApiErrorData};
use crate::ksuid::Ksuid;
use crate::server::ServerShared;
use crate::units::{format_body_size, format_elapsed};

/// Records the reply of one in-flight request: final status and cumulative
/// body byte count, both zero until a reply is produced, plus the chosen
/// error code.
#[derive(Debug, Clone, Default)]
pub struct RequestRecord {
    inner: Arc<Mutex<RecordInner>>,
}

#[derive(Debug, Default)]
struct RecordInner {
    status: u16,
    body_size: u64,
    error_code: Option<String>,
}

impl RequestRecord {
    pub fn set_status(&self, status: u16) {
        self.inner.lock().expect("record lock poisoned").status = status;
    }

    pub fn add_body_size(&self, size: u64) {
        self.inner.lock().expect("record lock poisoned").body_size += size;
    }

    pub fn set_error_code(&self, code: &str) {
        self.inner.lock().expect("record lock poisoned").error_code = Some(code.to_string());
    }

    pub fn snapshot(&self) -> (u16, u64, Option<String>) {
        let inner = self.inner.lock().expect("record lock poisoned");
        (inner.status, inner.body_size, inner.error_code.clone())
    }
}

/// Request-scoped values created before dispatch, shared between the
/// pipeline middleware and the handler.
#[derive(Debug, Clone)]
pub(crate) struct RequestScope {
    pub request_id: String,
    pub client_address: String,
    pub start_time: Instant,
    pub record: RequestRecord,
}

impl RequestScope {
    pub fn new(headers: &HeaderMap, remote_addr: Option<std::net::SocketAddr>) -> Self {
        let request_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| Ksuid::generate().to_string());

        Self {
            request_id,
            client_address: resolve_client_address(headers, remote_addr),
            start_time: Instant::now(),
            record: RequestRecord::default(),
        }
    }

    /// Emit the one request log line, after the handler returned or
    /// panicked.
    pub fn log_request(&self, method: &Method, path: &str, response: &Response) {
        let elapsed = self.start_time.elapsed();
        let (mut status, body_size, error_code) = self.record.snapshot();

        if status == 0 {
            // The reply was produced outside the handler surface; the
            // framework will still write this status.
            status = response.status().as_u16();
        }

        let status_string = if status == 0 {
            "-".to_string()
        } else {
            status.to_string()
        };

        tracing::info!(
            request_id = %self.request_id,
            address = %self.client_address,
            time = elapsed.as_micros() as u64,
            response_size = body_size,
            status,
            error = error_code.as_deref().unwrap_or(""),
            "{} {} {} {} {}",
            method,
            path,
            status_string,
            format_body_size(body_size),
            format_elapsed(elapsed),
        );
    }
}

/// Client address resolution: `X-Real-IP`, then the first entry of
/// `X-Forwarded-For`, then the host of the peer address. Empty when nothing
/// parses.
pub(crate) fn resolve_client_address(
    headers: &HeaderMap,
    remote_addr: Option<std::net::SocketAddr>,
) -> String {
    if let Some(value) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return value.to_string();
        }
    }

    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if !value.is_empty() {
            return value
                .split(',')
                .next()
                .unwrap_or_default()
                .trim()
                .to_string();
        }
    }

    remote_addr
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default()
}

/// Per-request handler, bound to one in-flight request.
pub struct Handler {
    shared: Arc<ServerShared>,

    pub pattern: String,
    pub method: Method,
    pub request_id: String,
    pub client_address: String,
    pub start_time: Instant,

    parts: Option<Parts>,
    body: Option<Body>,
    path_params: Vec<(String, String)>,
    query: Vec<(String, String)>,

    record: RequestRecord,
}

impl Handler {
    /// Build the handler for a dispatched request. The request scope was
    /// attached by the pipeline middleware; a fresh one is synthesized when
    /// the handler is used outside of it (tests).
    pub(crate) async fn from_request(
        shared: Arc<ServerShared>,
        pattern: String,
        method: Method,
        mut request: Request<Body>,
    ) -> Self {
        let scope = match request.extensions().get::<RequestScope>() {
            Some(scope) => scope.clone(),
            None => {
                let remote = request
                    .extensions()
                    .get::<ConnectInfo<std::net::SocketAddr>>()
                    .map(|info| info.0);
                RequestScope::new(request.headers(), remote)
            }
        };

        let path_params = match request.extract_parts::<RawPathParams>().await {
            Ok(params) => params
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            Err(_) => Vec::new(),
        };

        let query = request
            .uri()
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        let (parts, body) = request.into_parts();

        Self {
            shared,
            pattern,
            method,
            request_id: scope.request_id,
            client_address: scope.client_address,
            start_time: scope.start_time,
            parts: Some(parts),
            body: Some(body),
            path_params,
            query,
            record: scope.record,
        }
    }

    /// Build a request-less handler for the panic reply path.
    pub(crate) fn bare(shared: Arc<ServerShared>, scope: &RequestScope, method: Method) -> Self {
        Self {
            shared,
            pattern: String::new(),
            method,
            request_id: scope.request_id.clone(),
            client_address: scope.client_address.clone(),
            start_time: scope.start_time,
            parts: None,
            body: None,
            path_params: Vec::new(),
            query: Vec::new(),
            record: scope.record.clone(),
        }
    }

    pub fn route_variable(&self, name: &str) -> Option<&str> {
        self.path_params
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_query_parameter(&self, name: &str) -> bool {
        self.query.iter().any(|(param, _)| param == name)
    }

    pub fn query_parameter(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.parts
            .as_ref()
            .and_then(|parts| parts.headers.get(name))
            .and_then(|value| value.to_str().ok())
    }

    /// Read the whole request body.
    ///
    /// # Errors
    /// On read failure the error reply is already built; return it as the
    /// response.
    pub async fn request_data(&mut self) -> Result<Bytes, Response> {
        let Some(body) = self.body.take() else {
            return Ok(Bytes::new());
        };

        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(data) => Ok(data),
            Err(err) => Err(self.reply_internal_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("cannot read request body: {err}"),
            )),
        }
    }

    /// Read and decode a JSON request body.
    pub async fn json_request_data<T: DeserializeOwned>(&mut self) -> Result<T, Response> {
        let data = self.request_data().await?;

        serde_json::from_slice(&data).map_err(|err| {
            self.reply_error(
                StatusCode::BAD_REQUEST,
                "invalid_request_body",
                &format!("invalid request body: {err}"),
            )
        })
    }

    /// Read, decode and validate a JSON request body.
    pub async fn json_request_object<T: DeserializeOwned + Object>(
        &mut self,
    ) -> Result<T, Response> {
        let obj: T = self.json_request_data().await?;

        let mut checker = Checker::new();
        obj.check(&mut checker);

        match checker.into_result() {
            Ok(()) => Ok(obj),
            Err(errors) => Err(self.reply_request_body_validation_errors(&errors)),
        }
    }

    /// Set the status and stream a body.
    pub fn reply(&self, status: StatusCode, body: Body) -> Response {
        self.record.set_status(status.as_u16());

        if let Some(size) = http_body::Body::size_hint(&body).exact() {
            self.record.add_body_size(size);
        }

        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
    }

    pub fn reply_empty(&self, status: StatusCode) -> Response {
        self.reply(status, Body::empty())
    }

    pub fn reply_redirect(&self, status: StatusCode, uri: &str) -> Response {
        let mut response = self.reply_empty(status);

        match uri.parse() {
            Ok(value) => {
                response.headers_mut().insert(LOCATION, value);
            }
            Err(_) => tracing::error!("invalid redirection uri {uri:?}"),
        }

        response
    }

    /// Reply with a pretty-printed JSON body. Encoding failure degrades to
    /// an empty 500.
    pub fn reply_json<T: Serialize>(&self, status: StatusCode, value: &T) -> Response {
        let mut data = match serde_json::to_vec_pretty(value) {
            Ok(data) => data,
            Err(err) => {
                tracing::error!("cannot encode json response: {err}");
                return self.reply_empty(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };
        data.push(b'\n');

        let mut response = self.reply(status, Body::from(data));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, "application/json".parse().expect("static header value"));
        response
    }

    /// Reply with a structured error, deferring to the configured error
    /// handler when the server has one.
    pub fn reply_error(&self, status: StatusCode, code: &str, message: &str) -> Response {
        self.record.set_error_code(code);
        self.handle_error(status, code, message, None)
    }

    /// Same as [`Handler::reply_error`] with attached data.
    pub fn reply_error_data(
        &self,
        status: StatusCode,
        code: &str,
        data: ApiErrorData,
        message: &str,
    ) -> Response {
        self.record.set_error_code(code);
        self.handle_error(status, code, message, Some(data))
    }

    /// Reply to a failed request body validation.
    pub fn reply_request_body_validation_errors(&self, errors: &ValidationErrors) -> Response {
        let data = ApiErrorData::from([(
            "validation_errors".to_string(),
            serde_json::to_value(errors).unwrap_or_default(),
        )]);

        self.reply_error_data(
            StatusCode::BAD_REQUEST,
            "invalid_request_body",
            data,
            &format!("invalid request body:\n{errors}"),
        )
    }

    /// Log the full error detail and reply with `internal_error`. The
    /// user-visible message carries the detail only when the server opted
    /// out of hiding internal errors.
    pub fn reply_internal_error(&self, status: StatusCode, message: &str) -> Response {
        tracing::error!(request_id = %self.request_id, "internal error: {message}");

        let user_message = if self.shared.hide_internal_errors {
            "internal error"
        } else {
            message
        };

        self.reply_error(status, "internal_error", user_message)
    }

    pub fn reply_not_implemented(&self, feature: &str) -> Response {
        self.reply_error(
            StatusCode::NOT_IMPLEMENTED,
            "not_implemented",
            &format!("{feature} not implemented"),
        )
    }

    fn handle_error(
        &self,
        status: StatusCode,
        code: &str,
        message: &str,
        data: Option<ApiErrorData>,
    ) -> Response {
        if let Some(error_handler) = &self.shared.error_handler {
            return error_handler(self, status, code, message, data);
        }

        self.reply_json(
            status,
            &ApiError {
                message: message.to_string(),
                code: code.to_string(),
                data,
            },
        )
    }
}
