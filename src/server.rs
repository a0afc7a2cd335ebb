//! HTTP server with a uniform request pipeline.
//!
//! Every request goes through the same middleware: a request scope is
//! created before dispatch (request id, client address, reply record),
//! panics are isolated into `500 internal_error` replies, and exactly one
//! structured log line is emitted per request. Unmatched routes and methods
//! produce uniform error replies.
//!
//! Lifecycle: routes are registered while the server is idle, `start` binds
//! the listener and reports failures synchronously, `stop` drains with a
//! one second graceful budget, `terminate` releases the remaining state.

mod handler;

pub use handler::{Handler, RequestRecord};

use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{on, MethodFilter};
use axum::Router;
use futures::FutureExt;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tower::{Service, ServiceExt};

use crate::check::{Checker, Object};
use crate::http_client::ApiErrorData;
use crate::server::handler::RequestScope;

/// Address used when the configuration leaves it empty.
pub const DEFAULT_ADDRESS: &str = "localhost:8080";

/// Budget for the graceful drain; active requests are aborted afterwards.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(1);

/// Backtraces captured on panic are truncated to this size.
const MAX_BACKTRACE_SIZE: usize = 4096;

/// Server construction and runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("cannot listen on {address:?}: {source}")]
    Listen {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// A TLS certificate or key file could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A TLS file did not contain usable material.
    #[error("cannot load {kind} from {path}")]
    InvalidTlsFile { kind: &'static str, path: PathBuf },

    /// The TLS configuration could not be assembled.
    #[error("cannot build tls configuration: {0}")]
    TlsConfig(#[source] rustls::Error),

    /// The serving loop failed fatally.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Server-side TLS configuration. TLS 1.3 is the minimum accepted version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsServerCfg {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
}

impl Object for TlsServerCfg {
    fn check(&self, c: &mut Checker) {
        c.check_string_not_empty("certificate", &self.certificate.to_string_lossy());
        c.check_string_not_empty("private_key", &self.private_key.to_string_lossy());
    }
}

/// Pluggable error reply construction.
pub type ErrorHandler =
    Arc<dyn Fn(&Handler, StatusCode, &str, &str, Option<ApiErrorData>) -> Response + Send + Sync>;

/// Server configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerCfg {
    #[serde(default)]
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsServerCfg>,

    /// When set, internal error replies never carry failure details.
    #[serde(default)]
    pub hide_internal_errors: bool,

    #[serde(skip)]
    pub error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for ServerCfg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCfg")
            .field("address", &self.address)
            .field("tls", &self.tls)
            .field("hide_internal_errors", &self.hide_internal_errors)
            .field("error_handler", &self.error_handler.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Object for ServerCfg {
    fn check(&self, c: &mut Checker) {
        c.check_string_not_empty("address", &self.address);
        c.check_optional_object("tls", self.tls.as_ref());
    }
}

/// State shared with the request pipeline and every handler.
pub(crate) struct ServerShared {
    pub name: String,
    pub hide_internal_errors: bool,
    pub error_handler: Option<ErrorHandler>,
}

/// One listener and its router.
pub struct Server {
    cfg: ServerCfg,
    shared: Arc<ServerShared>,

    router: Option<Router>,

    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    error_tx: mpsc::Sender<ServerError>,

    serve_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl Server {
    /// Create an idle server; routes can be registered until `start`.
    ///
    /// Fatal serving errors are reported on `error_tx` once the server is
    /// listening.
    pub fn new(name: &str, mut cfg: ServerCfg, error_tx: mpsc::Sender<ServerError>) -> Self {
        if cfg.address.is_empty() {
            cfg.address = DEFAULT_ADDRESS.to_string();
        }

        let shared = Arc::new(ServerShared {
            name: name.to_string(),
            hide_internal_errors: cfg.hide_internal_errors,
            error_handler: cfg.error_handler.clone(),
        });

        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            cfg,
            shared,
            router: Some(Router::new()),
            stop_tx,
            stop_rx,
            error_tx,
            serve_task: None,
            local_addr: None,
        }
    }

    pub fn cfg(&self) -> &ServerCfg {
        &self.cfg
    }

    /// The bound address; set once the server started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Register a route.
    ///
    /// # Panics
    /// Panics when called after `start`, or with a method the router cannot
    /// filter on.
    pub fn route<F, Fut>(&mut self, pattern: &str, method: Method, route_fn: F)
    where
        F: Fn(Handler) -> Fut + Clone + Send + Sync + 'static,
        Fut: std::future::Future<Output = Response> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let pattern_string = pattern.to_string();
        let route_method = method.clone();

        let handler_fn = move |request: Request| {
            let shared = Arc::clone(&shared);
            let pattern = pattern_string.clone();
            let method = route_method.clone();
            let route_fn = route_fn.clone();

            async move {
                let handler = Handler::from_request(shared, pattern, method, request).await;
                route_fn(handler).await
            }
        };

        let filter = MethodFilter::try_from(method).expect("unsupported route method");

        let router = self.router.take().expect("server already started");
        self.router = Some(router.route(pattern, on(filter, handler_fn)));
    }

    /// Bind the listener and start serving. Bind failures are reported
    /// synchronously; later serving errors flow to the error channel.
    pub async fn start(&mut self) -> Result<(), ServerError> {
        let address = self.cfg.address.clone();

        let listener = TcpListener::bind(&address)
            .await
            .map_err(|source| ServerError::Listen {
                address: address.clone(),
                source,
            })?;

        self.local_addr = listener.local_addr().ok();

        tracing::info!(server = %self.shared.name, "listening on {address:?}");

        let router = self.build_router();
        let stop_rx = self.stop_rx.clone();
        let error_tx = self.error_tx.clone();

        let task = match &self.cfg.tls {
            None => tokio::spawn(serve_plain(listener, router, stop_rx, error_tx)),

            Some(tls_cfg) => {
                let tls_config = Arc::new(server_tls_config(tls_cfg)?);
                tokio::spawn(serve_tls(listener, router, tls_config, stop_rx, error_tx))
            }
        };

        self.serve_task = Some(task);

        Ok(())
    }

    /// Drain gracefully within the shutdown budget, aborting stragglers.
    pub async fn stop(&mut self) {
        let _ = self.stop_tx.send(true);

        if let Some(mut task) = self.serve_task.take() {
            if tokio::time::timeout(SHUTDOWN_BUDGET, &mut task).await.is_err() {
                tracing::error!(server = %self.shared.name, "cannot shutdown server gracefully");
                task.abort();
            }
        }
    }

    /// Release the remaining state.
    pub fn terminate(&mut self) {
        self.router = None;
    }

    fn build_router(&mut self) -> Router {
        let router = self.router.take().expect("server already started");

        let not_found_shared = Arc::clone(&self.shared);
        let not_allowed_shared = Arc::clone(&self.shared);

        router
            .fallback(move |request: Request| {
                let shared = Arc::clone(&not_found_shared);
                async move {
                    let method = request.method().clone();
                    let handler =
                        Handler::from_request(shared, String::new(), method, request).await;
                    handler.reply_error(StatusCode::NOT_FOUND, "route_not_found", "route not found")
                }
            })
            .method_not_allowed_fallback(move |request: Request| {
                let shared = Arc::clone(&not_allowed_shared);
                async move {
                    let method = request.method().clone();
                    let handler =
                        Handler::from_request(shared, String::new(), method, request).await;
                    handler.reply_error(
                        StatusCode::METHOD_NOT_ALLOWED,
                        "unhandled_method",
                        "unhandled method",
                    )
                }
            })
            .layer(middleware::from_fn_with_state(
                Arc::clone(&self.shared),
                request_pipeline,
            ))
    }
}

/// The uniform request pipeline: scope creation, panic isolation, request
/// logging.
async fn request_pipeline(
    State(shared): State<Arc<ServerShared>>,
    mut request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let scope = RequestScope::new(request.headers(), remote_addr);
    request.extensions_mut().insert(scope.clone());

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());

            let mut backtrace = std::backtrace::Backtrace::force_capture().to_string();
            crate::units::truncate_to_char_boundary(&mut backtrace, MAX_BACKTRACE_SIZE);

            tracing::error!(
                request_id = %scope.request_id,
                "panic: {message}\n{backtrace}"
            );

            let handler = Handler::bare(Arc::clone(&shared), &scope, method.clone());
            handler.reply_internal_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &format!("panic: {message}"),
            )
        }
    };

    scope.log_request(&method, &path, &response);

    response
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Wait for `stop_rx` to report a stop signal without holding the
/// watch guard across the call; keeps the returned future `Send` when
/// combined with other branches in a `tokio::select!`.
async fn wait_for_stop(stop_rx: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    stop_rx.wait_for(|stopped| *stopped).await?;
    Ok(())
}

async fn serve_plain(
    listener: TcpListener,
    router: Router,
    mut stop_rx: watch::Receiver<bool>,
    error_tx: mpsc::Sender<ServerError>,
) {
    let shutdown = async move {
        let _ = stop_rx.wait_for(|stopped| *stopped).await;
    };

    let result = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await;

    if let Err(err) = result {
        let _ = error_tx.send(ServerError::Serve(err)).await;
    }
}

async fn serve_tls(
    listener: TcpListener,
    router: Router,
    tls_config: Arc<rustls::ServerConfig>,
    mut stop_rx: watch::Receiver<bool>,
    error_tx: mpsc::Sender<ServerError>,
) {
    let acceptor = TlsAcceptor::from(tls_config);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = wait_for_stop(&mut stop_rx) => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(serve_tls_connection(
                        stream,
                        peer,
                        acceptor.clone(),
                        router.clone(),
                    ));
                }

                Err(err) => {
                    let _ = error_tx.send(ServerError::Serve(err)).await;
                    break;
                }
            },
        }
    }

    // Drain in-flight connections; the caller enforces the budget.
    while connections.join_next().await.is_some() {}
}

async fn serve_tls_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
) {
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(err) => {
            tracing::debug!("tls handshake failed: {err}");
            return;
        }
    };

    let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));

        let router = router.clone();
        let request = request.map(Body::new);

        async move {
            let mut service = router.into_service::<Body>();
            service
                .ready()
                .await
                .expect("router is infallible")
                .call(request)
                .await
        }
    });

    let result = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls_stream), service)
        .await;

    if let Err(err) = result {
        tracing::debug!("cannot serve connection: {err}");
    }
}

fn server_tls_config(cfg: &TlsServerCfg) -> Result<rustls::ServerConfig, ServerError> {
    let certs = read_pem_certificates(&cfg.certificate)?;
    let key = read_pem_private_key(&cfg.private_key)?;

    let mut config =
        rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(ServerError::TlsConfig)?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(config)
}

fn read_pem_certificates(
    path: &Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ServerError> {
    let data = std::fs::read(path).map_err(|source| ServerError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|_| ServerError::InvalidTlsFile {
            kind: "certificates",
            path: path.to_path_buf(),
        })?;

    if certs.is_empty() {
        return Err(ServerError::InvalidTlsFile {
            kind: "certificates",
            path: path.to_path_buf(),
        });
    }

    Ok(certs)
}

fn read_pem_private_key(
    path: &Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ServerError> {
    let data = std::fs::read(path).map_err(|source| ServerError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    rustls_pemfile::private_key(&mut data.as_slice())
        .ok()
        .flatten()
        .ok_or_else(|| ServerError::InvalidTlsFile {
            kind: "private key",
            path: path.to_path_buf(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Server {
        let (error_tx, _error_rx) = mpsc::channel(1);
        let cfg = ServerCfg {
            address: "127.0.0.1:0".to_string(),
            ..Default::default()
        };

        let mut server = Server::new("test", cfg, error_tx);
        server.route("/ping", Method::GET, |h: Handler| async move {
            h.reply_json(StatusCode::OK, &serde_json::json!({"ping": "pong"}))
        });
        server
    }

    #[tokio::test]
    async fn test_start_stop() {
        let mut server = test_server();
        server.start().await.unwrap();

        let addr = server.local_addr().unwrap();

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/ping"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["ping"], "pong");

        server.stop().await;
        server.terminate();

        // The listener is gone after the drain.
        assert!(reqwest::get(format!("http://{addr}/ping")).await.is_err());
    }

    #[tokio::test]
    async fn test_start_bind_failure() {
        let (error_tx, _error_rx) = mpsc::channel(1);
        let cfg = ServerCfg {
            address: "definitely-not-a-host-9aa1:80".to_string(),
            ..Default::default()
        };

        let mut server = Server::new("test", cfg, error_tx);
        assert!(matches!(
            server.start().await,
            Err(ServerError::Listen { .. })
        ));
    }

    #[tokio::test]
    async fn test_default_address() {
        let (error_tx, _error_rx) = mpsc::channel(1);
        let server = Server::new("test", ServerCfg::default(), error_tx);
        assert_eq!(server.cfg().address, DEFAULT_ADDRESS);
    }
}
