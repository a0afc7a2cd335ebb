//! Daemon lifecycle supervisor.
//!
//! A [`Service`] supplies the application behavior; the daemon owns the
//! shared components — named HTTP servers and clients, the metrics
//! pipeline, the database client — and drives them through init, start,
//! run, stop and terminate in dependency order. The run phase blocks on a
//! fan-in of termination signals, the internal stop trigger and the fatal
//! error channel.

mod api;
mod cfg;

pub use cfg::{ApiCfg, DaemonCfg, DEFAULT_API_ADDRESS};

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use clap::{CommandFactory, FromArgMatches, Parser};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::check::{Checker, Object, ValidationErrors};
use crate::config::{self, ConfigError};
use crate::db::{DbClient, DbError};
use crate::http_client::{HttpClient, HttpClientCfg, HttpClientError};
use crate::metrics::{MetricsClient, MetricsError};
use crate::server::{Server, ServerError};

/// Name of the HTTP client reserved for the metrics ingestion endpoint.
pub const METRICS_CLIENT_NAME: &str = "influx";

/// Name of the built-in diagnostic API server.
pub const API_SERVER_NAME: &str = "daemon-api";

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The local hostname could not be obtained.
    #[error("cannot obtain hostname")]
    Hostname,

    /// Two servers or two clients share a name.
    #[error("duplicate http server {0:?}")]
    DuplicateHttpServer(String),

    #[error("duplicate http client {0:?}")]
    DuplicateHttpClient(String),

    /// An HTTP client could not be built.
    #[error("cannot create http client {name:?}: {source}")]
    HttpClient {
        name: String,
        #[source]
        source: HttpClientError,
    },

    /// The metrics client could not be built.
    #[error("cannot create metrics client: {0}")]
    Metrics(#[from] MetricsError),

    /// The database client could not be built.
    #[error("cannot create db client: {0}")]
    Db(#[from] DbError),

    /// An HTTP server failed to start.
    #[error("cannot start http server {name:?}: {source}")]
    StartHttpServer {
        name: String,
        #[source]
        source: ServerError,
    },

    /// A component reported a fatal runtime error.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The configuration file could not be loaded.
    #[error("cannot load configuration: {0}")]
    Config(#[from] ConfigError),

    /// The configuration did not validate.
    #[error("invalid configuration:\n{0}")]
    InvalidConfiguration(ValidationErrors),

    /// Application-defined failure.
    #[error("{0}")]
    Service(String),
}

impl DaemonError {
    /// Build an application-defined error.
    pub fn service(message: impl Into<String>) -> Self {
        Self::Service(message.into())
    }
}

/// Application behavior hosted by the daemon.
#[async_trait]
pub trait Service: Send + Sized + 'static {
    /// Configuration decoded from the configuration file.
    type Cfg: DeserializeOwned + Default + Object + Send;

    /// Build the service from its validated configuration.
    fn new(cfg: Self::Cfg) -> Result<Self, DaemonError>;

    /// Describe the components the daemon must construct.
    fn daemon_cfg(&self) -> Result<DaemonCfg, DaemonError>;

    /// Called at the end of the init phase; routes are registered here.
    async fn init(&mut self, daemon: &mut Daemon) -> Result<(), DaemonError>;

    /// Called once every component started.
    async fn start(&mut self, daemon: &mut Daemon) -> Result<(), DaemonError>;

    /// First step of the stop phase.
    async fn stop(&mut self, daemon: &mut Daemon);

    /// First step of the terminate phase.
    async fn terminate(&mut self, daemon: &mut Daemon);
}

/// Handle used to stop a running daemon from the outside.
#[derive(Clone)]
pub struct DaemonStopper {
    stop_tx: mpsc::Sender<()>,
}

impl DaemonStopper {
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }
}

/// The lifecycle supervisor.
pub struct Daemon {
    cfg: DaemonCfg,

    pub hostname: String,

    http_servers: HashMap<String, Server>,
    http_clients: HashMap<String, Arc<HttpClient>>,

    pub metrics: Option<MetricsClient>,
    pub db: Option<Arc<DbClient>>,

    start_time: Instant,

    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,

    error_tx: mpsc::Sender<DaemonError>,
    error_rx: mpsc::Receiver<DaemonError>,

    server_error_tx: mpsc::Sender<ServerError>,
    server_error_rx: mpsc::Receiver<ServerError>,
}

impl Daemon {
    /// Create an uninitialized daemon from its configuration.
    pub fn new(cfg: DaemonCfg) -> Self {
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (error_tx, error_rx) = mpsc::channel(1);
        let (server_error_tx, server_error_rx) = mpsc::channel(1);

        Self {
            cfg,
            hostname: String::new(),
            http_servers: HashMap::new(),
            http_clients: HashMap::new(),
            metrics: None,
            db: None,
            start_time: Instant::now(),
            stop_tx,
            stop_rx,
            error_tx,
            error_rx,
            server_error_tx,
            server_error_rx,
        }
    }

    pub fn cfg(&self) -> &DaemonCfg {
        &self.cfg
    }

    pub fn http_server(&mut self, name: &str) -> Option<&mut Server> {
        self.http_servers.get_mut(name)
    }

    pub fn http_client(&self, name: &str) -> Option<Arc<HttpClient>> {
        self.http_clients.get(name).cloned()
    }

    /// A handle usable to stop the daemon from another task.
    pub fn stopper(&self) -> DaemonStopper {
        DaemonStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Escalate a fatal component error; the run phase exits the process.
    pub fn fatal(&self, err: DaemonError) {
        let _ = self.error_tx.try_send(err);
    }

    /// Construct every component, in strict dependency order.
    pub async fn init(&mut self) -> Result<(), DaemonError> {
        self.check_cfg()?;

        self.init_hostname()?;
        self.init_logger();
        self.init_http_servers();
        self.init_http_clients()?;
        self.init_metrics()?;
        self.init_db().await?;
        self.init_api();

        Ok(())
    }

    fn check_cfg(&self) -> Result<(), DaemonError> {
        let mut checker = Checker::new();
        self.cfg.check(&mut checker);

        checker
            .into_result()
            .map_err(DaemonError::InvalidConfiguration)
    }

    fn init_hostname(&mut self) -> Result<(), DaemonError> {
        self.hostname = gethostname::gethostname()
            .into_string()
            .map_err(|_| DaemonError::Hostname)?;

        Ok(())
    }

    fn init_logger(&self) {
        let logger_cfg = self.cfg.logger.clone().unwrap_or_default();
        config::init_logging(&logger_cfg);
    }

    fn init_http_servers(&mut self) {
        for (name, server_cfg) in self.cfg.http_servers.clone() {
            let server = Server::new(&name, server_cfg, self.server_error_tx.clone());
            self.http_servers.insert(name, server);
        }
    }

    fn init_http_clients(&mut self) -> Result<(), DaemonError> {
        if let Some(metrics_cfg) = &self.cfg.metrics {
            let client_cfg = HttpClientCfg {
                log_requests: metrics_cfg.log_requests,
                ..Default::default()
            };

            self.init_http_client(METRICS_CLIENT_NAME, client_cfg)?;
        }

        for (name, client_cfg) in self.cfg.http_clients.clone() {
            self.init_http_client(&name, client_cfg)?;
        }

        Ok(())
    }

    fn init_http_client(&mut self, name: &str, cfg: HttpClientCfg) -> Result<(), DaemonError> {
        if self.http_clients.contains_key(name) {
            return Err(DaemonError::DuplicateHttpClient(name.to_string()));
        }

        let client = HttpClient::new(cfg).map_err(|source| DaemonError::HttpClient {
            name: name.to_string(),
            source,
        })?;

        self.http_clients.insert(name.to_string(), Arc::new(client));

        Ok(())
    }

    fn init_metrics(&mut self) -> Result<(), DaemonError> {
        let Some(metrics_cfg) = self.cfg.metrics.clone() else {
            return Ok(());
        };

        let http = self
            .http_clients
            .get(METRICS_CLIENT_NAME)
            .cloned()
            .expect("metrics http client is initialized before the metrics client");

        let client = MetricsClient::new(metrics_cfg, http, &self.hostname)?;
        self.metrics = Some(client);

        Ok(())
    }

    async fn init_db(&mut self) -> Result<(), DaemonError> {
        let Some(db_cfg) = self.cfg.db.clone() else {
            return Ok(());
        };

        let client = DbClient::new(db_cfg).await?;
        self.db = Some(Arc::new(client));

        Ok(())
    }

    fn init_api(&mut self) {
        let Some(api_cfg) = self.cfg.api.clone() else {
            return;
        };

        let server_cfg = crate::server::ServerCfg {
            address: if api_cfg.address.is_empty() {
                DEFAULT_API_ADDRESS.to_string()
            } else {
                api_cfg.address
            },
            ..Default::default()
        };

        let mut server = Server::new(API_SERVER_NAME, server_cfg, self.server_error_tx.clone());

        api::register_api_routes(
            &mut server,
            api::ApiState {
                name: self.cfg.name.clone(),
                hostname: self.hostname.clone(),
                start_time: self.start_time,
            },
        );

        self.http_servers.insert(API_SERVER_NAME.to_string(), server);
    }

    /// Start every component; a failure skips the remaining steps.
    pub async fn start(&mut self) -> Result<(), DaemonError> {
        tracing::info!("starting");

        for (name, server) in &mut self.http_servers {
            server
                .start()
                .await
                .map_err(|source| DaemonError::StartHttpServer {
                    name: name.clone(),
                    source,
                })?;
        }

        if let Some(metrics) = &self.metrics {
            metrics.start();
        }

        tracing::info!("started");

        Ok(())
    }

    /// Block until a termination signal, the internal stop trigger, or a
    /// fatal component error.
    ///
    /// # Errors
    /// Returns the fatal error; the caller exits the process with status 1.
    pub async fn wait(&mut self) -> Result<(), DaemonError> {
        tokio::select! {
            signal = termination_signal() => {
                tracing::info!("received signal ({signal})");
                Ok(())
            }

            _ = self.stop_rx.recv() => Ok(()),

            Some(err) = self.error_rx.recv() => {
                tracing::error!("daemon error: {err}");
                Err(err)
            }

            Some(err) = self.server_error_rx.recv() => {
                tracing::error!("daemon error: {err}");
                Err(err.into())
            }
        }
    }

    /// Stop components in reverse dependency order.
    pub async fn stop(&mut self) {
        tracing::info!("stopping");

        if let Some(db) = &self.db {
            db.close().await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.stop().await;
        }

        for server in self.http_servers.values_mut() {
            server.stop().await;
        }

        tracing::info!("stopped");
    }

    /// Release remaining resources; called regardless of the start outcome.
    pub fn terminate(&mut self) {
        if let Some(metrics) = &self.metrics {
            metrics.terminate();
        }

        for client in self.http_clients.values() {
            client.terminate();
        }

        for server in self.http_servers.values_mut() {
            server.terminate();
        }
    }
}

async fn termination_signal() -> &'static str {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot install signal handler");

        tokio::select! {
            _ = ctrl_c => "interrupt",
            _ = terminate.recv() => "terminate",
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        "interrupt"
    }
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// The path of the configuration file.
    #[arg(short = 'c', long = "cfg-file", value_name = "path")]
    cfg_file: Option<PathBuf>,
}

/// Drive a service through the full daemon lifecycle.
///
/// Exit code 0 on normal termination, 1 on configuration, init or fatal
/// runtime errors.
pub async fn run_service<S: Service>(name: &str, description: &str) -> ExitCode {
    match try_run_service::<S>(name, description).await {
        Ok(()) => ExitCode::SUCCESS,

        Err(err) => {
            tracing::error!("{err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn try_run_service<S: Service>(name: &str, description: &str) -> Result<(), DaemonError> {
    let command = CliArgs::command()
        .name(name.to_string())
        .about(description.to_string());

    let args = CliArgs::from_arg_matches(&command.get_matches()).expect("cli arguments match");

    let service_cfg: S::Cfg = match &args.cfg_file {
        Some(path) => config::load_cfg(path)?,
        None => S::Cfg::default(),
    };

    let mut checker = Checker::new();
    service_cfg.check(&mut checker);
    checker
        .into_result()
        .map_err(DaemonError::InvalidConfiguration)?;

    let mut service = S::new(service_cfg)?;

    let mut daemon_cfg = service.daemon_cfg()?;
    daemon_cfg.name = name.to_string();
    daemon_cfg.description = description.to_string();

    let mut daemon = Daemon::new(daemon_cfg);

    if let Err(err) = daemon.init().await {
        daemon.terminate();
        return Err(err);
    }

    if let Err(err) = service.init(&mut daemon).await {
        daemon.terminate();
        return Err(err);
    }

    let start_result = match daemon.start().await {
        Ok(()) => service.start(&mut daemon).await,
        Err(err) => Err(err),
    };

    if start_result.is_ok() {
        // A fatal component error terminates the process with status 1
        // right away; the ordered teardown runs for the signal and
        // internal-stop exits only. A failed start skips the run phase but
        // still tears down what was constructed.
        daemon.wait().await?;
    }

    service.stop(&mut daemon).await;
    daemon.stop().await;

    service.terminate(&mut daemon).await;
    daemon.terminate();

    start_result
}
