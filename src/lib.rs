//! Steward - Service Harness for Network Daemons
//!
//! This crate hosts long-running network daemons: application code supplies
//! a [`daemon::Service`] and the harness drives the full lifecycle (init,
//! start, run, stop, terminate), owning a set of named HTTP servers and
//! clients, a batched metrics pipeline, and a relational database pool with
//! cooperative schema migration.
//!
//! # Architecture
//!
//! - **Daemon**: lifecycle supervisor composing the components in
//!   dependency order, with signal and fatal-error fan-in
//! - **Server**: HTTP request pipeline with request-scoped state, structured
//!   error replies and panic recovery
//! - **Client**: pooled outgoing HTTP with optional public-key pinning
//! - **Metrics**: concurrent point producers, bounded batches, line-protocol
//!   shipping
//! - **Db**: connection pool, transaction wrappers, advisory-lock-guarded
//!   migrations
//! - **Check/Pointer**: structural validation addressable by hierarchical
//!   pointers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use steward::check::{Checker, Object};
//! use steward::daemon::{run_service, Daemon, DaemonCfg, DaemonError, Service};
//! use steward::server::ServerCfg;
//! use async_trait::async_trait;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Default, Deserialize)]
//! struct ExampleCfg {}
//!
//! impl Object for ExampleCfg {
//!     fn check(&self, _c: &mut Checker) {}
//! }
//!
//! struct ExampleService;
//!
//! #[async_trait]
//! impl Service for ExampleService {
//!     type Cfg = ExampleCfg;
//!
//!     fn new(_cfg: ExampleCfg) -> Result<Self, DaemonError> {
//!         Ok(ExampleService)
//!     }
//!
//!     fn daemon_cfg(&self) -> Result<DaemonCfg, DaemonError> {
//!         let mut cfg = DaemonCfg::new();
//!         cfg.add_http_server("main", ServerCfg::default())?;
//!         Ok(cfg)
//!     }
//!
//!     async fn init(&mut self, _daemon: &mut Daemon) -> Result<(), DaemonError> {
//!         Ok(())
//!     }
//!
//!     async fn start(&mut self, _daemon: &mut Daemon) -> Result<(), DaemonError> {
//!         Ok(())
//!     }
//!
//!     async fn stop(&mut self, _daemon: &mut Daemon) {}
//!     async fn terminate(&mut self, _daemon: &mut Daemon) {}
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::process::ExitCode {
//!     run_service::<ExampleService>("example", "an example daemon").await
//! }
//! ```

pub mod check;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod db;
pub mod http_client;
pub mod ksuid;
pub mod metrics;
pub mod pointer;
pub mod server;
pub mod units;

// Re-export the types most services interact with.
pub use check::{Checker, Object, ValidationError, ValidationErrors};
pub use daemon::{run_service, Daemon, DaemonCfg, DaemonError, Service};
pub use http_client::{ApiClient, ApiError, HttpClient, HttpClientCfg};
pub use metrics::{Fields, MetricsCfg, MetricsClient, Point, Tags};
pub use pointer::Pointer;
pub use server::{Handler, Server, ServerCfg};
