//! Example service entry point.
//!
//! A minimal daemon exercising the harness: one public HTTP server with a
//! trivial route, one default HTTP client, the diagnostic API, and the
//! metrics pipeline.

use std::process::ExitCode;

use async_trait::async_trait;
use axum::http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::json;

use steward::check::{Checker, Object};
use steward::daemon::{run_service, ApiCfg, Daemon, DaemonCfg, DaemonError, Service};
use steward::metrics::MetricsCfg;
use steward::server::{Handler, ServerCfg};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ExampleCfg {
    address: String,
    metrics: Option<MetricsCfg>,
}

impl Object for ExampleCfg {
    fn check(&self, c: &mut Checker) {
        c.check_optional_object("metrics", self.metrics.as_ref());
    }
}

struct ExampleService {
    cfg: ExampleCfg,
}

#[async_trait]
impl Service for ExampleService {
    type Cfg = ExampleCfg;

    fn new(cfg: ExampleCfg) -> Result<Self, DaemonError> {
        Ok(Self { cfg })
    }

    fn daemon_cfg(&self) -> Result<DaemonCfg, DaemonError> {
        let mut cfg = DaemonCfg::new();

        cfg.add_http_server(
            "main",
            ServerCfg {
                address: self.cfg.address.clone(),
                ..Default::default()
            },
        )?;

        cfg.add_http_client("default", Default::default())?;

        cfg.api = Some(ApiCfg::default());
        cfg.metrics = self.cfg.metrics.clone();

        Ok(cfg)
    }

    async fn init(&mut self, daemon: &mut Daemon) -> Result<(), DaemonError> {
        let server = daemon
            .http_server("main")
            .expect("main server is configured");

        server.route("/hello", Method::GET, |h: Handler| async move {
            h.reply_json(StatusCode::OK, &json!({"hello": "world"}))
        });

        Ok(())
    }

    async fn start(&mut self, _daemon: &mut Daemon) -> Result<(), DaemonError> {
        Ok(())
    }

    async fn stop(&mut self, _daemon: &mut Daemon) {}

    async fn terminate(&mut self, _daemon: &mut Daemon) {}
}

#[tokio::main]
async fn main() -> ExitCode {
    run_service::<ExampleService>("steward-example", "steward example service").await
}
