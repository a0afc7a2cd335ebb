//! Daemon configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::check::{Checker, Object};
use crate::config::LoggerCfg;
use crate::daemon::DaemonError;
use crate::db::DbCfg;
use crate::http_client::HttpClientCfg;
use crate::metrics::MetricsCfg;
use crate::server::ServerCfg;

/// Address of the diagnostic API server when none is configured.
pub const DEFAULT_API_ADDRESS: &str = "localhost:4196";

/// Diagnostic API configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiCfg {
    /// An empty address selects [`DEFAULT_API_ADDRESS`].
    pub address: String,
}

impl Object for ApiCfg {
    fn check(&self, _c: &mut Checker) {
        // The address may be empty; the default is substituted at init.
    }
}

/// Description of every component the daemon owns.
#[derive(Debug, Clone, Default)]
pub struct DaemonCfg {
    pub(crate) name: String,
    pub(crate) description: String,

    pub logger: Option<LoggerCfg>,

    pub api: Option<ApiCfg>,

    pub http_servers: HashMap<String, ServerCfg>,
    pub http_clients: HashMap<String, HttpClientCfg>,

    pub metrics: Option<MetricsCfg>,

    pub db: Option<DbCfg>,
}

impl DaemonCfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Register a named HTTP server.
    ///
    /// # Errors
    /// Duplicate names are a configuration error.
    pub fn add_http_server(
        &mut self,
        name: impl Into<String>,
        cfg: ServerCfg,
    ) -> Result<(), DaemonError> {
        let name = name.into();

        if self.http_servers.contains_key(&name) {
            return Err(DaemonError::DuplicateHttpServer(name));
        }

        self.http_servers.insert(name, cfg);

        Ok(())
    }

    /// Register a named HTTP client.
    ///
    /// # Errors
    /// Duplicate names are a configuration error.
    pub fn add_http_client(
        &mut self,
        name: impl Into<String>,
        cfg: HttpClientCfg,
    ) -> Result<(), DaemonError> {
        let name = name.into();

        if self.http_clients.contains_key(&name) {
            return Err(DaemonError::DuplicateHttpClient(name));
        }

        self.http_clients.insert(name, cfg);

        Ok(())
    }
}

impl Object for DaemonCfg {
    fn check(&self, c: &mut Checker) {
        c.check_optional_object("logger", self.logger.as_ref());
        c.check_optional_object("api", self.api.as_ref());

        c.check_object_map("http_servers", &self.http_servers);
        c.check_object_map("http_clients", &self.http_clients);

        c.check_optional_object("metrics", self.metrics.as_ref());
        c.check_optional_object("db", self.db.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names() {
        let mut cfg = DaemonCfg::new();

        cfg.add_http_server("main", ServerCfg::default()).unwrap();
        assert!(matches!(
            cfg.add_http_server("main", ServerCfg::default()),
            Err(DaemonError::DuplicateHttpServer(name)) if name == "main"
        ));

        cfg.add_http_client("default", HttpClientCfg::default())
            .unwrap();
        assert!(matches!(
            cfg.add_http_client("default", HttpClientCfg::default()),
            Err(DaemonError::DuplicateHttpClient(name)) if name == "default"
        ));
    }

    #[test]
    fn test_check_nested() {
        let mut cfg = DaemonCfg::new();
        cfg.add_http_server(
            "main",
            ServerCfg {
                address: String::new(),
                ..Default::default()
            },
        )
        .unwrap();

        // An empty address passes through add_http_server but fails the
        // structural validation with its full pointer.
        let mut c = Checker::new();
        cfg.check(&mut c);
        assert_eq!(c.errors().len(), 1);
        assert_eq!(
            c.errors()[0].pointer.to_string(),
            "/http_servers/main/address"
        );
    }
}
