//! Configuration loading and logging setup.
//!
//! Configuration files are UTF-8 YAML, preprocessed by a small template
//! pass exposing the `env` function: `{{ env "NAME" }}` is replaced by the
//! value of the environment variable, and a missing variable is a hard
//! error rather than an empty string.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::check::{Checker, Object};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The template pass failed.
    #[error("cannot render {path}: {source}")]
    Render {
        path: PathBuf,
        #[source]
        source: TemplateError,
    },

    /// The rendered document is not valid YAML for the target type.
    #[error("cannot decode yaml data: {0}")]
    ParseYaml(#[from] serde_yaml::Error),
}

/// Template rendering errors.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// `env` referenced a variable that is not set.
    #[error("missing environment variable {0:?}")]
    MissingVariable(String),
}

/// Load a configuration file: read, render templates, decode.
pub fn load_cfg<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, ConfigError> {
    let path = path.as_ref();

    let data = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source,
    })?;

    let rendered = render_cfg(&data).map_err(|source| ConfigError::Render {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(serde_yaml::from_str(&rendered)?)
}

/// Render the template layer of a configuration document.
pub fn render_cfg(data: &str) -> Result<String, TemplateError> {
    static ENV_CALL_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let re = ENV_CALL_REGEX.get_or_init(|| {
        regex::Regex::new(r#"\{\{\s*env\s+"([^"]*)"\s*\}\}"#)
            .expect("failed to compile env call regex")
    });

    let mut rendered = String::with_capacity(data.len());
    let mut last_end = 0;

    for captures in re.captures_iter(data) {
        let call = captures.get(0).expect("capture group 0 always present");
        let name = &captures[1];

        let value = std::env::var(name)
            .map_err(|_| TemplateError::MissingVariable(name.to_string()))?;

        rendered.push_str(&data[last_end..call.start()]);
        rendered.push_str(&value);
        last_end = call.end();
    }

    rendered.push_str(&data[last_end..]);

    Ok(rendered)
}

/// Logger configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerCfg {
    /// Either `terminal` or `json`.
    pub backend: String,

    /// Width reserved for the emitting domain; zero drops it entirely.
    pub domain_width: usize,

    pub color: bool,

    /// Default level directive; overridden by the environment filter.
    pub level: String,
}

impl Default for LoggerCfg {
    fn default() -> Self {
        Self {
            backend: "terminal".to_string(),
            domain_width: 24,
            color: true,
            level: "info".to_string(),
        }
    }
}

impl Object for LoggerCfg {
    fn check(&self, c: &mut Checker) {
        c.check_string_value("backend", &self.backend, &["terminal", "json"]);
        c.check_string_value("level", &self.level, &["trace", "debug", "info", "warn", "error"]);
    }
}

/// Install the global subscriber described by the configuration.
///
/// Idempotent: later calls leave the first subscriber in place, which keeps
/// multi-daemon test binaries working.
pub fn init_logging(cfg: &LoggerCfg) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cfg.level.clone()));

    if cfg.backend == "json" {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(cfg.color)
                    .with_target(cfg.domain_width > 0),
            )
            .try_init();
    }
}
