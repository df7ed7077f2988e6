//! Configuration management for the zproxy application.
//!
//! Settings come from built-in defaults, an optional YAML file, and
//! finally command-line flags or environment variables (see `main.rs`).
//! The merged result is validated once at startup.

use crate::error::{ProxyError, Result};
use crate::refresher::RefreshPolicy;
use crate::rewriter::RewriteConfig;
use crate::socks::Credentials;
use crate::zeabur::DEFAULT_API_URL;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,

    /// Outbound connect timeout in seconds.
    pub connect_timeout: u64,

    /// Proxy auth username.
    pub username: Option<String>,

    /// Proxy auth password.
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:1080".to_string(),
            connect_timeout: 10,
            username: None,
            password: None,
        }
    }
}

/// Zeabur API configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ZeaburConfig {
    /// API key; the refresher is disabled without it.
    pub api_key: Option<String>,

    /// Target server id (`server-...`).
    pub server_id: Option<String>,

    /// GraphQL endpoint.
    pub api_url: String,

    /// Refresh interval, e.g. `30s`, `5m`, `1h30m`.
    pub update_interval: String,

    /// Per-fetch timeout in seconds.
    pub fetch_timeout: u64,
}

impl Default for ZeaburConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            server_id: None,
            api_url: DEFAULT_API_URL.to_string(),
            update_interval: "5m".to_string(),
            fetch_timeout: 30,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable pretty format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,

    /// Output destination: stdout, stderr, or file path.
    pub output: String,

    /// Log format.
    pub format: LogFormat,

    /// Include target (module path) in logs.
    pub include_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: "stdout".to_string(),
            format: LogFormat::Compact,
            include_target: true,
        }
    }
}

/// Values given on the command line or through the environment.
///
/// `None` leaves the file/default value in place.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub in_domain_suffix: Option<String>,
    pub cluster_domain: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub zeabur_api_key: Option<String>,
    pub zeabur_server_id: Option<String>,
    pub zeabur_update_interval: Option<String>,
    pub allow_ip_literals: bool,
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Server configuration.
    pub server: ServerConfig,

    /// Address rewrite configuration.
    pub rewrite: RewriteConfig,

    /// Zeabur API configuration.
    pub zeabur: ZeaburConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ProxyError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let mut config: AppConfig =
            serde_yaml::from_str(&contents).map_err(|e| ProxyError::config_parse(e.to_string()))?;

        config.normalize();
        config.validate()?;

        Ok(config)
    }

    /// Applies command-line/environment overrides, then re-validates.
    ///
    /// An explicit listen address wins over `PORT`.
    pub fn apply(&mut self, overrides: Overrides) -> Result<()> {
        if let Some(port) = overrides.port {
            self.server.listen = format!("0.0.0.0:{port}");
        }
        if let Some(listen) = overrides.listen {
            self.server.listen = listen;
        }
        if let Some(suffix) = overrides.in_domain_suffix {
            self.rewrite.in_domain_suffix = suffix;
        }
        if let Some(domain) = overrides.cluster_domain {
            self.rewrite.cluster_domain = domain;
        }
        if overrides.allow_ip_literals {
            self.rewrite.allow_ip_literals = true;
        }
        if overrides.username.is_some() {
            self.server.username = overrides.username;
        }
        if overrides.password.is_some() {
            self.server.password = overrides.password;
        }
        if overrides.zeabur_api_key.is_some() {
            self.zeabur.api_key = overrides.zeabur_api_key;
        }
        if overrides.zeabur_server_id.is_some() {
            self.zeabur.server_id = overrides.zeabur_server_id;
        }
        if let Some(interval) = overrides.zeabur_update_interval {
            self.zeabur.update_interval = interval;
        }

        self.normalize();
        self.validate()
    }

    /// Lowercases domains, strips surrounding dots and drops empty secrets.
    fn normalize(&mut self) {
        fn domain(value: &str) -> String {
            value.trim().trim_matches('.').to_lowercase()
        }
        fn non_empty(value: &mut Option<String>) {
            if value.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *value = None;
            }
        }

        self.rewrite.in_domain_suffix = domain(&self.rewrite.in_domain_suffix);
        self.rewrite.cluster_domain = domain(&self.rewrite.cluster_domain);
        self.rewrite.lookup_marker = domain(&self.rewrite.lookup_marker);
        non_empty(&mut self.server.username);
        non_empty(&mut self.server.password);
        non_empty(&mut self.zeabur.api_key);
        non_empty(&mut self.zeabur.server_id);
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.server.listen.is_empty() {
            return Err(ProxyError::config_validation(
                "Server listen address cannot be empty",
            ));
        }
        if self.server.connect_timeout == 0 {
            return Err(ProxyError::config_validation(
                "Connect timeout must be greater than zero",
            ));
        }
        if self.server.username.is_some() != self.server.password.is_some() {
            return Err(ProxyError::config_validation(
                "Username and password must be set together",
            ));
        }

        if self.rewrite.in_domain_suffix.is_empty() {
            return Err(ProxyError::config_validation("Domain suffix cannot be empty"));
        }
        if self.rewrite.cluster_domain.is_empty() {
            return Err(ProxyError::config_validation("Cluster domain cannot be empty"));
        }
        if self.rewrite.lookup_marker.is_empty() || self.rewrite.lookup_marker.contains('.') {
            return Err(ProxyError::config_validation(format!(
                "Lookup marker must be a single label: {:?}",
                self.rewrite.lookup_marker
            )));
        }

        if self.update_interval()?.is_zero() {
            return Err(ProxyError::config_validation(
                "Update interval must be greater than zero",
            ));
        }
        if self.zeabur.fetch_timeout == 0 {
            return Err(ProxyError::config_validation(
                "Fetch timeout must be greater than zero",
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ProxyError::config_validation(format!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level, valid_levels
            )));
        }

        Ok(())
    }

    /// Rewrite settings for the [`AddressRewriter`](crate::rewriter::AddressRewriter).
    pub fn rewrite_config(&self) -> RewriteConfig {
        self.rewrite.clone()
    }

    /// Proxy credentials, when both username and password are set.
    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.server.username, &self.server.password) {
            (Some(user), Some(pass)) => Some(Credentials::new(user, pass)),
            _ => None,
        }
    }

    /// Parses the refresh interval (`30s`, `5m`, `1h 30m`).
    pub fn update_interval(&self) -> Result<Duration> {
        humantime::parse_duration(self.zeabur.update_interval.trim()).map_err(|e| {
            ProxyError::config_validation(format!(
                "Invalid update interval {:?}: {e}",
                self.zeabur.update_interval
            ))
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout)
    }

    /// Refresh policy, present only when API key and server id are both set.
    pub fn refresh_policy(&self) -> Result<Option<RefreshPolicy>> {
        let (Some(api_key), Some(server_id)) = (&self.zeabur.api_key, &self.zeabur.server_id)
        else {
            debug!("Zeabur API key or server ID not provided");
            return Ok(None);
        };

        let interval = self.update_interval()?;

        Ok(Some(RefreshPolicy {
            api_url: self.zeabur.api_url.clone(),
            api_key: api_key.clone(),
            server_id: server_id.clone(),
            interval,
            fetch_timeout: Duration::from_secs(self.zeabur.fetch_timeout),
        }))
    }
}
