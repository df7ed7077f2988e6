//! Address rewriting for inbound connect requests.
//!
//! Hosts must end with the virtual domain suffix. Two modes share that check:
//!
//! - **Routed lookup**: `{key}.{marker}.{suffix}` is looked up in the
//!   [`NameStore`] and becomes `{value}.svc.{cluster_domain}`.
//! - **Direct**: `{name}.{suffix}` becomes `{name}.{cluster_domain}`.

use crate::error::{ProxyError, Result};
use crate::store::NameStore;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace};

/// Per-process rewrite settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RewriteConfig {
    /// Virtual domain suffix accepted from clients, without leading dot.
    pub in_domain_suffix: String,

    /// Real cluster domain to rewrite into, without leading dot.
    pub cluster_domain: String,

    /// Label marking routed-lookup names, directly under the suffix.
    pub lookup_marker: String,

    /// Whether IP literal hosts may pass the IP check.
    pub allow_ip_literals: bool,
}

impl Default for RewriteConfig {
    fn default() -> Self {
        Self {
            in_domain_suffix: "cluster.local".to_string(),
            cluster_domain: "cluster.local".to_string(),
            lookup_marker: "zeabur".to_string(),
            allow_ip_literals: false,
        }
    }
}

/// Translates virtual `(host, port)` pairs into dialable ones.
#[derive(Debug, Clone)]
pub struct AddressRewriter {
    config: RewriteConfig,
    suffix: String,
    marker: String,
    store: Option<Arc<NameStore>>,
}

impl AddressRewriter {
    /// Creates a rewriter that only serves direct names.
    pub fn new(config: RewriteConfig) -> Self {
        let suffix = format!(".{}", config.in_domain_suffix);
        let marker = format!(".{}", config.lookup_marker);
        Self {
            config,
            suffix,
            marker,
            store: None,
        }
    }

    /// Enables routed lookups against `store`.
    pub fn with_store(mut self, store: Arc<NameStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &RewriteConfig {
        &self.config
    }

    /// Whether routed lookups are backed by a store.
    pub fn store_backed(&self) -> bool {
        self.store.is_some()
    }

    /// Rewrites `host`; `port` passes through unchanged.
    pub fn rewrite(&self, host: &str, port: &str) -> Result<(String, String)> {
        let host = host.to_lowercase();
        let host = host.strip_suffix('.').unwrap_or(&host);

        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if !self.config.allow_ip_literals && bare.parse::<IpAddr>().is_ok() {
            return Err(ProxyError::DisallowedIp {
                host: host.to_string(),
            });
        }

        let name = host
            .strip_suffix(self.suffix.as_str())
            .ok_or_else(|| ProxyError::SuffixMismatch {
                host: host.to_string(),
                suffix: self.suffix.clone(),
            })?;
        if name.is_empty() {
            return Err(ProxyError::invalid_address(host));
        }

        let real_host = match name.strip_suffix(self.marker.as_str()) {
            Some(key) => {
                let value = self
                    .store
                    .as_ref()
                    .and_then(|store| store.get(key))
                    .ok_or_else(|| ProxyError::UnknownVirtualName {
                        key: key.to_string(),
                    })?;
                debug!(key = %key, value = %value, "Resolved routed name");
                format!("{}.svc.{}", value, self.config.cluster_domain)
            }
            None => format!("{}.{}", name, self.config.cluster_domain),
        };

        trace!(host = %host, rewritten = %real_host, "Rewrote host");
        Ok((real_host, port.to_string()))
    }

    /// Rewrites a `host:port` string, returning the new `host:port`.
    pub fn rewrite_address(&self, address: &str) -> Result<String> {
        let (host, port) = split_host_port(address)?;
        let (host, port) = self.rewrite(host, port)?;
        Ok(join_host_port(&host, &port))
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::invalid_address(address))?;

    let host = match host.strip_prefix('[') {
        Some(inner) => inner
            .strip_suffix(']')
            .ok_or_else(|| ProxyError::invalid_address(address))?,
        None if host.contains(':') => return Err(ProxyError::invalid_address(address)),
        None => host,
    };

    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(ProxyError::invalid_address(address));
    }
    Ok((host, port))
}

/// Joins host and port, bracketing IPv6 hosts.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
