//! # zproxy
//!
//! A SOCKS5 proxy for reaching services inside a cluster through virtual
//! domain names. Requested hosts are rewritten before dialing:
//!
//! - `{name}.{suffix}` becomes `{name}.{cluster_domain}`
//! - `{service}.{project}.zeabur.{suffix}` is looked up in a name mapping
//!   refreshed from the Zeabur API and becomes
//!   `service-{id}.environment-{id}.svc.{cluster_domain}`
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and validation
//! - [`error`]: Error types and handling
//! - [`logging`]: Logging setup and configuration
//! - [`store`]: The shared, atomically replaced name mapping
//! - [`topology`]: Remote topology document and mapping builder
//! - [`zeabur`]: Topology source backed by the Zeabur GraphQL API
//! - [`refresher`]: Background refresh loop
//! - [`rewriter`]: Address rewrite logic
//! - [`socks`]: SOCKS5 wire format
//! - [`proxy`]: The SOCKS5 server and dialers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use zproxy::{AddressRewriter, NameStore, ProxyServer, RewriteConfig, RewritingDialer, TcpDialer};
//!
//! let store = Arc::new(NameStore::new());
//! let rewriter = AddressRewriter::new(RewriteConfig::default()).with_store(store.clone());
//! let dialer = RewritingDialer::new(rewriter, Arc::new(TcpDialer::new(timeout)));
//! let server = ProxyServer::new("0.0.0.0:1080", Arc::new(dialer));
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod refresher;
pub mod rewriter;
pub mod socks;
pub mod store;
pub mod topology;
pub mod zeabur;

pub use config::{AppConfig, Overrides};
pub use error::{ProxyError, Result};
pub use proxy::{Dialer, ProxyServer, RewritingDialer, TcpDialer};
pub use refresher::{RefreshPolicy, Refresher};
pub use rewriter::{AddressRewriter, RewriteConfig};
pub use store::{Mapping, MappingDiff, NameStore};
pub use topology::{RawTopology, TopologyBuilder};
pub use zeabur::{TopologySource, ZeaburClient};
