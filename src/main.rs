//! # zproxy
//!
//! A SOCKS5 proxy for accessing internal services deployed on a Zeabur
//! dedicated server (or any cluster with predictable service names).
//!
//! ## Usage
//!
//! ```bash
//! # Direct rewrite: foo.cluster.local -> foo.cluster.local
//! zproxy
//!
//! # Rewrite a private suffix into the cluster domain
//! zproxy -s internal.local -c svc.cluster.local
//!
//! # Enable {service}.{project}.zeabur.{suffix} lookups
//! ZEABUR_API_KEY=... ZEABUR_SERVER_ID=server-... zproxy
//!
//! # Increase verbosity
//! zproxy -vvv
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use zproxy::config::{AppConfig, Overrides};
use zproxy::logging;
use zproxy::proxy::{ProxyServer, RewritingDialer, TcpDialer};
use zproxy::refresher::Refresher;
use zproxy::rewriter::AddressRewriter;
use zproxy::store::NameStore;

/// A SOCKS5 proxy for accessing internal services deployed by Zeabur Dedicated Server.
#[derive(Parser, Debug)]
#[command(name = "zproxy")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(long, env = "CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Proxy listening address
    #[arg(short, long)]
    listen: Option<String>,

    /// Port to listen on (all interfaces)
    #[arg(long, env = "PORT", hide = true)]
    port: Option<u16>,

    /// Domain suffix to replace
    #[arg(short = 's', long, env = "IN_DOMAIN_SUFFIX")]
    in_domain_suffix: Option<String>,

    /// Cluster domain to use as replacement
    #[arg(short = 'c', long, env = "CLUSTER_DOMAIN")]
    cluster_domain: Option<String>,

    /// Authentication username
    #[arg(short, long, env = "AUTH_USERNAME")]
    username: Option<String>,

    /// Authentication password
    #[arg(short, long, env = "AUTH_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Zeabur API key
    #[arg(long, env = "ZEABUR_API_KEY", hide_env_values = true)]
    zeabur_api_key: Option<String>,

    /// Zeabur server ID
    #[arg(long, env = "ZEABUR_SERVER_ID")]
    zeabur_server_id: Option<String>,

    /// Interval for updating Zeabur DNS map (e.g. 30s, 5m)
    #[arg(long, env = "ZEABUR_UPDATE_INTERVAL")]
    zeabur_update_interval: Option<String>,

    /// Allow IP literal destinations past the IP check
    #[arg(long)]
    allow_ip_literals: bool,

    /// Increase verbosity (-v info, -vv debug, -vvv trace, -vvvv trace+deps)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (only errors)
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Converts verbosity count to log level string
    fn log_level(&self) -> Option<String> {
        if self.quiet {
            return Some("error".to_string());
        }
        match self.verbose {
            0 => None,
            1 => Some("info".to_string()),
            2 => Some("debug".to_string()),
            _ => Some("trace".to_string()),
        }
    }

    /// Whether to include verbose dependency logging
    fn trace_deps(&self) -> bool {
        self.verbose >= 4
    }

    fn overrides(&self) -> Overrides {
        Overrides {
            listen: self.listen.clone(),
            port: self.port,
            in_domain_suffix: self.in_domain_suffix.clone(),
            cluster_domain: self.cluster_domain.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            zeabur_api_key: self.zeabur_api_key.clone(),
            zeabur_server_id: self.zeabur_server_id.clone(),
            zeabur_update_interval: self.zeabur_update_interval.clone(),
            allow_ip_literals: self.allow_ip_literals,
        }
    }
}

/// Application entry point.
#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    let _log_guard =
        match logging::init_logging(&config.logging, args.log_level(), args.trace_deps()) {
            Ok(guard) => guard,
            Err(e) => {
                eprintln!("Failed to initialize logging: {}", e);
                process::exit(1);
            }
        };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        suffix = %config.rewrite.in_domain_suffix,
        cluster_domain = %config.rewrite.cluster_domain,
        "Starting zproxy"
    );

    let cancel = CancellationToken::new();
    let store = Arc::new(NameStore::new());
    let mut rewriter = AddressRewriter::new(config.rewrite_config());

    match config.refresh_policy() {
        Ok(Some(policy)) => match Refresher::from_policy(&policy, store.clone()) {
            Ok(refresher) => {
                rewriter = rewriter.with_store(store.clone());
                tokio::spawn(refresher.run(cancel.child_token()));
            }
            Err(e) => {
                error!(error = %e, "Failed to create Zeabur client");
                process::exit(1);
            }
        },
        Ok(None) => info!("Zeabur DNS store disabled: API key or server ID not provided"),
        Err(e) => {
            error!(error = %e, "Invalid refresh configuration");
            process::exit(1);
        }
    }

    let dialer = RewritingDialer::new(rewriter, Arc::new(TcpDialer::new(config.connect_timeout())));
    let mut server = ProxyServer::new(config.server.listen.clone(), Arc::new(dialer));
    if let Some(credentials) = config.credentials() {
        server = server.with_credentials(credentials);
    }

    let listener = match server.bind().await {
        Ok(listener) => listener,
        Err(e) => {
            error!(listen = %server.listen_addr(), error = %e, "Error starting server");
            process::exit(1);
        }
    };

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    if let Err(e) = server.serve(listener, cancel).await {
        error!(error = %e, "Proxy server error");
        process::exit(1);
    }
}

/// Merges defaults, the optional config file and CLI/environment overrides.
fn load_config(args: &Args) -> zproxy::Result<AppConfig> {
    let config_path = args.config.clone().or_else(|| {
        let defaults = ["./zproxy.yaml", "./zproxy.yml", "/etc/zproxy/config.yaml"];
        defaults
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    });

    let mut config = match config_path {
        Some(path) => AppConfig::load(&path)?,
        None => AppConfig::default(),
    };
    config.apply(args.overrides())?;
    Ok(config)
}
