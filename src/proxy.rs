//! SOCKS5 proxy server that dials rewritten addresses.
//!
//! Every accepted connection runs on its own task:
//! - method negotiation and optional username/password auth
//! - CONNECT request parsing
//! - address rewrite and outbound dial through a [`Dialer`]
//! - byte relay until either side closes

use crate::error::{ProxyError, Result};
use crate::rewriter::AddressRewriter;
use crate::socks::{self, Credentials, Method, Reply};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Opens outbound TCP connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connects to `address` (`host:port`).
    async fn dial(&self, address: &str) -> Result<TcpStream>;
}

/// Plain TCP dialer with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &str) -> Result<TcpStream> {
        match tokio::time::timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(ProxyError::ConnectTimeout {
                address: address.to_string(),
            }),
        }
    }
}

/// Rewrites the requested address before handing it to an inner dialer.
pub struct RewritingDialer {
    rewriter: AddressRewriter,
    inner: Arc<dyn Dialer>,
}

impl RewritingDialer {
    pub fn new(rewriter: AddressRewriter, inner: Arc<dyn Dialer>) -> Self {
        Self { rewriter, inner }
    }
}

#[async_trait]
impl Dialer for RewritingDialer {
    async fn dial(&self, address: &str) -> Result<TcpStream> {
        let rewritten = self.rewriter.rewrite_address(address)?;
        debug!(requested = %address, dialing = %rewritten, "Dialing rewritten address");
        self.inner.dial(&rewritten).await
    }
}

/// The SOCKS5 front-end.
#[derive(Clone)]
pub struct ProxyServer {
    listen: String,
    dialer: Arc<dyn Dialer>,
    credentials: Option<Credentials>,
}

impl ProxyServer {
    /// Creates a server without authentication.
    pub fn new(listen: impl Into<String>, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            listen: listen.into(),
            dialer,
            credentials: None,
        }
    }

    /// Requires clients to authenticate with `credentials`.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen
    }

    /// Binds the listening socket.
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.listen).await?;
        Ok(listener)
    }

    /// Binds and serves until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, cancel).await
    }

    /// Accepts connections on `listener` until `cancel` fires.
    ///
    /// In-flight connections are not waited for on shutdown.
    pub async fn serve(&self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local = listener.local_addr()?;
        match &self.credentials {
            Some(creds) => info!(user = %creds.username, "Authentication enabled"),
            None => warn!("No authentication credentials provided. Running without authentication."),
        }
        info!(listen = %local, "Starting SOCKS5 proxy");

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        if !accept_backoff(&cancel).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let server = self.clone();
            let span = info_span!("conn", peer = %peer);
            tokio::spawn(
                async move {
                    if let Err(e) = server.handle(stream, peer).await {
                        debug!(error = %e, "Connection closed with error");
                    }
                }
                .instrument(span),
            );
        }

        info!("SOCKS5 proxy stopped");
        Ok(())
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr) -> Result<()> {
        trace!(peer = %peer, "Accepted connection");
        self.negotiate(&mut client).await?;

        let target = match socks::read_request(&mut client).await {
            Ok(target) => target,
            Err(e) => {
                if matches!(
                    e,
                    ProxyError::UnsupportedCommand(_) | ProxyError::UnsupportedAddressType(_)
                ) {
                    socks::write_reply(&mut client, e.reply(), None).await?;
                }
                return Err(e);
            }
        };

        let address = target.to_string();
        let mut upstream = match self.dialer.dial(&address).await {
            Ok(upstream) => upstream,
            Err(e) => {
                if e.is_rewrite_error() {
                    info!(target_addr = %address, error = %e, "Rejected connect request");
                } else {
                    error!(target_addr = %address, error = %e, "Failed to connect upstream");
                }
                socks::write_reply(&mut client, e.reply(), None).await?;
                return Err(e);
            }
        };

        let bound = upstream.local_addr().ok();
        socks::write_reply(&mut client, Reply::Succeeded, bound).await?;
        debug!(target_addr = %address, "Tunnel established");

        let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
        debug!(target_addr = %address, sent, received, "Tunnel closed");
        Ok(())
    }

    /// Method selection and, when configured, username/password auth.
    async fn negotiate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let offered = socks::read_greeting(stream).await?;

        let Some(expected) = &self.credentials else {
            if offered.contains(&(Method::NoAuth as u8)) {
                return socks::write_method(stream, Method::NoAuth).await;
            }
            socks::write_method(stream, Method::NoAcceptable).await?;
            return Err(ProxyError::auth_failed("client does not support no-auth"));
        };

        if !offered.contains(&(Method::UserPass as u8)) {
            socks::write_method(stream, Method::NoAcceptable).await?;
            return Err(ProxyError::auth_failed(
                "client does not support username/password",
            ));
        }
        socks::write_method(stream, Method::UserPass).await?;

        let given = socks::read_credentials(stream).await?;
        let accepted = given.matches(expected);
        socks::write_auth_status(stream, accepted).await?;
        if !accepted {
            return Err(ProxyError::auth_failed(format!(
                "invalid credentials for user {}",
                given.username
            )));
        }
        Ok(())
    }
}

/// Pause after a failed accept, e.g. while the process is out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits out [`ACCEPT_BACKOFF`]. Returns `false` if `cancel` fired first.
async fn accept_backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}
