//! Integration tests for zproxy.
//!
//! These tests verify the complete behavior of the proxy components
//! working together.

use async_trait::async_trait;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use zproxy::config::AppConfig;
use zproxy::proxy::{Dialer, ProxyServer, RewritingDialer};
use zproxy::refresher::Refresher;
use zproxy::rewriter::{AddressRewriter, RewriteConfig};
use zproxy::socks::Credentials;
use zproxy::store::NameStore;
use zproxy::topology::{RawTopology, TopologyBuilder};
use zproxy::zeabur::{TopologySource, ZeaburClient};
use zproxy::{ProxyError, Result};

/// Helper to create a temporary config file.
fn create_temp_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

const TOPOLOGY_JSON: &str = r#"{
    "me": {"_id": "u1", "name": "dev", "username": "dev", "email": "dev@example.com"},
    "servers": [
        {"_id": "abc", "name": "primary", "ip": "203.0.113.10"},
        {"_id": "def", "name": "secondary", "ip": "203.0.113.11"}
    ],
    "projects": {"edges": [
        {"node": {
            "_id": "p1",
            "name": "MyProj",
            "environments": [{"_id": "def", "name": "production"}],
            "services": [
                {"_id": "abc", "name": "MyApp", "dnsName": "MyApp"},
                {"_id": "pg1", "name": "PostgreSQL", "dnsName": "postgresql"}
            ],
            "region": {"id": "server-abc", "name": "primary"}
        }},
        {"node": {
            "_id": "p2",
            "name": "Elsewhere",
            "environments": [{"_id": "e2", "name": "production"}],
            "services": [{"_id": "s2", "name": "web", "dnsName": "web"}],
            "region": {"id": "server-def", "name": "secondary"}
        }}
    ]}
}"#;

fn sample_topology() -> RawTopology {
    serde_json::from_str(TOPOLOGY_JSON).unwrap()
}

struct StaticSource(RawTopology);

#[async_trait]
impl TopologySource for StaticSource {
    async fn fetch(&self) -> Result<RawTopology> {
        Ok(self.0.clone())
    }
}

/// Records the requested address and connects to a fixed local backend.
struct LoopbackDialer {
    backend: SocketAddr,
    dialed: Mutex<Vec<String>>,
}

#[async_trait]
impl Dialer for LoopbackDialer {
    async fn dial(&self, address: &str) -> Result<TcpStream> {
        self.dialed.lock().unwrap().push(address.to_string());
        Ok(TcpStream::connect(self.backend).await?)
    }
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn start_proxy(
    rewriter: AddressRewriter,
    credentials: Option<Credentials>,
) -> (SocketAddr, Arc<LoopbackDialer>, CancellationToken) {
    let backend = start_echo_server().await;
    let loopback = Arc::new(LoopbackDialer {
        backend,
        dialed: Mutex::new(Vec::new()),
    });
    let dialer = RewritingDialer::new(rewriter, loopback.clone());

    let mut server = ProxyServer::new("127.0.0.1:0", Arc::new(dialer));
    if let Some(credentials) = credentials {
        server = server.with_credentials(credentials);
    }
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move { server.serve(listener, token).await });

    (addr, loopback, cancel)
}

/// Sends a no-auth greeting and a CONNECT for `domain:port`, returning the reply code.
async fn socks_connect(stream: &mut TcpStream, domain: &str, port: u16) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    send_connect(stream, domain, port).await
}

async fn send_connect(stream: &mut TcpStream, domain: &str, port: u16) -> u8 {
    let mut request = vec![0x05, 0x01, 0x00, 0x03, domain.len() as u8];
    request.extend_from_slice(domain.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    reply[1]
}

fn internal_config() -> RewriteConfig {
    RewriteConfig {
        in_domain_suffix: "internal.local".to_string(),
        cluster_domain: "cluster.local".to_string(),
        ..Default::default()
    }
}

async fn refreshed_store() -> Arc<NameStore> {
    let store = Arc::new(NameStore::new());
    let refresher = Refresher::new(
        Arc::new(StaticSource(sample_topology())),
        TopologyBuilder::new("server-abc"),
        store.clone(),
        Duration::from_secs(300),
    );
    refresher.refresh_once().await.unwrap();
    store
}

mod config_tests {
    use super::*;

    #[test]
    fn test_full_config_load() {
        let yaml = r#"
server:
  listen: "127.0.0.1:1080"
  connect_timeout: 5
  username: "proxy"
  password: "hunter2"

rewrite:
  in_domain_suffix: "internal.local"
  cluster_domain: "svc.cluster.local"
  allow_ip_literals: false

zeabur:
  api_key: "sk-test"
  server_id: "server-abc"
  update_interval: "2m"
  fetch_timeout: 15

logging:
  level: "debug"
  output: "stderr"
  format: "json"
  include_target: false
"#;
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.server.listen, "127.0.0.1:1080");
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.credentials().is_some());

        let policy = config.refresh_policy().unwrap().unwrap();
        assert_eq!(policy.interval, Duration::from_secs(120));
        assert_eq!(policy.fetch_timeout, Duration::from_secs(15));

        let rewriter = AddressRewriter::new(config.rewrite_config());
        assert_eq!(
            rewriter.rewrite_address("foo.internal.local:80").unwrap(),
            "foo.svc.cluster.local:80"
        );
    }

    #[test]
    fn test_minimal_config() {
        let yaml = "# Empty config uses defaults\n{}";
        let file = create_temp_config(yaml);
        let config = AppConfig::load(file.path()).unwrap();

        assert_eq!(config.server.listen, "0.0.0.0:1080");
        assert_eq!(config.logging.level, "info");
        assert!(config.credentials().is_none());
        assert!(config.refresh_policy().unwrap().is_none());
    }
}

mod resolution_tests {
    use super::*;

    #[tokio::test]
    async fn test_refresh_then_rewrite() {
        let store = refreshed_store().await;
        assert_eq!(store.size(), 2);

        let rewriter = AddressRewriter::new(internal_config()).with_store(store);
        let (host, port) = rewriter
            .rewrite("MyApp.MyProj.zeabur.internal.local", "8080")
            .unwrap();
        assert_eq!(host, "service-abc.environment-def.svc.cluster.local");
        assert_eq!(port, "8080");

        let err = rewriter
            .rewrite("web.elsewhere.zeabur.internal.local", "80")
            .unwrap_err();
        assert!(matches!(err, ProxyError::UnknownVirtualName { .. }));
    }

    #[tokio::test]
    async fn test_failed_build_keeps_previous_mapping() {
        let store = refreshed_store().await;
        let refresher = Refresher::new(
            Arc::new(StaticSource(sample_topology())),
            TopologyBuilder::new("server-gone"),
            store.clone(),
            Duration::from_secs(300),
        );

        let err = refresher.refresh_once().await.unwrap_err();
        assert!(matches!(err, ProxyError::UnknownTarget { .. }));
        assert_eq!(store.size(), 2);
        assert!(store.get("myapp.myproj").is_some());
    }

    #[test]
    fn test_direct_mode_without_store() {
        let rewriter = AddressRewriter::new(RewriteConfig {
            in_domain_suffix: "internal.local".to_string(),
            cluster_domain: "svc.cluster.local".to_string(),
            ..Default::default()
        });
        assert_eq!(
            rewriter.rewrite_address("redis.internal.local:6379").unwrap(),
            "redis.svc.cluster.local:6379"
        );
    }
}

mod socks_tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_through_store_backed_name() {
        let store = refreshed_store().await;
        let rewriter = AddressRewriter::new(internal_config()).with_store(store);
        let (proxy, dialer, cancel) = start_proxy(rewriter, None).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        let code = socks_connect(&mut client, "postgresql.myproj.zeabur.internal.local", 5432).await;
        assert_eq!(code, 0x00);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(
            *dialer.dialed.lock().unwrap(),
            vec!["service-pg1.environment-def.svc.cluster.local:5432".to_string()]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_suffix_mismatch_rejected() {
        let (proxy, dialer, cancel) = start_proxy(AddressRewriter::new(internal_config()), None).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        let code = socks_connect(&mut client, "example.com", 443).await;
        assert_eq!(code, 0x02);
        assert!(dialer.dialed.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unknown_virtual_name_rejected() {
        let store = refreshed_store().await;
        let rewriter = AddressRewriter::new(internal_config()).with_store(store);
        let (proxy, dialer, cancel) = start_proxy(rewriter, None).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        let code = socks_connect(&mut client, "unknown.myproj.zeabur.internal.local", 80).await;
        assert_eq!(code, 0x04);
        assert!(dialer.dialed.lock().unwrap().is_empty());
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_ip_literal_rejected() {
        let (proxy, _dialer, cancel) = start_proxy(AddressRewriter::new(internal_config()), None).await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 10, 0, 0, 5, 0x00, 0x50])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x02);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_authenticated_session() {
        let (proxy, dialer, cancel) = start_proxy(
            AddressRewriter::new(internal_config()),
            Some(Credentials::new("proxy", "hunter2")),
        )
        .await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x02]);

        let mut auth = vec![0x01, 5];
        auth.extend_from_slice(b"proxy");
        auth.push(7);
        auth.extend_from_slice(b"hunter2");
        client.write_all(&auth).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);

        let code = send_connect(&mut client, "api.internal.local", 8080).await;
        assert_eq!(code, 0x00);
        assert_eq!(
            *dialer.dialed.lock().unwrap(),
            vec!["api.cluster.local:8080".to_string()]
        );
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bad_credentials_closes_connection() {
        let (proxy, dialer, cancel) = start_proxy(
            AddressRewriter::new(internal_config()),
            Some(Credentials::new("proxy", "hunter2")),
        )
        .await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();

        client
            .write_all(&[0x01, 5, b'p', b'r', b'o', b'x', b'y', 3, b'b', b'a', b'd'])
            .await
            .unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x01]);

        let mut rest = Vec::new();
        let n = client.read_to_end(&mut rest).await.unwrap_or(0);
        assert_eq!(n, 0);
        assert!(dialer.dialed.lock().unwrap().is_empty());
        cancel.cancel();
    }
}

mod zeabur_client_tests {
    use super::*;

    /// Serves one canned HTTP response and returns the URL to hit.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            let header_end = loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
                if let Some(pos) = request.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };

            let headers = String::from_utf8_lossy(&request[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            while request.len() < header_end + content_length {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        });

        format!("http://{addr}/graphql")
    }

    fn client(url: String) -> ZeaburClient {
        ZeaburClient::new(url, "sk-test", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let body = format!("{{\"data\": {}}}", TOPOLOGY_JSON);
        let url = serve_once("200 OK", body).await;

        let raw = client(url).fetch().await.unwrap();
        assert_eq!(raw.servers.len(), 2);

        let mapping = TopologyBuilder::new("server-abc").build(&raw).unwrap();
        assert_eq!(mapping.get("myapp.myproj"), Some("service-abc.environment-def"));
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let url = serve_once("401 Unauthorized", r#"{"error": "unauthorized"}"#.to_string()).await;

        let err = client(url).fetch().await.unwrap_err();
        match err {
            ProxyError::FetchFailure { message } => {
                assert!(message.contains("API request failed with status"))
            }
            other => panic!("Expected FetchFailure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_malformed_body() {
        let url = serve_once("200 OK", "not json at all".to_string()).await;

        let err = client(url).fetch().await.unwrap_err();
        assert!(matches!(err, ProxyError::DecodeFailure { .. }));
    }

    #[tokio::test]
    async fn test_fetch_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client(format!("http://{addr}/graphql")).fetch().await.unwrap_err();
        assert!(matches!(err, ProxyError::FetchFailure { .. }));
    }
}
