//! Remote topology source backed by the Zeabur GraphQL API.

use crate::error::{ProxyError, Result};
use crate::topology::RawTopology;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, trace};

/// Default GraphQL endpoint.
pub const DEFAULT_API_URL: &str = "https://api.zeabur.com/graphql";

const TOPOLOGY_QUERY: &str = r#"
query {
    me {
        _id
        name
        username
        email
    }
    servers {
        _id
        name
        ip
    }
    projects(limit: 1024) {
        edges {
            node {
                _id
                name
                environments {
                    _id
                    name
                }
                services {
                    _id
                    name
                    dnsName
                }
                region {
                    id
                    name
                }
            }
        }
    }
}
"#;

/// Anything that can produce a raw topology document.
///
/// A fetch either returns a complete document or an error; partial data is
/// never returned.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch(&self) -> Result<RawTopology>;
}

#[derive(Serialize)]
struct GraphQlRequest<'a> {
    query: &'a str,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct GraphQlResponse {
    data: Option<RawTopology>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

/// HTTP client for the Zeabur API.
#[derive(Clone)]
pub struct ZeaburClient {
    http: Client,
    api_url: String,
    api_key: String,
}

impl ZeaburClient {
    /// Creates a client with a per-request timeout.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::fetch_failure(format!("error creating client: {e}")))?;

        Ok(Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }
}

#[async_trait]
impl TopologySource for ZeaburClient {
    async fn fetch(&self) -> Result<RawTopology> {
        debug!(url = %self.api_url, "Fetching topology");

        let response = self
            .http
            .post(&self.api_url)
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&GraphQlRequest {
                query: TOPOLOGY_QUERY,
            })
            .send()
            .await
            .map_err(|e| ProxyError::fetch_failure(format!("error sending request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::fetch_failure(format!(
                "API request failed with status: {status}"
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::fetch_failure(format!("error reading response: {e}")))?;
        trace!(bytes = body.len(), "Topology response received");

        decode_response(&body)
    }
}

/// Decodes a GraphQL response body into a topology document.
fn decode_response(body: &[u8]) -> Result<RawTopology> {
    let response: GraphQlResponse = serde_json::from_slice(body)
        .map_err(|e| ProxyError::decode_failure(format!("error decoding response: {e}")))?;

    if let Some(error) = response.errors.first() {
        return Err(ProxyError::fetch_failure(format!(
            "API returned {} error(s): {}",
            response.errors.len(),
            error.message
        )));
    }

    response
        .data
        .ok_or_else(|| ProxyError::decode_failure("response has no data"))
}
