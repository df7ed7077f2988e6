//! Remote topology document and its conversion into a name [`Mapping`].
//!
//! The document mirrors the `servers` / `projects` part of the Zeabur
//! GraphQL schema. Only projects hosted on the target server contribute
//! entries:
//!
//! ```text
//! {dnsName}.{project}  ->  service-{serviceId}.environment-{environmentId}
//! ```

use crate::error::{ProxyError, Result};
use crate::store::Mapping;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

/// A dedicated server known to the account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Server {
    #[serde(rename = "_id", default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub ip: String,
}

impl Server {
    /// The identifier projects use to reference this server as their region.
    pub fn region_id(&self) -> String {
        format!("server-{}", self.id)
    }
}

/// A deployment environment of a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Environment {
    #[serde(rename = "_id", default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
}

/// A deployable service of a project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Service {
    #[serde(rename = "_id", default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(rename = "dnsName", default, deserialize_with = "null_as_default")]
    pub dns_name: String,
}

/// Where a project runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Region {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
}

/// A grouping unit holding environments and services.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Project {
    #[serde(rename = "_id", default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub environments: Vec<Environment>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub services: Vec<Service>,
    #[serde(default)]
    pub region: Option<Region>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProjectEdge {
    #[serde(default, deserialize_with = "null_as_default")]
    pub node: Project,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ProjectConnection {
    #[serde(default, deserialize_with = "null_as_default")]
    pub edges: Vec<ProjectEdge>,
}

/// The raw topology as returned by the remote API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RawTopology {
    #[serde(default, deserialize_with = "null_as_default")]
    pub servers: Vec<Server>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub projects: ProjectConnection,
}

/// Reads a JSON `null` as the field's empty value.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl RawTopology {
    /// Iterates over all projects.
    pub fn projects(&self) -> impl Iterator<Item = &Project> {
        self.projects.edges.iter().map(|edge| &edge.node)
    }

    /// Whether a server with the given region id exists.
    pub fn has_server(&self, server_id: &str) -> bool {
        self.servers.iter().any(|s| s.region_id() == server_id)
    }
}

/// Builds name mappings for one target server.
#[derive(Debug, Clone)]
pub struct TopologyBuilder {
    server_id: String,
}

impl TopologyBuilder {
    /// Creates a builder for the given server id (`server-...`).
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Converts `raw` into a complete mapping.
    ///
    /// Fails with [`ProxyError::UnknownTarget`] when the target server is not
    /// listed; no partial mapping is returned in that case. Projects without
    /// environments are skipped, and the first environment is used for all
    /// services of a project. Duplicate keys keep the last service seen.
    pub fn build(&self, raw: &RawTopology) -> Result<Mapping> {
        if !raw.has_server(&self.server_id) {
            return Err(ProxyError::UnknownTarget {
                server_id: self.server_id.clone(),
            });
        }

        let mut mapping = Mapping::new();
        for project in raw.projects() {
            let on_target = project
                .region
                .as_ref()
                .is_some_and(|region| region.id == self.server_id);
            if !on_target {
                continue;
            }

            let project_name = project.name.to_lowercase();
            let Some(environment) = project.environments.first() else {
                debug!(project = %project_name, "Skipping project without environments");
                continue;
            };

            for service in &project.services {
                let key = format!("{}.{}", service.dns_name.to_lowercase(), project_name);
                let value = format!("service-{}.environment-{}", service.id, environment.id);

                if let Some(previous) = mapping.insert(key.clone(), value.clone()) {
                    warn!(
                        key = %key,
                        previous = %previous,
                        value = %value,
                        "Duplicate service name, keeping last"
                    );
                }
            }
        }

        Ok(mapping)
    }
}
