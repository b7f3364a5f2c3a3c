//! Data structures used throughout the build engine.
//!
//! These types are serialised using [`serde`](https://serde.rs/) so the
//! command-line front end can read them from, and write them back to, a
//! deployment document. The records themselves live in an external store in
//! a full installation; the engine only reads and updates them in memory.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::resources::Resources;

pub type ServerId = u32;

/// A machine able to host several nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: ServerId,
    /// Address the remote transport connects to.
    pub addr: String,
    #[serde(default)]
    pub iface: String,
    /// Index of this server in the address plan.
    pub subnet_id: u32,
    pub max: usize,
    /// Nodes currently placed on the server.
    #[serde(default)]
    pub nodes: usize,
    #[serde(default)]
    pub ips: Vec<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub switches: Vec<Switch>,
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server {} ({})", self.id, self.addr)
    }
}

/// Switch the server is cabled to. Carried for the record; the engine does
/// not configure switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    pub addr: String,
    #[serde(default)]
    pub iface: String,
    #[serde(default)]
    pub brand: String,
}

/// One node placed by the allocator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    /// Build-wide number, continuous across servers.
    pub num: usize,
    /// Index on its server; the identity addresses and names derive from.
    pub local_id: u32,
    pub server: ServerId,
    pub ip: Ipv4Addr,
    /// Container name.
    pub name: String,
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({} on server {})", self.num, self.name, self.server)
    }
}

/// Extra container started next to every node, attached to the node's
/// network segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidecarSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
}

/// Long-lived helper started once per build on the coordinator server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// What the caller asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDetails {
    pub network_type: String,
    pub nodes: usize,
    /// One image for all nodes, or one per node.
    pub images: Vec<String>,
    /// Empty, one shared spec, or one per node.
    #[serde(default)]
    pub resources: Vec<Resources>,
    /// Empty, one shared map, or one per node.
    #[serde(default)]
    pub environments: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub sidecars: Vec<SidecarSpec>,
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

impl DeploymentDetails {
    /// Image for the `i`-th node of the request.
    pub fn image(&self, i: usize) -> Option<&str> {
        per_node(&self.images, i).map(String::as_str)
    }

    pub fn resources_for(&self, i: usize) -> Resources {
        per_node(&self.resources, i).cloned().unwrap_or_default()
    }

    pub fn env_for(&self, i: usize) -> BTreeMap<String, String> {
        per_node(&self.environments, i).cloned().unwrap_or_default()
    }
}

/// Selects entry `i` from a list holding either one shared entry or one
/// entry per node.
fn per_node<T>(list: &[T], i: usize) -> Option<&T> {
    match list.len() {
        0 => None,
        1 => list.first(),
        _ => list.get(i),
    }
}

/// The document the command-line front end reads and writes back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub servers: Vec<Server>,
    pub details: DeploymentDetails,
    /// Nodes created by earlier runs.
    #[serde(default)]
    pub nodes: Vec<Node>,
    /// Last session that finished successfully, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<Uuid>,
    /// JSON entries of that session's scratch store, for later add-nodes runs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scratch: BTreeMap<String, serde_json::Value>,
}

impl Deployment {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(Into::into)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(Into::into)
    }

    pub fn server(&self, id: ServerId) -> Result<&Server> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::validation(format!("no server with id {}", id)))
    }
}
