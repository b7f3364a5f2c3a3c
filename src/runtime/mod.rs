use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::address::NetworkLayout;
use crate::error::{Error, Failure, Result};
use crate::remote::RemoteClient;
use crate::resources::Limits;
use crate::types::{Server, ServiceSpec};

pub mod docker;
pub use docker::DockerRuntime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerClass {
    Node,
    /// Runs next to a node on the node's segment.
    Sidecar(String),
    /// Build-wide helper on the service network.
    Service(String),
}

/// Everything needed to launch one container.
///
/// Name, address and network are derived from `(subnet_id, node,
/// network_index)` through the layout and are never stored here.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    /// Local identity of the node the container belongs to.
    pub node: u32,
    pub subnet_id: u32,
    pub network_index: u32,
    pub class: ContainerClass,
    pub limits: Limits,
    pub env: BTreeMap<String, String>,
    pub entrypoint: Option<String>,
    pub args: Vec<String>,
}

impl ContainerSpec {
    pub fn node(image: &str, subnet_id: u32, node: u32) -> Self {
        Self {
            image: image.to_string(),
            node,
            subnet_id,
            network_index: 0,
            class: ContainerClass::Node,
            limits: Limits::default(),
            env: BTreeMap::new(),
            entrypoint: None,
            args: Vec::new(),
        }
    }

    pub fn name(&self, layout: &NetworkLayout) -> String {
        match &self.class {
            ContainerClass::Node => layout.node_name(self.subnet_id, self.node),
            ContainerClass::Sidecar(name) => layout.sidecar_name(self.subnet_id, self.node, name),
            ContainerClass::Service(name) => layout.service_name(name),
        }
    }

    /// Fixed address on the node segment; services get theirs from the engine.
    pub fn ip(&self, layout: &NetworkLayout) -> Result<Option<Ipv4Addr>> {
        match self.class {
            ContainerClass::Service(_) => Ok(None),
            _ => layout
                .ip(self.subnet_id, self.node, self.network_index)
                .map(Some),
        }
    }

    pub fn network(&self, layout: &NetworkLayout, service_network: &str) -> String {
        match self.class {
            ContainerClass::Service(_) => service_network.to_string(),
            _ => layout.network_name(self.node),
        }
    }
}

/// Container and network lifecycle on one host.
///
/// Bulk removal by name prefix is the only rollback there is; nothing keeps
/// a record of individual containers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create the isolated segment of node `local_id` on `server`.
    async fn create_network(&self, client: &dyn RemoteClient, server: &Server, local_id: u32)
        -> Result<()>;

    async fn destroy_network(&self, client: &dyn RemoteClient, local_id: u32) -> Result<()>;

    async fn destroy_all_networks(&self, client: &dyn RemoteClient) -> Result<()>;

    async fn run_container(&self, client: &dyn RemoteClient, spec: &ContainerSpec) -> Result<()>;

    /// Remove a node container together with its sidecars.
    async fn kill(&self, client: &dyn RemoteClient, subnet_id: u32, local_id: u32) -> Result<()>;

    async fn kill_all(&self, client: &dyn RemoteClient) -> Result<()>;

    /// Remove every node, service and network this system created on the
    /// host. Every step is attempted even when an earlier one failed.
    async fn destroy_all(&self, client: &dyn RemoteClient) -> Result<()> {
        let steps = [
            ("containers", self.kill_all(client).await),
            ("services", self.stop_services(client).await),
            ("networks", self.destroy_all_networks(client).await),
        ];
        let failures: Vec<Failure> = steps
            .into_iter()
            .filter_map(|(step, result)| {
                result.err().map(|err| Failure {
                    target: format!("{} on {}", step, client.host()),
                    message: err.to_string(),
                })
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::FanOut {
                what: "host teardown".into(),
                failures,
            })
        }
    }

    /// Let node segments route to each other.
    async fn allow_cross_node_routing(&self, client: &dyn RemoteClient) -> Result<()>;

    async fn create_service_network(&self, client: &dyn RemoteClient) -> Result<()>;

    async fn start_service(&self, client: &dyn RemoteClient, service: &ServiceSpec) -> Result<()>;

    async fn stop_services(&self, client: &dyn RemoteClient) -> Result<()>;
}
