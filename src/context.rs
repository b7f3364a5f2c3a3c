use std::collections::HashMap;
use std::sync::Arc;

use crate::address::NetworkLayout;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::remote::RemoteClient;
use crate::runtime::ContainerRuntime;
use crate::state::BuildState;
use crate::types::{DeploymentDetails, Node, Server, ServerId};

/// What a build phase gets to work with once provisioning is done.
pub struct BuildContext {
    pub config: Arc<Config>,
    pub layout: NetworkLayout,
    pub details: Arc<DeploymentDetails>,
    pub servers: Vec<Server>,
    /// Every node of the network, including ones from earlier sessions.
    pub nodes: Vec<Node>,
    /// Nodes created by this session.
    pub new_nodes: Vec<Node>,
    pub clients: HashMap<ServerId, Arc<dyn RemoteClient>>,
    pub state: Arc<BuildState>,
    pub fanout: FanOut,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl BuildContext {
    pub fn client(&self, server: ServerId) -> Result<Arc<dyn RemoteClient>> {
        self.clients
            .get(&server)
            .cloned()
            .ok_or_else(|| Error::Internal(format!("no connection to server {}", server)))
    }

    pub fn server(&self, id: ServerId) -> Result<&Server> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::Internal(format!("unknown server {}", id)))
    }

    /// Servers hosting at least one of `nodes`, in server order.
    pub fn servers_of(&self, nodes: &[Node]) -> Vec<Server> {
        self.servers
            .iter()
            .filter(|s| nodes.iter().any(|n| n.server == s.id))
            .cloned()
            .collect()
    }
}
