//! Deterministic address and name derivation.
//!
//! Every node owns a small segment carved out of `ip_prefix.0.0.0/8`:
//!
//! ```text
//! | prefix (8) | subnet id (server_bits) | local id (cluster_bits) | host (node_bits) |
//! ```
//!
//! Inside a segment the first host address is the gateway, the next ones
//! belong to the containers attached to the segment (network index 0 is the
//! node itself). The same inputs always give the same addresses and names,
//! so the network and the container can be created independently.

use std::net::Ipv4Addr;

use crate::config::Config;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkLayout {
    ip_prefix: u8,
    server_bits: u32,
    cluster_bits: u32,
    node_bits: u32,
    node_prefix: String,
    network_prefix: String,
    service_prefix: String,
}

/// Addressing of one node segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub network: Ipv4Addr,
    pub prefix_len: u32,
    pub gateway: Ipv4Addr,
}

impl Segment {
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.network, self.prefix_len)
    }
}

impl NetworkLayout {
    pub fn new(config: &Config) -> Self {
        Self {
            ip_prefix: config.ip_prefix,
            server_bits: config.server_bits,
            cluster_bits: config.cluster_bits,
            node_bits: config.node_bits,
            node_prefix: config.node_prefix.clone(),
            network_prefix: config.network_prefix.clone(),
            service_prefix: config.service_prefix.clone(),
        }
    }

    pub fn node_prefix(&self) -> &str {
        &self.node_prefix
    }

    pub fn network_prefix(&self) -> &str {
        &self.network_prefix
    }

    pub fn service_prefix(&self) -> &str {
        &self.service_prefix
    }

    /// Number of nodes one server can address.
    pub fn max_nodes_per_server(&self) -> u32 {
        1 << self.cluster_bits
    }

    /// Highest network index that still fits in a segment.
    pub fn max_network_index(&self) -> u32 {
        (1 << self.node_bits) - 4
    }

    fn base(&self, subnet_id: u32, local_id: u32) -> Result<u32> {
        if subnet_id >= 1 << self.server_bits {
            return Err(Error::validation(format!(
                "subnet id {} does not fit in {} bits",
                subnet_id, self.server_bits
            )));
        }
        if local_id >= self.max_nodes_per_server() {
            return Err(Error::validation(format!(
                "node index {} does not fit in {} bits",
                local_id, self.cluster_bits
            )));
        }
        Ok((u32::from(self.ip_prefix) << 24)
            | (subnet_id << (self.cluster_bits + self.node_bits))
            | (local_id << self.node_bits))
    }

    pub fn segment(&self, subnet_id: u32, local_id: u32) -> Result<Segment> {
        let base = self.base(subnet_id, local_id)?;
        Ok(Segment {
            network: Ipv4Addr::from(base),
            prefix_len: 32 - self.node_bits,
            gateway: Ipv4Addr::from(base + 1),
        })
    }

    pub fn ip(&self, subnet_id: u32, local_id: u32, network_index: u32) -> Result<Ipv4Addr> {
        if network_index > self.max_network_index() {
            return Err(Error::validation(format!(
                "network index {} exceeds the {} addresses of a segment",
                network_index,
                self.max_network_index() + 1
            )));
        }
        let base = self.base(subnet_id, local_id)?;
        Ok(Ipv4Addr::from(base + 2 + network_index))
    }

    pub fn node_ip(&self, subnet_id: u32, local_id: u32) -> Result<Ipv4Addr> {
        self.ip(subnet_id, local_id, 0)
    }

    pub fn network_name(&self, local_id: u32) -> String {
        format!("{}{}", self.network_prefix, local_id)
    }

    /// Unique across the whole network, not only on its server.
    pub fn node_name(&self, subnet_id: u32, local_id: u32) -> String {
        format!("{}{}-{}", self.node_prefix, subnet_id, local_id)
    }

    pub fn sidecar_name(&self, subnet_id: u32, local_id: u32, sidecar: &str) -> String {
        format!("{}-{}", self.node_name(subnet_id, local_id), sidecar)
    }

    pub fn service_name(&self, service: &str) -> String {
        format!("{}{}", self.service_prefix, service)
    }
}
