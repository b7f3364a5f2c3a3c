use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::remote::RetryPolicy;

/// Process-wide settings. Built once and handed to the deployer, the
/// fan-out executor and the container runtime.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Upper bound on concurrently running invocations of one fan-out call.
    pub concurrency_limit: usize,
    /// Largest node count a single build or add-nodes request may ask for.
    pub max_nodes: usize,

    pub node_prefix: String,
    pub network_prefix: String,
    pub service_prefix: String,
    pub service_network: String,
    pub service_subnet: String,
    pub network_driver: String,

    /// First octet of every node address.
    pub ip_prefix: u8,
    pub server_bits: u32,
    pub cluster_bits: u32,
    pub node_bits: u32,

    /// Operator public key injected into every node container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_identity: Option<PathBuf>,
    pub ssh_port: u16,

    /// Staging directory on servers for the first hop of file distribution.
    pub remote_tmp_dir: String,
    /// 0 retries forever.
    pub ready_attempts: u32,
    pub ready_delay_ms: u64,
    pub verify_copies: bool,
    pub cross_node_routing: bool,
    pub iptables: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency_limit: 20,
            max_nodes: 200,
            node_prefix: "tn-node".into(),
            network_prefix: "tn-net".into(),
            service_prefix: "tn-svc-".into(),
            service_network: "tn-services".into(),
            service_subnet: "172.30.0.0/16".into(),
            network_driver: "bridge".into(),
            ip_prefix: 10,
            server_bits: 8,
            cluster_bits: 13,
            node_bits: 3,
            ssh_public_key: None,
            ssh_user: None,
            ssh_identity: None,
            ssh_port: 22,
            remote_tmp_dir: "/tmp/shipyard".into(),
            ready_attempts: 60,
            ready_delay_ms: 1000,
            verify_copies: true,
            cross_node_routing: true,
            iptables: "iptables".into(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("shipyard.toml"))
            .merge(Json::file("shipyard.json"))
            .merge(Env::prefixed("SHIPYARD_"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(Error::validation("concurrency_limit must be at least 1"));
        }
        if self.max_nodes == 0 {
            return Err(Error::validation("max_nodes must be at least 1"));
        }
        let bits = self.server_bits + self.cluster_bits + self.node_bits;
        if bits != 24 {
            return Err(Error::validation(format!(
                "server_bits + cluster_bits + node_bits must be 24, got {}",
                bits
            )));
        }
        // network, gateway, node and broadcast addresses
        if self.node_bits < 2 {
            return Err(Error::validation("node_bits must be at least 2"));
        }
        for (field, name) in [
            ("node_prefix", &self.node_prefix),
            ("network_prefix", &self.network_prefix),
            ("service_prefix", &self.service_prefix),
            ("service_network", &self.service_network),
        ] {
            if !is_container_name(name) {
                return Err(Error::validation(format!(
                    "{} must be a non-empty run of [A-Za-z0-9_.-], got {:?}",
                    field, name
                )));
            }
        }
        if self.node_prefix.starts_with(&self.service_prefix)
            || self.service_prefix.starts_with(&self.node_prefix)
        {
            return Err(Error::validation(
                "node_prefix and service_prefix must not overlap",
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: (self.ready_attempts > 0).then_some(self.ready_attempts),
            delay: Duration::from_millis(self.ready_delay_ms),
        }
    }
}

/// Names end up inside shell commands and grep patterns.
pub(crate) fn is_container_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}
