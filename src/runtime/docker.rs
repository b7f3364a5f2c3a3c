//! Docker command rendering and the [`DockerRuntime`] that runs them through
//! a [`RemoteClient`].
//!
//! Bulk removals list names, filter them with `grep -E` and feed the result
//! to `xargs -r`, so removing something that is already gone is not an error.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use super::{ContainerClass, ContainerRuntime, ContainerSpec};
use crate::address::{NetworkLayout, Segment};
use crate::config::Config;
use crate::error::Result;
use crate::remote::RemoteClient;
use crate::resources::Limits;
use crate::types::{Server, ServiceSpec};

/// Chain docker inserts to keep user-defined bridges apart.
pub const ISOLATION_CHAIN: &str = "DOCKER-ISOLATION-STAGE-1";

fn join(args: &[String]) -> String {
    shell_words::join(args)
}

/// Escapes `name` for use inside an extended regular expression.
fn regex_escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Names starting with `prefix`.
pub fn prefix_pattern(prefix: &str) -> String {
    format!("^{}", regex_escape(prefix))
}

/// Exactly `name`.
pub fn exact_pattern(name: &str) -> String {
    format!("^{}$", regex_escape(name))
}

/// `name` and every `name-<suffix>` sidecar.
pub fn group_pattern(name: &str) -> String {
    format!("^{}(-.*)?$", regex_escape(name))
}

// Patterns are built from validated names and never hold a single quote.
pub fn remove_containers_cmd(pattern: &str) -> String {
    format!(
        "docker ps -a --format '{{{{.Names}}}}' | grep -E '{}' | xargs -r docker rm -f",
        pattern
    )
}

pub fn remove_networks_cmd(pattern: &str) -> String {
    format!(
        "docker network ls --format '{{{{.Name}}}}' | grep -E '{}' | xargs -r docker network rm",
        pattern
    )
}

pub fn network_create_cmd(driver: &str, name: &str, segment: &Segment) -> String {
    join(&[
        "docker".into(),
        "network".into(),
        "create".into(),
        "-d".into(),
        driver.into(),
        "--subnet".into(),
        segment.cidr(),
        "--gateway".into(),
        segment.gateway.to_string(),
        name.into(),
    ])
}

/// Creates `name` unless it already exists.
pub fn ensure_network_cmd(driver: &str, name: &str, subnet: &str) -> String {
    format!(
        "docker network ls --format '{{{{.Name}}}}' | grep -qx {name} || {create}",
        name = shell_words::quote(name),
        create = join(&[
            "docker".into(),
            "network".into(),
            "create".into(),
            "-d".into(),
            driver.into(),
            "--subnet".into(),
            subnet.into(),
            name.into(),
        ])
    )
}

fn limit_args(limits: &Limits) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(cpus) = limits.cpus {
        args.push("--cpus".into());
        args.push(cpus.to_string());
    }
    if let Some(memory) = limits.memory {
        args.push("--memory".into());
        args.push(format!("{}b", memory));
    }
    for port in &limits.ports {
        args.push("-p".into());
        args.push(port.clone());
    }
    for volume in &limits.volumes {
        args.push("-v".into());
        args.push(volume.clone());
    }
    args
}

pub fn run_cmd(spec: &ContainerSpec, layout: &NetworkLayout, service_network: &str) -> Result<String> {
    let name = spec.name(layout);
    let mut args: Vec<String> = vec![
        "docker".into(),
        "run".into(),
        "-d".into(),
        "--name".into(),
        name.clone(),
        "--hostname".into(),
        name,
        "--network".into(),
        spec.network(layout, service_network),
    ];
    if let Some(ip) = spec.ip(layout)? {
        args.push("--ip".into());
        args.push(ip.to_string());
    }
    args.extend(limit_args(&spec.limits));
    for (key, value) in &spec.env {
        args.push("-e".into());
        args.push(format!("{}={}", key, value));
    }
    match &spec.entrypoint {
        Some(entrypoint) => {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        // Idle shell; builders exec the real process later.
        None if spec.args.is_empty() => {
            args.push("-it".into());
            args.push("--entrypoint".into());
            args.push("/bin/sh".into());
        }
        None => {}
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    Ok(join(&args))
}

pub fn cp_cmd(container: &str, remote: &str, container_path: &str) -> String {
    join(&[
        "docker".into(),
        "cp".into(),
        remote.into(),
        format!("{}:{}", container, container_path),
    ])
}

pub fn exec_cmd(container: &str, cmd: &str) -> String {
    join(&[
        "docker".into(),
        "exec".into(),
        container.into(),
        "sh".into(),
        "-c".into(),
        cmd.into(),
    ])
}

/// Runs containers and networks through the docker CLI on the remote host.
pub struct DockerRuntime {
    config: Arc<Config>,
    layout: NetworkLayout,
}

impl DockerRuntime {
    pub fn new(config: Arc<Config>) -> Self {
        let layout = NetworkLayout::new(&config);
        Self { config, layout }
    }

    async fn exec(&self, client: &dyn RemoteClient, cmd: &str) -> Result<()> {
        client.run(cmd).await.map(|_| ())
    }

    pub fn service_spec(&self, service: &ServiceSpec) -> ContainerSpec {
        ContainerSpec {
            image: service.image.clone(),
            node: 0,
            subnet_id: 0,
            network_index: 0,
            class: ContainerClass::Service(service.name.clone()),
            limits: Limits {
                ports: service.ports.clone(),
                ..Limits::default()
            },
            env: service.env.clone(),
            entrypoint: service.entrypoint.clone(),
            args: service.args.clone(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(
        &self,
        client: &dyn RemoteClient,
        server: &Server,
        local_id: u32,
    ) -> Result<()> {
        let segment = self.layout.segment(server.subnet_id, local_id)?;
        let name = self.layout.network_name(local_id);
        self.exec(
            client,
            &network_create_cmd(&self.config.network_driver, &name, &segment),
        )
        .await
    }

    async fn destroy_network(&self, client: &dyn RemoteClient, local_id: u32) -> Result<()> {
        let name = self.layout.network_name(local_id);
        self.exec(client, &remove_networks_cmd(&exact_pattern(&name)))
            .await
    }

    async fn destroy_all_networks(&self, client: &dyn RemoteClient) -> Result<()> {
        self.exec(
            client,
            &remove_networks_cmd(&prefix_pattern(self.layout.network_prefix())),
        )
        .await
    }

    async fn run_container(&self, client: &dyn RemoteClient, spec: &ContainerSpec) -> Result<()> {
        let cmd = run_cmd(spec, &self.layout, &self.config.service_network)?;
        self.exec(client, &cmd).await
    }

    async fn kill(&self, client: &dyn RemoteClient, subnet_id: u32, local_id: u32) -> Result<()> {
        let name = self.layout.node_name(subnet_id, local_id);
        self.exec(client, &remove_containers_cmd(&group_pattern(&name)))
            .await
    }

    async fn kill_all(&self, client: &dyn RemoteClient) -> Result<()> {
        info!("removing all node containers on {}", client.host());
        self.exec(
            client,
            &remove_containers_cmd(&prefix_pattern(self.layout.node_prefix())),
        )
        .await
    }

    async fn allow_cross_node_routing(&self, client: &dyn RemoteClient) -> Result<()> {
        self.exec(client, &format!("{} -F {}", self.config.iptables, ISOLATION_CHAIN))
            .await
    }

    async fn create_service_network(&self, client: &dyn RemoteClient) -> Result<()> {
        self.exec(
            client,
            &ensure_network_cmd(
                &self.config.network_driver,
                &self.config.service_network,
                &self.config.service_subnet,
            ),
        )
        .await
    }

    async fn start_service(&self, client: &dyn RemoteClient, service: &ServiceSpec) -> Result<()> {
        info!("starting service {} on {}", service.name, client.host());
        self.run_container(client, &self.service_spec(service)).await
    }

    async fn stop_services(&self, client: &dyn RemoteClient) -> Result<()> {
        self.exec(
            client,
            &remove_containers_cmd(&prefix_pattern(self.layout.service_prefix())),
        )
        .await?;
        self.exec(
            client,
            &remove_networks_cmd(&exact_pattern(&self.config.service_network)),
        )
        .await
    }
}
