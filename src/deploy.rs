//! Orchestration driver.
//!
//! A build runs its phases in order: planning, provisioning, services,
//! building and finalizing. A failing phase ends the build but nothing it
//! created is rolled back; containers that came up stay up until a clean
//! build or [`Deployer::destroy`] removes them. Deferred actions run at the
//! end of every session whatever the outcome.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::address::NetworkLayout;
use crate::allocator::{self, Mode};
use crate::config::{is_container_name, Config};
use crate::context::BuildContext;
use crate::distribute;
use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::plugin::Registry;
use crate::remote::{Connector, RemoteClient};
use crate::runtime::{ContainerClass, ContainerRuntime, ContainerSpec, DockerRuntime};
use crate::state::{self, BuildState, Scratch};
use crate::types::{Deployment, DeploymentDetails, Node, Server, ServerId, ServiceSpec};

/// Command run inside a node container until it answers.
pub const READY_CHECK: &str = "true";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Planning,
    Provisioning,
    Services,
    Building,
    Finalizing,
    Deleting,
    Destroying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Planning => "planning",
            Phase::Provisioning => "provisioning",
            Phase::Services => "starting services",
            Phase::Building => "building",
            Phase::Finalizing => "finalizing",
            Phase::Deleting => "deleting nodes",
            Phase::Destroying => "destroying",
        };
        f.write_str(label)
    }
}

/// Outcome of a successful build or add-nodes call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildReport {
    pub build_id: Uuid,
    /// Every node of the network after the call.
    pub nodes: Vec<Node>,
    pub new_nodes: Vec<Node>,
    /// What the network-type builder said about the new nodes.
    pub labels: Vec<String>,
    pub warnings: Vec<String>,
}

type Clients = HashMap<ServerId, Arc<dyn RemoteClient>>;

/// Containers to start for one new node.
struct Launch {
    node: ContainerSpec,
    sidecars: Vec<ContainerSpec>,
}

pub struct Deployer {
    config: Arc<Config>,
    layout: NetworkLayout,
    connector: Arc<dyn Connector>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Registry,
    fanout: FanOut,
    cancel: CancellationToken,
    /// Scratch stores of finished sessions, by build id.
    sessions: Mutex<HashMap<Uuid, Scratch>>,
}

impl Deployer {
    pub fn new(config: Arc<Config>, connector: Arc<dyn Connector>) -> Self {
        Self {
            layout: NetworkLayout::new(&config),
            runtime: Arc::new(DockerRuntime::new(Arc::clone(&config))),
            fanout: FanOut::new(config.concurrency_limit),
            registry: Registry::with_builtin(),
            cancel: CancellationToken::new(),
            sessions: Mutex::new(HashMap::new()),
            connector,
            config,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Stops the retry loops of every running session. Sessions started
    /// afterwards are cancelled from the start.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Scratch store left behind by a successful session.
    pub fn scratch_for(&self, build_id: Uuid) -> Option<Scratch> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&build_id)
            .cloned()
    }

    fn retain(&self, state: &BuildState) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.id(), state.scratch());
    }

    /// Clean build: wipes every server and starts `details.nodes` nodes.
    pub async fn build(&self, doc: &mut Deployment) -> Result<BuildReport> {
        let count = doc.details.nodes;
        self.session(doc, Mode::Fresh, count, Scratch::default()).await
    }

    /// Adds `count` nodes to a running network. `parent` names the session
    /// whose scratch store the new one starts from, defaulting to the one
    /// recorded in the document.
    pub async fn add_nodes(
        &self,
        doc: &mut Deployment,
        count: usize,
        parent: Option<Uuid>,
    ) -> Result<BuildReport> {
        if doc.nodes.is_empty() {
            return Err(Error::validation(
                "the deployment has no nodes to add to, build it first",
            ));
        }
        let inherited = self.parent_scratch(doc, parent)?;
        self.session(doc, Mode::Incremental, count, inherited).await
    }

    /// Scratch store an add-nodes session starts from. Sessions this
    /// deployer ran win over what the document carries; a parent named
    /// explicitly must be known to one of them.
    fn parent_scratch(&self, doc: &Deployment, parent: Option<Uuid>) -> Result<Scratch> {
        let Some(id) = parent.or(doc.build_id) else {
            return Ok(Scratch::default());
        };
        if let Some(scratch) = self.scratch_for(id) {
            return Ok(scratch);
        }
        if doc.build_id == Some(id) {
            return Ok(state::from_portable(&doc.scratch));
        }
        Err(Error::validation(format!("unknown parent session {}", id)))
    }

    async fn session(
        &self,
        doc: &mut Deployment,
        mode: Mode,
        count: usize,
        inherited: Scratch,
    ) -> Result<BuildReport> {
        let state = BuildState::new(self.cancel.child_token())?;
        state.set_stage(Phase::Planning.to_string());
        if !inherited.is_empty() {
            debug!("[{}] continuing from session {:?}", state.id(), doc.build_id);
            state.inherit_scratch(&inherited);
        }

        let outcome = self.run_build(&state, doc, mode, count).await;
        state.finalize().await;

        let mut report = outcome?;
        if let Some(err) = state.get_error() {
            return Err(Error::Reported(err));
        }
        self.retain(&state);
        doc.build_id = Some(state.id());
        doc.scratch = state::portable(&state.scratch());
        report.warnings = state.warnings();
        info!(
            "[{}] done: {} new nodes, {} in total",
            report.build_id,
            report.new_nodes.len(),
            report.nodes.len()
        );
        Ok(report)
    }

    async fn run_build(
        &self,
        state: &Arc<BuildState>,
        doc: &mut Deployment,
        mode: Mode,
        count: usize,
    ) -> Result<BuildReport> {
        let builder = self.registry.get(&doc.details.network_type)?;
        validate_servers(&doc.servers)?;
        self.validate_request(&doc.details, count)?;

        let mut services = builder.services();
        services.extend(doc.details.services.iter().cloned());
        validate_services(&services)?;

        let first_num = match mode {
            Mode::Fresh => 0,
            Mode::Incremental => doc.nodes.iter().map(|n| n.num + 1).max().unwrap_or(0),
        };
        let allocation = allocator::plan(&doc.servers, count, first_num, mode, &self.layout)?;
        let new_nodes = allocation.nodes();
        let launches = Arc::new(self.launches(doc, &new_nodes)?);

        allocation.apply(&mut doc.servers);
        match mode {
            Mode::Fresh => {
                // the network the document described is about to be wiped
                doc.nodes = new_nodes.clone();
                doc.build_id = None;
                doc.scratch.clear();
            }
            Mode::Incremental => doc.nodes.extend(new_nodes.iter().cloned()),
        }

        let start_services = mode == Mode::Fresh && !services.is_empty();
        let (needed, idle): (Vec<Server>, Vec<Server>) =
            doc.servers.iter().cloned().partition(|server| {
                doc.nodes.iter().any(|n| n.server == server.id)
                    || (start_services && Some(server.id) == doc.servers.first().map(|s| s.id))
            });
        let mut clients = self.connect(state, &needed, true).await?;
        if mode == Mode::Fresh {
            // idle servers are only cleaned, and only when reachable
            clients.extend(self.connect(state, &idle, false).await?);
        }
        let ctx = Arc::new(BuildContext {
            config: Arc::clone(&self.config),
            layout: self.layout.clone(),
            details: Arc::new(doc.details.clone()),
            servers: doc.servers.clone(),
            nodes: doc.nodes.clone(),
            new_nodes,
            clients,
            state: Arc::clone(state),
            fanout: self.fanout,
            runtime: Arc::clone(&self.runtime),
        });
        state.set_steps(self.count_steps(&ctx, mode, &services, start_services));

        state.set_stage(Phase::Provisioning.to_string());
        if mode == Mode::Fresh {
            self.clean_servers(&ctx).await?;
        }
        self.provision_nodes(&ctx, launches).await?;
        if self.config.cross_node_routing {
            self.allow_routing(&ctx).await?;
        }

        if start_services {
            state.set_stage(Phase::Services.to_string());
            self.start_services(&ctx, &services).await?;
        }

        state.set_stage(Phase::Building.to_string());
        let labels = match mode {
            Mode::Fresh => builder.build(&ctx).await?,
            Mode::Incremental => builder.add(&ctx).await?,
        };
        state.increment_progress();

        state.set_stage(Phase::Finalizing.to_string());
        self.inject_credentials(&ctx).await;

        Ok(BuildReport {
            build_id: state.id(),
            nodes: ctx.nodes.clone(),
            new_nodes: ctx.new_nodes.clone(),
            labels,
            warnings: Vec::new(),
        })
    }

    fn validate_request(&self, details: &DeploymentDetails, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::validation("at least one node must be requested"));
        }
        if count > self.config.max_nodes {
            return Err(Error::validation(format!(
                "{} nodes requested, the limit is {}",
                count, self.config.max_nodes
            )));
        }
        if details.images.is_empty() || details.images.iter().any(|i| i.trim().is_empty()) {
            return Err(Error::validation("every node needs a non-empty image"));
        }
        for (field, len) in [
            ("images", details.images.len()),
            ("resources", details.resources.len()),
            ("environments", details.environments.len()),
        ] {
            if len > 1 && len != count {
                return Err(Error::validation(format!(
                    "{} holds {} entries for {} nodes",
                    field, len, count
                )));
            }
        }
        for resources in &details.resources {
            resources.validate()?;
        }

        let max_sidecars = self.layout.max_network_index() as usize;
        if details.sidecars.len() > max_sidecars {
            return Err(Error::validation(format!(
                "{} sidecars requested, a node segment fits {}",
                details.sidecars.len(),
                max_sidecars
            )));
        }
        let mut seen = HashSet::new();
        for sidecar in &details.sidecars {
            if !is_container_name(&sidecar.name) || !seen.insert(sidecar.name.as_str()) {
                return Err(Error::validation(format!(
                    "invalid or duplicate sidecar name {:?}",
                    sidecar.name
                )));
            }
            if sidecar.image.trim().is_empty() {
                return Err(Error::validation(format!(
                    "sidecar {} has no image",
                    sidecar.name
                )));
            }
            sidecar.resources.validate()?;
        }
        Ok(())
    }

    /// Container specs for every new node, in request order.
    fn launches(&self, doc: &Deployment, nodes: &[Node]) -> Result<HashMap<Uuid, Launch>> {
        let details = &doc.details;
        let mut launches = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let server = doc.server(node.server)?;
            let image = details
                .image(i)
                .ok_or_else(|| Error::validation(format!("no image for node {}", node.num)))?;
            let mut spec = ContainerSpec::node(image, server.subnet_id, node.local_id);
            spec.limits = details.resources_for(i).validate()?;
            spec.env = details.env_for(i);

            let mut sidecars = Vec::with_capacity(details.sidecars.len());
            for (k, sidecar) in details.sidecars.iter().enumerate() {
                sidecars.push(ContainerSpec {
                    image: sidecar.image.clone(),
                    node: node.local_id,
                    subnet_id: server.subnet_id,
                    network_index: k as u32 + 1,
                    class: ContainerClass::Sidecar(sidecar.name.clone()),
                    limits: sidecar.resources.validate()?,
                    env: sidecar.env.clone(),
                    entrypoint: None,
                    args: Vec::new(),
                });
            }
            launches.insert(
                node.id,
                Launch {
                    node: spec,
                    sidecars,
                },
            );
        }
        Ok(launches)
    }

    fn count_steps(
        &self,
        ctx: &BuildContext,
        mode: Mode,
        services: &[ServiceSpec],
        start_services: bool,
    ) -> usize {
        // network, node container, readiness, plus one per sidecar
        let per_node = 3 + ctx.details.sidecars.len();
        let mut steps = ctx.new_nodes.len() * per_node + 1;
        if mode == Mode::Fresh {
            steps += ctx.clients.len();
        }
        if self.config.cross_node_routing {
            steps += ctx.servers_of(&ctx.new_nodes).len();
        }
        if start_services {
            steps += services.len() + 1;
        }
        if self.config.ssh_public_key.is_some() {
            steps += ctx.new_nodes.len();
        }
        steps
    }

    /// Opens one client per server in parallel. With `required` every
    /// unreachable server is a failure of the call; otherwise it is a
    /// warning and the server is left out.
    async fn connect(
        &self,
        state: &Arc<BuildState>,
        servers: &[Server],
        required: bool,
    ) -> Result<Clients> {
        let found = Arc::new(Mutex::new(HashMap::with_capacity(servers.len())));
        let (connector, shared) = (Arc::clone(&self.connector), Arc::clone(&found));
        let work = move |server: Server| {
            let (connector, found) = (Arc::clone(&connector), Arc::clone(&shared));
            async move {
                let client = open(connector.as_ref(), &server).await?;
                found
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(server.id, client);
                Ok::<(), Error>(())
            }
        };
        if required {
            self.fanout
                .for_each_server(state, "connect", servers, work)
                .await?;
        } else {
            self.fanout
                .for_each_best_effort(state, "connect", servers.to_vec(), work)
                .await;
        }
        let clients = std::mem::take(&mut *found.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(clients)
    }

    /// Wipes every server the session reached.
    async fn clean_servers(&self, ctx: &Arc<BuildContext>) -> Result<()> {
        let servers: Vec<Server> = ctx
            .servers
            .iter()
            .filter(|s| ctx.clients.contains_key(&s.id))
            .cloned()
            .collect();
        let shared = Arc::clone(ctx);
        ctx.fanout
            .for_each_server(&ctx.state, "server cleanup", &servers, move |server| {
                let ctx = Arc::clone(&shared);
                async move {
                    let client = ctx.client(server.id)?;
                    ctx.runtime.destroy_all(client.as_ref()).await?;
                    ctx.state.increment_progress();
                    Ok(())
                }
            })
            .await
    }

    async fn provision_nodes(
        &self,
        ctx: &Arc<BuildContext>,
        launches: Arc<HashMap<Uuid, Launch>>,
    ) -> Result<()> {
        let shared = Arc::clone(ctx);
        ctx.fanout
            .for_each_node(&ctx.state, "node provisioning", &ctx.new_nodes, move |node| {
                let ctx = Arc::clone(&shared);
                let launches = Arc::clone(&launches);
                async move {
                    let launch = launches
                        .get(&node.id)
                        .ok_or_else(|| Error::Internal(format!("no launch plan for {}", node)))?;
                    provision_node(&ctx, launch, &node).await
                }
            })
            .await
    }

    async fn allow_routing(&self, ctx: &Arc<BuildContext>) -> Result<()> {
        let servers = ctx.servers_of(&ctx.new_nodes);
        let shared = Arc::clone(ctx);
        ctx.fanout
            .for_each_server(&ctx.state, "routing adjustment", &servers, move |server| {
                let ctx = Arc::clone(&shared);
                async move {
                    let client = ctx.client(server.id)?;
                    ctx.runtime.allow_cross_node_routing(client.as_ref()).await?;
                    ctx.state.increment_progress();
                    Ok(())
                }
            })
            .await
    }

    /// Services run once per build on the coordinator, the first server.
    async fn start_services(&self, ctx: &BuildContext, services: &[ServiceSpec]) -> Result<()> {
        let coordinator = ctx
            .servers
            .first()
            .ok_or_else(|| Error::validation("no coordinator server"))?;
        let client = ctx.client(coordinator.id)?;
        self.runtime.create_service_network(client.as_ref()).await?;
        ctx.state.increment_progress();
        for service in services {
            self.runtime
                .start_service(client.as_ref(), service)
                .await
                .map_err(|err| Error::Target {
                    target: format!("service {}", service.name),
                    source: Box::new(err),
                })?;
            ctx.state.increment_progress();
        }
        Ok(())
    }

    /// Installs the operator's public key in every new node. Failures are
    /// warnings.
    async fn inject_credentials(&self, ctx: &Arc<BuildContext>) {
        let Some(path) = &self.config.ssh_public_key else {
            return;
        };
        let key = match tokio::fs::read_to_string(path).await {
            Ok(key) => key.trim().to_string(),
            Err(err) => {
                ctx.state
                    .report_warning(format!("cannot read {}: {}", path.display(), err));
                return;
            }
        };
        let cmd = authorized_key_cmd(&key);
        let shared = Arc::clone(ctx);
        ctx.fanout
            .for_each_best_effort(
                &ctx.state,
                "ssh key injection",
                ctx.new_nodes.clone(),
                move |node| {
                    let ctx = Arc::clone(&shared);
                    let cmd = cmd.clone();
                    async move {
                        let client = ctx.client(node.server)?;
                        client.container_exec(&node.name, &cmd).await?;
                        ctx.state.increment_progress();
                        Ok(())
                    }
                },
            )
            .await;
    }

    /// Removes the nodes numbered `nums` together with their sidecars and
    /// networks. Nodes removed before a failure are dropped from the
    /// document even when the call fails.
    pub async fn delete_nodes(&self, doc: &mut Deployment, nums: &[usize]) -> Result<()> {
        let state = BuildState::new(self.cancel.child_token())?;
        state.set_stage(Phase::Deleting.to_string());
        let outcome = self.run_delete(&state, doc, nums).await;
        state.finalize().await;
        outcome
    }

    async fn run_delete(
        &self,
        state: &Arc<BuildState>,
        doc: &mut Deployment,
        nums: &[usize],
    ) -> Result<()> {
        let mut targets: Vec<Node> = Vec::with_capacity(nums.len());
        for num in nums {
            let node = doc
                .nodes
                .iter()
                .find(|n| n.num == *num)
                .ok_or_else(|| Error::validation(format!("no node numbered {}", num)))?;
            if !targets.iter().any(|t| t.id == node.id) {
                targets.push(node.clone());
            }
        }
        let servers: Arc<HashMap<ServerId, Server>> = Arc::new(
            doc.servers
                .iter()
                .filter(|s| targets.iter().any(|n| n.server == s.id))
                .map(|s| (s.id, s.clone()))
                .collect(),
        );
        state.set_steps(targets.len());

        let removed = Arc::new(Mutex::new(HashSet::new()));
        let (connector, runtime, done, shared) = (
            Arc::clone(&self.connector),
            Arc::clone(&self.runtime),
            Arc::clone(&removed),
            Arc::clone(state),
        );
        let result = self
            .fanout
            .for_each_node(state, "node removal", &targets, move |node| {
                let (connector, runtime, servers, done, state) = (
                    Arc::clone(&connector),
                    Arc::clone(&runtime),
                    Arc::clone(&servers),
                    Arc::clone(&done),
                    Arc::clone(&shared),
                );
                async move {
                    let server = servers.get(&node.server).ok_or_else(|| {
                        Error::validation(format!("no server with id {}", node.server))
                    })?;
                    let client = open(connector.as_ref(), server).await?;
                    runtime
                        .kill(client.as_ref(), server.subnet_id, node.local_id)
                        .await?;
                    runtime.destroy_network(client.as_ref(), node.local_id).await?;
                    done.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(node.id);
                    state.increment_progress();
                    Ok(())
                }
            })
            .await;

        let removed = std::mem::take(&mut *removed.lock().unwrap_or_else(PoisonError::into_inner));
        forget_nodes(doc, &removed);
        result
    }

    /// Removes every node, service and network on every server. An
    /// unreachable server fails on its own; the others are still cleared.
    pub async fn destroy(&self, doc: &mut Deployment) -> Result<()> {
        let state = BuildState::new(self.cancel.child_token())?;
        state.set_stage(Phase::Destroying.to_string());
        let outcome = self.run_destroy(&state, doc).await;
        state.finalize().await;
        outcome
    }

    async fn run_destroy(&self, state: &Arc<BuildState>, doc: &mut Deployment) -> Result<()> {
        state.set_steps(doc.servers.len());

        let cleared = Arc::new(Mutex::new(HashSet::new()));
        let (connector, runtime, done, shared) = (
            Arc::clone(&self.connector),
            Arc::clone(&self.runtime),
            Arc::clone(&cleared),
            Arc::clone(state),
        );
        let result = self
            .fanout
            .for_each_server(state, "destroy", &doc.servers, move |server| {
                let (connector, runtime, done, state) = (
                    Arc::clone(&connector),
                    Arc::clone(&runtime),
                    Arc::clone(&done),
                    Arc::clone(&shared),
                );
                async move {
                    let client = open(connector.as_ref(), &server).await?;
                    runtime.destroy_all(client.as_ref()).await?;
                    done.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(server.id);
                    state.increment_progress();
                    Ok(())
                }
            })
            .await;

        let cleared = std::mem::take(&mut *cleared.lock().unwrap_or_else(PoisonError::into_inner));
        for server in doc.servers.iter_mut().filter(|s| cleared.contains(&s.id)) {
            server.nodes = 0;
            server.ips.clear();
        }
        doc.nodes.retain(|n| !cleared.contains(&n.server));
        if doc.nodes.is_empty() {
            doc.build_id = None;
            doc.scratch.clear();
        }
        result
    }
}

async fn open(connector: &dyn Connector, server: &Server) -> Result<Arc<dyn RemoteClient>> {
    connector
        .connect(server)
        .await
        .map_err(|err| Error::Target {
            target: format!("connect to {}", server.addr),
            source: Box::new(err),
        })
}

async fn provision_node(ctx: &BuildContext, launch: &Launch, node: &Node) -> Result<()> {
    let client = ctx.client(node.server)?;
    let server = ctx.server(node.server)?;

    ctx.runtime
        .create_network(client.as_ref(), server, node.local_id)
        .await?;
    ctx.state.increment_progress();

    ctx.runtime.run_container(client.as_ref(), &launch.node).await?;
    ctx.state.increment_progress();

    for sidecar in &launch.sidecars {
        ctx.runtime.run_container(client.as_ref(), sidecar).await?;
        ctx.state.increment_progress();
    }

    distribute::wait_for_node(ctx, node, READY_CHECK).await?;
    ctx.state.increment_progress();
    debug!("{} is up at {}", node, node.ip);
    Ok(())
}

/// Drops removed nodes from the document. Their slots stay counted so
/// local identities are never handed out twice before a clean build.
fn forget_nodes(doc: &mut Deployment, removed: &HashSet<Uuid>) {
    let (gone, kept): (Vec<Node>, Vec<Node>) = std::mem::take(&mut doc.nodes)
        .into_iter()
        .partition(|n| removed.contains(&n.id));
    doc.nodes = kept;
    for node in gone {
        if let Some(server) = doc.servers.iter_mut().find(|s| s.id == node.server) {
            server.ips.retain(|ip| *ip != node.ip);
        }
    }
}

fn validate_servers(servers: &[Server]) -> Result<()> {
    if servers.is_empty() {
        return Err(Error::validation("no servers to build on"));
    }
    let mut ids = HashSet::new();
    let mut subnets = HashSet::new();
    for server in servers {
        if !ids.insert(server.id) {
            return Err(Error::validation(format!("duplicate server id {}", server.id)));
        }
        if !subnets.insert(server.subnet_id) {
            return Err(Error::validation(format!(
                "duplicate subnet id {} on {}",
                server.subnet_id, server
            )));
        }
    }
    Ok(())
}

fn validate_services(services: &[ServiceSpec]) -> Result<()> {
    let mut seen = HashSet::new();
    for service in services {
        if !is_container_name(&service.name) || !seen.insert(service.name.as_str()) {
            return Err(Error::validation(format!(
                "invalid or duplicate service name {:?}",
                service.name
            )));
        }
        if service.image.trim().is_empty() {
            return Err(Error::validation(format!(
                "service {} has no image",
                service.name
            )));
        }
    }
    Ok(())
}

fn authorized_key_cmd(key: &str) -> String {
    format!(
        "mkdir -p /root/.ssh && chmod 700 /root/.ssh && echo {} >> /root/.ssh/authorized_keys \
         && chmod 600 /root/.ssh/authorized_keys",
        shell_words::quote(key)
    )
}
