// Shared fixtures for shipyard integration tests: an in-memory cluster that
// understands the docker commands the engine sends.
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use shipyard::error::{Error, Result};
use shipyard::remote::{Connector, RemoteClient};
use shipyard::runtime::docker::{cp_cmd, exec_cmd};
use shipyard::types::{Deployment, DeploymentDetails, Server};
use shipyard::{Config, Deployer};

pub const TEST_IMAGE: &str = "alpine:3.19";

#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    pub image: String,
    pub network: String,
    pub ip: Option<String>,
    pub files: HashMap<String, Vec<u8>>,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub containers: BTreeMap<String, FakeContainer>,
    pub networks: BTreeSet<String>,
    /// Files on the host itself, by absolute path.
    pub files: HashMap<String, Vec<u8>>,
    pub commands: Vec<String>,
    pub routing_flushes: usize,
}

/// One server. Commands containing any of the `failing` substrings fail.
pub struct FakeHost {
    addr: String,
    state: Mutex<HostState>,
    failing: Mutex<Vec<String>>,
}

impl FakeHost {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            state: Mutex::new(HostState::default()),
            failing: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_when(&self, needle: &str) {
        self.failing.lock().unwrap().push(needle.to_string());
    }

    pub fn containers(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.get(name).cloned()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state.lock().unwrap().networks.iter().cloned().collect()
    }

    pub fn host_files(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn routing_flushes(&self) -> usize {
        self.state.lock().unwrap().routing_flushes
    }

    /// Simulates an operator removing a container by hand.
    pub fn remove_container(&self, name: &str) {
        self.state.lock().unwrap().containers.remove(name);
    }

    fn record(&self, cmd: &str) -> Result<()> {
        self.state.lock().unwrap().commands.push(cmd.to_string());
        let failing = self.failing.lock().unwrap();
        if failing.iter().any(|needle| cmd.contains(needle.as_str())) {
            return Err(Error::remote(&self.addr, cmd, "injected failure"));
        }
        Ok(())
    }

    fn fail(&self, cmd: &str, message: &str) -> Error {
        Error::remote(&self.addr, cmd, message)
    }

    fn interpret(&self, cmd: &str) -> Result<String> {
        let words = shell_words::split(cmd).map_err(|e| self.fail(cmd, &e.to_string()))?;
        let has = |seq: &[&str]| words.windows(seq.len()).any(|w| w == seq);
        let starts = |seq: &[&str]| {
            words.len() >= seq.len() && words.iter().zip(seq).all(|(w, s)| w == s)
        };
        let after = |flag: &str| {
            words
                .iter()
                .position(|w| w == flag)
                .and_then(|i| words.get(i + 1))
                .cloned()
        };
        let mut state = self.state.lock().unwrap();

        if has(&["grep", "-qx"]) {
            let name = words.last().cloned().unwrap_or_default();
            state.networks.insert(name);
            return Ok(String::new());
        }
        if starts(&["docker", "ps"]) && has(&["xargs", "-r"]) {
            let pattern = after("-E").unwrap_or_default();
            state.containers.retain(|name, _| !matches(&pattern, name));
            return Ok(String::new());
        }
        if starts(&["docker", "network", "ls"])
            && has(&["xargs", "-r"])
        {
            let pattern = after("-E").unwrap_or_default();
            state.networks.retain(|name| !matches(&pattern, name));
            return Ok(String::new());
        }
        if starts(&["docker", "network", "create"]) {
            let name = words.last().cloned().unwrap_or_default();
            if !state.networks.insert(name) {
                return Err(self.fail(cmd, "network already exists"));
            }
            return Ok(String::new());
        }
        if starts(&["docker", "run"]) {
            let name = after("--name").unwrap_or_default();
            let network = after("--network").unwrap_or_default();
            if !state.networks.contains(&network) {
                return Err(self.fail(cmd, "network not found"));
            }
            if state.containers.contains_key(&name) {
                return Err(self.fail(cmd, "container name already in use"));
            }
            let container = FakeContainer {
                image: words.last().cloned().unwrap_or_default(),
                network,
                ip: after("--ip"),
                files: HashMap::new(),
            };
            state.containers.insert(name, container);
            return Ok(String::new());
        }
        if starts(&["iptables"]) {
            state.routing_flushes += 1;
            return Ok(String::new());
        }
        if starts(&["rm", "-f"]) {
            for path in &words[2..] {
                state.files.remove(path);
            }
            return Ok(String::new());
        }
        Ok(String::new())
    }
}

/// Mirrors the three pattern shapes the docker runtime emits.
fn matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim_start_matches('^');
    if let Some(base) = pattern.strip_suffix("(-.*)?$") {
        let base = unescape(base);
        name == base || name.starts_with(&format!("{}-", base))
    } else if let Some(base) = pattern.strip_suffix('$') {
        name == unescape(base)
    } else {
        name.starts_with(&unescape(pattern))
    }
}

fn unescape(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[async_trait]
impl RemoteClient for FakeHost {
    fn host(&self) -> &str {
        &self.addr
    }

    async fn run(&self, cmd: &str) -> Result<String> {
        self.record(cmd)?;
        self.interpret(cmd)
    }

    async fn scp(&self, local: &Path, remote: &str) -> Result<()> {
        self.record(&format!("scp {} {}", local.display(), remote))?;
        let bytes = tokio::fs::read(local).await?;
        self.state
            .lock()
            .unwrap()
            .files
            .insert(remote.to_string(), bytes);
        Ok(())
    }

    async fn container_cp(&self, container: &str, remote: &str, container_path: &str) -> Result<()> {
        let cmd = cp_cmd(container, remote, container_path);
        self.record(&cmd)?;
        let mut state = self.state.lock().unwrap();
        let bytes = state
            .files
            .get(remote)
            .cloned()
            .ok_or_else(|| self.fail(&cmd, "no such file on host"))?;
        let target = state
            .containers
            .get_mut(container)
            .ok_or_else(|| self.fail(&cmd, "no such container"))?;
        target.files.insert(container_path.to_string(), bytes);
        Ok(())
    }

    async fn container_exec(&self, container: &str, cmd: &str) -> Result<String> {
        let shown = exec_cmd(container, cmd);
        self.record(&shown)?;
        let state = self.state.lock().unwrap();
        let target = state
            .containers
            .get(container)
            .ok_or_else(|| self.fail(&shown, "no such container"))?;
        if let Some(path) = cmd.strip_prefix("sha256sum ") {
            let path = shell_words::split(path)
                .ok()
                .and_then(|words| words.into_iter().next())
                .unwrap_or_default();
            let bytes = target
                .files
                .get(&path)
                .ok_or_else(|| self.fail(&shown, "no such file in container"))?;
            return Ok(format!("{}  {}\n", hex::encode(Sha256::digest(bytes)), path));
        }
        Ok(String::new())
    }
}

/// Every server the engine connects to, by address.
#[derive(Default)]
pub struct FakeCluster {
    hosts: Mutex<HashMap<String, Arc<FakeHost>>>,
    unreachable: Mutex<BTreeSet<String>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn host(&self, addr: &str) -> Arc<FakeHost> {
        Arc::clone(
            self.hosts
                .lock()
                .unwrap()
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(FakeHost::new(addr))),
        )
    }

    /// Makes every later connection to `addr` fail.
    pub fn cut_off(&self, addr: &str) {
        self.unreachable.lock().unwrap().insert(addr.to_string());
    }

    pub fn command_count(&self) -> usize {
        self.hosts
            .lock()
            .unwrap()
            .values()
            .map(|h| h.commands().len())
            .sum()
    }
}

#[async_trait]
impl Connector for FakeCluster {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteClient>> {
        if self.unreachable.lock().unwrap().contains(&server.addr) {
            return Err(Error::remote(&server.addr, "connect", "unreachable"));
        }
        let host: Arc<dyn RemoteClient> = self.host(&server.addr);
        Ok(host)
    }
}

/// Short retry budget so readiness failures surface quickly.
pub fn test_config() -> Config {
    Config {
        concurrency_limit: 4,
        ready_attempts: 3,
        ready_delay_ms: 1,
        ..Config::default()
    }
}

pub fn deployer(cluster: &Arc<FakeCluster>, config: Config) -> Deployer {
    let connector: Arc<dyn Connector> = Arc::clone(cluster) as Arc<dyn Connector>;
    Deployer::new(Arc::new(config), connector)
}

/// Servers `host-0`, `host-1`, ... with the given capacities and subnet ids
/// starting at 1.
pub fn servers(capacities: &[usize]) -> Vec<Server> {
    capacities
        .iter()
        .enumerate()
        .map(|(i, max)| Server {
            id: i as u32 + 1,
            addr: format!("host-{}", i),
            iface: "eth0".into(),
            subnet_id: i as u32 + 1,
            max: *max,
            nodes: 0,
            ips: vec![],
            switches: vec![],
        })
        .collect()
}

pub fn deployment(capacities: &[usize], nodes: usize) -> Deployment {
    Deployment {
        servers: servers(capacities),
        details: DeploymentDetails {
            network_type: "generic".into(),
            nodes,
            images: vec![TEST_IMAGE.into()],
            resources: vec![],
            environments: vec![],
            params: serde_json::json!({ "chain_id": "testnet-1" }),
            sidecars: vec![],
            services: vec![],
        },
        nodes: vec![],
        build_id: None,
        scratch: BTreeMap::new(),
    }
}
