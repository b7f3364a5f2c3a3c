use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::{Connector, RemoteClient};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::Server;

#[derive(Debug, Clone)]
enum Transport {
    /// Commands run through `sh -c` on this machine.
    Local,
    Ssh {
        destination: String,
        port: u16,
        identity: Option<PathBuf>,
    },
}

/// Client that shells out to `sh`, `ssh` and `scp`.
#[derive(Debug, Clone)]
pub struct ShellClient {
    host: String,
    transport: Transport,
}

impl ShellClient {
    pub fn local() -> Self {
        Self {
            host: "localhost".into(),
            transport: Transport::Local,
        }
    }

    pub fn ssh(host: &str, user: Option<&str>, port: u16, identity: Option<PathBuf>) -> Self {
        let destination = match user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        Self {
            host: host.to_string(),
            transport: Transport::Ssh {
                destination,
                port,
                identity,
            },
        }
    }

    fn ssh_options(port: u16, identity: &Option<PathBuf>, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            port_flag.to_string(),
            port.to_string(),
        ];
        if let Some(identity) = identity {
            args.push("-i".into());
            args.push(identity.display().to_string());
        }
        args
    }

    async fn output(&self, mut command: Command, shown: &str) -> Result<String> {
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::remote(&self.host, shown, e.to_string()))?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(Error::remote(
                &self.host,
                shown,
                format!("{}: {}", output.status, stderr.trim()),
            ))
        }
    }
}

#[async_trait]
impl RemoteClient for ShellClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, cmd: &str) -> Result<String> {
        debug!("[{}] {}", self.host, cmd);
        let command = match &self.transport {
            Transport::Local => {
                let mut c = Command::new("sh");
                c.arg("-c").arg(cmd);
                c
            }
            Transport::Ssh {
                destination,
                port,
                identity,
            } => {
                let mut c = Command::new("ssh");
                c.args(Self::ssh_options(*port, identity, "-p"))
                    .arg(destination)
                    .arg(cmd);
                c
            }
        };
        self.output(command, cmd).await
    }

    async fn scp(&self, local: &Path, remote: &str) -> Result<()> {
        let shown = format!("scp {} {}", local.display(), remote);
        debug!("[{}] {}", self.host, shown);
        match &self.transport {
            Transport::Local => {
                if let Some(parent) = Path::new(remote).parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::copy(local, remote)
                    .await
                    .map_err(|e| Error::remote(&self.host, &shown, e.to_string()))?;
                Ok(())
            }
            Transport::Ssh {
                destination,
                port,
                identity,
            } => {
                let mut c = Command::new("scp");
                c.args(Self::ssh_options(*port, identity, "-P"))
                    .arg(local)
                    .arg(format!("{}:{}", destination, remote));
                self.output(c, &shown).await.map(|_| ())
            }
        }
    }
}

/// Connects to loopback servers locally and to everything else over ssh.
#[derive(Debug, Clone)]
pub struct ShellConnector {
    user: Option<String>,
    port: u16,
    identity: Option<PathBuf>,
}

impl ShellConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            user: config.ssh_user.clone(),
            port: config.ssh_port,
            identity: config.ssh_identity.clone(),
        }
    }
}

fn is_loopback(addr: &str) -> bool {
    addr == "localhost"
        || addr
            .parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

#[async_trait]
impl Connector for ShellConnector {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteClient>> {
        if is_loopback(&server.addr) {
            return Ok(Arc::new(ShellClient::local()));
        }
        Ok(Arc::new(ShellClient::ssh(
            &server.addr,
            self.user.as_deref(),
            self.port,
            self.identity.clone(),
        )))
    }
}
