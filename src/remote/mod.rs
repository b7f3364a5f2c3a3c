//! Remote execution capability.
//!
//! Everything the engine does on a server goes through [`RemoteClient`]. The
//! engine never cares how commands reach the host; [`shell`] ships a
//! transport built on `sh` and the OpenSSH client binaries.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::Server;

pub mod shell;
pub use shell::{ShellClient, ShellConnector};

/// How often and how long a readiness check is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries until cancelled.
    pub attempts: Option<u32>,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn bounded(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: Some(attempts),
            delay,
        }
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Address of the host, used in logs and errors.
    fn host(&self) -> &str;

    /// Run a shell command on the host and return its stdout.
    async fn run(&self, cmd: &str) -> Result<String>;

    /// Copy a local file to `remote` on the host.
    async fn scp(&self, local: &Path, remote: &str) -> Result<()>;

    /// Copy a file already on the host into a running container.
    async fn container_cp(&self, container: &str, remote: &str, container_path: &str) -> Result<()> {
        self.run(&crate::runtime::docker::cp_cmd(container, remote, container_path))
            .await
            .map(|_| ())
    }

    /// Run a shell command inside a container on the host.
    async fn container_exec(&self, container: &str, cmd: &str) -> Result<String> {
        self.run(&crate::runtime::docker::exec_cmd(container, cmd))
            .await
    }

    /// Run `cmd` until it succeeds, following `policy`.
    async fn keep_try_run(
        &self,
        cmd: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<String> {
        poll_until_ready(cmd, policy, cancel, || self.run(cmd)).await
    }
}

/// Hands out a client for a server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteClient>>;
}

/// Retries `check` until it returns `Ok`, the attempt budget runs out, or
/// `cancel` fires. Every failure is retried; errors are not classified.
pub async fn poll_until_ready<T, F, Fut>(
    what: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T>> + Send,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = check() => result,
        };
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if policy.attempts.is_some_and(|max| attempt >= max) {
            return Err(Error::RetriesExhausted {
                command: what.to_string(),
                attempts: attempt,
                last: err.to_string(),
            });
        }
        debug!("`{}` not ready (attempt {}): {}", what, attempt, err);

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = sleep(policy.delay) => {}
        }
    }
}
