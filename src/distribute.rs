//! Getting files into containers, and waiting for them to come up.
//!
//! Files travel in two hops: once per server into a staging directory, then
//! once per node from the staging directory into the container. Staged files
//! are removed by a deferred action when the session ends.

use std::path::Path;
use std::sync::Arc;

use log::warn;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::context::BuildContext;
use crate::error::{Error, Result};
use crate::remote::{poll_until_ready, RemoteClient};
use crate::types::{Node, ServerId};

/// Staging location of `name` on a server for this session.
pub fn staging_path(ctx: &BuildContext, name: &str) -> String {
    format!(
        "{}/{}/{}",
        ctx.config.remote_tmp_dir.trim_end_matches('/'),
        ctx.state.id(),
        name
    )
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn staged_name(local: &Path) -> String {
    let file = local
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".into());
    format!("{}-{}", Uuid::new_v4().simple(), file)
}

/// First hop: put `local` at `remote` on one server and schedule its removal.
async fn stage(
    ctx: &BuildContext,
    client: Arc<dyn RemoteClient>,
    local: &Path,
    remote: &str,
) -> Result<()> {
    if let Some(dir) = Path::new(remote).parent() {
        let dir = dir.to_string_lossy();
        client
            .run(&format!("mkdir -p {}", shell_words::quote(&dir)))
            .await?;
    }
    client.scp(local, remote).await?;

    let remote = remote.to_string();
    ctx.state.defer(move || async move {
        let cmd = format!("rm -f {}", shell_words::quote(&remote));
        if let Err(err) = client.run(&cmd).await {
            warn!("failed to clean up {} on {}: {}", remote, client.host(), err);
        }
    });
    Ok(())
}

/// Second hop: copy a staged file into the node container, checking the
/// result when `verify_copies` is on.
async fn deliver(
    ctx: &BuildContext,
    client: &dyn RemoteClient,
    node: &Node,
    staged: &str,
    container_path: &str,
    digest: &str,
) -> Result<()> {
    client.container_cp(&node.name, staged, container_path).await?;
    if !ctx.config.verify_copies {
        return Ok(());
    }
    let cmd = format!("sha256sum {}", shell_words::quote(container_path));
    let out = client.container_exec(&node.name, &cmd).await?;
    let found = out.split_whitespace().next().unwrap_or_default();
    if found != digest {
        return Err(Error::remote(
            client.host(),
            &cmd,
            format!(
                "checksum mismatch for {} in {}: expected {}, found {}",
                container_path, node.name, digest, found
            ),
        ));
    }
    Ok(())
}

/// Copies `local` to `remote` on every server of the session.
pub async fn copy_to_servers(ctx: &Arc<BuildContext>, local: &Path, remote: &str) -> Result<()> {
    let servers = ctx.servers_of(&ctx.nodes);
    let local = local.to_path_buf();
    let remote = remote.to_string();
    let shared = Arc::clone(ctx);
    ctx.fanout
        .for_each_server(&ctx.state, "copy to servers", &servers, move |server| {
            let ctx = Arc::clone(&shared);
            let local = local.clone();
            let remote = remote.clone();
            async move {
                let client = ctx.client(server.id)?;
                if let Some(dir) = Path::new(&remote).parent() {
                    let dir = dir.to_string_lossy();
                    client
                        .run(&format!("mkdir -p {}", shell_words::quote(&dir)))
                        .await?;
                }
                client.scp(&local, &remote).await
            }
        })
        .await
}

/// Copies `local` into `container_path` of every node in `nodes`.
pub async fn copy_to_nodes(
    ctx: &Arc<BuildContext>,
    nodes: &[Node],
    local: &Path,
    container_path: &str,
) -> Result<()> {
    let digest = sha256_hex(&tokio::fs::read(local).await?);
    let staged = staging_path(ctx, &staged_name(local));
    let local = local.to_path_buf();

    let servers = ctx.servers_of(nodes);
    let shared = Arc::clone(ctx);
    let (src, dest) = (local.clone(), staged.clone());
    ctx.fanout
        .for_each_server(&ctx.state, "stage file", &servers, move |server| {
            let ctx = Arc::clone(&shared);
            let (src, dest) = (src.clone(), dest.clone());
            async move {
                let client = ctx.client(server.id)?;
                stage(&ctx, client, &src, &dest).await
            }
        })
        .await?;

    let shared = Arc::clone(ctx);
    let container_path = container_path.to_string();
    ctx.fanout
        .for_each_node(&ctx.state, "copy into nodes", nodes, move |node| {
            let ctx = Arc::clone(&shared);
            let (staged, container_path, digest) =
                (staged.clone(), container_path.clone(), digest.clone());
            async move {
                let client = ctx.client(node.server)?;
                deliver(&ctx, client.as_ref(), &node, &staged, &container_path, &digest).await
            }
        })
        .await
}

/// Copies `local` into every node created by this session.
pub async fn copy_to_all_nodes(
    ctx: &Arc<BuildContext>,
    local: &Path,
    container_path: &str,
) -> Result<()> {
    let nodes = ctx.new_nodes.clone();
    copy_to_nodes(ctx, &nodes, local, container_path).await
}

/// Writes `bytes` to a session file and copies it into every new node.
pub async fn copy_bytes_to_all_nodes(
    ctx: &Arc<BuildContext>,
    name: &str,
    bytes: &[u8],
    container_path: &str,
) -> Result<()> {
    let local = ctx.state.write(name, bytes).await?;
    copy_to_all_nodes(ctx, &local, container_path).await
}

/// Writes `bytes` to a session file and copies it into one node.
pub async fn copy_bytes_to_node(
    ctx: &Arc<BuildContext>,
    node: &Node,
    name: &str,
    bytes: &[u8],
    container_path: &str,
) -> Result<()> {
    let local = ctx.state.write(name, bytes).await?;
    let client = ctx.client(node.server)?;
    let staged = staging_path(ctx, &staged_name(&local));
    stage(ctx, Arc::clone(&client), &local, &staged).await?;
    deliver(
        ctx,
        client.as_ref(),
        node,
        &staged,
        container_path,
        &sha256_hex(bytes),
    )
    .await
}

/// Runs `check` inside the node until it succeeds, within the configured
/// retry budget.
pub async fn wait_for_node(ctx: &BuildContext, node: &Node, check: &str) -> Result<String> {
    let client = ctx.client(node.server)?;
    let policy = ctx.config.retry_policy();
    poll_until_ready(check, &policy, ctx.state.cancel_token(), || {
        client.container_exec(&node.name, check)
    })
    .await
}

/// Runs `cmd` on the server until it succeeds, within the configured retry
/// budget.
pub async fn wait_for_server(ctx: &BuildContext, server: ServerId, cmd: &str) -> Result<String> {
    let client = ctx.client(server)?;
    client
        .keep_try_run(cmd, &ctx.config.retry_policy(), ctx.state.cancel_token())
        .await
}
