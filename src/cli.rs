use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "shipyard", version, about = "Build and tear down multi-host test networks")]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Wipe the servers and build the network described by the document
    Build(DocArgs),
    /// Add nodes to a running network
    AddNodes(AddNodesArgs),
    /// Remove nodes by number
    DeleteNodes(DeleteNodesArgs),
    /// Remove every node, service and network from the servers
    Destroy(DocArgs),
}

#[derive(Args, Debug)]
pub struct DocArgs {
    /// Deployment document (JSON); updated in place on success
    pub deployment: PathBuf,

    /// Print the build report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct AddNodesArgs {
    #[command(flatten)]
    pub doc: DocArgs,

    /// Number of nodes to add
    #[arg(long, short = 'n')]
    pub count: usize,

    /// Session to continue from (defaults to the one in the document)
    #[arg(long)]
    pub parent: Option<Uuid>,
}

#[derive(Args, Debug)]
pub struct DeleteNodesArgs {
    #[command(flatten)]
    pub doc: DocArgs,

    /// Node numbers to remove
    #[arg(required = true, num_args = 1..)]
    pub nodes: Vec<usize>,
}
