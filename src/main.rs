//! Shipyard command-line entry point.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal;

use shipyard::cli::{Cli, Commands};
use shipyard::remote::ShellConnector;
use shipyard::types::Deployment;
use shipyard::{BuildReport, Config, Deployer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let cfg = Arc::new(Config::load()?);
    info!("Starting shipyard with config: {:?}", cfg);

    let connector = Arc::new(ShellConnector::new(&cfg));
    let deployer = Arc::new(Deployer::new(Arc::clone(&cfg), connector));

    // Ctrl+C stops retry loops; deferred cleanup still runs
    let watcher = Arc::clone(&deployer);
    let ctrl_c = tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling...");
            watcher.cancel();
        }
    });

    let result = run(&deployer, cli.cmd).await;
    ctrl_c.abort();

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(deployer: &Deployer, cmd: Commands) -> anyhow::Result<()> {
    match cmd {
        Commands::Build(args) => {
            let mut doc = Deployment::from_file(&args.deployment)?;
            let report = deployer.build(&mut doc).await?;
            doc.write(&args.deployment)?;
            print_report(&report, args.json)?;
        }
        Commands::AddNodes(args) => {
            let path = &args.doc.deployment;
            let mut doc = Deployment::from_file(path)?;
            let report = deployer.add_nodes(&mut doc, args.count, args.parent).await?;
            doc.write(path)?;
            print_report(&report, args.doc.json)?;
        }
        Commands::DeleteNodes(args) => {
            let path = &args.doc.deployment;
            let mut doc = Deployment::from_file(path)?;
            let result = deployer.delete_nodes(&mut doc, &args.nodes).await;
            save(&doc, path)?;
            result?;
        }
        Commands::Destroy(args) => {
            let mut doc = Deployment::from_file(&args.deployment)?;
            let result = deployer.destroy(&mut doc).await;
            save(&doc, &args.deployment)?;
            result?;
        }
    }
    Ok(())
}

/// Removals are recorded even when some of them failed.
fn save(doc: &Deployment, path: &Path) -> anyhow::Result<()> {
    doc.write(path)?;
    Ok(())
}

fn print_report(report: &BuildReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("build {}", report.build_id);
    for node in &report.new_nodes {
        println!("  {}\t{}\t{}", node.num, node.name, node.ip);
    }
    for label in &report.labels {
        println!("  label: {}", label);
    }
    for warning in &report.warnings {
        println!("  warning: {}", warning);
    }
    Ok(())
}
