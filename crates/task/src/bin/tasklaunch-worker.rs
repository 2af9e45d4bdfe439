use clap::Parser;
use eyre::WrapErr;

use tasklaunch_config::{LauncherConfig, LauncherConfigLoader};
use tasklaunch_core::WORKER_NODE_COUNT;
use tasklaunch_task::{run_worker, LauncherServices, WorkerOptions};

#[derive(Parser)]
#[command(name = "tasklaunch-worker")]
#[command(about = "Hosts the tasks of a forked launcher", long_about = None)]
#[command(version)]
struct Cli {
    /// Contact URL of the parent launcher
    #[arg(short = 'p', long = "parent")]
    parent: String,

    /// Number of nodes to deploy
    #[arg(short = 'c', long = "nodes", default_value_t = WORKER_NODE_COUNT)]
    nodes: u32,

    /// Session id the parent waits on
    #[arg(short = 'd', long = "deployment-id")]
    deployment_id: u32,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    // stdout and stderr belong to the tasks, keep diagnostics quiet by default
    if let Err(e) = tasklaunch_utils::tracing::init_with_default("warn") {
        eprintln!("Failed to initialize tracing: {e}");
    }

    let config = LauncherConfigLoader::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "falling back to the default configuration");
        LauncherConfig::default()
    });

    let options = WorkerOptions {
        contact_url: cli.parent,
        node_count: cli.nodes,
        deployment_id: cli.deployment_id,
    };
    run_worker(options, LauncherServices::new(config))
        .await
        .wrap_err("worker runtime failed")
}
