use anyhow::Result;
use clap::Parser;
use kubesetup::commands::{self, Commands};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kubesetup")]
#[command(version)]
#[command(about = "Provision Proxmox VMs and bring them up as a kubeadm Kubernetes cluster", long_about = None)]
struct Cli {
    /// Debug-level logging (overrides RUST_LOG)
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

fn main() -> Result<()> {
    // PROXMOX_TOKEN and friends may live in a local .env
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    commands::handle_command(cli.command)
}
