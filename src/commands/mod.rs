// Command module routing
//
// Each subcommand lives in its own file and exposes one `handle_*` function.

pub mod cleanup;
pub mod cluster;

use anyhow::Result;
use clap::Subcommand;

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Bring up a cluster with a single control plane
    Simple(cluster::ClusterArgs),
    /// Bring up a multi-control-plane cluster behind a load-balancer VIP
    Ha(cluster::HaArgs),
    /// Shut down and delete every VM in an inventory
    Cleanup(cleanup::CleanupArgs),
}

/// Dispatch command to appropriate handler
pub fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Simple(args) => cluster::handle_simple(args),
        Commands::Ha(args) => cluster::handle_ha(args),
        Commands::Cleanup(args) => cleanup::handle_cleanup(args),
    }
}

pub(crate) fn banner(title: &str) {
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("{}", title);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!();
}
