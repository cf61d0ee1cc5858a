use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "vpnmanager",
    version,
    about = "Failover and weighted distribution of LAN traffic over VPN uplinks"
)]
pub struct Cli {
    /// Path to config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the manager in the foreground (default)
    Run,

    /// Write a default config file (does not overwrite unless --force)
    InitConfig {
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the resolved config file path
    PrintConfigPath,

    /// Parse and validate the config file, then print the rendered table
    CheckConfig,

    /// Edit the domain bypass set of a running manager
    Allow {
        #[command(subcommand)]
        action: AllowAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum AllowAction {
    /// Add resolved addresses of bypass domains
    Add {
        #[arg(required = true)]
        ips: Vec<Ipv4Addr>,
    },

    /// Remove addresses from the set
    Remove {
        #[arg(required = true)]
        ips: Vec<Ipv4Addr>,
    },

    /// Remove every address from the set
    Flush,
}
