//! CLI definition using clap
//!
//! Defines the command-line interface structure for bridgenetctl.

use clap::{Args, Parser, Subcommand};

/// bridgenetctl - inspect and repair bridgenet address allocations
#[derive(Parser, Debug)]
#[command(name = "bridgenetctl")]
#[command(version)]
#[command(about = "Bridgenet address allocation tool", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Display allocation status
    #[command(about = "Show the subnet, gateway and allocated addresses")]
    Status(StatusArgs),

    /// Print the address held by a container
    Check(ContainerArgs),

    /// Release the address held by a container
    #[command(about = "Release a container's address (cleanup after a lost DEL)")]
    Release(ContainerArgs),

    /// Read or write the node subnet file
    #[command(subcommand)]
    Subnet(SubnetCommands),
}

/// Arguments for the status command
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output in JSON format
    #[arg(long, help = "Output status in JSON format")]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct ContainerArgs {
    /// Container ID as passed by the runtime in CNI_CONTAINERID
    #[arg(value_name = "CONTAINER_ID")]
    pub container_id: String,
}

#[derive(Subcommand, Debug)]
pub enum SubnetCommands {
    /// Print the current subnet file
    Show,

    /// Write the subnet file
    Set(SubnetSetArgs),
}

#[derive(Args, Debug)]
pub struct SubnetSetArgs {
    /// Subnet in CIDR notation, e.g. 10.244.1.0/24
    #[arg(long, value_name = "CIDR")]
    pub subnet: String,

    /// Bridge interface name (the plugin default applies when omitted)
    #[arg(long, value_name = "NAME")]
    pub bridge: Option<String>,
}
