//! bridgenetctl
//!
//! Operator tool for the bridgenet CNI plugin. Works directly on the
//! allocation store, taking the same lock as the plugin.

mod cli;
mod commands;
mod config;

use anyhow::Result;
use bridgenet_cni::logging;
use clap::Parser;
use cli::{Cli, Commands, SubnetCommands};
use config::Config;

fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(logging::level_for_verbosity(cli.verbose));

    let config = Config::load()?;

    match cli.command {
        Commands::Status(args) => commands::status::run(&config, args)?,
        Commands::Check(args) => commands::check::run(&config, args)?,
        Commands::Release(args) => commands::release::run(&config, args)?,
        Commands::Subnet(SubnetCommands::Show) => commands::subnet::show(&config)?,
        Commands::Subnet(SubnetCommands::Set(args)) => commands::subnet::set(&config, args)?,
    }

    Ok(())
}
