mod cli;

use anyhow::Result;
use clap::Parser;

use berth::config::BerthConfig;
use cli::context::{init_tracing, Core};
use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let config = BerthConfig::load(&cli.config)?;
    let core = Core::bootstrap(&config, cli.artifacts_dir.clone(), cli.stage_dir.clone())?;

    match cli.command {
        Command::Troubleshoot => {
            cli::troubleshoot::run(&core, &config).await?;
        }
        Command::Setup { authorized_keys } => {
            cli::setup::run(&core, &config, &authorized_keys).await?;
        }
        Command::Security { action } => {
            cli::security::run(&core, &config, &action).await?;
        }
        Command::Service { action } => {
            cli::service::run(&core, &config, &action).await?;
        }
        Command::Deploy { action } => {
            cli::deploy::run(&core, &config, &action).await?;
        }
    }

    Ok(())
}
