use anyhow::Result;
use clap::Parser;
use fctest::cli::{Cli, Commands};
use fctest::config::HarnessConfig;
use fctest::logging::{self, LogMode};
use fctest::commands;
use tracing::error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(if cli.sub_process {
        LogMode::SubProcess
    } else {
        LogMode::Interactive
    });

    let result = match HarnessConfig::load(cli.config.as_deref()) {
        Ok(config) => match cli.cmd {
            Commands::Host => commands::cmd_host(&config).await,
            Commands::Snapshots(args) => commands::cmd_snapshots(&config, args).await,
            Commands::Artifacts(args) => commands::cmd_artifacts(&config, args).await,
        },
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }

    result
}
