use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "yanet-balancer")]
#[command(about = "Control plane for the YANET L4 balancer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file
    Check {
        /// Config file path
        #[arg(short, long, default_value = yanet_balancer::constants::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Print the update requests as JSON
        #[arg(long)]
        print_requests: bool,
    },
    /// Create the configured balancers and maintain them until Ctrl+C
    Run {
        /// Config file path
        #[arg(short, long, default_value = yanet_balancer::constants::DEFAULT_CONFIG_FILE)]
        config: PathBuf,
        /// Log as JSON lines
        #[arg(long)]
        log_json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check {
            config,
            print_requests,
        } => commands::check::execute(&config, print_requests),
        Commands::Run { config, log_json } => {
            commands::init_logging(log_json);
            commands::run::execute(&config).await
        }
    }
}
