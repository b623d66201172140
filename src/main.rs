use clap::{Parser, Subcommand};
use env_logger::Env;
use sluice_common::config::AppConfig;

#[derive(Parser)]
#[command(name = "sluice", version, about = "Distributed dataflow engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the driver, which schedules task groups onto workers.
    Driver,
    /// Run a worker, which executes instruction sets and serves shards.
    Worker,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = AppConfig::load()?;
    match cli.command {
        Command::Driver => sluice_execution::run_driver(&config).await,
        Command::Worker => sluice_execution::run_worker(&config).await,
    }
}
