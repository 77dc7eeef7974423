//! Kiln CLI entrypoint.

use clap::Parser;

mod client;
mod commands;
mod config;
mod handlers;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Kiln CI command-line interface", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();

    match cli.command {
        Commands::Builders => handlers::builders(&config).await?,
        Commands::Builds { builder, limit } => handlers::builds(&config, &builder, limit).await?,
        Commands::Show { builder, number } => handlers::show(&config, &builder, number).await?,
        Commands::Force { builder } => handlers::force(&config, &builder).await?,
        Commands::Cancel { request_id } => handlers::cancel(&config, &request_id).await?,
        Commands::Requests => handlers::requests(&config).await?,
        Commands::Workers => handlers::workers(&config).await?,
        Commands::Watch { pattern } => handlers::watch(&config, &pattern).await?,
        Commands::Login => handlers::login().await?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
