use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::warn;

mod commands;

#[derive(Debug, Parser)]
#[command(name = "ruleclock", version, about = "Rule-based alarm scheduler")]
struct Cli {
    /// Config file (default: ~/.ruleclock/ruleclock.toml).
    #[arg(long, env = "RULECLOCK_CONFIG")]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the scheduler until Ctrl-C, printing fired events as JSON lines.
    Run,
    /// Show every rule and when it fires next.
    List,
    /// Upsert rules from a JSON array.
    Import { file: PathBuf },
    /// Switch a rule on; interval triggers restart from now.
    Enable { id: String },
    /// Switch a rule off.
    Disable { id: String },
    /// Delete a rule.
    Remove { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ruleclock=info,ruleclock_scheduler=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = ruleclock_core::RuleclockConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ruleclock_core::RuleclockConfig::default()
    });

    let store = commands::open_store(&config.database.path)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => commands::run(&config, store).await,
        Command::List => commands::list(&store),
        Command::Import { file } => commands::import(&store, &file),
        Command::Enable { id } => commands::set_enabled(&store, &id, true),
        Command::Disable { id } => commands::set_enabled(&store, &id, false),
        Command::Remove { id } => commands::remove(&store, &id),
    }
}
