mod commands;
mod config;
mod progress;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "wpcache",
    version,
    about = "Browse WordPress.com media folders through a read-through cache"
)]
struct Cli {
    #[command(subcommand)]
    command: commands::Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        commands::Command::Init(args) => commands::init::run(args).await,
        commands::Command::Site(args) => commands::site::run(args).await,
        commands::Command::Folders(args) => commands::folders::run(args).await,
    }
}
