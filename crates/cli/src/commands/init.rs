use anyhow::Result;
use clap::Args;
use dialoguer::Password;
use tracing::info;

use wpcache_rest::client::DEFAULT_API_BASE;

use crate::config::{ApiConfig, AppConfig};

#[derive(Args)]
pub struct InitArgs {
    /// REST API base URL
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,

    /// OAuth bearer token (prompted for when omitted)
    #[arg(long)]
    token: Option<String>,

    /// Folders requested per page
    #[arg(long, default_value_t = 20)]
    per_page: u32,

    /// Do not prompt; store no token when --token is absent
    #[arg(long)]
    no_prompt: bool,

    /// Overwrite an existing config
    #[arg(long)]
    force: bool,
}

pub async fn run(args: InitArgs) -> Result<()> {
    let path = AppConfig::config_path();
    if path.exists() && !args.force {
        anyhow::bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    if args.per_page == 0 {
        anyhow::bail!("--per-page must be at least 1");
    }

    let token = match args.token {
        Some(token) => Some(token),
        None if args.no_prompt => None,
        None => {
            let entered = Password::new()
                .with_prompt("OAuth token (leave empty for public sites)")
                .allow_empty_password(true)
                .interact()?;
            Some(entered).filter(|t| !t.is_empty())
        }
    };

    // Keep configured sites when re-initialising.
    let sites = if path.exists() {
        AppConfig::load().map(|c| c.sites).unwrap_or_default()
    } else {
        Vec::new()
    };

    let config = AppConfig {
        api: ApiConfig {
            base_url: args.api_base,
            token,
            per_page: args.per_page,
        },
        sites,
    };
    config.save()?;

    info!(config_path = %path.display(), "Config saved");
    println!("Config: {}", path.display());
    Ok(())
}
