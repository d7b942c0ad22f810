use anyhow::Result;
use clap::{Args, Subcommand};

use wpcache_rest::SiteId;

use crate::config::{AppConfig, SiteConfig};

#[derive(Args)]
pub struct SiteArgs {
    #[command(subcommand)]
    action: SiteAction,
}

#[derive(Subcommand)]
enum SiteAction {
    /// Add a named site
    Add {
        /// Display name used on the command line
        #[arg(long)]
        name: String,
        /// Numeric WordPress.com site ID
        #[arg(long)]
        id: SiteId,
    },
    /// List configured sites
    List,
    /// Remove a site
    Remove {
        /// Site name to remove
        name: String,
    },
}

pub async fn run(args: SiteArgs) -> Result<()> {
    let mut config = AppConfig::load()?;
    match args.action {
        SiteAction::Add { name, id } => {
            if config.find_site(&name).is_some() {
                anyhow::bail!("site '{name}' already exists");
            }
            config.sites.push(SiteConfig {
                name: name.clone(),
                site_id: id,
            });
            config.save()?;
            println!("Site '{name}' added.");
        }
        SiteAction::List => {
            if config.sites.is_empty() {
                println!("No sites configured.");
            } else {
                println!("{:<24} {:<12}", "NAME", "SITE ID");
                println!("{}", "-".repeat(36));
                for s in &config.sites {
                    println!("{:<24} {:<12}", s.name, s.site_id);
                }
            }
        }
        SiteAction::Remove { name } => {
            let before = config.sites.len();
            config.sites.retain(|s| !s.name.eq_ignore_ascii_case(&name));
            if config.sites.len() == before {
                anyhow::bail!("site '{name}' not found");
            }
            config.save()?;
            println!("Site '{name}' removed.");
        }
    }
    Ok(())
}
