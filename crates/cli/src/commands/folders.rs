use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use serde_json::Value;
use tracing::info;

use wpcache_core::{Binding, Dispatcher, Projection, Query};
use wpcache_rest::{FolderAction, FolderStore, MediaFolder, MediaFolderActions};

use crate::config::AppConfig;
use crate::progress;

#[derive(Args)]
pub struct FoldersArgs {
    /// Site name or numeric site ID
    #[arg(long)]
    site: String,

    /// Maximum number of pages to load
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pages: u32,

    /// Query parameter as KEY=VALUE (repeatable)
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    filters: Vec<String>,

    /// Look up a single folder by ID instead of listing
    #[arg(long, conflicts_with_all = ["pages", "filters"])]
    id: Option<u64>,

    /// Print folders as JSON
    #[arg(long)]
    json: bool,
}

pub async fn run(args: FoldersArgs) -> Result<()> {
    let config = AppConfig::load()?;
    let site = config.resolve_site(&args.site)?;
    let query = parse_filters(&args.filters)?;

    let dispatcher: Arc<Dispatcher<FolderAction>> = Arc::new(Dispatcher::new());
    let store = Arc::new(FolderStore::with_config(
        "media-folders",
        config.store_config(),
    ));
    store.register(&dispatcher, &[])?;
    let actions = Arc::new(MediaFolderActions::new(
        Arc::clone(&dispatcher),
        Arc::clone(&store),
        Arc::new(config.client()?),
    )?);
    if let Some(id) = args.id {
        return show_folder(&actions, site, id, args.json).await;
    }
    if !query.is_empty() {
        actions.set_query(site, query)?;
    }

    let spinner = progress::create_spinner(&format!("Fetching folders for site {site}..."));
    let mut changes = store.changes();
    let status = spinner.clone();
    let binding = Binding::attach(
        Arc::clone(&store),
        site,
        actions,
        move |p: Projection<MediaFolder>| {
            let loaded = p.items.as_ref().map_or(0, Vec::len);
            if p.is_fetching {
                status.set_message(format!("{loaded} folders loaded, fetching more..."));
            } else {
                status.set_message(format!("{loaded} folders loaded"));
            }
        },
    );

    let mut pages = 0;
    loop {
        changes.changed().await.context("folder store went away")?;
        let projection = binding.projection();
        if projection.is_fetching {
            continue;
        }
        if let Some(err) = projection.last_error {
            spinner.abandon();
            anyhow::bail!("failed to fetch folders for site {site}: {err}");
        }
        pages += 1;
        if pages >= args.pages || !projection.has_next_page || !binding.request_more() {
            break;
        }
    }
    spinner.finish_and_clear();

    let projection = binding.projection();
    drop(binding);
    let folders = projection.items.unwrap_or_default();
    info!(site, pages, folders = folders.len(), "Folders loaded");

    if args.json {
        println!("{}", serde_json::to_string_pretty(&folders)?);
        return Ok(());
    }
    print_table(&folders);
    if projection.has_next_page {
        println!(
            "{}",
            style(format!(
                "More folders available; rerun with --pages {}",
                pages + 1
            ))
            .dim()
        );
    }
    Ok(())
}

async fn show_folder(
    actions: &MediaFolderActions,
    site: u64,
    id: u64,
    json: bool,
) -> Result<()> {
    let spinner = progress::create_spinner(&format!("Fetching folder {id}..."));
    if let Some(request) = actions.fetch_folder(site, id) {
        request.await.context("folder request task failed")?;
    }
    spinner.finish_and_clear();

    let folder = actions
        .store()
        .get_all(&site)
        .and_then(|folders| folders.into_iter().find(|f| f.id == id))
        .with_context(|| format!("folder {id} not found on site {site}"))?;
    info!(site, folder = id, "Folder loaded");

    if json {
        println!("{}", serde_json::to_string_pretty(&folder)?);
    } else {
        print_table(std::slice::from_ref(&folder));
    }
    Ok(())
}

/// Turn `KEY=VALUE` pairs into a query. Values that parse as JSON keep their
/// type (`number=5`, `recursive=true`); anything else is a string.
fn parse_filters(filters: &[String]) -> Result<Query> {
    let mut query = Query::new();
    for filter in filters {
        let (key, raw) = filter
            .split_once('=')
            .with_context(|| format!("invalid filter '{filter}', expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            anyhow::bail!("invalid filter '{filter}', empty key");
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw));
        query.insert(key, value);
    }
    Ok(query)
}

fn print_table(folders: &[MediaFolder]) {
    if folders.is_empty() {
        println!("No folders found.");
        return;
    }

    println!(
        "{}",
        style(format!(
            "{:<10} {:<32} {:<10} {:<8} {:<12}",
            "ID", "NAME", "PARENT", "MEDIA", "CREATED"
        ))
        .bold()
    );
    println!("{}", "-".repeat(76));
    for folder in folders {
        println!(
            "{:<10} {:<32} {:<10} {:<8} {:<12}",
            folder.id,
            truncate(&folder.name, 32),
            folder
                .parent
                .map_or_else(|| "-".to_string(), |p| p.to_string()),
            folder
                .media_count
                .map_or_else(|| "-".to_string(), |n| n.to_string()),
            folder
                .date
                .map_or_else(|| "-".to_string(), |d| d.format("%Y-%m-%d").to_string()),
        );
    }
    println!("{} folders", style(folders.len()).cyan());
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let cut: String = name.chars().take(width.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}
