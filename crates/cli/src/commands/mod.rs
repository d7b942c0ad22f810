pub mod folders;
pub mod init;
pub mod site;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Command {
    /// Write the API configuration
    Init(init::InitArgs),
    /// Manage named sites
    Site(site::SiteArgs),
    /// List a site's media folders
    Folders(folders::FoldersArgs),
}
