/// CLI argument parsing

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "odoo-ops")]
#[command(author, version = VERSION_WITH_BUILD, about = "Backup, restore and schedule an Odoo deployment", long_about = None)]
pub struct Cli {
    /// Deployment directory (holds docker-compose.yml and .env)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Environment file, default <project-dir>/.env
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a bundle, ship it to the remotes and prune old ones
    Backup {
        /// Keep the bundle local only
        #[arg(long)]
        no_ship: bool,

        /// Skip the retention sweep
        #[arg(long)]
        no_prune: bool,
    },

    /// Restore a bundle over the live database and filestore
    Restore {
        /// Bundle file (.tar.gz)
        bundle: PathBuf,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        /// With --yes, restore a dump that does not name its database
        #[arg(long)]
        allow_unverified: bool,

        /// Leave custom-addons untouched
        #[arg(long)]
        skip_addons: bool,

        /// Leave the Odoo service stopped afterwards
        #[arg(long)]
        no_restart: bool,
    },

    /// Check a bundle without touching the deployment
    Verify {
        /// Bundle file (.tar.gz)
        bundle: PathBuf,
    },

    /// List local bundles
    List {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Delete local bundles past BACKUP_RETENTION_DAYS
    Prune,

    /// Install the crontab entry that runs `backup`
    ScheduleInstall {
        /// Cron expression, default BACKUP_CRON
        #[arg(long)]
        cron: Option<String>,
    },

    /// Remove the crontab entry
    ScheduleRemove,

    /// Show service and backup status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// View configuration
    View,

    /// Validate configuration
    Validate,
}
