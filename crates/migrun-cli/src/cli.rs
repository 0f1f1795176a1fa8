use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use migrun_common::MigrationId;

/// Apply, revert and inspect versioned schema migrations
#[derive(Parser, Debug)]
#[command(name = "migrate", version, about, long_about = None)]
pub struct Cli {
    /// Config file (.yml, .yaml or .toml)
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Target database, overrides the config file
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Migrations directory, overrides the config file
    #[arg(long, global = true)]
    pub migrations: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    pub log_format: LogFormat,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Apply pending migrations
    Up {
        /// Stop after this migration id
        #[arg(long)]
        to: Option<MigrationId>,
    },

    /// Revert applied migrations (the most recent one by default)
    Down(DownArgs),

    /// Show applied and pending migrations
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Remove a migration lock left behind by a crashed run
    Unlock,
}

#[derive(Debug, Args)]
#[group(multiple = false)]
pub struct DownArgs {
    /// Revert every migration newer than this id
    #[arg(long)]
    pub to: Option<MigrationId>,

    /// Revert every applied migration
    #[arg(long)]
    pub all: bool,
}
