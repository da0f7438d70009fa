use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "vibehost")]
#[command(author = "Alberto Cavalcante")]
#[command(version)]
#[command(about = "One-shot provisioning - converge a bare Debian server into a multi-tenant container host", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Provision a server from a configuration file
    Provision(ProvisionArgs),

    /// Show what a run would do without mutating anything
    Plan(PlanArgs),

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(clap::Args)]
pub struct ProvisionArgs {
    /// Path to the YAML configuration file
    pub config: PathBuf,

    /// Run checks only - no action ever executes
    #[arg(long)]
    pub dry_run: bool,

    /// Skip backup configuration
    #[arg(long)]
    pub skip_backups: bool,

    /// Maximum concurrently executing steps
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,

    /// Directory for the run log and handoff document
    #[arg(short, long, default_value = ".")]
    pub output_dir: PathBuf,

    /// Skip the confirmation prompt
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(clap::Args)]
pub struct PlanArgs {
    /// Path to the YAML configuration file
    pub config: PathBuf,

    /// Skip backup configuration
    #[arg(long)]
    pub skip_backups: bool,

    /// Maximum concurrently executing steps
    #[arg(short, long, default_value_t = 4)]
    pub jobs: usize,
}
