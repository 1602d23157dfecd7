use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "openclaw", version, about = "Gateway secrets runtime and migration")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    Secrets(SecretsOpts),
    Config(ConfigOpts),
    Version,
}

#[derive(clap::Args)]
pub struct SecretsOpts {
    #[arg(short, long)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub action: SecretsAction,
}

#[derive(Subcommand)]
pub enum SecretsAction {
    /// Re-resolve all secret references and activate a fresh snapshot.
    Reload {
        #[arg(long)]
        json: bool,
    },
    /// Rewrite plaintext credentials into encrypted-file references.
    Migrate {
        /// Apply the plan. Without this flag the command is a dry run.
        #[arg(long)]
        write: bool,
        /// Leave the `.env` file untouched.
        #[arg(long)]
        no_scrub_env: bool,
        #[arg(long)]
        json: bool,
        /// Restore a previous migration backup instead of migrating.
        #[arg(long, value_name = "BACKUP_ID")]
        rollback: Option<String>,
    },
}

#[derive(clap::Args)]
pub struct ConfigOpts {
    #[arg(short, long)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    Show,
    Validate,
}
