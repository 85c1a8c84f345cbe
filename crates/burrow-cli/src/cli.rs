use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "burrow", about = "burrow: a Personal Data Server", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Server configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the configured data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the server
    Serve(ServeArgs),
    /// Create an account and its genesis commit
    CreateAccount(CreateAccountArgs),
    /// Generate a signing key
    GenKey,
    /// Write a repository export stream (CAR) to a file
    Export(ExportArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Overrides the configured bind address
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Args)]
pub struct CreateAccountArgs {
    #[arg(long)]
    pub handle: String,
    /// Generated when absent
    #[arg(long)]
    pub did: Option<String>,
    /// Hex-encoded signing key; generated when absent
    #[arg(long)]
    pub key: Option<String>,
}

#[derive(Args)]
pub struct ExportArgs {
    #[arg(long)]
    pub did: String,
    #[arg(short, long)]
    pub out: PathBuf,
}
