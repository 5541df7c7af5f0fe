use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "stow",
    about = "Pack many small items into few bucket files",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Directory holding the bucket files
    #[arg(long, global = true, default_value = ".stow")]
    pub root: PathBuf,

    /// TOML file with packer settings
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store an item
    Put(PutArgs),
    /// Print an item's payload
    Get(GetArgs),
    /// Remove items
    Delete(DeleteArgs),
    /// List items by location prefix
    List(ListArgs),
    /// Show where an item is stored
    Locate(LocateArgs),
    /// Summarize the bucket tree
    Stats,
    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub struct PutArgs {
    pub id: String,
    /// Payload text; read from stdin when neither this nor --file is given
    #[arg(conflicts_with = "file")]
    pub value: Option<String>,
    #[arg(short, long)]
    pub file: Option<PathBuf>,
}

#[derive(Args)]
pub struct GetArgs {
    pub id: String,
    /// Write the payload here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct DeleteArgs {
    #[arg(required = true)]
    pub ids: Vec<String>,
}

#[derive(Args)]
pub struct ListArgs {
    /// Location prefix such as `a7` or `a7/3`
    #[arg(default_value = "")]
    pub prefix: String,
    /// Also print each item's location
    #[arg(short, long)]
    pub long: bool,
}

#[derive(Args)]
pub struct LocateArgs {
    pub id: String,
}

#[derive(Args)]
pub struct ConfigArgs {
    /// Print built-in defaults without opening the store
    #[arg(long)]
    pub defaults: bool,
}
