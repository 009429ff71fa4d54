use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use log::info;

use storagectl::command::{self, Command};

#[derive(Debug, Parser)]
#[command(version, author, about = "Inspect and repair a storage-core data directory")]
pub struct Args {
    /// Directory holding the indexed-store and sync-kv log files.
    #[clap(short = 'd', long, default_value = "./storage-data")]
    data_dir: PathBuf,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();
    info!("storagectl starting against {}", args.data_dir.display());

    command::run(args.data_dir, args.cmd)
}
