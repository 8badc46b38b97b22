//! Command line interface for the crosswire demo binary.

use std::path::PathBuf;

use clap::Parser;

/// Command line arguments for the `crosswire` binary.
#[derive(Debug, Parser)]
#[command(name = "crosswire", version, about = "Event-bus bridge demo server")]
pub struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value = "127.0.0.1:7000")]
    pub listen: String,

    /// Path to a JSON file holding bridge options.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
