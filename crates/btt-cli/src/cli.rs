//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::commands::build::BuildArgs;
use crate::commands::fetch::FetchArgs;
use crate::commands::parse::ParseArgs;

/// Build time trend for Travis CI.
///
/// Extracts timed substages from Travis CI job logs and turns them into
/// analytics events.
#[derive(Debug, Parser)]
#[command(name = "btt", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Parse one or more local job log files.
    Parse(ParseArgs),

    /// Download and parse the log of a single Travis CI job.
    Fetch(FetchArgs),

    /// Download and parse the logs of every job in a Travis CI build.
    Build(BuildArgs),
}
