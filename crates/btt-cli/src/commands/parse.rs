//! Parse local job log files.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use btt_core::{CancelToken, LogParser, ParseOptions};
use clap::Args;
use rayon::prelude::*;

use super::report::{self, JobArgs, JobReport, OutputArgs};
use crate::Config;

#[derive(Debug, Args)]
pub struct ParseArgs {
    /// Job log files to parse.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub job: JobArgs,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Stop parsing after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

pub fn run<W: Write>(writer: &mut W, args: &ParseArgs, config: &Config) -> Result<()> {
    let cancel = report::cancel_after(args.timeout);
    let options = config.parse_options();

    // One parser per file; results keep the command-line order.
    let reports = args
        .files
        .par_iter()
        .map(|path| parse_file(path, &args.job, options, &cancel))
        .collect::<Result<Vec<_>>>()?;

    report::emit(writer, &reports, args.output, config)
}

fn parse_file(
    path: &Path,
    job: &JobArgs,
    options: ParseOptions,
    cancel: &CancelToken,
) -> Result<JobReport> {
    let outcome = LogParser::new(options)
        .with_cancel(cancel.clone())
        .parse_file(path)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    tracing::debug!(
        path = %path.display(),
        substages = outcome.substages.len(),
        duration = outcome.total_duration(),
        "parsed job log"
    );
    Ok(JobReport::new(path.display().to_string(), job.meta(), &outcome))
}
