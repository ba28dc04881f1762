//! Download and parse the log of one Travis CI job.

use std::io::Write;

use anyhow::{Context, Result};
use btt_core::JobMeta;
use btt_travis::{Client, JobInfo, JobLog};
use clap::Args;

use super::report::{self, OutputArgs};
use crate::Config;

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Travis CI job ID.
    pub job_id: String,

    /// Repository slug. Looked up from the job when omitted.
    #[arg(long)]
    pub repo: Option<String>,

    /// Build number. Derived from the job number when omitted.
    #[arg(long)]
    pub build: Option<String>,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Stop parsing after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

pub fn run<W: Write>(writer: &mut W, args: &FetchArgs, config: &Config) -> Result<()> {
    let client = Client::new(&config.api_url).context("failed to create Travis client")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let (meta, log) = runtime.block_on(download(&client, args, config.max_log_bytes))?;

    let cancel = report::cancel_after(args.timeout);
    let report = report::parse_log(
        &args.job_id,
        meta,
        log.into_reader(),
        config.parse_options(),
        &cancel,
    )?;
    report::emit(writer, &[report], args.output, config)
}

async fn download(client: &Client, args: &FetchArgs, max_bytes: u64) -> Result<(JobMeta, JobLog)> {
    let mut meta = JobMeta {
        repo: args.repo.clone(),
        build: args.build.clone(),
        job: Some(args.job_id.clone()),
    };

    if meta.repo.is_none() || meta.build.is_none() {
        match client.job(&args.job_id).await {
            Ok(info) => merge_job_info(&mut meta, info),
            Err(err) => {
                tracing::warn!(job_id = %args.job_id, error = %err, "job lookup failed");
            }
        }
    }

    let log = client
        .fetch_job_log(&args.job_id, max_bytes)
        .await
        .with_context(|| format!("failed to fetch log of job {}", args.job_id))?;
    Ok((meta, log))
}

/// Fills in repository and build number from job metadata. Explicit values win.
fn merge_job_info(meta: &mut JobMeta, info: JobInfo) {
    if meta.repo.is_none() {
        meta.repo = info.repository_slug;
    }
    if meta.build.is_none() {
        // Job numbers are "<build>.<index>".
        meta.build = info
            .number
            .as_deref()
            .and_then(|number| number.split_once('.'))
            .map(|(build, _)| build.to_string());
    }
}
