//! Download and parse every job log of a Travis CI build.

use std::io::Write;

use anyhow::{Context, Result};
use btt_core::JobMeta;
use btt_travis::{Client, JobLog};
use clap::Args;
use rayon::prelude::*;
use tokio::task::JoinSet;

use super::report::{self, OutputArgs};
use crate::Config;

#[derive(Debug, Args)]
pub struct BuildArgs {
    /// Repository slug, e.g. buildtimetrend/python-lib.
    pub repo: String,

    /// Build number.
    pub build: String,

    #[command(flatten)]
    pub output: OutputArgs,

    /// Stop parsing after this many seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

struct DownloadedLog {
    job_id: String,
    log: JobLog,
}

pub fn run<W: Write>(writer: &mut W, args: &BuildArgs, config: &Config) -> Result<()> {
    let client = Client::new(&config.api_url).context("failed to create Travis client")?;
    let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
    let logs = runtime.block_on(download_build(&client, args, config.max_log_bytes))?;

    let cancel = report::cancel_after(args.timeout);
    let options = config.parse_options();
    let reports = logs
        .into_par_iter()
        .map(|job| {
            report::parse_log(
                &job.job_id,
                job_meta(args, &job.job_id),
                job.log.into_reader(),
                options,
                &cancel,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    report::emit(writer, &reports, args.output, config)
}

fn job_meta(args: &BuildArgs, job_id: &str) -> JobMeta {
    JobMeta {
        repo: Some(args.repo.clone()),
        build: Some(args.build.clone()),
        job: Some(job_id.to_string()),
    }
}

/// Downloads all job logs of the build concurrently, in job order.
async fn download_build(client: &Client, args: &BuildArgs, max_bytes: u64) -> Result<Vec<DownloadedLog>> {
    let build = client
        .build(&args.repo, &args.build)
        .await
        .with_context(|| format!("failed to look up build {} of {}", args.build, args.repo))?
        .with_context(|| format!("build {} of {} not found", args.build, args.repo))?;

    tracing::info!(
        repo = %args.repo,
        build = %args.build,
        jobs = build.job_ids.len(),
        "fetching build job logs"
    );

    let mut tasks = JoinSet::new();
    for (index, job_id) in build.job_ids.iter().enumerate() {
        let client = client.clone();
        let job_id = job_id.to_string();
        tasks.spawn(async move {
            let log = client.fetch_job_log(&job_id, max_bytes).await;
            (index, job_id, log)
        });
    }

    let mut logs = Vec::with_capacity(build.job_ids.len());
    while let Some(joined) = tasks.join_next().await {
        let (index, job_id, log) = joined.context("job log download task failed")?;
        let log = log.with_context(|| format!("failed to fetch log of job {job_id}"))?;
        logs.push((index, DownloadedLog { job_id, log }));
    }
    logs.sort_by_key(|(index, _)| *index);

    Ok(logs.into_iter().map(|(_, log)| log).collect())
}
