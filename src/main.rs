use anyhow::{Context, Result};
use clap::{ArgGroup, Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use vericopy::core::{
    Algorithm, CaseMetadata, Job, JobOutcome, ProgressEvent, SinkMode, start_job, verify_container,
    verify_manifest,
};
use vericopy::core::orchestrator::report_location;
use vericopy::core::verifier::VerificationSummary;
use vericopy::{config, context, logging};

#[derive(Parser)]
#[command(name = "vericopy")]
#[command(about = "Verified copy of a directory tree to several destinations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file used instead of ./vericopy.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigArgs,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy a source tree and verify every destination
    Copy(CopyArgs),
    /// Re-check an existing copy against its container or manifest
    Verify(VerifyArgs),
    /// Print the effective configuration
    Config,
}

/// Options that map onto config fields. Unset ones do not override lower
/// layers.
#[derive(Args, Serialize)]
struct ConfigArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    chunk_size: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    progress_interval_ms: Option<u64>,

    #[serde(rename = "csv_report", skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    csv: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    sync_files: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(long, global = true)]
    log_json: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Args)]
struct CopyArgs {
    #[arg(long)]
    source: PathBuf,

    /// Destination root; repeat for more destinations
    #[arg(long = "dest", required = true)]
    destinations: Vec<PathBuf>,

    /// Digest algorithm; repeat for more. Defaults to the configured list.
    #[arg(long = "algorithm", value_enum)]
    algorithms: Vec<Algorithm>,

    /// Store the copy in a container with this name (single destination)
    #[arg(long)]
    container: Option<String>,

    #[arg(long)]
    operator: Option<String>,

    #[arg(long, default_value = "")]
    case_id: String,

    #[arg(long, default_value = "")]
    notes: String,

    /// Print progress events as JSON lines
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("target").required(true).args(["container", "manifest"])))]
struct VerifyArgs {
    #[arg(long)]
    container: Option<PathBuf>,

    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Directory holding the files listed in the manifest
    #[arg(long, requires = "manifest")]
    root: Option<PathBuf>,

    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config = config::AppConfig::new(cli.config.as_deref(), Some(&cli.overrides))?;
    logging::init(config.log_config());

    let ctx = context::EngineContext::new(config);
    let success = match cli.command {
        Commands::Copy(args) => run_copy(&ctx, args).await.context("Copy failed")?,
        Commands::Verify(args) => run_verify(&ctx, args).await.context("Verification failed")?,
        Commands::Config => {
            print!("{}", ctx.config.to_toml()?);
            true
        }
    };

    Ok(if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn run_copy(ctx: &context::EngineContext, args: CopyArgs) -> Result<bool> {
    let config = &ctx.config;
    let algorithms = if args.algorithms.is_empty() {
        config.algorithms.clone()
    } else {
        args.algorithms
    };

    let mut job = Job::new(args.source, args.destinations, algorithms);
    job.options = config.job_options();
    job.metadata = CaseMetadata {
        operator: args.operator.unwrap_or_else(|| config.operator.clone()),
        case_id: args.case_id,
        notes: args.notes,
    };
    if let Some(name) = args.container {
        job.mode = SinkMode::Container { name };
    }
    let reports: Vec<PathBuf> = job
        .destinations
        .iter()
        .map(|d| report_location(&job, d))
        .collect();

    let handle = start_job(job, ctx)?;
    info!(job_id = %handle.id, "Job started");

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let json = args.json;
    let outcome = handle
        .run_to_end(|event| print_event(event, json))
        .await?;

    if !json {
        print_outcome(&outcome);
        for report in reports.iter().filter(|r| r.exists()) {
            println!("Report: {}", report.display());
        }
    }
    Ok(outcome.is_success())
}

fn print_event(event: &ProgressEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => warn!(error = %e, "Failed to serialize progress event"),
        }
        return;
    }

    let phase = match event {
        ProgressEvent::Copying { .. } => "copy",
        ProgressEvent::Verifying { .. } => "verify",
        _ => return,
    };
    if let Some(sinks) = event.sinks() {
        for (sink, p) in sinks {
            println!(
                "[{}] {}: {:?} {:.2} GB, {} files {}",
                phase,
                sink,
                p.status,
                p.processed_bytes as f64 / 1e9,
                p.processed_files,
                p.current_file
            );
        }
    }
}

fn print_outcome(outcome: &JobOutcome) {
    let summary = &outcome.summary;
    println!(
        "Job {} finished: {:?} ({} files, {} bytes)",
        summary.job_id, outcome.state, summary.files_copied, summary.bytes_copied
    );
    for dropped in &summary.dropped {
        println!("Dropped {}: {}", dropped.sink, dropped.reason);
    }
    for result in &summary.verification {
        println!(
            "{}: {} verified, {} failed",
            result.sink,
            result.files_verified(),
            result.failures.len()
        );
        for failed in &result.failures {
            println!("  FAILED {}", failed.relative_path);
        }
    }
    if let Some(error) = &outcome.error {
        println!("Error: {}", error);
    }
}

async fn run_verify(ctx: &context::EngineContext, args: VerifyArgs) -> Result<bool> {
    let cancel = tokio_util::sync::CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let chunk_size = ctx.config.chunk_size;
    let summary = match &args.container {
        Some(container) => {
            verify_container(container, ctx.containers.clone(), chunk_size, cancel).await?
        }
        None => {
            let manifest = args
                .manifest
                .as_deref()
                .context("Either --container or --manifest is required")?;
            verify_manifest(manifest, args.root.as_deref(), chunk_size, cancel).await?
        }
    };

    print_summary(&summary, args.json)?;
    Ok(summary.result.is_success())
}

fn print_summary(summary: &VerificationSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    let hashes: Vec<&str> = summary.algorithms.iter().map(Algorithm::as_str).collect();
    let result = &summary.result;
    println!("Target: {}", summary.target.display());
    println!("Hashes: {}", hashes.join(" - "));
    for failed in &result.failures {
        println!("Verification failed for file: {}", failed.relative_path);
    }
    println!(
        "{} files checked, {} verified, {} failed{}",
        result.files_checked,
        result.files_verified(),
        result.failures.len(),
        if result.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}
