//! Job controller: drives one job through its states and owns everything
//! the passes produce.
//!
//! `Idle -> Copying -> ManifestWrite -> Verifying -> Done`, with `Failed`
//! reachable from anywhere and `Cancelled` from the two passes. The caller
//! gets exactly one terminal event on the job's channel.

use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::context::EngineContext;
use crate::core::copy_pass::CopyPass;
use crate::core::error::{JobError, SinkError};
use crate::core::manifest;
use crate::core::models::{DroppedDestination, FileRecord, Job, JobState, JobSummary, SinkMode};
use crate::core::progress::{EVENT_CHANNEL_CAPACITY, EventBus, ProgressEvent, SinkStatus};
use crate::core::report;
use crate::core::sink::{ContainerSink, DirectorySink, Sink, SinkSet};
use crate::core::verifier::VerifyPass;
use crate::core::volume::VolumeInfo;
use crate::core::walker::{self, SourcePlan};

/// Final result of a job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub state: JobState,
    pub summary: JobSummary,
    pub error: Option<String>,
}

impl JobOutcome {
    /// Copied, verified on every surviving destination, no failures.
    pub fn is_success(&self) -> bool {
        self.state == JobState::Done && self.summary.all_verified()
    }
}

pub struct JobController {
    job: Job,
    sinks: SinkSet,
    bus: EventBus,
    volumes: Arc<dyn VolumeInfo>,
    cancel: CancellationToken,
    state: JobState,
    records: Vec<FileRecord>,
    summary: JobSummary,
    started: Option<DateTime<Local>>,
}

impl JobController {
    pub fn new(
        job: Job,
        sinks: Vec<Arc<dyn Sink>>,
        events: mpsc::Sender<ProgressEvent>,
        volumes: Arc<dyn VolumeInfo>,
    ) -> Self {
        let bus = EventBus::new(events, job.options.progress_interval);
        let summary = JobSummary {
            job_id: job.id.clone(),
            ..Default::default()
        };
        Self {
            job,
            sinks: SinkSet::new(sinks),
            bus,
            volumes,
            cancel: CancellationToken::new(),
            state: JobState::Idle,
            records: Vec::new(),
            summary,
            started: None,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn transition(&mut self, next: JobState) {
        debug!(from = ?self.state, to = ?next, "Job state change");
        self.state = next;
    }

    pub async fn run(mut self) -> JobOutcome {
        let span = info_span!("job", job_id = %self.job.id);
        async move {
            info!(
                source = %self.job.source.display(),
                destinations = self.job.destinations.len(),
                "Starting job"
            );

            let result = self.execute().await;
            self.summary.dropped = self
                .sinks
                .dropped()
                .into_iter()
                .map(|d| DroppedDestination {
                    sink: d.id,
                    reason: d.reason,
                })
                .collect();

            let error = match result {
                Ok(()) => None,
                Err(e) => {
                    error!(error = %e, "Job failed");
                    self.transition(JobState::Failed);
                    if self.started.is_some() {
                        self.append_to_reports(report::error_trailer(&e.to_string()))
                            .await;
                    }
                    Some(e.to_string())
                }
            };

            let event = match self.state {
                JobState::Done => ProgressEvent::Done {
                    summary: self.summary.clone(),
                },
                JobState::Cancelled => ProgressEvent::Cancelled {
                    at: Local::now(),
                    summary: self.summary.clone(),
                },
                _ => ProgressEvent::Error {
                    cause: error.clone().unwrap_or_else(|| "job stopped".into()),
                },
            };
            self.bus.finish(event).await;

            info!(
                state = ?self.state,
                files = self.summary.files_copied,
                verification_failures = self.summary.verification_failures(),
                "Job finished"
            );
            JobOutcome {
                state: self.state,
                summary: self.summary,
                error,
            }
        }
        .instrument(span)
        .await
    }

    async fn execute(&mut self) -> Result<(), JobError> {
        self.job.validate()?;

        let plan = walker::scan(&self.job.source, &self.job.base_name()).await?;
        info!(
            files = plan.total_files,
            bytes = plan.total_bytes,
            "Source scanned"
        );

        self.preflight(plan.total_bytes).await?;
        self.prepare().await?;
        self.write_headers(&plan).await?;

        self.transition(JobState::Copying);
        let copy = CopyPass::new(
            &plan,
            &self.job.algorithms,
            self.job.options.chunk_size,
            self.sinks.clone(),
            self.bus.clone(),
            self.cancel.clone(),
        );
        let outcome = copy.run().instrument(info_span!("copy")).await?;
        self.summary.files_copied = outcome.records.len() as u64;
        self.summary.bytes_copied = outcome.bytes_copied;
        self.records = outcome.records;

        if outcome.cancelled {
            // Containers still get an index of the files that made it
            self.seal_sinks().await?;
            self.cancelled().await;
            return Ok(());
        }

        self.transition(JobState::ManifestWrite);
        self.seal_sinks().await?;
        if self.sinks.is_empty() {
            return Err(JobError::NoDestinations);
        }
        self.write_manifests().await?;

        self.transition(JobState::Verifying);
        let verify = VerifyPass::new(
            self.sinks.clone(),
            self.bus.clone(),
            self.job.options.chunk_size,
            self.cancel.clone(),
        );
        let results = verify
            .run(&mut self.records)
            .instrument(info_span!("verify"))
            .await?;
        let interrupted = results.iter().any(|r| r.interrupted);
        self.summary.verification = results;

        if interrupted || self.cancel.is_cancelled() {
            self.cancelled().await;
            return Ok(());
        }

        self.write_verification_reports().await?;
        self.transition(JobState::Done);
        Ok(())
    }

    async fn cancelled(&mut self) {
        info!("Job cancelled");
        self.append_to_reports(report::interrupted(&Local::now()))
            .await;
        self.transition(JobState::Cancelled);
    }

    /// Skip destinations that cannot hold the copy.
    async fn preflight(&self, needed: u64) -> Result<(), JobError> {
        let sinks = self.sinks.clone();
        let volumes = Arc::clone(&self.volumes);
        tokio::task::spawn_blocking(move || {
            for sink in sinks.snapshot() {
                let root = sink.report_root();
                if !volumes.is_writable(root) {
                    sinks.drop_sink(sink.id(), format!("{} is not writable", root.display()));
                    continue;
                }
                match volumes.bytes_free(root) {
                    Ok(free) if free < needed => {
                        sinks.drop_sink(
                            sink.id(),
                            format!("not enough space: {} bytes needed, {} free", needed, free),
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(sink = %sink.id(), error = %e, "Unable to query free space");
                    }
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn prepare(&self) -> Result<(), JobError> {
        let sinks = self.sinks.clone();
        let metadata = self.job.metadata.clone();
        tokio::task::spawn_blocking(move || {
            for sink in sinks.snapshot() {
                if let Err(e) = sink.prepare(&metadata) {
                    sinks.drop_sink(sink.id(), e.to_string());
                }
            }
        })
        .await?;

        if self.sinks.is_empty() {
            return Err(JobError::NoDestinations);
        }
        Ok(())
    }

    async fn write_headers(&mut self, plan: &SourcePlan) -> Result<(), JobError> {
        let started = Local::now();
        let job = self.job.clone();
        let sinks = self.sinks.snapshot();
        let (files, bytes) = (plan.total_files, plan.total_bytes);

        let written = tokio::task::spawn_blocking(move || {
            let base = job.base_name();
            let mut written = 0;
            for sink in sinks {
                let text = report::header(&job, &sink.location(), files, bytes, &started);
                match report::create(&report::report_path(sink.report_root(), &base), &text) {
                    Ok(()) => written += 1,
                    Err(e) => warn!(sink = %sink.id(), error = %e, "Failed to create report"),
                }
            }
            written
        })
        .await?;

        if written == 0 {
            return Err(JobError::ReportUnwritable);
        }
        self.started = Some(started);
        Ok(())
    }

    /// Finalize every live sink, dropping the ones that fail.
    async fn seal_sinks(&self) -> Result<(), JobError> {
        let sinks = self.sinks.clone();
        let bus = self.bus.clone();
        tokio::task::spawn_blocking(move || {
            for sink in sinks.snapshot() {
                if let Err(e) = sink.seal() {
                    error!(sink = %sink.id(), error = %e, "Failed to finalize destination");
                    drop_failed(&sinks, &bus, sink.id(), &e);
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn write_manifests(&mut self) -> Result<(), JobError> {
        let ended = Local::now();
        let started = self.started.unwrap_or(ended);
        let base = self.job.base_name();
        let algorithms = self.job.algorithms.clone();
        let csv = self.job.options.csv_report;
        let sinks = self.sinks.snapshot();
        let records = std::mem::take(&mut self.records);

        let (written, records) = tokio::task::spawn_blocking(move || {
            let hashes = report::source_hashes(&algorithms, &records, &started, &ended);
            let mut written = 0;
            for sink in sinks {
                let root = sink.report_root();
                let result = report::append(&report::report_path(root, &base), &hashes)
                    .and_then(|()| manifest::write_manifests(root, &base, &algorithms, &records))
                    .and_then(|_| {
                        if csv {
                            manifest::write_csv(root, &base, &algorithms, &records)?;
                        }
                        Ok(())
                    });
                match result {
                    Ok(()) => written += 1,
                    Err(e) => warn!(sink = %sink.id(), error = %e, "Failed to write manifests"),
                }
            }
            (written, records)
        })
        .await?;
        self.records = records;

        if written == 0 {
            return Err(JobError::ReportUnwritable);
        }
        Ok(())
    }

    async fn write_verification_reports(&self) -> Result<(), JobError> {
        let base = self.job.base_name();
        let sinks = self.sinks.snapshot();
        let results = self.summary.verification.clone();
        tokio::task::spawn_blocking(move || {
            for result in &results {
                let Some(sink) = sinks.iter().find(|s| s.id() == result.sink) else {
                    continue;
                };
                let path = report::report_path(sink.report_root(), &base);
                if let Err(e) = report::append(&path, &report::verification(result)) {
                    warn!(sink = %result.sink, error = %e, "Failed to write verification report");
                }
            }
        })
        .await?;
        Ok(())
    }

    async fn append_to_reports(&self, text: String) {
        let base = self.job.base_name();
        let sinks = self.sinks.snapshot();
        let appended = tokio::task::spawn_blocking(move || {
            for sink in sinks {
                let path = report::report_path(sink.report_root(), &base);
                if let Err(e) = report::append(&path, &text) {
                    warn!(sink = %sink.id(), error = %e, "Failed to append to report");
                }
            }
        })
        .await;
        if let Err(e) = appended {
            warn!(error = %e, "Report writer task failed");
        }
    }
}

fn drop_failed(sinks: &SinkSet, bus: &EventBus, id: &str, err: &SinkError) {
    if sinks.drop_sink(id, err.to_string()) {
        let status = if err.is_gone() {
            SinkStatus::ErrorIo
        } else {
            SinkStatus::ErrorCopy
        };
        bus.mark_error(id, status);
    }
}

/// Build the sinks a job writes to. Each sink is identified by its
/// destination root.
pub fn build_sinks(job: &Job, ctx: &EngineContext) -> Vec<Arc<dyn Sink>> {
    let base = job.base_name();
    job.destinations
        .iter()
        .map(|dest| -> Arc<dyn Sink> {
            let id = dest.display().to_string();
            match &job.mode {
                SinkMode::Directory => Arc::new(DirectorySink::new(
                    id,
                    dest.clone(),
                    &base,
                    job.options.sync_files,
                )),
                SinkMode::Container { name } => Arc::new(ContainerSink::new(
                    id,
                    dest.clone(),
                    name,
                    Arc::clone(&ctx.containers),
                )),
            }
        })
        .collect()
}

/// A running job.
pub struct JobHandle {
    pub id: String,
    pub events: mpsc::Receiver<ProgressEvent>,
    cancel: CancellationToken,
    task: JoinHandle<JobOutcome>,
}

impl JobHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drain events into `on_event` until the job ends.
    pub async fn run_to_end(
        mut self,
        mut on_event: impl FnMut(&ProgressEvent),
    ) -> Result<JobOutcome, JobError> {
        while let Some(event) = self.events.recv().await {
            on_event(&event);
        }
        Ok(self.task.await?)
    }
}

/// Validate `job` and start it on the runtime.
pub fn start_job(job: Job, ctx: &EngineContext) -> Result<JobHandle, JobError> {
    job.validate()?;

    let sinks = build_sinks(&job, ctx);
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let id = job.id.clone();
    let controller = JobController::new(job, sinks, tx, Arc::clone(&ctx.volumes));
    let cancel = controller.cancel_token();
    let task = tokio::spawn(controller.run());

    Ok(JobHandle {
        id,
        events: rx,
        cancel,
        task,
    })
}

/// Where the report of `job` lands on destination `dest`.
pub fn report_location(job: &Job, dest: &std::path::Path) -> PathBuf {
    report::report_path(dest, &job.base_name())
}
