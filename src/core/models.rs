use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use super::digest::{Algorithm, Digests};
use super::error::JobError;

/// Default read size for the copy and verification passes.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024 * 1024;

/// Default minimum interval between streaming progress events.
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Case details recorded in every report and in container metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub operator: String,
    pub case_id: String,
    pub notes: String,
}

/// Where the copy lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMode {
    /// Plain directory tree under each destination root.
    Directory,
    /// A single container named `name` inside the only destination root.
    Container { name: String },
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub chunk_size: usize,
    pub progress_interval: Duration,
    pub csv_report: bool,
    pub sync_files: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            csv_report: false,
            sync_files: false,
        }
    }
}

/// A single duplication run.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source: PathBuf,
    pub destinations: Vec<PathBuf>,
    pub mode: SinkMode,
    pub algorithms: Vec<Algorithm>,
    pub metadata: CaseMetadata,
    pub options: JobOptions,
}

impl Job {
    pub fn new(
        source: impl Into<PathBuf>,
        destinations: Vec<PathBuf>,
        algorithms: Vec<Algorithm>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            source: source.into(),
            destinations,
            mode: SinkMode::Directory,
            algorithms,
            metadata: CaseMetadata::default(),
            options: JobOptions::default(),
        }
    }

    /// Name under which the copy is stored in every destination: the
    /// container name, or the source directory's basename.
    pub fn base_name(&self) -> String {
        match &self.mode {
            SinkMode::Container { name } => name.clone(),
            SinkMode::Directory => self
                .source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "[root]".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), JobError> {
        if self.algorithms.is_empty() {
            return Err(JobError::InvalidJob("no digest algorithm selected".into()));
        }
        if self.destinations.is_empty() {
            return Err(JobError::InvalidJob("no destination selected".into()));
        }
        if let SinkMode::Container { name } = &self.mode {
            if self.destinations.len() != 1 {
                return Err(JobError::InvalidJob(format!(
                    "container mode needs exactly one destination, got {}",
                    self.destinations.len()
                )));
            }
            if name.is_empty() || name.contains(['/', '\\']) {
                return Err(JobError::InvalidJob(format!(
                    "invalid container name '{}'",
                    name
                )));
            }
        }
        if self.options.chunk_size == 0 {
            return Err(JobError::InvalidJob("chunk size must be positive".into()));
        }
        if !self.source.is_dir() {
            return Err(JobError::InvalidJob(format!(
                "source {} is not a directory",
                self.source.display()
            )));
        }
        Ok(())
    }
}

/// Timestamps captured from source metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStamps {
    pub created: Option<DateTime<Utc>>,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub record_changed: Option<DateTime<Utc>>,
}

impl FileStamps {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        Self {
            created: FileTime::from_creation_time(metadata).map(to_utc),
            modified: to_utc(FileTime::from_last_modification_time(metadata)),
            accessed: to_utc(FileTime::from_last_access_time(metadata)),
            record_changed: record_changed(metadata),
        }
    }

    pub fn accessed_filetime(&self) -> FileTime {
        to_filetime(self.accessed)
    }

    pub fn modified_filetime(&self) -> FileTime {
        to_filetime(self.modified)
    }
}

#[cfg(unix)]
fn record_changed(metadata: &Metadata) -> Option<DateTime<Utc>> {
    use std::os::unix::fs::MetadataExt;
    DateTime::from_timestamp(metadata.ctime(), metadata.ctime_nsec() as u32)
}

#[cfg(not(unix))]
fn record_changed(_metadata: &Metadata) -> Option<DateTime<Utc>> {
    None
}

fn to_utc(ft: FileTime) -> DateTime<Utc> {
    DateTime::from_timestamp(ft.unix_seconds(), ft.nanoseconds()).unwrap_or_default()
}

fn to_filetime(dt: DateTime<Utc>) -> FileTime {
    FileTime::from_unix_time(dt.timestamp(), dt.timestamp_subsec_nanos())
}

/// Outcome of verifying one file on one sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FileVerification {
    Verified,
    Mismatch { hashes: Vec<HashMismatch> },
    Unreadable { error: String },
}

impl FileVerification {
    pub fn is_verified(&self) -> bool {
        matches!(self, Self::Verified)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashMismatch {
    pub algorithm: Algorithm,
    pub stored: String,
    pub calculated: String,
}

/// Ground-truth record for one copied file.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    /// Path relative to the source root, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    pub stamps: FileStamps,
    /// Digests of the single source read.
    pub digests: Digests,
    /// Sinks that received the complete file.
    pub written_to: Vec<String>,
    /// Verification outcome per sink, filled by the verification pass.
    pub verification: BTreeMap<String, FileVerification>,
}

impl FileRecord {
    pub fn path(&self) -> &Path {
        Path::new(&self.relative_path)
    }

    /// Digests in the job's algorithm order.
    pub fn ordered_digests<'a>(&'a self, algorithms: &'a [Algorithm]) -> Vec<&'a str> {
        algorithms
            .iter()
            .filter_map(|a| self.digests.get(a).map(String::as_str))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub relative_path: String,
    pub outcome: FileVerification,
}

/// Verification result for one sink.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SinkVerification {
    pub sink: String,
    pub files_checked: u64,
    pub bytes_checked: u64,
    pub failures: Vec<FailedFile>,
    /// Set when the pass stopped early (cancellation).
    pub interrupted: bool,
}

impl SinkVerification {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && !self.interrupted
    }

    pub fn files_verified(&self) -> u64 {
        self.files_checked - self.failures.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DroppedDestination {
    pub sink: String,
    pub reason: String,
}

/// What the caller gets at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub files_copied: u64,
    pub bytes_copied: u64,
    /// One entry per destination that survived the copy.
    pub verification: Vec<SinkVerification>,
    pub dropped: Vec<DroppedDestination>,
}

impl JobSummary {
    pub fn verification_failures(&self) -> usize {
        self.verification.iter().map(|v| v.failures.len()).sum()
    }

    pub fn all_verified(&self) -> bool {
        !self.verification.is_empty() && self.verification.iter().all(|v| v.is_success())
    }
}

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Copying,
    ManifestWrite,
    Verifying,
    Done,
    Cancelled,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Failed)
    }
}
