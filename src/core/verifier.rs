use serde::Serialize;
use std::collections::HashMap;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::digest::{Algorithm, DigestSet, Digests};
use crate::core::error::{JobError, SinkError};
use crate::core::manifest::{manifest_algorithm, parse_manifest};
use crate::core::models::{
    FailedFile, FileRecord, FileVerification, HashMismatch, SinkVerification,
};
use crate::core::progress::{EventBus, Phase, SinkStatus};
use crate::core::sink::{
    ContainerBackend, ContainerFactory, DirectoryReader, SinkReader, SinkSet, StreamId,
};

/// A file to re-hash and the digests it must match.
#[derive(Debug, Clone)]
pub struct ExpectedFile {
    pub relative_path: String,
    pub size: u64,
    pub digests: Digests,
}

impl From<&FileRecord> for ExpectedFile {
    fn from(record: &FileRecord) -> Self {
        Self {
            relative_path: record.relative_path.clone(),
            size: record.size,
            digests: record.digests.clone(),
        }
    }
}

/// Result of checking an existing copy outside of a job.
#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    pub target: PathBuf,
    pub algorithms: Vec<Algorithm>,
    pub result: SinkVerification,
}

/// Smallest read buffer, used when expected sizes are unknown or tiny.
const MIN_BUFFER: usize = 64 * 1024;

/// Progress hooks for [`verify_files`]. Both default to doing nothing.
pub trait VerifyObserver {
    /// `bytes` more of `file` were read and hashed.
    fn on_chunk(&self, _file: &str, _bytes: u64) {}

    /// `file` is done with `outcome`.
    fn on_file(&self, _file: &str, _outcome: &FileVerification) {}
}

impl VerifyObserver for () {}

/// Feeds verification progress into a job's event bus.
struct BusObserver<'a> {
    bus: &'a EventBus,
    sink: &'a str,
}

impl VerifyObserver for BusObserver<'_> {
    fn on_chunk(&self, file: &str, bytes: u64) {
        self.bus.update(self.sink, |p| {
            p.processed_bytes += bytes;
            if p.current_file != file {
                p.current_file = file.to_string();
            }
        });
        self.bus.emit_throttled();
    }

    fn on_file(&self, file: &str, outcome: &FileVerification) {
        self.bus.update(self.sink, |p| {
            p.processed_files += 1;
            p.current_file = file.to_string();
            if !outcome.is_verified() {
                p.status = SinkStatus::ErrorHash;
            }
        });
        self.bus.emit_nowait();
    }
}

/// Re-read every expected file from `reader` and compare digests.
///
/// Returns the aggregate plus one outcome per file checked, in order. Stops
/// early (marking the result interrupted) when `cancel` fires.
pub fn verify_files(
    sink: &str,
    reader: &dyn SinkReader,
    expected: &[ExpectedFile],
    chunk_size: usize,
    cancel: &CancellationToken,
    observer: &dyn VerifyObserver,
) -> (SinkVerification, Vec<FileVerification>) {
    let mut result = SinkVerification {
        sink: sink.to_string(),
        ..Default::default()
    };
    let mut outcomes = Vec::with_capacity(expected.len());

    let largest = expected.iter().map(|e| e.size).max().unwrap_or(0) as usize;
    let mut buffer = vec![0u8; chunk_size.min(largest.max(MIN_BUFFER)).max(1)];

    for file in expected {
        if cancel.is_cancelled() {
            result.interrupted = true;
            break;
        }

        debug!(sink = %sink, file = %file.relative_path, "Verifying file");
        let (outcome, read) = match hash_stream(reader, file, &mut buffer, cancel, observer) {
            Ok(Some((digests, read))) => (compare(&file.digests, &digests), read),
            Ok(None) => {
                result.interrupted = true;
                break;
            }
            Err(e) => (
                FileVerification::Unreadable {
                    error: e.to_string(),
                },
                0,
            ),
        };

        if !outcome.is_verified() {
            error!(sink = %sink, file = %file.relative_path, "Verification failed");
            result.failures.push(FailedFile {
                relative_path: file.relative_path.clone(),
                outcome: outcome.clone(),
            });
        }
        result.files_checked += 1;
        result.bytes_checked += read;
        observer.on_file(&file.relative_path, &outcome);
        outcomes.push(outcome);
    }

    (result, outcomes)
}

/// `Ok(None)` on cancellation.
fn hash_stream(
    reader: &dyn SinkReader,
    file: &ExpectedFile,
    buffer: &mut [u8],
    cancel: &CancellationToken,
    observer: &dyn VerifyObserver,
) -> Result<Option<(Digests, u64)>, SinkError> {
    let algorithms: Vec<Algorithm> = file.digests.keys().copied().collect();
    let mut digest = DigestSet::new(&algorithms);
    let mut stream = reader.open(&file.relative_path)?;

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let n = match stream.read(buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        digest.absorb(&buffer[..n]);
        observer.on_chunk(&file.relative_path, n as u64);
    }

    let read = digest.absorbed();
    Ok(Some((digest.finalize(), read)))
}

fn compare(stored: &Digests, calculated: &Digests) -> FileVerification {
    let hashes: Vec<HashMismatch> = stored
        .iter()
        .filter_map(|(algorithm, stored)| {
            let calculated = calculated.get(algorithm).cloned().unwrap_or_default();
            (*stored != calculated).then(|| HashMismatch {
                algorithm: *algorithm,
                stored: stored.clone(),
                calculated,
            })
        })
        .collect();

    if hashes.is_empty() {
        FileVerification::Verified
    } else {
        FileVerification::Mismatch { hashes }
    }
}

/// The verification pass of a job: every live sink, concurrently.
pub struct VerifyPass {
    sinks: SinkSet,
    bus: EventBus,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl VerifyPass {
    pub fn new(sinks: SinkSet, bus: EventBus, chunk_size: usize, cancel: CancellationToken) -> Self {
        Self {
            sinks,
            bus,
            chunk_size,
            cancel,
        }
    }

    /// Verify every record on every sink that received it. Outcomes are
    /// also stored on the records.
    pub async fn run(&self, records: &mut [FileRecord]) -> Result<Vec<SinkVerification>, JobError> {
        let live = self.sinks.snapshot();
        let ids: Vec<String> = live.iter().map(|s| s.id().to_string()).collect();
        info!(sinks = live.len(), files = records.len(), "Starting verification");

        self.bus.begin_phase(Phase::Verifying, &ids, 0);
        self.bus.update_live(|p| p.status = SinkStatus::Hashing);
        self.bus.emit().await;

        let mut tasks = JoinSet::new();
        for sink in live {
            let id = sink.id().to_string();
            let expected: Vec<ExpectedFile> = records
                .iter()
                .filter(|r| r.written_to.contains(&id))
                .map(ExpectedFile::from)
                .collect();
            let bus = self.bus.clone();
            let cancel = self.cancel.clone();
            let chunk_size = self.chunk_size;

            tasks.spawn_blocking(move || {
                let observer = BusObserver {
                    bus: &bus,
                    sink: &id,
                };

                let (result, outcomes) = match sink.open_reader() {
                    Ok(reader) => verify_files(
                        &id,
                        reader.as_ref(),
                        &expected,
                        chunk_size,
                        &cancel,
                        &observer,
                    ),
                    Err(e) => {
                        error!(sink = %id, error = %e, "Unable to open destination for verification");
                        unreadable(&id, &expected, &e)
                    }
                };

                bus.update(&id, |p| {
                    p.current_file.clear();
                    if result.is_success() {
                        p.status = SinkStatus::Done;
                    } else if !result.interrupted {
                        p.status = SinkStatus::ErrorHash;
                    }
                });
                (id, expected, result, outcomes)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (id, expected, result, outcomes) = joined?;
            info!(
                sink = %id,
                checked = result.files_checked,
                failed = result.failures.len(),
                interrupted = result.interrupted,
                "Sink verification finished"
            );

            for (file, outcome) in expected.iter().zip(outcomes) {
                if let Some(record) = records
                    .iter_mut()
                    .find(|r| r.relative_path == file.relative_path)
                {
                    record.verification.insert(id.clone(), outcome);
                }
            }
            results.push(result);
        }

        // Report in destination order, not completion order
        results.sort_by_key(|r| ids.iter().position(|id| *id == r.sink));
        self.bus.emit().await;
        Ok(results)
    }
}

fn unreadable(
    sink: &str,
    expected: &[ExpectedFile],
    err: &SinkError,
) -> (SinkVerification, Vec<FileVerification>) {
    let outcome = FileVerification::Unreadable {
        error: err.to_string(),
    };
    let failures = expected
        .iter()
        .map(|f| FailedFile {
            relative_path: f.relative_path.clone(),
            outcome: outcome.clone(),
        })
        .collect();
    let result = SinkVerification {
        sink: sink.to_string(),
        files_checked: expected.len() as u64,
        bytes_checked: 0,
        failures,
        interrupted: false,
    };
    (result, vec![outcome; expected.len()])
}

/// Re-hash every stream of an existing container against the hashes it
/// recorded on creation.
pub async fn verify_container(
    path: &Path,
    factory: Arc<dyn ContainerFactory>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<VerificationSummary, JobError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let backend = factory
            .open_container(&path)
            .map_err(|e| JobError::InvalidJob(format!("{}: {}", path.display(), e)))?;
        let streams = backend
            .list_streams()
            .map_err(|e| JobError::InvalidJob(format!("{}: {}", path.display(), e)))?;

        let mut algorithms: Vec<Algorithm> = streams
            .iter()
            .flat_map(|s| s.hashes.keys().copied())
            .collect();
        algorithms.sort();
        algorithms.dedup();

        let reader = StreamReader {
            backend,
            ids: streams.iter().map(|s| (s.path.clone(), s.id.clone())).collect(),
        };
        let (unhashed, expected): (Vec<_>, Vec<_>) = streams
            .into_iter()
            .map(|s| ExpectedFile {
                relative_path: s.path,
                size: s.size,
                digests: s.hashes,
            })
            .partition(|e| e.digests.is_empty());

        info!(container = %path.display(), streams = expected.len() + unhashed.len(), "Verifying container");
        let id = path.display().to_string();
        let (mut result, _) = verify_files(&id, &reader, &expected, chunk_size, &cancel, &());

        for file in unhashed {
            result.files_checked += 1;
            result.failures.push(FailedFile {
                relative_path: file.relative_path,
                outcome: FileVerification::Unreadable {
                    error: "no hash recorded in container".into(),
                },
            });
        }

        Ok(VerificationSummary {
            target: path,
            algorithms,
            result,
        })
    })
    .await?
}

struct StreamReader {
    backend: Box<dyn ContainerBackend>,
    ids: HashMap<String, StreamId>,
}

impl SinkReader for StreamReader {
    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>, SinkError> {
        let id = self.ids.get(relative).ok_or_else(|| {
            SinkError::Container(format!("{} is not stored in the container", relative))
        })?;
        self.backend.open_stream(id)
    }
}

/// Re-hash every file listed in a `<basename>.<algorithm>` manifest.
///
/// Without `root`, files are looked up in `<manifest dir>/<basename>/`,
/// where a directory-mode copy puts them.
pub async fn verify_manifest(
    manifest: &Path,
    root: Option<&Path>,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<VerificationSummary, JobError> {
    let algorithm = manifest_algorithm(manifest).ok_or_else(|| {
        JobError::InvalidJob(format!(
            "{} does not end in a supported algorithm name",
            manifest.display()
        ))
    })?;
    let root = match root {
        Some(root) => root.to_path_buf(),
        None => {
            let stem = manifest.file_stem().ok_or_else(|| {
                JobError::InvalidJob(format!("{} has no base name", manifest.display()))
            })?;
            manifest.with_file_name(stem)
        }
    };

    let text = tokio::fs::read_to_string(manifest)
        .await
        .map_err(|e| JobError::InvalidJob(format!("{}: {}", manifest.display(), e)))?;
    let expected: Vec<ExpectedFile> = parse_manifest(&text)?
        .into_iter()
        .map(|entry| ExpectedFile {
            relative_path: entry.relative_path,
            // Not recorded in manifests
            size: 0,
            digests: [(algorithm, entry.digest)].into_iter().collect(),
        })
        .collect();

    info!(manifest = %manifest.display(), root = %root.display(), files = expected.len(), "Verifying manifest");
    tokio::task::spawn_blocking(move || {
        let reader = DirectoryReader::new(&root);
        let id = root.display().to_string();
        let (result, _) = verify_files(&id, &reader, &expected, chunk_size, &cancel, &());
        Ok(VerificationSummary {
            target: root,
            algorithms: vec![algorithm],
            result,
        })
    })
    .await?
}
