#![allow(dead_code)]

use std::fs;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use vericopy::core::models::{CaseMetadata, FileStamps};
use vericopy::core::progress::EVENT_CHANNEL_CAPACITY;
use vericopy::core::sink::{Chunk, DirectorySink, FinishedFile, Sink, SinkReader, SinkWriter};
use vericopy::core::{Job, JobController, JobOutcome, ProgressEvent, SinkError, SystemVolumes};

/// Deterministic pseudo-random bytes.
pub fn pattern(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// `<root>/DCIM` with the given files.
pub fn source_tree(root: &Path, files: &[(&str, Vec<u8>)]) -> PathBuf {
    let source = root.join("DCIM");
    for (relative, data) in files {
        let path = source.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }
    fs::create_dir_all(&source).unwrap();
    source
}

pub fn dest(root: &Path, name: &str) -> PathBuf {
    let path = root.join(name);
    fs::create_dir_all(&path).unwrap();
    path
}

/// Run a controller to completion, collecting every event.
pub async fn run(
    job: Job,
    sinks: Vec<Arc<dyn Sink>>,
    on_built: impl FnOnce(&JobController),
) -> (JobOutcome, Vec<ProgressEvent>) {
    let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let controller = JobController::new(job, sinks, tx, Arc::new(SystemVolumes));
    on_built(&controller);

    let task = tokio::spawn(controller.run());
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (task.await.expect("job task panicked"), events)
}

/// Behaviour injected around a real directory sink.
#[derive(Default, Clone)]
pub struct Hooks {
    /// Writes fail with ENODEV once this many bytes went to the file.
    pub fail_after_bytes: Option<u64>,
    /// Reads of this file come back with the first byte flipped.
    pub tamper: Option<String>,
    /// Cancel the job once this many files were closed.
    pub cancel_after_files: Option<usize>,
    /// Delete this source file once this many files were closed.
    pub remove_source_after_files: Option<(usize, PathBuf)>,
    /// Cancel the job as soon as verification opens this destination.
    pub cancel_on_verify: bool,
    /// Delete the copied tree right before it is verified.
    pub vanish_before_verify: bool,
    pub cancel: Arc<OnceLock<CancellationToken>>,
}

impl Hooks {
    fn trigger_cancel(&self) {
        if let Some(token) = self.cancel.get() {
            token.cancel();
        }
    }
}

pub struct HookedSink {
    inner: DirectorySink,
    hooks: Hooks,
    closed: Arc<AtomicUsize>,
}

impl HookedSink {
    pub fn new(job: &Job, root: &Path, hooks: Hooks) -> Self {
        Self {
            inner: DirectorySink::new(
                root.display().to_string(),
                root,
                &job.base_name(),
                false,
            ),
            hooks,
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl Sink for HookedSink {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn report_root(&self) -> &Path {
        self.inner.report_root()
    }

    fn location(&self) -> PathBuf {
        self.inner.location()
    }

    fn prepare(&self, metadata: &CaseMetadata) -> Result<(), SinkError> {
        self.inner.prepare(metadata)
    }

    fn create_dir(&self, relative: &str) -> Result<(), SinkError> {
        self.inner.create_dir(relative)
    }

    fn set_dir_stamps(&self, relative: &str, stamps: &FileStamps) -> Result<(), SinkError> {
        self.inner.set_dir_stamps(relative, stamps)
    }

    fn create_file(&self, relative: &str, size: u64) -> Result<Box<dyn SinkWriter>, SinkError> {
        Ok(Box::new(HookedWriter {
            inner: self.inner.create_file(relative, size)?,
            written: 0,
            hooks: self.hooks.clone(),
            closed: Arc::clone(&self.closed),
        }))
    }

    fn seal(&self) -> Result<(), SinkError> {
        self.inner.seal()
    }

    fn open_reader(&self) -> Result<Box<dyn SinkReader>, SinkError> {
        if self.hooks.cancel_on_verify {
            self.hooks.trigger_cancel();
        }
        if self.hooks.vanish_before_verify {
            fs::remove_dir_all(self.inner.location())?;
        }
        Ok(Box::new(HookedReader {
            inner: self.inner.open_reader()?,
            tamper: self.hooks.tamper.clone(),
        }))
    }
}

struct HookedWriter {
    inner: Box<dyn SinkWriter>,
    written: u64,
    hooks: Hooks,
    closed: Arc<AtomicUsize>,
}

impl SinkWriter for HookedWriter {
    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), SinkError> {
        if let Some(limit) = self.hooks.fail_after_bytes {
            if self.written >= limit {
                return Err(io::Error::from_raw_os_error(libc::ENODEV).into());
            }
        }
        self.inner.write_chunk(chunk)?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>, file: &FinishedFile<'_>) -> Result<(), SinkError> {
        self.inner.finish(file)?;
        let closed = self.closed.fetch_add(1, Ordering::SeqCst) + 1;
        if self.hooks.cancel_after_files == Some(closed) {
            self.hooks.trigger_cancel();
        }
        if let Some((after, path)) = &self.hooks.remove_source_after_files {
            if *after == closed {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

struct HookedReader {
    inner: Box<dyn SinkReader>,
    tamper: Option<String>,
}

impl SinkReader for HookedReader {
    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>, SinkError> {
        let mut stream = self.inner.open(relative)?;
        if self.tamper.as_deref() != Some(relative) {
            return Ok(stream);
        }
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        if let Some(first) = data.first_mut() {
            *first ^= 0xff;
        }
        Ok(Box::new(Cursor::new(data)))
    }
}
