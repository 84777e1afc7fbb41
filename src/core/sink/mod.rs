//! Destinations the engine writes into and later reads back from.
//!
//! The copy pass, verification pass and reporting are written once against
//! [`Sink`]; [`directory::DirectorySink`] and [`container::ContainerSink`]
//! are the two implementations.

pub mod bundle;
pub mod container;
pub mod directory;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use super::digest::Digests;
use super::error::SinkError;
use super::models::{CaseMetadata, FileStamps};

pub use bundle::BundleFactory;
pub use container::{ContainerBackend, ContainerFactory, ContainerSink, StreamId, StreamInfo};
pub use directory::{DirectoryReader, DirectorySink};

/// One read from the source, shared by the digest task and every writer.
pub type Chunk = Arc<Vec<u8>>;

/// Everything a writer needs to know once the source file hit EOF.
pub struct FinishedFile<'a> {
    pub relative_path: &'a str,
    pub size: u64,
    pub stamps: &'a FileStamps,
    pub digests: &'a Digests,
}

pub trait Sink: Send + Sync {
    /// Stable identifier used in progress events and outcomes.
    fn id(&self) -> &str;

    /// Directory receiving the report and manifest files.
    fn report_root(&self) -> &Path;

    /// Where the copied data lives (report "Destination:" line).
    fn location(&self) -> PathBuf;

    /// Called once before the first write.
    fn prepare(&self, metadata: &CaseMetadata) -> Result<(), SinkError>;

    fn create_dir(&self, relative: &str) -> Result<(), SinkError>;

    fn set_dir_stamps(&self, relative: &str, stamps: &FileStamps) -> Result<(), SinkError>;

    fn create_file(&self, relative: &str, size: u64) -> Result<Box<dyn SinkWriter>, SinkError>;

    /// Called once after the last write, before verification.
    fn seal(&self) -> Result<(), SinkError>;

    /// Open a fresh, independent read handle for verification.
    fn open_reader(&self) -> Result<Box<dyn SinkReader>, SinkError>;
}

/// Exclusive handle on one destination file for the duration of a copy.
pub trait SinkWriter: Send + Sync {
    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), SinkError>;

    /// Close the file. Metadata failures are logged, not returned.
    fn finish(self: Box<Self>, file: &FinishedFile<'_>) -> Result<(), SinkError>;
}

pub trait SinkReader: Send {
    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>, SinkError>;
}

/// A sink removed from the live set and the reason it was removed.
#[derive(Debug, Clone)]
pub struct DroppedSink {
    pub id: String,
    pub reason: String,
}

struct SinkSetInner {
    live: Vec<Arc<dyn Sink>>,
    dropped: Vec<DroppedSink>,
    version: u64,
}

/// The job's live destination list.
///
/// Readers take snapshots; removal bumps the version so a caller holding a
/// snapshot can tell it is stale.
#[derive(Clone)]
pub struct SinkSet {
    inner: Arc<Mutex<SinkSetInner>>,
}

impl SinkSet {
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SinkSetInner {
                live: sinks,
                dropped: Vec::new(),
                version: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SinkSetInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> Vec<Arc<dyn Sink>> {
        self.lock().live.clone()
    }

    pub fn version(&self) -> u64 {
        self.lock().version
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().live.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().live.iter().map(|s| s.id().to_string()).collect()
    }

    pub fn is_live(&self, id: &str) -> bool {
        self.lock().live.iter().any(|s| s.id() == id)
    }

    /// Remove a sink. Returns false if it was already gone.
    pub fn drop_sink(&self, id: &str, reason: impl Into<String>) -> bool {
        let mut inner = self.lock();
        let Some(pos) = inner.live.iter().position(|s| s.id() == id) else {
            return false;
        };
        inner.live.remove(pos);
        inner.version += 1;
        let reason = reason.into();
        warn!(sink = %id, reason = %reason, "Destination dropped");
        inner.dropped.push(DroppedSink {
            id: id.to_string(),
            reason,
        });
        true
    }

    pub fn dropped(&self) -> Vec<DroppedSink> {
        self.lock().dropped.clone()
    }
}
