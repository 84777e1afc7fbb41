//! Container sink: the whole copy goes into one forensic container.
//!
//! The container format itself lives behind [`ContainerBackend`]; this module
//! only adapts it to the [`Sink`] interface. Backends consume each file as a
//! reader (`write_stream`), while the copy pass pushes chunks, so every file
//! gets a short-lived backend thread fed through a bounded channel.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::{Chunk, FinishedFile, Sink, SinkReader, SinkWriter};
use crate::core::digest::{Algorithm, Digests};
use crate::core::error::SinkError;
use crate::core::models::{CaseMetadata, FileStamps};

pub type StreamId = String;

/// One stored file as listed by the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: StreamId,
    pub path: String,
    pub size: u64,
    #[serde(default)]
    pub hashes: Digests,
    #[serde(default)]
    pub stamps: Option<FileStamps>,
}

/// An open container.
pub trait ContainerBackend: Send {
    /// Store `length` bytes read from `reader` under `relative_path`.
    fn write_stream(
        &mut self,
        relative_path: &str,
        reader: &mut dyn Read,
        length: u64,
    ) -> Result<StreamId, SinkError>;

    fn record_hash(
        &mut self,
        stream: &StreamId,
        algorithm: Algorithm,
        digest: &str,
    ) -> Result<(), SinkError>;

    fn record_stamps(&mut self, stream: &StreamId, stamps: &FileStamps) -> Result<(), SinkError>;

    fn list_streams(&self) -> Result<Vec<StreamInfo>, SinkError>;

    fn open_stream(&self, stream: &StreamId) -> Result<Box<dyn Read + Send>, SinkError>;

    /// Flush everything. No writes are accepted afterwards.
    fn close(&mut self) -> Result<(), SinkError>;
}

pub trait ContainerFactory: Send + Sync {
    fn create_container(
        &self,
        path: &Path,
        metadata: &CaseMetadata,
    ) -> Result<Box<dyn ContainerBackend>, SinkError>;

    fn open_container(&self, path: &Path) -> Result<Box<dyn ContainerBackend>, SinkError>;
}

type SharedBackend = Arc<Mutex<Option<Box<dyn ContainerBackend>>>>;

fn lock_backend(backend: &SharedBackend) -> MutexGuard<'_, Option<Box<dyn ContainerBackend>>> {
    backend.lock().unwrap_or_else(|e| e.into_inner())
}

fn not_open() -> SinkError {
    SinkError::Container("container is not open".into())
}

pub struct ContainerSink {
    id: String,
    root: PathBuf,
    path: PathBuf,
    factory: Arc<dyn ContainerFactory>,
    backend: SharedBackend,
}

impl ContainerSink {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        name: &str,
        factory: Arc<dyn ContainerFactory>,
    ) -> Self {
        let root = root.into();
        let path = root.join(name);
        Self {
            id: id.into(),
            root,
            path,
            factory,
            backend: Arc::new(Mutex::new(None)),
        }
    }

    pub fn container_path(&self) -> &Path {
        &self.path
    }
}

impl Sink for ContainerSink {
    fn id(&self) -> &str {
        &self.id
    }

    fn report_root(&self) -> &Path {
        &self.root
    }

    fn location(&self) -> PathBuf {
        self.path.clone()
    }

    fn prepare(&self, metadata: &CaseMetadata) -> Result<(), SinkError> {
        if !self.root.is_dir() {
            return Err(SinkError::Gone(io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not available", self.root.display()),
            )));
        }
        let backend = self.factory.create_container(&self.path, metadata)?;
        *lock_backend(&self.backend) = Some(backend);
        debug!(container = %self.path.display(), "Container created");
        Ok(())
    }

    // Folders are implied by the stream paths.
    fn create_dir(&self, _relative: &str) -> Result<(), SinkError> {
        Ok(())
    }

    fn set_dir_stamps(&self, _relative: &str, _stamps: &FileStamps) -> Result<(), SinkError> {
        Ok(())
    }

    fn create_file(&self, relative: &str, size: u64) -> Result<Box<dyn SinkWriter>, SinkError> {
        if lock_backend(&self.backend).is_none() {
            return Err(not_open());
        }

        let (tx, rx) = sync_channel::<Chunk>(1);
        let backend = Arc::clone(&self.backend);
        let relative_path = relative.to_string();

        let handle = thread::Builder::new()
            .name("container-stream".into())
            .spawn(move || {
                let mut reader = ChannelReader::new(rx);
                let mut guard = lock_backend(&backend);
                let backend = guard.as_mut().ok_or_else(not_open)?;
                backend.write_stream(&relative_path, &mut reader, size)
            })?;

        Ok(Box::new(ContainerWriter {
            backend: Arc::clone(&self.backend),
            tx: Some(tx),
            handle: Some(handle),
        }))
    }

    fn seal(&self) -> Result<(), SinkError> {
        let mut guard = lock_backend(&self.backend);
        let mut backend = guard.take().ok_or_else(not_open)?;
        backend.close()?;
        debug!(container = %self.path.display(), "Container closed");
        Ok(())
    }

    fn open_reader(&self) -> Result<Box<dyn SinkReader>, SinkError> {
        let backend = self.factory.open_container(&self.path)?;
        let streams = backend
            .list_streams()?
            .into_iter()
            .map(|s| (s.path, s.id))
            .collect();
        Ok(Box::new(ContainerReader { backend, streams }))
    }
}

struct ContainerWriter {
    backend: SharedBackend,
    tx: Option<SyncSender<Chunk>>,
    handle: Option<JoinHandle<Result<StreamId, SinkError>>>,
}

impl ContainerWriter {
    /// Wait for the backend thread and return its result.
    fn join(&mut self) -> Result<StreamId, SinkError> {
        self.tx.take();
        let handle = self.handle.take().ok_or_else(not_open)?;
        handle
            .join()
            .map_err(|_| SinkError::Container("stream writer panicked".into()))?
    }
}

impl SinkWriter for ContainerWriter {
    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), SinkError> {
        let sent = match &self.tx {
            Some(tx) => tx.send(Arc::clone(chunk)).is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        // The backend thread hung up: surface its error.
        match self.join() {
            Err(e) => Err(e),
            Ok(_) => Err(SinkError::Container(
                "container accepted fewer bytes than sent".into(),
            )),
        }
    }

    fn finish(mut self: Box<Self>, file: &FinishedFile<'_>) -> Result<(), SinkError> {
        let stream = self.join()?;

        let mut guard = lock_backend(&self.backend);
        let backend = guard.as_mut().ok_or_else(not_open)?;
        for (algorithm, digest) in file.digests {
            backend.record_hash(&stream, *algorithm, digest)?;
        }
        if let Err(e) = backend.record_stamps(&stream, file.stamps) {
            warn!(
                file = %file.relative_path,
                error = %e,
                "Unable to record file timestamps in container"
            );
        }
        Ok(())
    }
}

impl Drop for ContainerWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            // Abandoned mid-file: closing the channel ends the stream early.
            let _ = self.join();
        }
    }
}

/// `Read` over chunks arriving on a channel; EOF once the sender is gone.
struct ChannelReader {
    rx: Receiver<Chunk>,
    current: Option<Chunk>,
    offset: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Chunk>) -> Self {
        Self {
            rx,
            current: None,
            offset: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(chunk) = &self.current {
                if self.offset < chunk.len() {
                    let n = buf.len().min(chunk.len() - self.offset);
                    buf[..n].copy_from_slice(&chunk[self.offset..self.offset + n]);
                    self.offset += n;
                    return Ok(n);
                }
            }
            match self.rx.recv() {
                Ok(chunk) => {
                    self.current = Some(chunk);
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
    }
}

struct ContainerReader {
    backend: Box<dyn ContainerBackend>,
    streams: HashMap<String, StreamId>,
}

impl SinkReader for ContainerReader {
    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>, SinkError> {
        let stream = self.streams.get(relative).ok_or_else(|| {
            SinkError::Io(io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not stored in the container", relative),
            ))
        })?;
        self.backend.open_stream(stream)
    }
}
