//! Reference container backend.
//!
//! A bundle is a directory holding one file per stream under `streams/` and
//! an `index.json` with the case metadata and every stream's path, size,
//! hashes and timestamps. The index is written when the container is closed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::container::{ContainerBackend, ContainerFactory, StreamId, StreamInfo};
use crate::core::digest::Algorithm;
use crate::core::error::SinkError;
use crate::core::models::{CaseMetadata, FileStamps};

const INDEX_FILE: &str = "index.json";
const STREAMS_DIR: &str = "streams";
const FORMAT: &str = "vericopy-bundle/1";

/// Buffer size used when storing a stream
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BundleIndex {
    format: String,
    metadata: CaseMetadata,
    created: DateTime<Utc>,
    closed: Option<DateTime<Utc>>,
    streams: Vec<StreamInfo>,
}

/// Creates and opens bundle containers.
#[derive(Debug, Clone, Copy, Default)]
pub struct BundleFactory;

impl ContainerFactory for BundleFactory {
    fn create_container(
        &self,
        path: &Path,
        metadata: &CaseMetadata,
    ) -> Result<Box<dyn ContainerBackend>, SinkError> {
        if path.join(INDEX_FILE).exists() {
            return Err(SinkError::Container(format!(
                "{} already holds a container",
                path.display()
            )));
        }
        fs::create_dir_all(path.join(STREAMS_DIR))?;

        Ok(Box::new(Bundle {
            root: path.to_path_buf(),
            index: BundleIndex {
                format: FORMAT.to_string(),
                metadata: metadata.clone(),
                created: Utc::now(),
                closed: None,
                streams: Vec::new(),
            },
            writable: true,
        }))
    }

    fn open_container(&self, path: &Path) -> Result<Box<dyn ContainerBackend>, SinkError> {
        let file = File::open(path.join(INDEX_FILE))?;
        let index: BundleIndex = serde_json::from_reader(BufReader::new(file))?;
        if index.format != FORMAT {
            return Err(SinkError::Container(format!(
                "unsupported container format '{}'",
                index.format
            )));
        }
        Ok(Box::new(Bundle {
            root: path.to_path_buf(),
            index,
            writable: false,
        }))
    }
}

struct Bundle {
    root: PathBuf,
    index: BundleIndex,
    writable: bool,
}

impl Bundle {
    fn stream_path(&self, id: &str) -> PathBuf {
        self.root.join(STREAMS_DIR).join(id)
    }

    fn stream_mut(&mut self, id: &str) -> Result<&mut StreamInfo, SinkError> {
        self.index
            .streams
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| SinkError::Container(format!("unknown stream {}", id)))
    }

    fn ensure_writable(&self) -> Result<(), SinkError> {
        if self.writable {
            Ok(())
        } else {
            Err(SinkError::Container("container is read-only".into()))
        }
    }

    fn store(&self, path: &Path, reader: &mut dyn Read) -> io::Result<u64> {
        let mut out = BufWriter::with_capacity(COPY_BUFFER_SIZE, File::create(path)?);
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            out.write_all(&buffer[..n])?;
            written += n as u64;
        }
        out.flush()?;
        Ok(written)
    }
}

impl ContainerBackend for Bundle {
    fn write_stream(
        &mut self,
        relative_path: &str,
        reader: &mut dyn Read,
        length: u64,
    ) -> Result<StreamId, SinkError> {
        self.ensure_writable()?;

        let id = Uuid::now_v7().to_string();
        let path = self.stream_path(&id);
        let written = match self.store(&path, reader) {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&path);
                return Err(e.into());
            }
        };

        if written != length {
            let _ = fs::remove_file(&path);
            return Err(SinkError::Container(format!(
                "stream {} ended after {} of {} bytes",
                relative_path, written, length
            )));
        }

        debug!(stream = %id, path = %relative_path, size = written, "Stream stored");
        self.index.streams.push(StreamInfo {
            id: id.clone(),
            path: relative_path.to_string(),
            size: written,
            hashes: Default::default(),
            stamps: None,
        });
        Ok(id)
    }

    fn record_hash(
        &mut self,
        stream: &StreamId,
        algorithm: Algorithm,
        digest: &str,
    ) -> Result<(), SinkError> {
        self.ensure_writable()?;
        self.stream_mut(stream)?
            .hashes
            .insert(algorithm, digest.to_string());
        Ok(())
    }

    fn record_stamps(&mut self, stream: &StreamId, stamps: &FileStamps) -> Result<(), SinkError> {
        self.ensure_writable()?;
        self.stream_mut(stream)?.stamps = Some(*stamps);
        Ok(())
    }

    fn list_streams(&self) -> Result<Vec<StreamInfo>, SinkError> {
        Ok(self.index.streams.clone())
    }

    fn open_stream(&self, stream: &StreamId) -> Result<Box<dyn Read + Send>, SinkError> {
        if !self.index.streams.iter().any(|s| &s.id == stream) {
            return Err(SinkError::Container(format!("unknown stream {}", stream)));
        }
        Ok(Box::new(File::open(self.stream_path(stream))?))
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if !self.writable {
            return Ok(());
        }
        self.index.closed = Some(Utc::now());

        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        let mut out = BufWriter::new(File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut out, &self.index)?;
        out.flush()?;
        out.into_inner()
            .map_err(|e| SinkError::from(e.into_error()))?
            .sync_all()?;
        fs::rename(&tmp, self.root.join(INDEX_FILE))?;

        self.writable = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn metadata() -> CaseMetadata {
        CaseMetadata {
            operator: "jdoe".into(),
            case_id: "CASE-7".into(),
            notes: "seized laptop".into(),
        }
    }

    #[test]
    fn index_survives_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("evidence");

        let mut bundle = BundleFactory.create_container(&path, &metadata()).unwrap();
        let id = bundle
            .write_stream("a/b.txt", &mut &b"hello"[..], 5)
            .unwrap();
        bundle.record_hash(&id, Algorithm::Md5, "abc").unwrap();
        bundle.close().unwrap();

        let reopened = BundleFactory.open_container(&path).unwrap();
        let streams = reopened.list_streams().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].path, "a/b.txt");
        assert_eq!(streams[0].size, 5);
        assert_eq!(streams[0].hashes[&Algorithm::Md5], "abc");

        let mut content = String::new();
        reopened
            .open_stream(&id)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello");
    }

    #[test]
    fn short_stream_is_rejected() {
        let temp = tempdir().unwrap();
        let mut bundle = BundleFactory
            .create_container(&temp.path().join("c"), &metadata())
            .unwrap();
        let err = bundle.write_stream("x", &mut &b"abc"[..], 10).unwrap_err();
        assert!(err.to_string().contains("3 of 10"));
        assert!(bundle.list_streams().unwrap().is_empty());
    }

    #[test]
    fn reopened_container_is_read_only() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("c");
        let mut bundle = BundleFactory.create_container(&path, &metadata()).unwrap();
        bundle.close().unwrap();

        assert!(BundleFactory.create_container(&path, &metadata()).is_err());
        let mut reopened = BundleFactory.open_container(&path).unwrap();
        assert!(reopened.write_stream("x", &mut &b""[..], 0).is_err());
    }
}
