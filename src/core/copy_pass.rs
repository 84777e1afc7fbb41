//! The copy pass: one sequential read per source file, digested once and
//! fanned out to every live sink.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::digest::{Algorithm, DigestSet};
use super::error::JobError;
use super::fanout::{FanOutWriter, FinishedRecord};
use super::models::{FileRecord, FileStamps};
use super::progress::{EventBus, Phase, SinkStatus};
use super::sink::{Chunk, SinkSet};
use super::walker::{SourceFile, SourcePlan, WalkEntry};

#[derive(Debug, Default)]
pub struct CopyOutcome {
    /// One record per completely copied file, in walk order.
    pub records: Vec<FileRecord>,
    pub bytes_copied: u64,
    /// The pass stopped early on cancellation.
    pub cancelled: bool,
}

pub struct CopyPass<'a> {
    plan: &'a SourcePlan,
    algorithms: &'a [Algorithm],
    chunk_size: usize,
    sinks: SinkSet,
    bus: EventBus,
    cancel: CancellationToken,
}

struct DirStamps {
    relative: String,
    depth: usize,
    stamps: FileStamps,
}

impl<'a> CopyPass<'a> {
    pub fn new(
        plan: &'a SourcePlan,
        algorithms: &'a [Algorithm],
        chunk_size: usize,
        sinks: SinkSet,
        bus: EventBus,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plan,
            algorithms,
            chunk_size,
            sinks,
            bus,
            cancel,
        }
    }

    pub async fn run(&self) -> Result<CopyOutcome, JobError> {
        let started = Instant::now();
        let mut outcome = CopyOutcome::default();
        let mut fanout = FanOutWriter::new(self.sinks.clone(), self.bus.clone());
        let mut dirs = Vec::new();

        self.bus.begin_phase(Phase::Copying, &self.sinks.ids(), 0);
        self.bus.update_live(|p| p.status = SinkStatus::Copy);
        self.bus.emit().await;

        for entry in &self.plan.entries {
            if self.cancel.is_cancelled() {
                info!("Copy cancelled between files");
                outcome.cancelled = true;
                break;
            }

            match entry {
                WalkEntry::Dir { relative, path } => {
                    let metadata = tokio::fs::metadata(path)
                        .await
                        .map_err(|e| JobError::source_lost(path, e))?;
                    fanout.create_dir(relative).await;
                    dirs.push(DirStamps {
                        relative: relative.clone(),
                        depth: depth_of(relative),
                        stamps: FileStamps::from_metadata(&metadata),
                    });
                }
                WalkEntry::File(file) => {
                    match self.copy_file(&mut fanout, file).await? {
                        Some(record) => {
                            outcome.bytes_copied += record.size;
                            outcome.records.push(record);
                        }
                        None => {
                            outcome.cancelled = true;
                            break;
                        }
                    }
                }
            }

            if self.sinks.is_empty() {
                return Err(JobError::NoDestinations);
            }
        }

        // Deepest first, so setting a parent's times is not undone by a child
        dirs.sort_by(|a, b| b.depth.cmp(&a.depth));
        for dir in dirs {
            fanout.set_dir_stamps(&dir.relative, dir.stamps).await;
        }

        if !outcome.cancelled {
            self.bus.update_live(|p| {
                p.status = SinkStatus::Done;
                p.current_file.clear();
            });
            self.bus.emit().await;
        }

        info!(
            files = outcome.records.len(),
            bytes = outcome.bytes_copied,
            duration_ms = started.elapsed().as_millis() as u64,
            cancelled = outcome.cancelled,
            "Copy pass finished"
        );
        Ok(outcome)
    }

    /// Copy one file. Returns `None` if cancelled mid-file.
    async fn copy_file(
        &self,
        fanout: &mut FanOutWriter,
        file: &SourceFile,
    ) -> Result<Option<FileRecord>, JobError> {
        debug!(file = %file.relative, size = file.size, "Copying file");

        let (source, stamps) = open_source(&file.path).await?;
        fanout.open(&file.relative, file.size).await;
        if self.sinks.is_empty() {
            return Err(JobError::NoDestinations);
        }

        let relative = file.relative.clone();
        self.bus.update_live(|p| {
            p.status = SinkStatus::Copy;
            p.current_file = relative.clone();
        });

        let capacity = self.chunk_size.min(file.size as usize).max(1);
        let chunk_size = self.chunk_size as u64;
        let mut digest = DigestSet::new(self.algorithms);
        let (mut source, mut next) = read_chunk(source, chunk_size, capacity).await?;

        loop {
            let chunk = next.map_err(|e| JobError::source_lost(&file.path, e))?;
            if chunk.is_empty() {
                break;
            }
            if self.cancel.is_cancelled() {
                info!(file = %file.relative, "Copy cancelled mid-file");
                fanout.abandon();
                return Ok(None);
            }

            let chunk: Chunk = Arc::new(chunk);
            let len = chunk.len() as u64;

            let hashing = {
                let chunk = Arc::clone(&chunk);
                tokio::task::spawn_blocking(move || {
                    digest.absorb(&chunk);
                    digest
                })
            };
            let (hashed, (), read) = tokio::join!(
                hashing,
                fanout.write(Arc::clone(&chunk)),
                read_chunk(source, chunk_size, capacity)
            );
            digest = hashed?;
            (source, next) = read?;

            for sink in fanout.open_sinks() {
                self.bus.update(&sink, |p| p.processed_bytes += len);
            }
            self.bus.emit_throttled();

            if !fanout.has_writers() && self.sinks.is_empty() {
                return Err(JobError::NoDestinations);
            }
        }

        let size = digest.absorbed();
        if size != file.size {
            warn!(
                file = %file.relative,
                scanned = file.size,
                read = size,
                "Source file changed size during the copy"
            );
        }

        let record = Arc::new(FinishedRecord {
            relative_path: file.relative.clone(),
            size,
            stamps,
            digests: digest.finalize(),
        });
        let writing = fanout.open_sinks();
        fanout.finish(Arc::clone(&record)).await;
        let written_to: Vec<String> = writing
            .into_iter()
            .filter(|id| self.sinks.is_live(id))
            .collect();

        for sink in &written_to {
            self.bus.update(sink, |p| p.processed_files += 1);
        }
        self.bus.emit_nowait();

        let FinishedRecord {
            relative_path,
            size,
            stamps,
            digests,
        } = Arc::unwrap_or_clone(record);

        Ok(Some(FileRecord {
            relative_path,
            size,
            stamps,
            digests,
            written_to,
            verification: Default::default(),
        }))
    }
}

fn depth_of(relative: &str) -> usize {
    if relative.is_empty() {
        0
    } else {
        relative.split('/').count()
    }
}

async fn open_source(path: &Path) -> Result<(File, FileStamps), JobError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = File::open(&path).map_err(|e| JobError::source_lost(&path, e))?;
        let metadata = file
            .metadata()
            .map_err(|e| JobError::source_lost(&path, e))?;
        Ok((file, FileStamps::from_metadata(&metadata)))
    })
    .await?
}

/// Read up to `limit` bytes. An empty buffer means EOF.
async fn read_chunk(
    file: File,
    limit: u64,
    capacity: usize,
) -> Result<(File, io::Result<Vec<u8>>), JobError> {
    let handle = tokio::task::spawn_blocking(move || {
        let mut file = file;
        let mut buf = Vec::with_capacity(capacity);
        let result = file
            .by_ref()
            .take(limit)
            .read_to_end(&mut buf)
            .map(|_| buf);
        (file, result)
    });
    Ok(handle.await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::digest_bytes;
    use crate::core::models::CaseMetadata;
    use crate::core::sink::{DirectorySink, Sink};
    use crate::core::walker::scan_source;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    fn sink(root: &Path, id: &str) -> Arc<dyn Sink> {
        let dest = root.join(id);
        fs::create_dir_all(&dest).unwrap();
        let sink = DirectorySink::new(id, dest, "src", false);
        sink.prepare(&CaseMetadata::default()).unwrap();
        Arc::new(sink)
    }

    #[tokio::test]
    async fn copies_tree_to_every_sink_in_small_chunks() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(source.join("sub/deeper")).unwrap();
        fs::write(source.join("a.txt"), b"hello world").unwrap();
        fs::write(source.join("sub/deeper/b.bin"), vec![7u8; 1000]).unwrap();
        fs::write(source.join("empty"), b"").unwrap();

        let plan = scan_source(&source, "src").unwrap();
        let sinks = SinkSet::new(vec![sink(temp.path(), "d1"), sink(temp.path(), "d2")]);
        let (tx, mut rx) = mpsc::channel(256);
        let bus = EventBus::new(tx, Duration::ZERO);
        let algorithms = [Algorithm::Md5, Algorithm::Sha256];

        let pass = CopyPass::new(
            &plan,
            &algorithms,
            64,
            sinks.clone(),
            bus,
            CancellationToken::new(),
        );
        let outcome = pass.run().await.unwrap();
        drop(pass);

        assert!(!outcome.cancelled);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.bytes_copied, 1011);

        let b = outcome
            .records
            .iter()
            .find(|r| r.relative_path == "sub/deeper/b.bin")
            .unwrap();
        assert_eq!(b.digests, digest_bytes(&algorithms, &[7u8; 1000]));
        assert_eq!(b.written_to, vec!["d1", "d2"]);

        for d in ["d1", "d2"] {
            let root = temp.path().join(d).join("src");
            assert_eq!(fs::read(root.join("a.txt")).unwrap(), b"hello world");
            assert_eq!(fs::read(root.join("sub/deeper/b.bin")).unwrap().len(), 1000);
            assert_eq!(fs::read(root.join("empty")).unwrap().len(), 0);
        }

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        let last = last.unwrap();
        assert_eq!(last.sinks().unwrap()["d1"].status, SinkStatus::Done);
        assert_eq!(last.sinks().unwrap()["d2"].processed_files, 3);
    }

    #[tokio::test]
    async fn cancelled_before_start_copies_nothing() {
        let temp = tempdir().unwrap();
        let source = temp.path().join("src");
        fs::create_dir_all(&source).unwrap();
        fs::write(source.join("a.txt"), b"data").unwrap();

        let plan = scan_source(&source, "src").unwrap();
        let sinks = SinkSet::new(vec![sink(temp.path(), "d1")]);
        let (tx, _rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = CopyPass::new(
            &plan,
            &[Algorithm::Sha1],
            1024,
            sinks,
            EventBus::new(tx, Duration::ZERO),
            cancel,
        )
        .run()
        .await
        .unwrap();

        assert!(outcome.cancelled);
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn depth_counts_components() {
        assert_eq!(depth_of(""), 0);
        assert_eq!(depth_of("a"), 1);
        assert_eq!(depth_of("a/b/c"), 3);
    }
}
