//! Fan-out of one byte stream to every live sink.
//!
//! Each operation runs one blocking task per live sink and joins them all
//! before returning, so a slow destination never blocks another one's write
//! and no sink ever sees chunk N+1 before chunk N. A sink whose operation
//! fails is removed from the [`SinkSet`] for the rest of the run. While the
//! copy pass runs, this is the only code that removes sinks.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::digest::Digests;
use super::error::SinkError;
use super::models::FileStamps;
use super::progress::{EventBus, SinkStatus};
use super::sink::{Chunk, FinishedFile, Sink, SinkSet, SinkWriter};

/// Owned form of [`FinishedFile`] that can cross into blocking tasks.
#[derive(Debug, Clone)]
pub struct FinishedRecord {
    pub relative_path: String,
    pub size: u64,
    pub stamps: FileStamps,
    pub digests: Digests,
}

impl FinishedRecord {
    fn as_finished(&self) -> FinishedFile<'_> {
        FinishedFile {
            relative_path: &self.relative_path,
            size: self.size,
            stamps: &self.stamps,
            digests: &self.digests,
        }
    }
}

struct OpenWriter {
    order: usize,
    sink: String,
    writer: Box<dyn SinkWriter>,
}

pub struct FanOutWriter {
    sinks: SinkSet,
    bus: EventBus,
    writers: Vec<OpenWriter>,
}

impl FanOutWriter {
    pub fn new(sinks: SinkSet, bus: EventBus) -> Self {
        Self {
            sinks,
            bus,
            writers: Vec::new(),
        }
    }

    /// Sinks holding an open writer for the current file.
    pub fn open_sinks(&self) -> Vec<String> {
        self.writers.iter().map(|w| w.sink.clone()).collect()
    }

    pub fn has_writers(&self) -> bool {
        !self.writers.is_empty()
    }

    /// Remove a sink from the live set and flag it on the event bus.
    pub fn drop_sink(&self, sink: &str, err: &SinkError) {
        if self.sinks.drop_sink(sink, err.to_string()) {
            let status = if err.is_gone() {
                SinkStatus::ErrorIo
            } else {
                SinkStatus::ErrorCopy
            };
            self.bus.mark_error(sink, status);
        }
    }

    /// Run `op` against every live sink concurrently and drop the failures.
    async fn for_each_sink<F>(&self, what: &'static str, op: F)
    where
        F: Fn(&dyn Sink) -> Result<(), SinkError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut tasks = JoinSet::new();
        let mut pending = HashSet::new();

        for sink in self.sinks.snapshot() {
            let op = Arc::clone(&op);
            pending.insert(sink.id().to_string());
            tasks.spawn_blocking(move || {
                let result = op(sink.as_ref());
                (sink.id().to_string(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => {
                    pending.remove(&id);
                    if let Err(e) = result {
                        error!(sink = %id, error = %e, "Failed to {}", what);
                        self.drop_sink(&id, &e);
                    }
                }
                Err(e) => error!(error = %e, "Sink task failed"),
            }
        }

        for id in pending {
            self.drop_sink(&id, &SinkError::Container(format!("{} task panicked", what)));
        }
    }

    pub async fn create_dir(&self, relative: &str) {
        let relative = relative.to_string();
        self.for_each_sink("create directory", move |sink| sink.create_dir(&relative))
            .await;
    }

    /// Apply directory timestamps. Failures are warnings only.
    pub async fn set_dir_stamps(&self, relative: &str, stamps: FileStamps) {
        let mut tasks = JoinSet::new();
        for sink in self.sinks.snapshot() {
            let relative = relative.to_string();
            tasks.spawn_blocking(move || {
                if let Err(e) = sink.set_dir_stamps(&relative, &stamps) {
                    warn!(
                        sink = %sink.id(),
                        dir = %relative,
                        error = %e,
                        "Unable to copy directory timestamps, destination will not reflect the source"
                    );
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Open a writer for `relative` on every live sink.
    pub async fn open(&mut self, relative: &str, size: u64) {
        self.abandon();

        let mut tasks = JoinSet::new();
        let mut pending = HashSet::new();
        for (order, sink) in self.sinks.snapshot().into_iter().enumerate() {
            let relative = relative.to_string();
            pending.insert(sink.id().to_string());
            tasks.spawn_blocking(move || {
                let result = sink.create_file(&relative, size);
                (order, sink.id().to_string(), result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((order, sink, result)) => {
                    pending.remove(&sink);
                    match result {
                        Ok(writer) => self.writers.push(OpenWriter {
                            order,
                            sink,
                            writer,
                        }),
                        Err(e) => {
                            error!(sink = %sink, file = %relative, error = %e, "Failed to create destination file");
                            self.drop_sink(&sink, &e);
                        }
                    }
                }
                Err(e) => error!(error = %e, "Sink task failed"),
            }
        }

        for sink in pending {
            self.drop_sink(&sink, &SinkError::Container("create task panicked".into()));
        }
        self.writers.sort_by_key(|w| w.order);
    }

    /// Write one chunk to every open writer. When this returns, every sink
    /// has either taken the whole chunk or been dropped.
    pub async fn write(&mut self, chunk: Chunk) {
        let writers = std::mem::take(&mut self.writers);
        self.writers = self
            .run_writers(writers, "write", move |writer| writer.write_chunk(&chunk))
            .await;
    }

    /// Close every open writer for the current file.
    pub async fn finish(&mut self, record: Arc<FinishedRecord>) {
        let writers = std::mem::take(&mut self.writers);
        let mut tasks = JoinSet::new();
        let mut pending = HashSet::new();

        for open in writers {
            let record = Arc::clone(&record);
            pending.insert(open.sink.clone());
            tasks.spawn_blocking(move || {
                let result = open.writer.finish(&record.as_finished());
                (open.sink, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((sink, result)) => {
                    pending.remove(&sink);
                    match result {
                        Ok(()) => debug!(sink = %sink, file = %record.relative_path, "File closed"),
                        Err(e) => {
                            error!(sink = %sink, file = %record.relative_path, error = %e, "Failed to close destination file");
                            self.drop_sink(&sink, &e);
                        }
                    }
                }
                Err(e) => error!(error = %e, "Sink task failed"),
            }
        }

        for sink in pending {
            self.drop_sink(&sink, &SinkError::Container("close task panicked".into()));
        }
    }

    /// Discard open writers without finishing them.
    pub fn abandon(&mut self) {
        self.writers.clear();
    }

    async fn run_writers<F>(
        &self,
        writers: Vec<OpenWriter>,
        what: &'static str,
        op: F,
    ) -> Vec<OpenWriter>
    where
        F: Fn(&mut dyn SinkWriter) -> Result<(), SinkError> + Send + Sync + 'static,
    {
        let op = Arc::new(op);
        let mut tasks = JoinSet::new();
        let mut pending: HashSet<String> = HashSet::new();

        for mut open in writers {
            let op = Arc::clone(&op);
            pending.insert(open.sink.clone());
            tasks.spawn_blocking(move || {
                let result = op(open.writer.as_mut());
                (open, result)
            });
        }

        let mut kept = Vec::with_capacity(pending.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((open, result)) => {
                    pending.remove(&open.sink);
                    match result {
                        Ok(()) => kept.push(open),
                        Err(e) => {
                            error!(sink = %open.sink, error = %e, "Failed to {} destination", what);
                            self.drop_sink(&open.sink, &e);
                        }
                    }
                }
                Err(e) => error!(error = %e, "Sink task failed"),
            }
        }

        for sink in pending {
            self.drop_sink(&sink, &SinkError::Container(format!("{} task panicked", what)));
        }

        kept.sort_by_key(|w| w.order);
        kept
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::{Algorithm, digest_bytes};
    use crate::core::models::CaseMetadata;
    use crate::core::progress::Phase;
    use crate::core::sink::{DirectorySink, SinkReader};
    use std::io::{self, Read};
    use std::path::{Path, PathBuf};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    /// Sink whose writers fail on the second chunk, or that panics when
    /// asked for a writer at all.
    struct FlakySink {
        inner: DirectorySink,
        panic_on_create: bool,
    }

    struct FlakyWriter {
        inner: Box<dyn SinkWriter>,
        chunks: usize,
    }

    impl SinkWriter for FlakyWriter {
        fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), SinkError> {
            self.chunks += 1;
            if self.chunks > 1 {
                return Err(io::Error::from_raw_os_error(libc::ENODEV).into());
            }
            self.inner.write_chunk(chunk)
        }

        fn finish(self: Box<Self>, file: &FinishedFile<'_>) -> Result<(), SinkError> {
            self.inner.finish(file)
        }
    }

    impl Sink for FlakySink {
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
            if self.panic_on_create {
                panic!("create_file blew up");
            }
            Ok(Box::new(FlakyWriter {
                inner: self.inner.create_file(relative, size)?,
                chunks: 0,
            }))
        }
        fn seal(&self) -> Result<(), SinkError> {
            self.inner.seal()
        }
        fn open_reader(&self) -> Result<Box<dyn SinkReader>, SinkError> {
            self.inner.open_reader()
        }
    }

    #[tokio::test]
    async fn failing_sink_is_dropped_and_others_continue() {
        let temp = tempdir().unwrap();
        for d in ["a", "b"] {
            std::fs::create_dir(temp.path().join(d)).unwrap();
        }
        let good = DirectorySink::new("a", temp.path().join("a"), "case", false);
        let flaky = FlakySink {
            inner: DirectorySink::new("b", temp.path().join("b"), "case", false),
            panic_on_create: false,
        };
        good.prepare(&CaseMetadata::default()).unwrap();
        flaky.prepare(&CaseMetadata::default()).unwrap();

        let sinks = SinkSet::new(vec![Arc::new(good), Arc::new(flaky)]);
        let (tx, _rx) = mpsc::channel(16);
        let bus = EventBus::new(tx, Duration::from_millis(10));
        bus.begin_phase(Phase::Copying, &sinks.ids(), 0);

        let mut fanout = FanOutWriter::new(sinks.clone(), bus.clone());
        fanout.open("f.bin", 6).await;
        assert_eq!(fanout.open_sinks(), vec!["a", "b"]);

        fanout.write(Arc::new(b"abc".to_vec())).await;
        fanout.write(Arc::new(b"def".to_vec())).await;
        assert_eq!(fanout.open_sinks(), vec!["a"]);
        assert_eq!(sinks.ids(), vec!["a"]);
        assert_eq!(bus.status("b").unwrap().status, SinkStatus::ErrorIo);

        let record = Arc::new(FinishedRecord {
            relative_path: "f.bin".into(),
            size: 6,
            stamps: FileStamps::from_metadata(&std::fs::metadata(temp.path()).unwrap()),
            digests: digest_bytes(&[Algorithm::Md5], b"abcdef"),
        });
        fanout.finish(record).await;
        assert!(!fanout.has_writers());

        let mut content = Vec::new();
        std::fs::File::open(temp.path().join("a/case/f.bin"))
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"abcdef");

        // Dropped sinks get no further operations
        fanout.create_dir("later").await;
        assert!(temp.path().join("a/case/later").is_dir());
        assert!(!temp.path().join("b/case/later").exists());
    }

    #[tokio::test]
    async fn sink_that_panics_on_create_is_dropped() {
        let temp = tempdir().unwrap();
        for d in ["a", "b"] {
            std::fs::create_dir(temp.path().join(d)).unwrap();
        }
        let good = DirectorySink::new("a", temp.path().join("a"), "case", false);
        let broken = FlakySink {
            inner: DirectorySink::new("b", temp.path().join("b"), "case", false),
            panic_on_create: true,
        };
        good.prepare(&CaseMetadata::default()).unwrap();
        broken.prepare(&CaseMetadata::default()).unwrap();

        let sinks = SinkSet::new(vec![Arc::new(good), Arc::new(broken)]);
        let (tx, _rx) = mpsc::channel(16);
        let bus = EventBus::new(tx, Duration::from_millis(10));
        bus.begin_phase(Phase::Copying, &sinks.ids(), 0);

        let mut fanout = FanOutWriter::new(sinks.clone(), bus.clone());
        fanout.open("f.bin", 3).await;
        assert_eq!(fanout.open_sinks(), vec!["a"]);
        assert_eq!(sinks.ids(), vec!["a"]);
        let dropped = sinks.dropped();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, "b");
        assert!(dropped[0].reason.contains("create task panicked"));
        assert_eq!(bus.status("b").unwrap().status, SinkStatus::ErrorCopy);
    }
}
