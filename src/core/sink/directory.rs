use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{Chunk, FinishedFile, Sink, SinkReader, SinkWriter};
use crate::core::error::SinkError;
use crate::core::models::{CaseMetadata, FileStamps};

/// A plain directory tree: `<root>/<base_name>/<relative path>`.
pub struct DirectorySink {
    id: String,
    root: PathBuf,
    base: PathBuf,
    sync_files: bool,
}

impl DirectorySink {
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        base_name: &str,
        sync_files: bool,
    ) -> Self {
        let root = root.into();
        let base = root.join(base_name);
        Self {
            id: id.into(),
            root,
            base,
            sync_files,
        }
    }

    fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        resolve_relative(&self.base, relative)
    }
}

/// Join a `/`-separated relative path onto `base`. Paths that would climb
/// out of `base` are rejected.
pub(crate) fn resolve_relative(base: &Path, relative: &str) -> io::Result<PathBuf> {
    let mut path = base.to_path_buf();
    for part in relative.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("{} leaves the destination tree", relative),
                ));
            }
            part => path.push(part),
        }
    }
    Ok(path)
}

impl Sink for DirectorySink {
    fn id(&self) -> &str {
        &self.id
    }

    fn report_root(&self) -> &Path {
        &self.root
    }

    fn location(&self) -> PathBuf {
        self.base.clone()
    }

    fn prepare(&self, _metadata: &CaseMetadata) -> Result<(), SinkError> {
        if !self.root.is_dir() {
            return Err(SinkError::Gone(io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not available", self.root.display()),
            )));
        }
        fs::create_dir_all(&self.base)?;
        Ok(())
    }

    fn create_dir(&self, relative: &str) -> Result<(), SinkError> {
        fs::create_dir_all(self.resolve(relative)?)?;
        Ok(())
    }

    fn set_dir_stamps(&self, relative: &str, stamps: &FileStamps) -> Result<(), SinkError> {
        filetime::set_file_times(
            self.resolve(relative)?,
            stamps.accessed_filetime(),
            stamps.modified_filetime(),
        )?;
        Ok(())
    }

    fn create_file(&self, relative: &str, _size: u64) -> Result<Box<dyn SinkWriter>, SinkError> {
        let path = self.resolve(relative)?;
        let file = File::create(&path)?;
        Ok(Box::new(DirectoryWriter {
            file,
            path,
            sync_file: self.sync_files,
        }))
    }

    fn seal(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn open_reader(&self) -> Result<Box<dyn SinkReader>, SinkError> {
        if !self.base.is_dir() {
            return Err(SinkError::Gone(io::Error::new(
                ErrorKind::NotFound,
                format!("{} is not available", self.base.display()),
            )));
        }
        Ok(Box::new(DirectoryReader {
            base: self.base.clone(),
        }))
    }
}

struct DirectoryWriter {
    file: File,
    path: PathBuf,
    sync_file: bool,
}

impl SinkWriter for DirectoryWriter {
    fn write_chunk(&mut self, chunk: &Chunk) -> Result<(), SinkError> {
        self.file.write_all(chunk)?;
        Ok(())
    }

    fn finish(self: Box<Self>, file: &FinishedFile<'_>) -> Result<(), SinkError> {
        let DirectoryWriter {
            file: mut handle,
            path,
            sync_file,
        } = *self;

        handle.flush()?;
        if sync_file {
            handle.sync_all()?;
        }
        drop(handle);

        // Preserve timestamps
        if let Err(e) = filetime::set_file_times(
            &path,
            file.stamps.accessed_filetime(),
            file.stamps.modified_filetime(),
        ) {
            warn!(
                dest = %path.display(),
                error = %e,
                "Unable to copy file timestamps, destination will not reflect the source"
            );
        }

        debug!(dest = %path.display(), size = file.size, "Destination file closed");
        Ok(())
    }
}

/// Reads files back from a directory tree, outside of any sink.
pub struct DirectoryReader {
    base: PathBuf,
}

impl DirectoryReader {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl SinkReader for DirectoryReader {
    fn open(&self, relative: &str) -> Result<Box<dyn Read + Send>, SinkError> {
        let file = File::open(resolve_relative(&self.base, relative)?)?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::{Algorithm, digest_bytes};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn resolve_relative_ignores_dot_segments() {
        let base = Path::new("/dst/case");
        assert_eq!(resolve_relative(base, "").unwrap(), PathBuf::from("/dst/case"));
        assert_eq!(
            resolve_relative(base, "./a/b.txt").unwrap(),
            PathBuf::from("/dst/case/a/b.txt")
        );
    }

    #[test]
    fn resolve_relative_rejects_parent_segments() {
        let base = Path::new("/dst/case");
        let err = resolve_relative(base, "a/../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(resolve_relative(base, "..").is_err());
        // Not a parent segment, just a name
        assert!(resolve_relative(base, "a/..b").is_ok());
    }

    #[test]
    fn reader_refuses_paths_outside_the_tree() {
        let temp = tempdir().unwrap();
        fs::create_dir(temp.path().join("case")).unwrap();
        fs::write(temp.path().join("outside.txt"), b"secret").unwrap();

        let reader = DirectoryReader::new(temp.path().join("case"));
        assert!(reader.open("../outside.txt").is_err());
    }

    #[test]
    fn write_then_read_back() {
        let temp = tempdir().unwrap();
        let sink = DirectorySink::new("d1", temp.path(), "case", false);
        sink.prepare(&CaseMetadata::default()).unwrap();
        sink.create_dir("sub").unwrap();

        let stamps = FileStamps::from_metadata(&fs::metadata(temp.path()).unwrap());
        let digests = digest_bytes(&[Algorithm::Md5], b"hello world");
        let mut writer = sink.create_file("sub/f.txt", 11).unwrap();
        writer.write_chunk(&Arc::new(b"hello ".to_vec())).unwrap();
        writer.write_chunk(&Arc::new(b"world".to_vec())).unwrap();
        writer
            .finish(&FinishedFile {
                relative_path: "sub/f.txt",
                size: 11,
                stamps: &stamps,
                digests: &digests,
            })
            .unwrap();

        let mut content = String::new();
        sink.open_reader()
            .unwrap()
            .open("sub/f.txt")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hello world");

        let copied = fs::metadata(temp.path().join("case/sub/f.txt")).unwrap();
        assert_eq!(FileStamps::from_metadata(&copied).modified, stamps.modified);
    }

    #[test]
    fn prepare_fails_when_root_missing() {
        let temp = tempdir().unwrap();
        let sink = DirectorySink::new("gone", temp.path().join("unmounted"), "case", false);
        let err = sink.prepare(&CaseMetadata::default()).unwrap_err();
        assert!(err.is_gone());
    }
}
