use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use super::digest::Algorithm;
use super::error::JobError;
use super::{manifest, report};

/// A regular file found in the source tree.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// `/`-separated path relative to the source root
    pub relative: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub enum WalkEntry {
    /// A directory; the source root itself has an empty relative path.
    Dir { relative: String, path: PathBuf },
    File(SourceFile),
}

/// Result of scanning the source tree, in copy order.
#[derive(Debug, Clone, Default)]
pub struct SourcePlan {
    pub entries: Vec<WalkEntry>,
    pub total_files: u64,
    pub total_bytes: u64,
}

impl SourcePlan {
    pub fn files(&self) -> impl Iterator<Item = &SourceFile> {
        self.entries.iter().filter_map(|e| match e {
            WalkEntry::File(f) => Some(f),
            WalkEntry::Dir { .. } => None,
        })
    }
}

/// Scan the source off the async runtime.
pub async fn scan(root: &Path, base_name: &str) -> Result<SourcePlan, JobError> {
    let root = root.to_path_buf();
    let base_name = base_name.to_string();
    tokio::task::spawn_blocking(move || scan_source(&root, &base_name)).await?
}

/// Walk `root` depth-first, entries sorted by name, directories before their
/// contents. Any unreadable entry is fatal.
///
/// Reports and manifests a previous run wrote for `base_name` at the root
/// are left out; everything else is copied.
pub fn scan_source(root: &Path, base_name: &str) -> Result<SourcePlan, JobError> {
    let mut plan = SourcePlan::default();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let source = e
                .into_io_error()
                .unwrap_or_else(|| io::Error::other("filesystem loop"));
            JobError::source_lost(path, source)
        })?;

        let relative = relative_key(root, entry.path());
        let file_type = entry.file_type();

        if file_type.is_dir() {
            plan.entries.push(WalkEntry::Dir {
                relative,
                path: entry.path().to_path_buf(),
            });
        } else if file_type.is_file() {
            if entry.depth() == 1
                && is_engine_output(&entry.file_name().to_string_lossy(), base_name)
            {
                warn!(file = %relative, "Skipping report file from a previous run");
                continue;
            }
            let size = entry
                .metadata()
                .map_err(|e| {
                    let source = e
                        .into_io_error()
                        .unwrap_or_else(|| io::Error::other("metadata unavailable"));
                    JobError::source_lost(entry.path(), source)
                })?
                .len();
            plan.total_files += 1;
            plan.total_bytes += size;
            plan.entries.push(WalkEntry::File(SourceFile {
                relative,
                path: entry.path().to_path_buf(),
                size,
            }));
        } else {
            // Skip symlinks and other special files
            debug!(path = %entry.path().display(), "Skipping non-regular entry");
        }
    }

    Ok(plan)
}

fn relative_key(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether `name` is one of the files this tool writes for `base_name`:
/// the report, the CSV export or a per-algorithm manifest.
pub fn is_engine_output(name: &str, base_name: &str) -> bool {
    if name == report::report_file_name(base_name) || name == manifest::csv_file_name(base_name) {
        return true;
    }
    Algorithm::ALL
        .iter()
        .any(|a| name == manifest::manifest_file_name(base_name, *a))
}
