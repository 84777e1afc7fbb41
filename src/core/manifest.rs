//! Per-algorithm digest manifests and the optional CSV file report.
//!
//! A manifest is `<dest>/<basename>.<algorithm>`, one `<digest> <path>` line
//! per file in walk order. Both outputs are rewritten on every run.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use super::digest::Algorithm;
use super::error::JobError;
use super::models::FileRecord;

pub fn manifest_file_name(base_name: &str, algorithm: Algorithm) -> String {
    format!("{}.{}", base_name, algorithm)
}

pub fn csv_file_name(base_name: &str) -> String {
    format!("{}_file_report.csv", base_name)
}

/// Write one manifest per algorithm into `root`.
pub fn write_manifests(
    root: &Path,
    base_name: &str,
    algorithms: &[Algorithm],
    records: &[FileRecord],
) -> io::Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(algorithms.len());
    for &algorithm in algorithms {
        let path = root.join(manifest_file_name(base_name, algorithm));
        let mut out = BufWriter::new(File::create(&path)?);
        for record in records {
            if let Some(digest) = record.digests.get(&algorithm) {
                writeln!(out, "{} {}", digest, record.relative_path)?;
            }
        }
        out.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        written.push(path);
    }
    Ok(written)
}

pub fn write_csv(
    root: &Path,
    base_name: &str,
    algorithms: &[Algorithm],
    records: &[FileRecord],
) -> io::Result<PathBuf> {
    let path = root.join(csv_file_name(base_name));
    let mut out = BufWriter::new(File::create(&path)?);

    let mut header = vec![
        "path", "size", "created", "modified", "accessed", "record_changed",
    ];
    header.extend(algorithms.iter().map(|a| a.as_str()));
    writeln!(out, "{}", header.join(","))?;

    for record in records {
        let stamps = &record.stamps;
        let mut row = vec![
            csv_field(&record.relative_path),
            record.size.to_string(),
            stamps.created.map(timestamp).unwrap_or_default(),
            timestamp(stamps.modified),
            timestamp(stamps.accessed),
            stamps.record_changed.map(timestamp).unwrap_or_default(),
        ];
        row.extend(record.ordered_digests(algorithms).into_iter().map(String::from));
        writeln!(out, "{}", row.join(","))?;
    }

    out.flush()?;
    Ok(path)
}

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Quote a field only when it needs it.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub digest: String,
    pub relative_path: String,
}

/// The algorithm a manifest was written with, from its extension.
pub fn manifest_algorithm(path: &Path) -> Option<Algorithm> {
    path.extension()?.to_str()?.parse().ok()
}

pub fn parse_manifest(text: &str) -> Result<Vec<ManifestEntry>, JobError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            let (digest, path) = line.split_once(' ').ok_or_else(|| {
                JobError::InvalidJob(format!("manifest line {} has no path", n + 1))
            })?;
            if digest.is_empty() || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(JobError::InvalidJob(format!(
                    "manifest line {} has an invalid digest",
                    n + 1
                )));
            }
            Ok(ManifestEntry {
                digest: digest.to_ascii_lowercase(),
                relative_path: path.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::digest_bytes;
    use crate::core::models::FileStamps;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn record(path: &str, data: &[u8]) -> FileRecord {
        let t = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        FileRecord {
            relative_path: path.into(),
            size: data.len() as u64,
            stamps: FileStamps {
                created: None,
                modified: t,
                accessed: t,
                record_changed: Some(t),
            },
            digests: digest_bytes(&[Algorithm::Md5, Algorithm::Sha1], data),
            written_to: vec!["d1".into()],
            verification: BTreeMap::new(),
        }
    }

    #[test]
    fn manifests_round_trip_through_parser() {
        let temp = tempdir().unwrap();
        let records = vec![record("a.txt", b"abc"), record("dir/with space.bin", b"")];
        let written = write_manifests(
            temp.path(),
            "case",
            &[Algorithm::Md5, Algorithm::Sha1],
            &records,
        )
        .unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(manifest_algorithm(&written[0]), Some(Algorithm::Md5));

        let text = std::fs::read_to_string(temp.path().join("case.md5")).unwrap();
        assert_eq!(
            text.lines().next().unwrap(),
            "900150983cd24fb0d6963f7d28e17f72 a.txt"
        );

        let entries = parse_manifest(&text).unwrap();
        assert_eq!(entries[1].relative_path, "dir/with space.bin");
        assert_eq!(entries[1].digest, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_manifest("nothex a.txt\n").is_err());
        assert!(parse_manifest("abcdef\n").is_err());
        assert!(parse_manifest("\n\n").unwrap().is_empty());
    }

    #[test]
    fn csv_has_header_and_quotes_when_needed() {
        let temp = tempdir().unwrap();
        let records = vec![record("a,b.txt", b"abc")];
        let path = write_csv(temp.path(), "case", &[Algorithm::Sha1], &records).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "path,size,created,modified,accessed,record_changed,sha1"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("\"a,b.txt\",3,,2023-11-14T22:13:20.000000Z,"));
        assert!(row.ends_with(",a9993e364706816aba3e25717850c26c9cd0d89d"));
    }
}
