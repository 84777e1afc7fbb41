//! The human-readable transfer report, `<dest>/<basename>_copy_report.txt`.
//!
//! The controller builds each section as text and appends it to the report
//! of every live sink, so a run that dies halfway still leaves everything up
//! to the failure on disk.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, SecondsFormat};

use super::digest::Algorithm;
use super::models::{FileRecord, FileVerification, Job, SinkVerification};

const RULE: &str = "#####################################################";

pub fn report_file_name(base_name: &str) -> String {
    format!("{}_copy_report.txt", base_name)
}

pub fn report_path(root: &Path, base_name: &str) -> PathBuf {
    root.join(report_file_name(base_name))
}

/// Create (or truncate) the report with `text`.
pub fn create(path: &Path, text: &str) -> io::Result<()> {
    std::fs::write(path, text)
}

pub fn append(path: &Path, text: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(text.as_bytes())?;
    file.flush()
}

fn time(dt: &DateTime<Local>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Everything up to and including the start time.
pub fn header(
    job: &Job,
    destination: &Path,
    total_files: u64,
    total_bytes: u64,
    started: &DateTime<Local>,
) -> String {
    let mut out = String::new();
    let meta = &job.metadata;
    let hashes: Vec<&str> = job.algorithms.iter().map(Algorithm::as_str).collect();

    let _ = writeln!(out, "# vericopy Copy Report");
    let _ = writeln!(out, "# vericopy v{}", env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "{}\n", RULE);

    let _ = writeln!(out, "################## Case Metadata ####################");
    let _ = writeln!(out, "Operator: {}", meta.operator);
    let _ = writeln!(out, "Case ID: {}", meta.case_id);
    let _ = writeln!(out, "Notes:\n{}\n", meta.notes);

    let _ = writeln!(out, "################## Copy Information #################");
    let _ = writeln!(out, "Source: {}", job.source.display());
    let _ = writeln!(out, "Destination: {}", destination.display());
    let _ = writeln!(out, "Total Files: {}", total_files);
    let _ = writeln!(
        out,
        "Size: {} Bytes (~ {:.2} GB)",
        total_bytes,
        total_bytes as f64 / 1e9
    );
    let _ = writeln!(out, "Hashes: {}\n", hashes.join(" - "));

    let _ = writeln!(out, "################## Copy Report ######################");
    let _ = writeln!(out, "Start Time: {}", time(started));
    out
}

/// End time, duration and the digest of every copied file.
pub fn source_hashes(
    algorithms: &[Algorithm],
    records: &[FileRecord],
    started: &DateTime<Local>,
    ended: &DateTime<Local>,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "End Time: {}", time(ended));
    let _ = writeln!(out, "Duration: {}\n", duration(*ended - *started));

    let _ = writeln!(out, "################## Source Hashes ######################");
    for record in records {
        let mut fields = record.ordered_digests(algorithms);
        fields.push(&record.relative_path);
        let _ = writeln!(out, "{}", fields.join(" - "));
    }
    out
}

pub fn verification(result: &SinkVerification) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "\n################## Verification Report ######################"
    );

    for failed in &result.failures {
        let _ = writeln!(out, "Verification failed for file: {}", failed.relative_path);
        match &failed.outcome {
            FileVerification::Mismatch { hashes } => {
                for m in hashes {
                    let _ = writeln!(
                        out,
                        "\t{} Hash Differs - Stored: {} - Calculated {}",
                        m.algorithm, m.stored, m.calculated
                    );
                }
            }
            FileVerification::Unreadable { error } => {
                let _ = writeln!(out, "\tUnable to read file: {}", error);
            }
            FileVerification::Verified => {}
        }
    }

    if !result.failures.is_empty() {
        let _ = writeln!(out, "Verification failed for {} files.", result.failures.len());
    }
    let _ = writeln!(out, "Verification successful for {} files", result.files_verified());
    out
}

pub fn interrupted(at: &DateTime<Local>) -> String {
    format!("\nUser interrupted at {}\n", time(at))
}

pub fn error_trailer(cause: &str) -> String {
    format!("\nERROR DURING COPY:\n{}\n", cause)
}

/// `HH:MM:SS.mmm`
fn duration(elapsed: chrono::TimeDelta) -> String {
    let ms = elapsed.num_milliseconds().max(0);
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        ms / 3_600_000,
        ms / 60_000 % 60,
        ms / 1000 % 60,
        ms % 1000
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::digest::digest_bytes;
    use crate::core::models::{CaseMetadata, FailedFile, FileStamps, HashMismatch};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn header_lists_case_and_copy_information() {
        let temp = tempdir().unwrap();
        let mut job = Job::new(temp.path(), vec![PathBuf::from("/mnt/a")], vec![
            Algorithm::Md5,
            Algorithm::Sha256,
        ]);
        job.metadata = CaseMetadata {
            operator: "J. Doe".into(),
            case_id: "2024-117".into(),
            notes: "seized laptop".into(),
        };

        let text = header(&job, Path::new("/mnt/a/src"), 2, 2_500_000_000, &Local::now());
        assert!(text.starts_with("# vericopy Copy Report\n"));
        assert!(text.contains("Operator: J. Doe\nCase ID: 2024-117\nNotes:\nseized laptop\n"));
        assert!(text.contains("Destination: /mnt/a/src\n"));
        assert!(text.contains("Size: 2500000000 Bytes (~ 2.50 GB)\n"));
        assert!(text.contains("Hashes: md5 - sha256\n"));
        assert!(text.contains("Start Time: "));
    }

    #[test]
    fn source_hashes_follow_algorithm_order() {
        let t = chrono::Utc::now();
        let record = FileRecord {
            relative_path: "dir/a.txt".into(),
            size: 3,
            stamps: FileStamps {
                created: None,
                modified: t,
                accessed: t,
                record_changed: None,
            },
            digests: digest_bytes(&[Algorithm::Sha1, Algorithm::Md5], b"abc"),
            written_to: vec![],
            verification: BTreeMap::new(),
        };
        let start = Local::now();
        let end = start + chrono::TimeDelta::milliseconds(3_723_004);

        let text = source_hashes(&[Algorithm::Md5, Algorithm::Sha1], &[record], &start, &end);
        assert!(text.contains("Duration: 01:02:03.004\n"));
        assert!(text.ends_with(
            "900150983cd24fb0d6963f7d28e17f72 - a9993e364706816aba3e25717850c26c9cd0d89d - dir/a.txt\n"
        ));
    }

    #[test]
    fn verification_section_lists_failures() {
        let result = SinkVerification {
            sink: "d1".into(),
            files_checked: 3,
            bytes_checked: 30,
            failures: vec![FailedFile {
                relative_path: "b.txt".into(),
                outcome: FileVerification::Mismatch {
                    hashes: vec![HashMismatch {
                        algorithm: Algorithm::Sha256,
                        stored: "aa".into(),
                        calculated: "bb".into(),
                    }],
                },
            }],
            interrupted: false,
        };

        let text = verification(&result);
        assert!(text.contains(
            "Verification failed for file: b.txt\n\tsha256 Hash Differs - Stored: aa - Calculated bb\n"
        ));
        assert!(text.contains("Verification failed for 1 files.\n"));
        assert!(text.ends_with("Verification successful for 2 files\n"));
    }

    #[test]
    fn append_after_create() {
        let temp = tempdir().unwrap();
        let path = report_path(temp.path(), "case");
        create(&path, "one\n").unwrap();
        append(&path, &error_trailer("disk on fire")).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "one\n\nERROR DURING COPY:\ndisk on fire\n"
        );
    }
}
