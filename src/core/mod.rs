pub mod copy_pass;
pub mod digest;
pub mod error;
pub mod fanout;
pub mod manifest;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod report;
pub mod sink;
pub mod verifier;
pub mod volume;
pub mod walker;

pub use digest::{Algorithm, DigestSet, Digests};
pub use error::{JobError, SinkError};
pub use models::{CaseMetadata, FileRecord, Job, JobOptions, JobState, JobSummary, SinkMode};
pub use orchestrator::{JobController, JobHandle, JobOutcome, build_sinks, start_job};
pub use progress::{ProgressEvent, SinkProgress, SinkStatus};
pub use verifier::{VerificationSummary, verify_container, verify_manifest};
pub use volume::{SimulatedVolumes, SystemVolumes, VolumeInfo};
