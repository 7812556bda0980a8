mod error;
mod file_info;
mod job;
mod mount;
mod principal;
mod scheduled;
mod storage_config;
mod upload_session;

pub use error::{Error, UpstreamError};
pub use file_info::{DirEntry, DirListing, FileInfo};
pub use job::{JobDescriptor, JobStats, JobStatus};
pub use mount::{Mount, PathPassword, WebdavPolicy};
pub use principal::Principal;
pub use scheduled::{
    RunStatus, RunTrigger, RuntimeState, ScheduleKind, ScheduledJob, ScheduledJobRun,
};
pub use storage_config::{DriverKind, StorageAcl, StorageConfig};
pub use upload_session::{UploadSession, UploadSessionStatus};

/// Generate a fresh random identifier for sessions, jobs, and run records.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
