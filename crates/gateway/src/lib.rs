mod fs;
mod jobs;
mod resolver;
mod sessions;
pub mod store;

pub use fs::{FileSystem, ItemCopied, ProxyQuery, Target};
pub use jobs::{
    BatchCopyOutcome, CopyItem, CopyJobOptions, CopyPayload, JobEngine, JobHandler,
    TASK_TYPE_COPY,
};
pub use resolver::{MountResolver, Resolved};
pub use sessions::{SessionInit, UploadSessionService};
pub use store::{JobFilter, MemoryStore};
