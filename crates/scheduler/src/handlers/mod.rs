mod cleanup_sessions;
mod sync_copy;

pub use cleanup_sessions::CleanupUploadSessions;
pub use sync_copy::ScheduledSyncCopy;
