pub mod fs;
pub mod jobs;
pub mod proxy;
pub mod scheduled;
pub mod uploads;
