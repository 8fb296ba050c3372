pub mod artifact;
pub mod compression;
pub mod encryption;
pub mod job;
pub mod lock;
pub mod verify;

pub use job::{run, BackupJob, Services};
