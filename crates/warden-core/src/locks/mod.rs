//! Locks - 並行 worker のファイル所有権

pub mod mirror;
pub mod registry;

pub use mirror::{LockMirror, LockRecord};
pub use registry::{FileLock, FileLockRegistry, LockMode, LockSnapshot, WorkerRegistration, WorkerStatus};
