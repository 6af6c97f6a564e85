//! SQLite persistence for builds, generated files, jobs, provider keys,
//! plans, usage and the audit log. One database file is shared by every
//! API process and worker.

pub mod db;
pub mod models;

pub use db::{BuildDb, DbHandle, GENERATED_FILE_TYPE, JOB_LEASE_PREFIX};
pub use models::*;
