//! Scheduled database backups.
//!
//! Jobs dump one or more databases on a cron cadence, compress the dumps,
//! ship them to a storage backend and prune old copies.

pub mod backup;
pub mod config;
pub mod errors;
pub mod models;
pub mod notify;
pub mod scheduler;
pub mod storage;
pub mod store;
