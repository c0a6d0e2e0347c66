//! aerobackup - hot backups of a running page-based storage engine
//!
//! A backup copies tablespace files while the engine keeps writing, tails
//! the engine's circular redo log in parallel, and drives the engine through
//! a staged lock protocol so that the copied files plus the copied log are
//! consistent at a single LSN. `prepare` turns such a directory into a
//! consistent data directory.

pub mod backoff;
pub mod checksum;
pub mod cli;
pub mod config;
pub mod copier;
pub mod corrupted;
pub mod ddl;
pub mod engine;
pub mod filter;
pub mod metadata;
pub mod observability;
pub mod page;
pub mod prepare;
pub mod redo;
pub mod session;
pub mod stage;
