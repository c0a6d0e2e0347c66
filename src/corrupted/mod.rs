//! Pages found torn while copying
//!
//! The copier records pages that never passed validation; the restore side
//! repairs what it can and reports the rest. An entry leaves the registry
//! only through repair or through a rename/drop of its tablespace.

mod registry;
mod repair;

pub use registry::{CorruptedPages, RegistryError, SpaceCorruption, CORRUPTED_PAGES_FILE};
pub use repair::{repair, RepairReport};
