//! Entity cache: per-kind tables of CRM records plus snapshot persistence.
//!
//! This module provides:
//! - One table per entity kind, keyed by the record's own numeric ID
//! - Upsert-by-ID merging for full loads and incremental refreshes
//! - Whole-cache snapshots stored as a single JSON document

mod storage;
mod store;

#[cfg(test)]
pub use storage::NoopStorage;
pub use storage::{JsonFileStorage, SnapshotStorage};
pub use store::EntityCache;
