#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Persistence for the planning engine: a small record-store contract
//! (get, put, query, atomic increment) over three collections, with an
//! in-memory and a file-backed implementation plus typed repositories.

/// File-backed record store.
pub mod file_store;
/// In-memory record store.
pub mod memory_store;
/// Typed records and the plan repository.
pub mod records;
/// Statistics repository persisted through a record store.
pub mod statistics;
/// The record-store contract.
pub mod store;

pub use file_store::FileRecordStore;
pub use memory_store::MemoryRecordStore;
pub use records::{
    ActionStatsRecord, PlanOutcome, PlanRecord, PlanRepository, PlanStatus, SignatureRecord,
    TraceSummary,
};
pub use statistics::StoreBackedStatistics;
pub use store::{Collection, RecordStore, RecordStoreExt, StoreError};
