//! # ContentDB Storage
//!
//! Feature ledgers persisted in LMDB. Each ledger is published as immutable
//! generations: writers build N+1 copy-on-write and swap the pointer, readers
//! never block and never see a half-written ledger.

pub mod ledger;
pub mod lmdb_storage;
pub mod manager;
pub mod rebuild;

pub use ledger::{Generation, Ledger, LedgerKey, LedgerScope, UpsertOutcome};
pub use lmdb_storage::LmdbStorage;
pub use manager::{RebuildGuard, StorageManager};
pub use rebuild::{Compactor, GroupSummary, ImageFailure, RebuildReport};
