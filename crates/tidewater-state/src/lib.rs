//! Tidewater-State: run ledger for the build-verification pipeline
//!
//! Every pipeline Run is mirrored into a [`RunLedger`]: the run record is
//! created when the Run starts, stage events are appended in order, and the
//! record is finalized exactly once as completed, failed, or cancelled.
//!
//! ## Key Components
//!
//! - `RunLedger`: async storage trait for runs and their events
//! - `MemoryRunLedger`: in-process implementation used by the CLI and tests
//! - `ContentDigest`: SHA-256 identity of a run specification

mod error;
pub mod ledger;
pub mod memory;

pub use error::StorageError;
pub use ledger::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
pub use memory::MemoryRunLedger;
