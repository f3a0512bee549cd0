//! Error types for tidewater-state

use thiserror::Error;

/// Errors raised by [`crate::RunLedger`] implementations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with this id exists in the ledger
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run is not in the state the operation requires
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// A digest string was not 64 hex characters
    #[error("invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Event sequence numbers must increase within a run
    #[error("event seq {seq} for run {run_id} is not after {last}")]
    OutOfOrderEvent { run_id: String, seq: u64, last: u64 },
}
