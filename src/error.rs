use solana_sdk::signature::Signature;
use thiserror::Error;

/// Errors produced by the funding engine.
///
/// The split mirrors how failures are handled: `Validation` and
/// `InsufficientBalance` happen before anything touches the chain and the
/// caller can just fix the request. `Rpc` means a read was retried to
/// exhaustion. Everything from `Submission` on happened after a transaction
/// left the process, so nothing is retried automatically; the operator has
/// to verify on chain before trying again.
#[derive(Debug, Error)]
pub enum FleetError {
    #[error("invalid funding request: {0}")]
    Validation(String),

    #[error("insufficient balance: have {have} lamports, need {need} lamports (amount + fees)")]
    InsufficientBalance { have: u64, need: u64 },

    #[error("rpc request failed after {attempts} attempts: {message}")]
    Rpc { attempts: usize, message: String },

    #[error("key error: {0}")]
    Key(String),

    #[error("batch {batch}: failed to sign transaction: {message}")]
    Signing { batch: usize, message: String },

    #[error("batch {batch}: transaction submission failed: {message}")]
    Submission { batch: usize, message: String },

    #[error("batch {batch}: transaction {signature} not confirmed after {polls} polls; verify on chain before retrying")]
    ConfirmationTimeout {
        batch: usize,
        signature: Signature,
        polls: usize,
    },

    #[error("batch {batch}: transaction {signature} failed on chain: {reason}")]
    TransactionFailed {
        batch: usize,
        signature: Signature,
        reason: String,
    },

    #[error("funding run cancelled")]
    Cancelled,

    #[error("vault io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("vault format error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("csv export error: {0}")]
    Csv(#[from] csv::Error),
}
