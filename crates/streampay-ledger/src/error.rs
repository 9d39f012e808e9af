use thiserror::Error;

/// Errors surfaced by the ledger adapter.
///
/// `AccountAlreadyExists` and `TransferExists` are how idempotent retries
/// observe that the original operation took effect; callers treat them as
/// success when replaying.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("account already exists")]
    AccountAlreadyExists,
    #[error("unknown account")]
    UnknownAccount,
    #[error("invalid account for this operation")]
    InvalidAccount,
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("a transfer with this id already exists")]
    TransferExists,
    #[error("unknown transfer")]
    UnknownTransfer,
    #[error("transfer was already posted")]
    AlreadyPosted,
    #[error("transfer was already voided")]
    AlreadyVoided,
    #[error("insufficient balance")]
    InsufficientBalance,
}
