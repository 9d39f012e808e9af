use thiserror::Error;

/// Failure of a streaming payment attempt.
///
/// Retryable errors mean the same payment may succeed on a later attempt and
/// should be rescheduled with backoff; fatal errors mean the payment can
/// never complete as quoted.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PaymentError {
    #[error("receiver closed the stream before the full amount was delivered")]
    ClosedByReceiver,
    #[error("no fulfill received within the idle timeout")]
    IdleTimeout,
    #[error("unable to establish the stream connection")]
    EstablishmentFailed,
    #[error("receiver credited less than the minimum exchange rate allows")]
    InsufficientExchangeRate,
    #[error("exchange rate probe failed")]
    RateProbeFailed,
    #[error("connector error: {0}")]
    ConnectorError(String),
    #[error("receiver violated the stream protocol: {0}")]
    ReceiverProtocolViolation(String),
    #[error("destination asset details do not match the quote")]
    DestinationAssetConflict,
    #[error("receiver cannot receive the quoted amount")]
    IncompatibleReceiveMax,
    #[error("sequence number space exhausted")]
    InvalidGeneratedSequence,
}

impl PaymentError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::ClosedByReceiver
                | PaymentError::IdleTimeout
                | PaymentError::EstablishmentFailed
                | PaymentError::InsufficientExchangeRate
                | PaymentError::RateProbeFailed
                | PaymentError::ConnectorError(_)
        )
    }
}
