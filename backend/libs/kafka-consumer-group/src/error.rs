//! Error types for the consumer group runtime.

use rdkafka::error::KafkaError;
use thiserror::Error;

/// Result type alias for consumer group operations.
pub type ConsumerResult<T> = Result<T, ConsumerError>;

/// Errors surfaced by the consumer group, its co-hosted service and the
/// shutdown sequence.
///
/// Per-message processing failures are deliberately absent: they are owned by
/// the injected [`crate::Processor`] / [`crate::ErrorHandler`] pair and never
/// leave the claim loop.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Kafka client error that could not be recovered by re-joining the group
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    /// The shared cancellation token was already cancelled when checked
    #[error("consumer group context cancelled")]
    Cancelled,

    /// Configuration could not be assembled
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    Validation(#[from] validator::ValidationErrors),

    /// Environment variables could not be deserialized
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Socket / IO failure in the HTTP service
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The co-hosted HTTP service stopped without being asked to
    #[error("HTTP service stopped unexpectedly")]
    ServiceStopped,

    /// The co-hosted HTTP service could not be shut down cleanly
    #[error("Failed to close HTTP service: {0}")]
    ServiceClose(String),

    /// `close` was called on a consumer group that is already closed
    #[error("consumer group already closed")]
    AlreadyClosed,

    /// The shutdown sequence was asked to run a step out of order
    #[error("shutdown sequence is {0}")]
    Shutdown(&'static str),

    /// A channel the runtime depends on was dropped
    #[error("{0} channel closed")]
    ChannelClosed(&'static str),
}

impl ConsumerError {
    /// True when the error only reports a requested shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ConsumerError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::types::RDKafkaErrorCode;

    #[test]
    fn test_cancelled_is_recognised() {
        assert!(ConsumerError::Cancelled.is_cancelled());
        assert!(!ConsumerError::ServiceStopped.is_cancelled());
    }

    #[test]
    fn test_kafka_error_conversion() {
        let err: ConsumerError =
            KafkaError::MessageConsumption(RDKafkaErrorCode::SaslAuthenticationFailed).into();
        assert!(matches!(err, ConsumerError::Kafka(_)));
        assert!(err.to_string().starts_with("Kafka error"));
    }
}
