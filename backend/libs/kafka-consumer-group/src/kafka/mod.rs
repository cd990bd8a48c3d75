//! librdkafka-backed group runtime.

mod context;
mod runtime;

pub use context::{GroupConsumerContext, RebalanceEvent};
pub use runtime::{KafkaClaim, KafkaGroupRuntime, KafkaSession};

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;

/// Whether a client error should stop the consumer instead of being retried.
///
/// Authentication and authorization failures and errors librdkafka flags as
/// fatal will not go away by re-joining the group.
pub fn is_fatal(err: &KafkaError) -> bool {
    match err {
        KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) | KafkaError::Subscription(_) => {
            true
        }
        _ => matches!(
            err.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::Fatal
                    | RDKafkaErrorCode::Authentication
                    | RDKafkaErrorCode::SaslAuthenticationFailed
                    | RDKafkaErrorCode::TopicAuthorizationFailed
                    | RDKafkaErrorCode::GroupAuthorizationFailed
                    | RDKafkaErrorCode::ClusterAuthorizationFailed
            )
        ),
    }
}
