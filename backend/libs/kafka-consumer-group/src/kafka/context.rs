use parking_lot::Mutex;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::TopicPartitionList;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Group membership change observed in a rebalance callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// Topic to partitions now owned by this member
    Assigned(BTreeMap<String, Vec<i32>>),
    Revoked,
    Error(String),
}

/// Consumer context bridging librdkafka callbacks into the runtime.
///
/// Rebalance callbacks run on the thread polling the consumer. A revocation
/// cancels the live session token right there, so claim loops stop committing
/// before the partitions are handed to another member.
pub struct GroupConsumerContext {
    events: mpsc::UnboundedSender<RebalanceEvent>,
    session: Mutex<Option<CancellationToken>>,
}

impl GroupConsumerContext {
    pub fn new(events: mpsc::UnboundedSender<RebalanceEvent>) -> Self {
        Self {
            events,
            session: Mutex::new(None),
        }
    }

    /// Register the token of the generation that is about to start.
    pub fn begin_session(&self, token: CancellationToken) {
        *self.session.lock() = Some(token);
    }

    /// Forget the current generation's token.
    pub fn end_session(&self) {
        self.session.lock().take();
    }

    fn cancel_session(&self) {
        if let Some(token) = self.session.lock().as_ref() {
            token.cancel();
        }
    }

    fn emit(&self, event: RebalanceEvent) {
        if self.events.send(event).is_err() {
            debug!("Rebalance event dropped, runtime no longer listening");
        }
    }
}

pub(crate) fn partitions_by_topic(tpl: &TopicPartitionList) -> BTreeMap<String, Vec<i32>> {
    let mut claims: BTreeMap<String, Vec<i32>> = BTreeMap::new();
    for elem in tpl.elements() {
        claims
            .entry(elem.topic().to_string())
            .or_default()
            .push(elem.partition());
    }
    for partitions in claims.values_mut() {
        partitions.sort_unstable();
    }
    claims
}

impl ClientContext for GroupConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => error!(target: "librdkafka", facility = fac, "{}", log_message),
            RDKafkaLogLevel::Warning => warn!(target: "librdkafka", facility = fac, "{}", log_message),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(target: "librdkafka", facility = fac, "{}", log_message)
            }
            RDKafkaLogLevel::Debug => debug!(target: "librdkafka", facility = fac, "{}", log_message),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        error!(target: "librdkafka", error = %error, "{}", reason);
    }
}

impl ConsumerContext for GroupConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(partitions = ?partitions_by_topic(tpl), "Partition revocation");
                self.cancel_session();
                self.emit(RebalanceEvent::Revoked);
            }
            Rebalance::Assign(tpl) => {
                debug!(partitions = ?partitions_by_topic(tpl), "Partition assignment pending");
            }
            Rebalance::Error(err) => {
                error!(error = %err, "Rebalance error");
                self.cancel_session();
                self.emit(RebalanceEvent::Error(err.to_string()));
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Assign(tpl) = rebalance {
            let claims = partitions_by_topic(tpl);
            info!(partitions = ?claims, "Partitions assigned");
            self.emit(RebalanceEvent::Assigned(claims));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(()) => debug!(partitions = offsets.count(), "Offsets committed"),
            Err(err) => warn!(error = %err, "Failed to commit offsets"),
        }
    }
}
