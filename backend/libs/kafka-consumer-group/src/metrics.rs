use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::debug;

use crate::error::ConsumerResult;
use crate::message::RawMessage;

/// Reason label for a message that processed cleanly.
pub const REASON_PROCESSED: &str = "processed";
/// Reason label for a message whose processor returned an error.
pub const REASON_PROCESS_FAILED: &str = "process_failed";
/// Reason label for a failed message whose error handler also failed.
pub const REASON_ERROR_HANDLER_FAILED: &str = "error_handler_failed";

/// Counters and gauges describing consumer activity.
#[derive(Clone)]
pub struct ConsumerMetrics {
    pub events: IntCounterVec,
    pub active_claims: IntGauge,
    pub generations: IntCounter,
}

impl ConsumerMetrics {
    fn new(registry: &Registry) -> ConsumerResult<Self> {
        let events = IntCounterVec::new(
            Opts::new(
                "kafka_consumer_events_total",
                "A counter for total number of events being consumed",
            ),
            &["partition", "topic", "reason"],
        )?;

        let active_claims = IntGauge::with_opts(Opts::new(
            "kafka_consumer_active_claims",
            "Number of partition claims currently being consumed",
        ))?;

        let generations = IntCounter::with_opts(Opts::new(
            "kafka_consumer_generations_total",
            "Number of consumer group generations this process took part in",
        ))?;

        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(active_claims.clone()))?;
        registry.register(Box::new(generations.clone()))?;

        Ok(Self {
            events,
            active_claims,
            generations,
        })
    }

    /// Count one consumed message under `reason`.
    pub fn instrument(&self, msg: &RawMessage, reason: &str) {
        let partition = msg.partition.to_string();
        self.events
            .with_label_values(&[partition.as_str(), msg.topic.as_str(), reason])
            .inc();
        debug!(
            partition = msg.partition,
            topic = %msg.topic,
            reason,
            "instrumented message"
        );
    }
}

/// Process-wide telemetry state.
///
/// Built once by the host and handed to the components that need it, instead
/// of living in package-level statics. Cloning shares the same registry.
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    consumer: ConsumerMetrics,
}

impl Telemetry {
    /// Create a registry whose metric names are prefixed with `namespace`.
    pub fn new(namespace: &str) -> ConsumerResult<Self> {
        let registry = Registry::new_custom(Some(sanitize_namespace(namespace)), None)?;
        let consumer = ConsumerMetrics::new(&registry)?;
        Ok(Self { registry, consumer })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn consumer(&self) -> &ConsumerMetrics {
        &self.consumer
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn encode(&self) -> ConsumerResult<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// Prometheus names only allow `[a-zA-Z0-9_]` and may not start with a digit.
pub fn sanitize_namespace(raw: &str) -> String {
    let mut ns: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if ns.is_empty() || ns.starts_with(|c: char| c.is_ascii_digit()) {
        ns.insert(0, '_');
    }
    ns
}
