//! Consumer group lifecycle: the join/consume retry loop and the per-generation
//! handler that feeds claims into the processing pipeline.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::claim::consume_claim;
use crate::config::Config;
use crate::error::{ConsumerError, ConsumerResult};
use crate::kafka::KafkaGroupRuntime;
use crate::metrics::{ConsumerMetrics, Telemetry};
use crate::processor::{ErrorHandler, NopErrorHandler, Processor};
use crate::session::{GroupHandler, GroupRuntime, GroupSession, PartitionClaim};

/// Handler the runtime calls back into once per generation and once per claim.
///
/// `setup` and `cleanup` only log and count generations; they are the place for
/// per-generation bookkeeping such as warming or draining caches.
pub struct MessagePipeline {
    processor: Arc<dyn Processor>,
    error_handler: Arc<dyn ErrorHandler>,
    metrics: Option<ConsumerMetrics>,
}

impl MessagePipeline {
    pub fn new(processor: Arc<dyn Processor>, error_handler: Arc<dyn ErrorHandler>) -> Self {
        Self {
            processor,
            error_handler,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ConsumerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[async_trait]
impl GroupHandler for MessagePipeline {
    async fn setup(&self, session: &dyn GroupSession) -> ConsumerResult<()> {
        info!(
            generation = session.generation_id(),
            claims = ?session.claims(),
            "Consumer group generation started"
        );
        if let Some(metrics) = &self.metrics {
            metrics.generations.inc();
        }
        Ok(())
    }

    async fn cleanup(&self, session: &dyn GroupSession) -> ConsumerResult<()> {
        info!(
            generation = session.generation_id(),
            "Consumer group generation stopped"
        );
        Ok(())
    }

    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> ConsumerResult<()> {
        if let Some(metrics) = &self.metrics {
            metrics.active_claims.inc();
        }

        let result = consume_claim(
            session,
            claim,
            self.processor.as_ref(),
            self.error_handler.as_ref(),
            self.metrics.as_ref(),
        )
        .await;

        if let Some(metrics) = &self.metrics {
            metrics.active_claims.dec();
        }
        result
    }
}

/// Consumer group member.
///
/// Owns the client runtime (and with it the group membership and network
/// connection) plus the pipeline every claim is drained through.
pub struct ConsumerGroup<R: GroupRuntime = KafkaGroupRuntime> {
    runtime: R,
    pipeline: Arc<MessagePipeline>,
    topics: Vec<String>,
}

impl ConsumerGroup<KafkaGroupRuntime> {
    /// Build a Kafka-backed consumer group from validated configuration.
    ///
    /// The consumer joins the group lazily, on the first [`Self::start`] call.
    pub fn from_config(
        cfg: &Config,
        processor: Arc<dyn Processor>,
        error_handler: Arc<dyn ErrorHandler>,
        telemetry: &Telemetry,
    ) -> ConsumerResult<Self> {
        let runtime = KafkaGroupRuntime::new(cfg)?;
        let pipeline =
            MessagePipeline::new(processor, error_handler).with_metrics(telemetry.consumer().clone());
        Ok(Self::new(runtime, pipeline, cfg.topics.clone()))
    }
}

impl<R: GroupRuntime> ConsumerGroup<R> {
    pub fn new(runtime: R, pipeline: MessagePipeline, topics: Vec<String>) -> Self {
        Self {
            runtime,
            pipeline: Arc::new(pipeline),
            topics,
        }
    }

    /// Group with the no-op error handler and no metrics.
    pub fn with_processor(runtime: R, processor: Arc<dyn Processor>, topics: Vec<String>) -> Self {
        Self::new(
            runtime,
            MessagePipeline::new(processor, Arc::new(NopErrorHandler)),
            topics,
        )
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Consume until a fatal error or cancellation, re-joining the group after
    /// every generation.
    ///
    /// A generation that ends without error (rebalance, lost heartbeat) starts
    /// the next join attempt. A fatal error, or finding `cancel` already
    /// cancelled after a generation, is sent on `errors` exactly once and ends
    /// the loop.
    pub async fn start(&self, cancel: CancellationToken, errors: mpsc::Sender<ConsumerError>) {
        let handler: Arc<dyn GroupHandler> = self.pipeline.clone();

        loop {
            info!(topics = ?self.topics, "Starting message consumption...");

            if let Err(err) = self
                .runtime
                .consume(&cancel, &self.topics, handler.clone())
                .await
            {
                error!(error = %err, "Failed to consume messages");
                report(&errors, err).await;
                return;
            }

            if cancel.is_cancelled() {
                error!("consumer group context cancelled");
                report(&errors, ConsumerError::Cancelled).await;
                return;
            }
        }
    }

    /// Leave the group and release the connection.
    ///
    /// Call once, after [`Self::start`] has returned.
    pub async fn close(&self) -> ConsumerResult<()> {
        info!("Closing consumer group...");
        self.runtime.close().await
    }
}

async fn report(errors: &mpsc::Sender<ConsumerError>, err: ConsumerError) {
    if let Err(unsent) = errors.send(err).await {
        warn!(error = %unsent.0, "Consumer error channel closed, dropping error");
    }
}
