//! Seams between the consumer group and the client runtime that speaks the
//! group protocol.
//!
//! The runtime owns membership, partition assignment and the per-claim
//! execution units. The consumer group only sees one [`GroupSession`] per
//! generation and one [`PartitionClaim`] per assigned partition, and is called
//! back through [`GroupHandler`].

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::ConsumerResult;
use crate::message::RawMessage;

/// One generation of group membership.
///
/// Shared by every claim of the generation; implementations must be safe for
/// concurrent use.
pub trait GroupSession: Send + Sync {
    /// Monotonic generation counter, local to this process.
    fn generation_id(&self) -> u64;

    /// Topic to partitions owned during this generation.
    fn claims(&self) -> &BTreeMap<String, Vec<i32>>;

    /// Cancelled when the generation ends (rebalance, shutdown).
    fn context(&self) -> &CancellationToken;

    /// Record `msg` as processed. No-op once [`Self::context`] is cancelled.
    fn mark_message(&self, msg: &RawMessage);

    /// Commit marked offsets. Failures are logged by the runtime, never
    /// returned. No-op once [`Self::context`] is cancelled.
    fn commit(&self);
}

/// Delivery stream for one partition within one generation.
#[async_trait]
pub trait PartitionClaim: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Next message in offset order, or `None` once the runtime stops feeding
    /// this claim.
    async fn recv(&mut self) -> Option<RawMessage>;
}

/// Callbacks invoked by the runtime at generation boundaries and per claim.
#[async_trait]
pub trait GroupHandler: Send + Sync {
    /// Run at the start of a generation, before any claim is consumed.
    async fn setup(&self, session: &dyn GroupSession) -> ConsumerResult<()>;

    /// Run at the end of a generation, after every claim loop has returned.
    async fn cleanup(&self, session: &dyn GroupSession) -> ConsumerResult<()>;

    /// Drain one claim until the session context is cancelled.
    ///
    /// Already runs on its own task; must not spawn further work.
    async fn consume_claim(
        &self,
        session: &dyn GroupSession,
        claim: &mut dyn PartitionClaim,
    ) -> ConsumerResult<()>;
}

/// Client runtime that joins the group and drives generations.
#[async_trait]
pub trait GroupRuntime: Send + Sync {
    /// Join the group for `topics` and run a single generation through
    /// `handler`.
    ///
    /// Returns `Ok(())` when the generation ends normally (rebalance, lost
    /// heartbeat, `cancel` fired) and `Err` on a non-recoverable failure.
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ConsumerResult<()>;

    /// Leave the group and release network resources.
    async fn close(&self) -> ConsumerResult<()>;
}
