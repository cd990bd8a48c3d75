//! Pluggable message handling.
//!
//! Business logic lives behind [`Processor`]; recovery for failed messages
//! (dead-lettering, alerting) lives behind [`ErrorHandler`]. Both are shared
//! across every partition claim of the group, so implementations must be
//! `Send + Sync` and tolerate concurrent calls with independent messages.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::message::RawMessage;

/// Capability invoked once per delivered message.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Handle one message.
    ///
    /// `cancel` is the token of the group generation that delivered the
    /// message; long-running work should watch it.
    ///
    /// # Errors
    ///
    /// Any error is logged and forwarded to the [`ErrorHandler`]. The offset is
    /// committed regardless, so a failed message is not redelivered.
    async fn process(&self, cancel: &CancellationToken, msg: &RawMessage) -> anyhow::Result<()>;
}

/// Capability invoked synchronously from the claim loop after a failed
/// [`Processor::process`] call. Must not block indefinitely.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle_error(&self, msg: &RawMessage, err: &anyhow::Error) -> anyhow::Result<()>;
}

/// Processor that logs every consumed message and always succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintProcessor;

impl PrintProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Processor for PrintProcessor {
    async fn process(&self, _cancel: &CancellationToken, msg: &RawMessage) -> anyhow::Result<()> {
        info!(
            topic = %msg.topic,
            partition = msg.partition,
            offset = msg.offset,
            key = %String::from_utf8_lossy(&msg.key),
            body = %String::from_utf8_lossy(&msg.body),
            headers = ?msg.headers,
            event_time = %msg.event_time,
            "Consumed message"
        );
        Ok(())
    }
}

/// Error handler that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopErrorHandler;

impl NopErrorHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ErrorHandler for NopErrorHandler {
    async fn handle_error(&self, _msg: &RawMessage, _err: &anyhow::Error) -> anyhow::Result<()> {
        Ok(())
    }
}
