//! Per-partition consumption loop.

use tracing::{debug, error};

use crate::error::ConsumerResult;
use crate::metrics::{
    ConsumerMetrics, REASON_ERROR_HANDLER_FAILED, REASON_PROCESSED, REASON_PROCESS_FAILED,
};
use crate::processor::{ErrorHandler, Processor};
use crate::session::{GroupSession, PartitionClaim};

/// Drain `claim` through `processor` until the session context is cancelled.
///
/// Every delivered message is marked and committed after processing, whether
/// the processor succeeded or not. Failed messages go to `error_handler`
/// instead of being redelivered. Cancellation wins over pending messages: once
/// the session context is done nothing more is read or committed.
///
/// This runs on the task the runtime created for the claim and must not spawn.
pub async fn consume_claim(
    session: &dyn GroupSession,
    claim: &mut dyn PartitionClaim,
    processor: &dyn Processor,
    error_handler: &dyn ErrorHandler,
    metrics: Option<&ConsumerMetrics>,
) -> ConsumerResult<()> {
    let cancel = session.context();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            msg = claim.recv() => Some(msg),
        };

        let msg = match next {
            None => break,
            Some(Some(msg)) => msg,
            Some(None) => {
                // Stream closed ahead of the session; nothing left to read.
                cancel.cancelled().await;
                break;
            }
        };

        let mut reason = REASON_PROCESSED;
        if let Err(err) = processor.process(cancel, &msg).await {
            error!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                error = %err,
                "error occurred while processing message"
            );
            reason = REASON_PROCESS_FAILED;

            if let Err(handler_err) = error_handler.handle_error(&msg, &err).await {
                error!(
                    topic = %msg.topic,
                    partition = msg.partition,
                    offset = msg.offset,
                    error = %handler_err,
                    "failed to handle error"
                );
                reason = REASON_ERROR_HANDLER_FAILED;
            }
        }

        if let Some(metrics) = metrics {
            metrics.instrument(&msg, reason);
        }

        // The generation may have ended while the message was in flight.
        if cancel.is_cancelled() {
            break;
        }
        session.mark_message(&msg);
        session.commit();
    }

    debug!(
        topic = claim.topic(),
        partition = claim.partition(),
        "Claim loop finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RawMessage;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct RecordingSession {
        token: CancellationToken,
        claims: BTreeMap<String, Vec<i32>>,
        marked: Mutex<Vec<i64>>,
        committed: Mutex<Vec<i64>>,
    }

    impl RecordingSession {
        fn new() -> Self {
            Self {
                token: CancellationToken::new(),
                claims: BTreeMap::new(),
                marked: Mutex::new(Vec::new()),
                committed: Mutex::new(Vec::new()),
            }
        }

        fn committed(&self) -> Vec<i64> {
            self.committed.lock().clone()
        }
    }

    impl GroupSession for RecordingSession {
        fn generation_id(&self) -> u64 {
            1
        }

        fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
            &self.claims
        }

        fn context(&self) -> &CancellationToken {
            &self.token
        }

        // Records every call, so the claim loop alone decides what is marked.
        fn mark_message(&self, msg: &RawMessage) {
            self.marked.lock().push(msg.offset);
        }

        fn commit(&self) {
            let mut marked = self.marked.lock();
            self.committed.lock().append(&mut marked);
        }
    }

    struct ChannelClaim {
        rx: mpsc::Receiver<RawMessage>,
    }

    #[async_trait]
    impl PartitionClaim for ChannelClaim {
        fn topic(&self) -> &str {
            "orders"
        }

        fn partition(&self) -> i32 {
            0
        }

        async fn recv(&mut self) -> Option<RawMessage> {
            self.rx.recv().await
        }
    }

    #[derive(Default)]
    struct ScriptedProcessor {
        fail_offsets: HashSet<i64>,
        // Ends the session while this offset is being processed.
        cancel_at: Option<i64>,
        seen: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl Processor for ScriptedProcessor {
        async fn process(&self, cancel: &CancellationToken, msg: &RawMessage) -> anyhow::Result<()> {
            self.seen.lock().push(msg.offset);
            if self.cancel_at == Some(msg.offset) {
                cancel.cancel();
            }
            if self.fail_offsets.contains(&msg.offset) {
                anyhow::bail!("cannot process offset {}", msg.offset);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingErrorHandler {
        fail: bool,
        handled: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl ErrorHandler for RecordingErrorHandler {
        async fn handle_error(&self, msg: &RawMessage, err: &anyhow::Error) -> anyhow::Result<()> {
            self.handled.lock().push((msg.offset, err.to_string()));
            if self.fail {
                anyhow::bail!("dead letter queue unavailable");
            }
            Ok(())
        }
    }

    fn message(offset: i64) -> RawMessage {
        RawMessage {
            topic: "orders".to_string(),
            key: Vec::new(),
            body: format!("payload-{offset}").into_bytes(),
            headers: HashMap::new(),
            event_time: Default::default(),
            partition: 0,
            offset,
        }
    }

    async fn wait_for_commits(session: &RecordingSession, count: usize) {
        for _ in 0..200 {
            if session.committed().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {count} commits, got {:?}", session.committed());
    }

    #[tokio::test]
    async fn test_commits_follow_delivery_order() {
        let session = Arc::new(RecordingSession::new());
        let processor = Arc::new(ScriptedProcessor::default());
        let handler = Arc::new(RecordingErrorHandler::default());
        let (tx, rx) = mpsc::channel(16);

        for offset in [5, 6, 7, 8] {
            tx.send(message(offset)).await.unwrap();
        }

        let task = {
            let (session, processor, handler) = (session.clone(), processor.clone(), handler.clone());
            tokio::spawn(async move {
                let mut claim = ChannelClaim { rx };
                consume_claim(&*session, &mut claim, &*processor, &*handler, None).await
            })
        };

        wait_for_commits(&session, 4).await;
        session.token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(session.committed(), vec![5, 6, 7, 8]);
        assert!(handler.handled.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failed_message_is_still_committed() {
        let session = Arc::new(RecordingSession::new());
        let processor = Arc::new(ScriptedProcessor {
            fail_offsets: HashSet::from([11]),
            ..Default::default()
        });
        let handler = Arc::new(RecordingErrorHandler::default());
        let (tx, rx) = mpsc::channel(16);

        for offset in [10, 11, 12] {
            tx.send(message(offset)).await.unwrap();
        }

        let task = {
            let (session, processor, handler) = (session.clone(), processor.clone(), handler.clone());
            tokio::spawn(async move {
                let mut claim = ChannelClaim { rx };
                consume_claim(&*session, &mut claim, &*processor, &*handler, None).await
            })
        };

        wait_for_commits(&session, 3).await;
        session.token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(session.committed(), vec![10, 11, 12]);
        let handled = handler.handled.lock().clone();
        assert_eq!(handled.len(), 1);
        assert_eq!(handled[0].0, 11);
        assert!(handled[0].1.contains("offset 11"));
    }

    #[tokio::test]
    async fn test_error_handler_failure_does_not_stop_loop() {
        let session = Arc::new(RecordingSession::new());
        let processor = Arc::new(ScriptedProcessor {
            fail_offsets: HashSet::from([1, 2]),
            ..Default::default()
        });
        let handler = Arc::new(RecordingErrorHandler {
            fail: true,
            ..Default::default()
        });
        let telemetry = crate::metrics::Telemetry::new("claim_test").unwrap();
        let (tx, rx) = mpsc::channel(16);

        for offset in [1, 2, 3] {
            tx.send(message(offset)).await.unwrap();
        }

        let task = {
            let (session, processor, handler) = (session.clone(), processor.clone(), handler.clone());
            let metrics = telemetry.consumer().clone();
            tokio::spawn(async move {
                let mut claim = ChannelClaim { rx };
                consume_claim(&*session, &mut claim, &*processor, &*handler, Some(&metrics)).await
            })
        };

        wait_for_commits(&session, 3).await;
        session.token.cancel();
        task.await.unwrap().unwrap();

        assert_eq!(session.committed(), vec![1, 2, 3]);
        assert_eq!(handler.handled.lock().len(), 2);
        let events = &telemetry.consumer().events;
        assert_eq!(
            events
                .with_label_values(&["0", "orders", REASON_ERROR_HANDLER_FAILED])
                .get(),
            2
        );
        assert_eq!(
            events.with_label_values(&["0", "orders", REASON_PROCESSED]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_cancellation_stops_without_waiting_for_messages() {
        let session = Arc::new(RecordingSession::new());
        let processor = Arc::new(ScriptedProcessor::default());
        let handler = Arc::new(RecordingErrorHandler::default());
        let (tx, rx) = mpsc::channel(16);

        tx.send(message(10)).await.unwrap();

        let task = {
            let (session, processor, handler) = (session.clone(), processor.clone(), handler.clone());
            tokio::spawn(async move {
                let mut claim = ChannelClaim { rx };
                consume_claim(&*session, &mut claim, &*processor, &*handler, None).await
            })
        };

        wait_for_commits(&session, 1).await;
        session.token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("claim loop should exit on cancellation")
            .unwrap()
            .unwrap();

        // Messages that show up after cancellation are never read.
        let _ = tx.send(message(11)).await;
        let _ = tx.send(message(12)).await;

        assert_eq!(session.committed(), vec![10]);
        assert_eq!(processor.seen.lock().clone(), vec![10]);
    }

    #[tokio::test]
    async fn test_buffered_messages_are_dropped_after_cancellation() {
        let session = RecordingSession::new();
        let processor = ScriptedProcessor::default();
        let handler = RecordingErrorHandler::default();
        let (tx, rx) = mpsc::channel(16);

        for offset in [11, 12] {
            tx.send(message(offset)).await.unwrap();
        }
        session.token.cancel();

        let mut claim = ChannelClaim { rx };
        consume_claim(&session, &mut claim, &processor, &handler, None)
            .await
            .unwrap();

        assert!(session.committed().is_empty());
        assert!(processor.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_stream_waits_for_session_end() {
        let session = Arc::new(RecordingSession::new());
        let processor = Arc::new(ScriptedProcessor::default());
        let handler = Arc::new(RecordingErrorHandler::default());
        let (tx, rx) = mpsc::channel(1);
        drop(tx);

        let task = {
            let (session, processor, handler) = (session.clone(), processor.clone(), handler.clone());
            tokio::spawn(async move {
                let mut claim = ChannelClaim { rx };
                consume_claim(&*session, &mut claim, &*processor, &*handler, None).await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        session.token.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_message_in_flight_at_revocation_is_not_marked() {
        let session = RecordingSession::new();
        let processor = ScriptedProcessor {
            cancel_at: Some(21),
            ..Default::default()
        };
        let handler = RecordingErrorHandler::default();
        let (tx, rx) = mpsc::channel(16);

        for offset in [20, 21, 22] {
            tx.send(message(offset)).await.unwrap();
        }

        let mut claim = ChannelClaim { rx };
        consume_claim(&session, &mut claim, &processor, &handler, None)
            .await
            .unwrap();

        assert_eq!(processor.seen.lock().clone(), vec![20, 21]);
        assert_eq!(session.marked.lock().clone(), Vec::<i64>::new());
        assert_eq!(session.committed(), vec![20]);
    }
}
