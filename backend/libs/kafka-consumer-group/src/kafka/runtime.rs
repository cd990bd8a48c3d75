use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::{SendError, TrySendError};
use tokio::sync::mpsc::{self, OwnedPermit};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{partitions_by_topic, GroupConsumerContext, RebalanceEvent};
use super::is_fatal;
use crate::config::Config;
use crate::error::{ConsumerError, ConsumerResult};
use crate::message::RawMessage;
use crate::session::{GroupHandler, GroupRuntime, GroupSession, PartitionClaim};

type GroupConsumer = StreamConsumer<GroupConsumerContext>;
type PartitionKey = (String, i32);
type Assignment = BTreeMap<String, Vec<i32>>;

/// Session of one generation on top of an rdkafka consumer.
pub struct KafkaSession {
    consumer: Arc<GroupConsumer>,
    generation: u64,
    claims: Assignment,
    token: CancellationToken,
}

impl GroupSession for KafkaSession {
    fn generation_id(&self) -> u64 {
        self.generation
    }

    fn claims(&self) -> &BTreeMap<String, Vec<i32>> {
        &self.claims
    }

    fn context(&self) -> &CancellationToken {
        &self.token
    }

    fn mark_message(&self, msg: &RawMessage) {
        if self.token.is_cancelled() {
            return;
        }
        // Committed offsets point at the next message to read.
        if let Err(err) = self
            .consumer
            .store_offset(&msg.topic, msg.partition, msg.offset + 1)
        {
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                error = %err,
                "Failed to mark message"
            );
        }
    }

    fn commit(&self) {
        if self.token.is_cancelled() {
            return;
        }
        if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Async) {
            if !is_nothing_to_commit(&err) {
                warn!(error = %err, "Failed to commit Kafka offsets");
            }
        }
    }
}

fn is_nothing_to_commit(err: &KafkaError) -> bool {
    matches!(err, KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset))
}

/// Delivery stream for one partition, fed by the runtime's dispatcher.
pub struct KafkaClaim {
    topic: String,
    partition: i32,
    messages: mpsc::Receiver<RawMessage>,
}

#[async_trait]
impl PartitionClaim for KafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    async fn recv(&mut self) -> Option<RawMessage> {
        self.messages.recv().await
    }
}

impl KafkaClaim {
    /// Offset of the first record that reached the claim but was never read.
    fn first_unread(&mut self) -> Option<i64> {
        let first = self.messages.try_recv().ok().map(|msg| msg.offset);
        while self.messages.try_recv().is_ok() {}
        first
    }
}

type Reservation = BoxFuture<'static, (PartitionKey, Result<OwnedPermit<RawMessage>, SendError<()>>)>;

struct Lane {
    tx: mpsc::Sender<RawMessage>,
    // Records polled while the claim channel was full, in offset order.
    backlog: VecDeque<RawMessage>,
}

/// Per-partition routing for one generation.
///
/// The dispatcher never waits on a claim. When a claim's channel is full its
/// partition is paused in librdkafka and later records queue up behind it
/// until the claim frees a slot, so a slow partition never holds back the
/// others or the poll loop.
struct Lanes {
    lanes: HashMap<PartitionKey, Lane>,
    reservations: FuturesUnordered<Reservation>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            lanes: HashMap::new(),
            reservations: FuturesUnordered::new(),
        }
    }

    fn open(&mut self, topic: &str, partition: i32, buffer: usize) -> KafkaClaim {
        let (tx, rx) = mpsc::channel(buffer);
        self.lanes.insert(
            (topic.to_string(), partition),
            Lane {
                tx,
                backlog: VecDeque::new(),
            },
        );
        KafkaClaim {
            topic: topic.to_string(),
            partition,
            messages: rx,
        }
    }

    fn route(&mut self, consumer: &GroupConsumer, msg: RawMessage) {
        let key = (msg.topic.clone(), msg.partition);
        let Some(lane) = self.lanes.get_mut(&key) else {
            debug!(
                topic = %msg.topic,
                partition = msg.partition,
                "Record for unclaimed partition, dropping"
            );
            return;
        };

        if !lane.backlog.is_empty() {
            lane.backlog.push_back(msg);
            return;
        }

        match lane.tx.try_send(msg) {
            Ok(()) => {}
            Err(TrySendError::Full(msg)) => {
                debug!(topic = %key.0, partition = key.1, "Claim is full, pausing partition");
                lane.backlog.push_back(msg);
                set_paused(consumer, &key, true);
                self.reservations.push(reserve(key, lane.tx.clone()));
            }
            Err(TrySendError::Closed(_)) => debug!("Claim loop exited, record dropped"),
        }
    }

    /// Move backlog into the claim once it has room again.
    fn refill(
        &mut self,
        consumer: &GroupConsumer,
        key: PartitionKey,
        permit: Result<OwnedPermit<RawMessage>, SendError<()>>,
    ) {
        let Some(lane) = self.lanes.get_mut(&key) else {
            return;
        };
        let Ok(permit) = permit else {
            debug!(topic = %key.0, partition = key.1, "Claim loop exited, backlog dropped");
            lane.backlog.clear();
            return;
        };

        let Some(msg) = lane.backlog.pop_front() else {
            return;
        };
        permit.send(msg);

        while let Some(msg) = lane.backlog.pop_front() {
            match lane.tx.try_send(msg) {
                Ok(()) => {}
                Err(TrySendError::Full(msg)) => {
                    lane.backlog.push_front(msg);
                    self.reservations.push(reserve(key, lane.tx.clone()));
                    return;
                }
                Err(TrySendError::Closed(_)) => {
                    lane.backlog.clear();
                    return;
                }
            }
        }

        set_paused(consumer, &key, false);
    }

    /// Resume paused partitions and report the first record of each backlog.
    fn close(self, consumer: &GroupConsumer) -> HashMap<PartitionKey, i64> {
        let mut unread = HashMap::new();
        for (key, lane) in self.lanes {
            if let Some(first) = lane.backlog.front() {
                set_paused(consumer, &key, false);
                unread.insert(key, first.offset);
            }
        }
        unread
    }
}

fn reserve(key: PartitionKey, tx: mpsc::Sender<RawMessage>) -> Reservation {
    Box::pin(async move { (key, tx.reserve_owned().await) })
}

fn set_paused(consumer: &GroupConsumer, (topic, partition): &PartitionKey, paused: bool) {
    let mut tpl = TopicPartitionList::new();
    tpl.add_partition(topic, *partition);
    let result = if paused {
        consumer.pause(&tpl)
    } else {
        consumer.resume(&tpl)
    };
    if let Err(err) = result {
        warn!(topic = %topic, partition, paused, error = %err, "Failed to toggle partition fetching");
    }
}

struct GenerationEvents {
    events: mpsc::UnboundedReceiver<RebalanceEvent>,
    // Record polled in the same call that completed the assignment.
    early: Option<RawMessage>,
}

/// Group runtime backed by a librdkafka `StreamConsumer`.
///
/// A single dispatcher polls the consumer, which lets librdkafka service
/// heartbeats and rebalances, and routes each record to the bounded channel
/// of its partition claim. Per-partition order is kept; partitions never wait
/// on each other.
pub struct KafkaGroupRuntime {
    consumer: Arc<GroupConsumer>,
    state: Mutex<GenerationEvents>,
    subscribed: parking_lot::Mutex<Option<Vec<String>>>,
    generations: AtomicU64,
    channel_buffer: usize,
    closed: AtomicBool,
}

impl KafkaGroupRuntime {
    pub fn new(cfg: &Config) -> ConsumerResult<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: GroupConsumer = cfg
            .kafka_client_config()?
            .create_with_context(GroupConsumerContext::new(tx))?;

        info!(
            brokers = %cfg.bootstrap_servers(),
            group_id = %cfg.group_id,
            client_id = %cfg.client_id,
            "Created Kafka consumer"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            state: Mutex::new(GenerationEvents {
                events: rx,
                early: None,
            }),
            subscribed: parking_lot::Mutex::new(None),
            generations: AtomicU64::new(0),
            channel_buffer: cfg.channel_buffer_size,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_subscribed(&self, topics: &[String]) -> ConsumerResult<()> {
        let mut subscribed = self.subscribed.lock();
        if subscribed.as_deref() == Some(topics) {
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&names)?;
        info!(topics = ?topics, "Subscribed to topics");
        *subscribed = Some(topics.to_vec());
        Ok(())
    }

    fn current_assignment(&self) -> Assignment {
        match self.consumer.assignment() {
            Ok(tpl) => partitions_by_topic(&tpl),
            Err(err) => {
                warn!(error = %err, "Failed to read partition assignment");
                Assignment::new()
            }
        }
    }

    /// Poll until this member owns at least one partition.
    ///
    /// The consumer's own assignment is the source of truth, so a generation
    /// that ended without a new rebalance (error, caller cancellation) resumes
    /// on the partitions still held. Returns `Ok(None)` when `cancel` fires
    /// first.
    async fn wait_for_assignment(
        &self,
        state: &mut GenerationEvents,
        cancel: &CancellationToken,
    ) -> ConsumerResult<Option<Assignment>> {
        loop {
            let current = self.current_assignment();
            if !current.is_empty() {
                return Ok(Some(current));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                event = state.events.recv() => match event {
                    Some(RebalanceEvent::Assigned(claims)) if claims.is_empty() => {
                        debug!("Empty assignment, waiting for partitions");
                    }
                    Some(RebalanceEvent::Assigned(_)) | Some(RebalanceEvent::Revoked) => {}
                    Some(RebalanceEvent::Error(err)) => {
                        warn!(error = %err, "Rebalance failed while joining");
                    }
                    None => return Err(ConsumerError::ChannelClosed("rebalance")),
                },
                record = self.consumer.recv() => match record {
                    Ok(record) => {
                        let msg = RawMessage::from_kafka(&record);
                        let owned = self
                            .current_assignment()
                            .get(&msg.topic)
                            .is_some_and(|partitions| partitions.contains(&msg.partition));
                        if owned {
                            state.early = Some(msg);
                        } else {
                            debug!(topic = %msg.topic, partition = msg.partition, "Record outside assignment, dropping");
                        }
                    }
                    Err(err) if is_fatal(&err) => return Err(err.into()),
                    Err(err) => warn!(error = %err, "Kafka consumer error"),
                },
            }
        }
    }

    /// Route records to claims until the session ends.
    async fn dispatch(
        &self,
        state: &mut GenerationEvents,
        session: &KafkaSession,
        lanes: &mut Lanes,
    ) -> ConsumerResult<()> {
        let token = session.context();

        if let Some(msg) = state.early.take() {
            lanes.route(&self.consumer, msg);
        }

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(()),
                event = state.events.recv() => match event {
                    Some(RebalanceEvent::Revoked) => return Ok(()),
                    Some(RebalanceEvent::Assigned(next)) => {
                        if &next != session.claims() {
                            return Ok(());
                        }
                    }
                    Some(RebalanceEvent::Error(err)) => {
                        warn!(error = %err, "Rebalance error, ending generation");
                        return Ok(());
                    }
                    None => return Err(ConsumerError::ChannelClosed("rebalance")),
                },
                Some((key, permit)) = lanes.reservations.next(), if !lanes.reservations.is_empty() => {
                    lanes.refill(&self.consumer, key, permit);
                }
                record = self.consumer.recv() => match record {
                    Ok(record) => lanes.route(&self.consumer, RawMessage::from_kafka(&record)),
                    Err(err) if is_fatal(&err) => return Err(err.into()),
                    Err(err) => warn!(error = %err, "Kafka consumer error"),
                },
            }
        }
    }

    /// Point partitions that are still assigned back at their first unread
    /// record, so the next generation starts where this one stopped reading.
    fn rewind(&self, unread: HashMap<PartitionKey, i64>) {
        if unread.is_empty() {
            return;
        }
        let assigned = self.current_assignment();
        for ((topic, partition), offset) in unread {
            let held = assigned
                .get(&topic)
                .is_some_and(|partitions| partitions.contains(&partition));
            if !held {
                continue;
            }
            if let Err(err) =
                self.consumer
                    .seek(&topic, partition, Offset::Offset(offset), Duration::ZERO)
            {
                warn!(topic = %topic, partition, offset, error = %err, "Failed to rewind partition");
            }
        }
    }
}

#[async_trait]
impl GroupRuntime for KafkaGroupRuntime {
    async fn consume(
        &self,
        cancel: &CancellationToken,
        topics: &[String],
        handler: Arc<dyn GroupHandler>,
    ) -> ConsumerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyClosed);
        }
        self.ensure_subscribed(topics)?;

        let mut state = self.state.lock().await;
        let Some(assignment) = self.wait_for_assignment(&mut state, cancel).await? else {
            return Ok(());
        };

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(KafkaSession {
            consumer: self.consumer.clone(),
            generation,
            claims: assignment,
            token: cancel.child_token(),
        });
        self.consumer.context().begin_session(session.token.clone());
        debug!(generation, claims = ?session.claims(), "Generation started");

        if let Err(err) = handler.setup(session.as_ref()).await {
            session.token.cancel();
            self.consumer.context().end_session();
            return Err(err);
        }

        let mut lanes = Lanes::new();
        let mut tasks = JoinSet::new();
        for (topic, partitions) in session.claims() {
            for &partition in partitions {
                let mut claim = lanes.open(topic, partition, self.channel_buffer);
                let session = session.clone();
                let handler = handler.clone();
                tasks.spawn(async move {
                    let result = handler.consume_claim(session.as_ref(), &mut claim).await;
                    (claim, result)
                });
            }
        }

        let outcome = self.dispatch(&mut state, &session, &mut lanes).await;

        session.token.cancel();
        let mut unread = lanes.close(&self.consumer);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((mut claim, result)) => {
                    if let Err(err) = result {
                        error!(topic = %claim.topic, partition = claim.partition, error = %err, "Claim loop failed");
                    }
                    // Channel contents precede the backlog.
                    if let Some(offset) = claim.first_unread() {
                        unread.insert((claim.topic, claim.partition), offset);
                    }
                }
                Err(err) => error!(error = %err, "Claim task panicked"),
            }
        }
        self.consumer.context().end_session();
        self.rewind(unread);

        let cleanup = handler.cleanup(session.as_ref()).await;
        outcome?;
        cleanup
    }

    /// Flush stored offsets and leave the group.
    ///
    /// The librdkafka handle itself is released when the runtime is dropped
    /// together with its consumer group.
    async fn close(&self) -> ConsumerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyClosed);
        }

        let consumer = self.consumer.clone();
        let flushed =
            tokio::task::spawn_blocking(move || consumer.commit_consumer_state(CommitMode::Sync))
                .await;
        match flushed {
            Ok(Ok(())) => debug!("Final offsets committed"),
            Ok(Err(err)) if is_nothing_to_commit(&err) => {}
            Ok(Err(err)) => warn!(error = %err, "Failed to commit final offsets"),
            Err(err) => warn!(error = %err, "Final commit task failed"),
        }

        self.consumer.unsubscribe();
        self.subscribed.lock().take();
        info!("Kafka consumer left the group");
        Ok(())
    }
}
