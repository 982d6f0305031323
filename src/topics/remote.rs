//! # Broker-backed topics with reconnect and publish retry.
//!
//! [`RemoteTopic`] speaks to an external message broker through the
//! [`Connector`]/[`Channel`] seam. The channel is established lazily and
//! shared through a memoized slot; consume and publish each recover from
//! transport failures on their own schedule.
//!
//! ```text
//!   next():    channel ──▶ delivery ──▶ decode ──▶ TopicDelivery(ack)
//!                 ▲ clear + backoff on failure
//!   publish(): reserve ──▶ channel ──▶ publish ──▶ accepted?
//!                 ▲ leader sleeps holding the lock, followers queue
//! ```
//!
//! ## Publish retry
//!
//! Concurrent publishers share one [`ReservationLock`]. On a retryable
//! failure the first publisher to take the lock becomes the leader and
//! sleeps out the delay while holding it; publishers queued behind it skip
//! their own sleep once the lock opens. A full queue is retried on a fixed
//! delay; transport failures escalate along the [`BackoffSchedule`].

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{TopicError, TransportError};
use crate::message::{TopicDelivery, TopicMessage};
use crate::sync::{Memoized, ReservationLock, ReservationToken};

use super::Topic;

/// One raw message pulled from a broker queue.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The encoded message body.
    pub payload: Vec<u8>,
    /// Broker-assigned tag used to ack or nack this delivery.
    pub tag: u64,
}

/// Outcome of a broker publish attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The broker accepted the message.
    Accepted,
    /// The broker declined the message (queue full or overloaded); the
    /// publish may be retried later.
    Rejected,
}

/// Establishes broker channels.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens a fresh channel to the broker.
    async fn connect(&self) -> Result<Arc<dyn Channel>, TransportError>;
}

/// One established broker channel.
///
/// A channel that returns an `Err` is assumed broken; the topic discards
/// it and connects anew.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Declares `queue`, creating it if missing. Idempotent.
    async fn ensure_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Receives the next delivery from `queue`. `Ok(None)` means the
    /// consume stream ended cleanly.
    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>, TransportError>;

    /// Publishes `payload` to `queue`.
    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        persistent: bool,
    ) -> Result<PublishOutcome, TransportError>;

    /// Confirms the delivery tagged `tag`.
    async fn ack(&self, tag: u64) -> Result<(), TransportError>;

    /// Rejects the delivery tagged `tag`, returning it to the queue.
    async fn nack(&self, tag: u64) -> Result<(), TransportError>;

    /// Closes the channel.
    async fn close(&self);
}

/// Ascending reconnect delays, indexed by consecutive failure count.
#[derive(Clone, Debug, Deserialize)]
pub struct BackoffSchedule {
    /// Delay steps; failures past the end reuse the last step.
    pub steps: Vec<Duration>,
}

impl BackoffSchedule {
    /// Delay for the `failures`-th consecutive failure (zero-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let index = (failures as usize).min(self.steps.len().saturating_sub(1));
        self.steps.get(index).copied().unwrap_or(Duration::ZERO)
    }
}

impl Default for BackoffSchedule {
    /// `[1s, 2s, 5s, 10s, 30s]`.
    fn default() -> Self {
        Self {
            steps: [1, 2, 5, 10, 30].map(Duration::from_secs).to_vec(),
        }
    }
}

/// Options for a [`RemoteTopic`].
#[derive(Clone, Debug, Deserialize)]
pub struct RemoteTopicOptions {
    /// Broker queue to consume from and publish to.
    pub queue: String,

    /// Publish messages as persistent.
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Maximum publishers queued for retry at once (`0` = unbounded).
    #[serde(default = "default_publish_reservations")]
    pub publish_reservations: usize,

    /// Fixed delay between retries when the broker declines a publish.
    #[serde(default = "default_retry_publish_delay")]
    pub retry_publish_delay: Duration,

    /// Reconnect delays for transport failures.
    #[serde(default)]
    pub backoff: BackoffSchedule,
}

fn default_persistent() -> bool {
    true
}

fn default_publish_reservations() -> usize {
    8
}

fn default_retry_publish_delay() -> Duration {
    Duration::from_secs(1)
}

impl RemoteTopicOptions {
    /// Options for `queue` with all defaults.
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            persistent: default_persistent(),
            publish_reservations: default_publish_reservations(),
            retry_publish_delay: default_retry_publish_delay(),
            backoff: BackoffSchedule::default(),
        }
    }
}

/// A topic backed by a broker queue.
pub struct RemoteTopic {
    name: String,
    options: RemoteTopicOptions,
    channel: Memoized<Arc<dyn Channel>, TransportError>,
    publish_lock: ReservationLock,
    closing: CancellationToken,
    consume_failures: AtomicU32,
}

impl RemoteTopic {
    /// Creates a topic named `name` over `connector`.
    ///
    /// No connection is made until the first `next` or `publish`.
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        options: RemoteTopicOptions,
    ) -> Self {
        let queue = options.queue.clone();
        let channel = Memoized::new(move || {
            let connector = Arc::clone(&connector);
            let queue = queue.clone();
            async move {
                let channel = connector.connect().await?;
                channel.ensure_queue(&queue).await?;
                Ok(channel)
            }
        });
        Self {
            name: name.into(),
            publish_lock: ReservationLock::new(options.publish_reservations),
            options,
            channel,
            closing: CancellationToken::new(),
            consume_failures: AtomicU32::new(0),
        }
    }

    /// Sleeps out one consume failure. Returns `false` when the topic
    /// closed during the sleep.
    async fn pause_consume(&self) -> bool {
        let failures = self.consume_failures.fetch_add(1, Ordering::Relaxed);
        let delay = self.options.backoff.delay_for(failures);
        tokio::select! {
            _ = self.closing.cancelled() => false,
            _ = time::sleep(delay) => true,
        }
    }

    /// Waits out one publish failure behind the shared lock.
    ///
    /// The leader sleeps `delay` while holding the lock and bumps
    /// `failures`; a follower only waits for the lock to open, then resets
    /// its count because the leader's sleep already covered the window.
    async fn wait_turn(
        &self,
        token: &mut ReservationToken,
        failures: &mut u32,
        delay: Duration,
    ) -> Result<(), TopicError> {
        let leading = token.locked() || !self.publish_lock.locked();
        token.acquire().await;
        if self.closing.is_cancelled() {
            return Err(TopicError::Closed);
        }
        if leading {
            *failures += 1;
            tokio::select! {
                _ = self.closing.cancelled() => return Err(TopicError::Closed),
                _ = time::sleep(delay) => {}
            }
        } else {
            *failures = 0;
        }
        Ok(())
    }

    fn settled_delivery(&self, channel: Arc<dyn Channel>, message: TopicMessage, tag: u64) -> TopicDelivery {
        let topic = self.name.clone();
        TopicDelivery::with_ack(message, move |success| {
            Box::pin(async move {
                let result = if success {
                    channel.ack(tag).await
                } else {
                    channel.nack(tag).await
                };
                if let Err(err) = result {
                    warn!(
                        topic = %topic,
                        tag,
                        label = err.as_label(),
                        error = %err,
                        "delivery settle failed",
                    );
                }
            })
        })
    }
}

#[async_trait]
impl Topic for RemoteTopic {
    fn name(&self) -> &str {
        &self.name
    }

    async fn next(&self) -> Option<TopicDelivery> {
        loop {
            if self.closing.is_cancelled() {
                return None;
            }
            let channel = match self.channel.get().await {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(
                        topic = %self.name,
                        label = err.as_label(),
                        error = %err,
                        "connect failed; reconnecting",
                    );
                    if !self.pause_consume().await {
                        return None;
                    }
                    continue;
                }
            };

            let received = tokio::select! {
                _ = self.closing.cancelled() => return None,
                received = channel.next_delivery(&self.options.queue) => received,
            };
            match received {
                Ok(Some(delivery)) => {
                    self.consume_failures.store(0, Ordering::Relaxed);
                    match serde_json::from_slice::<TopicMessage>(&delivery.payload) {
                        Ok(message) => {
                            return Some(self.settled_delivery(channel, message, delivery.tag));
                        }
                        Err(err) => {
                            error!(
                                topic = %self.name,
                                tag = delivery.tag,
                                error = %err,
                                "discarding undecodable message",
                            );
                            if let Err(err) = channel.ack(delivery.tag).await {
                                warn!(topic = %self.name, error = %err, "discard ack failed");
                            }
                        }
                    }
                }
                Ok(None) => {
                    debug!(topic = %self.name, "consume stream ended; reconnecting");
                    self.channel.clear();
                    if !self.pause_consume().await {
                        return None;
                    }
                }
                Err(err) => {
                    warn!(
                        topic = %self.name,
                        label = err.as_label(),
                        error = %err,
                        "consume failed; reconnecting",
                    );
                    self.channel.clear();
                    if !self.pause_consume().await {
                        return None;
                    }
                }
            }
        }
    }

    async fn publish(&self, message: TopicMessage, wait: bool) -> Result<bool, TopicError> {
        if self.closing.is_cancelled() {
            return Err(TopicError::Closed);
        }
        if !wait && self.publish_lock.locked_or_reserving() {
            return Ok(false);
        }
        let payload = serde_json::to_vec(&message)?;

        let mut token = self.publish_lock.reserve().await;
        let mut failures: u32 = 0;
        loop {
            if self.closing.is_cancelled() {
                return Err(TopicError::Closed);
            }
            let channel = match self.channel.get().await {
                Ok(channel) => channel,
                Err(err) => {
                    if !wait {
                        return Err(TopicError::Transport(err));
                    }
                    warn!(
                        topic = %self.name,
                        label = err.as_label(),
                        error = %err,
                        "connect failed; publish waiting",
                    );
                    let delay = self.options.backoff.delay_for(failures);
                    self.wait_turn(&mut token, &mut failures, delay).await?;
                    continue;
                }
            };

            let attempt = channel
                .publish(&self.options.queue, &payload, self.options.persistent)
                .await;
            match attempt {
                Ok(PublishOutcome::Accepted) => return Ok(true),
                Ok(PublishOutcome::Rejected) => {
                    if !wait {
                        return Ok(false);
                    }
                    debug!(topic = %self.name, message = %message.id, "publish declined; retrying");
                    // A full queue is a capacity condition, so the wait
                    // stays fixed instead of escalating.
                    let delay = self.options.retry_publish_delay;
                    self.wait_turn(&mut token, &mut failures, delay).await?;
                }
                Err(err) => {
                    if !wait {
                        return Err(TopicError::Transport(err));
                    }
                    warn!(
                        topic = %self.name,
                        label = err.as_label(),
                        error = %err,
                        "publish failed; reconnecting",
                    );
                    self.channel.clear();
                    let delay = self.options.backoff.delay_for(failures);
                    self.wait_turn(&mut token, &mut failures, delay).await?;
                }
            }
        }
    }

    async fn close(&self) {
        self.closing.cancel();
        if let Some(channel) = self.channel.peek() {
            channel.close().await;
        }
        self.channel.clear();
    }
}

/// In-process broker, for embedded deployments and tests.
///
/// Queues are bounded; unacked deliveries are parked per channel and
/// return to the front of the queue on nack.
pub struct MemoryConnector {
    state: Arc<BrokerState>,
    capacity: usize,
}

struct BrokerState {
    queues: std::sync::Mutex<std::collections::HashMap<String, std::collections::VecDeque<Vec<u8>>>>,
    unacked: std::sync::Mutex<std::collections::HashMap<u64, (String, Vec<u8>)>>,
    arrived: tokio::sync::Notify,
    next_tag: AtomicU64,
}

impl MemoryConnector {
    /// Creates a broker whose queues hold at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: std::sync::Mutex::new(std::collections::HashMap::new()),
                unacked: std::sync::Mutex::new(std::collections::HashMap::new()),
                arrived: tokio::sync::Notify::new(),
                next_tag: AtomicU64::new(1),
            }),
            capacity,
        }
    }

    /// Number of messages waiting in `queue`, for diagnostics.
    pub fn pending(&self, queue: &str) -> usize {
        crate::sync::hold(&self.state.queues)
            .get(queue)
            .map_or(0, |q| q.len())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Channel>, TransportError> {
        Ok(Arc::new(MemoryChannel {
            state: Arc::clone(&self.state),
            capacity: self.capacity,
            closed: CancellationToken::new(),
        }))
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    capacity: usize,
    closed: CancellationToken,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn ensure_queue(&self, queue: &str) -> Result<(), TransportError> {
        crate::sync::hold(&self.state.queues)
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>, TransportError> {
        loop {
            let notified = self.state.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.is_cancelled() {
                return Ok(None);
            }
            let popped = crate::sync::hold(&self.state.queues)
                .get_mut(queue)
                .and_then(|q| q.pop_front());
            if let Some(payload) = popped {
                let tag = self.state.next_tag.fetch_add(1, Ordering::Relaxed);
                crate::sync::hold(&self.state.unacked)
                    .insert(tag, (queue.to_string(), payload.clone()));
                return Ok(Some(Delivery { payload, tag }));
            }

            tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                _ = &mut notified => {}
            }
        }
    }

    async fn publish(
        &self,
        queue: &str,
        payload: &[u8],
        _persistent: bool,
    ) -> Result<PublishOutcome, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut queues = crate::sync::hold(&self.state.queues);
        let entry = queues.entry(queue.to_string()).or_default();
        if entry.len() >= self.capacity {
            return Ok(PublishOutcome::Rejected);
        }
        entry.push_back(payload.to_vec());
        drop(queues);
        self.state.arrived.notify_waiters();
        Ok(PublishOutcome::Accepted)
    }

    async fn ack(&self, tag: u64) -> Result<(), TransportError> {
        crate::sync::hold(&self.state.unacked).remove(&tag);
        Ok(())
    }

    async fn nack(&self, tag: u64) -> Result<(), TransportError> {
        let parked = crate::sync::hold(&self.state.unacked).remove(&tag);
        if let Some((queue, payload)) = parked {
            crate::sync::hold(&self.state.queues)
                .entry(queue)
                .or_default()
                .push_front(payload);
            self.state.arrived.notify_waiters();
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
