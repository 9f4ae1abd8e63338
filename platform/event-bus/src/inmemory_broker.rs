//! In-memory implementation of the Topic and Queue traits for testing and development

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::dead_letter::{DeadLetter, DeadLetterReason, RedrivePolicy};
use crate::{
    BusError, BusResult, Queue, QueueMessage, ReceiptHandle, ReceiveRequest, Topic, TopicMessage,
    EVENT_TYPE_ATTRIBUTE,
};

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

// Nothing awaits while holding these locks, so a poisoned lock still holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One subscription on an [`InMemoryBroker`]
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub name: String,
    /// Accepted `event_type` attribute values; empty accepts everything
    pub event_types: HashSet<String>,
    pub visibility_timeout: Duration,
    pub redrive_policy: Option<RedrivePolicy>,
}

impl SubscriptionConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            event_types: HashSet::new(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            redrive_policy: None,
        }
    }

    pub fn with_event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = event_types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    pub fn with_redrive_policy(mut self, policy: RedrivePolicy) -> Self {
        self.redrive_policy = Some(policy);
        self
    }

    fn accepts(&self, event_type: Option<&str>) -> bool {
        self.event_types.is_empty() || event_type.is_some_and(|t| self.event_types.contains(t))
    }
}

/// Topic + subscription queues held in process memory
///
/// This implementation is suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development without a NATS server
///
/// Every subscription registered with [`InMemoryBroker::subscribe`] receives a
/// copy of each later publish whose `event_type` passes its filter. Queues
/// follow the same rules as the production transport: visibility timeout per
/// delivery, delivery counting, and redrive to a dead-letter list. Time is
/// `tokio::time`, so tests can run it with paused time.
///
/// # Example
/// ```rust
/// use event_bus::{InMemoryBroker, Queue, ReceiveRequest, SubscriptionConfig, Topic, TopicMessage};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// let queue = broker.subscribe(SubscriptionConfig::new("audit"));
///
/// broker
///     .publish(TopicMessage::new(b"{}".to_vec()).with_attribute("event_type", "Lead.New"))
///     .await?;
///
/// let batch = queue.receive(ReceiveRequest::single(Duration::from_secs(1))).await?;
/// assert_eq!(batch[0].delivery_count, 1);
/// queue.delete(&batch[0].receipt_handle).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    subscriptions: Mutex<Vec<InMemoryQueue>>,
    unavailable: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; it sees only messages published after this call
    pub fn subscribe(&self, config: SubscriptionConfig) -> InMemoryQueue {
        let queue = InMemoryQueue::new(config);
        lock(&self.inner.subscriptions).push(queue.clone());
        queue
    }

    /// Make every publish fail until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Topic for InMemoryBroker {
    async fn publish(&self, message: TopicMessage) -> BusResult<()> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(
                "in-memory topic unavailable".to_string(),
            ));
        }

        let subscriptions = lock(&self.inner.subscriptions).clone();
        for queue in subscriptions {
            if queue.config().accepts(message.event_type()) {
                queue.enqueue(message.body.clone(), message.attributes.clone());
            }
        }

        Ok(())
    }
}

struct StoredMessage {
    id: String,
    body: Vec<u8>,
    attributes: HashMap<String, String>,
    delivery_count: u32,
    invisible_until: Option<Instant>,
    receipt: Option<String>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }

    fn owns(&self, receipt: &ReceiptHandle, now: Instant) -> bool {
        self.receipt.as_deref() == Some(receipt.as_str()) && !self.is_visible(now)
    }
}

#[derive(Default)]
struct QueueInner {
    messages: VecDeque<StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    next_message_id: u64,
}

struct QueueState {
    config: SubscriptionConfig,
    inner: Mutex<QueueInner>,
    notify: Notify,
    unavailable: AtomicBool,
}

/// One subscription's queue on an [`InMemoryBroker`]
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<QueueState>,
}

impl InMemoryQueue {
    fn new(config: SubscriptionConfig) -> Self {
        Self {
            state: Arc::new(QueueState {
                config,
                inner: Mutex::new(QueueInner::default()),
                notify: Notify::new(),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.state.config.name
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.state.config
    }

    fn enqueue(&self, body: Vec<u8>, attributes: HashMap<String, String>) {
        {
            let mut inner = lock(&self.state.inner);
            inner.next_message_id += 1;
            let id = format!("{}-{}", self.state.config.name, inner.next_message_id);
            inner.messages.push_back(StoredMessage {
                id,
                body,
                attributes,
                delivery_count: 0,
                invisible_until: None,
                receipt: None,
            });
        }
        self.state.notify.notify_one();
    }

    /// Make receive/delete fail until reset (simulates a transport outage)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages still on the live queue, in flight or not
    pub fn len(&self) -> usize {
        lock(&self.state.inner).messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages a receive issued now could hand out
    pub fn visible_len(&self) -> usize {
        let now = Instant::now();
        lock(&self.state.inner)
            .messages
            .iter()
            .filter(|m| m.is_visible(now))
            .count()
    }

    /// Messages currently hidden behind a visibility deadline
    pub fn in_flight_len(&self) -> usize {
        self.len() - self.visible_len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.state.inner).dead_letters.clone()
    }

    /// Move every dead letter back onto the live queue with a fresh delivery count
    pub fn replay_dead_letters(&self) -> usize {
        let replayed = {
            let mut inner = lock(&self.state.inner);
            let dead_letters = std::mem::take(&mut inner.dead_letters);
            let count = dead_letters.len();
            for dead in dead_letters {
                inner.messages.push_back(StoredMessage {
                    id: dead.message_id,
                    body: dead.body,
                    attributes: dead.attributes,
                    delivery_count: 0,
                    invisible_until: None,
                    receipt: None,
                });
            }
            count
        };

        if replayed > 0 {
            tracing::info!(queue = %self.name(), replayed, "Replayed dead letters onto live queue");
            self.state.notify.notify_one();
        }
        replayed
    }

    fn check_available(&self) -> BusResult<()> {
        if self.state.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError(format!(
                "in-memory queue {} unavailable",
                self.name()
            )));
        }
        Ok(())
    }

    /// Hand out up to `max` visible messages, dead-lettering exhausted ones on
    /// the way. Also returns the earliest moment a hidden message reappears.
    fn take_visible(&self, max: usize, now: Instant) -> (Vec<QueueMessage>, Option<Instant>) {
        let config = &self.state.config;
        let mut inner = lock(&self.state.inner);
        let mut batch = Vec::new();
        let mut next_wakeup: Option<Instant> = None;
        let mut index = 0;

        while index < inner.messages.len() {
            let message = &mut inner.messages[index];

            if !message.is_visible(now) {
                if let Some(until) = message.invisible_until {
                    next_wakeup = Some(next_wakeup.map_or(until, |t| t.min(until)));
                }
                index += 1;
                continue;
            }

            let exhausted = config
                .redrive_policy
                .is_some_and(|policy| policy.is_exhausted(message.delivery_count));

            if exhausted {
                if let Some(dead) = inner.messages.remove(index) {
                    tracing::warn!(
                        queue = %config.name,
                        message_id = %dead.id,
                        delivery_count = dead.delivery_count,
                        "Message exceeded max receive count, moved to dead letters"
                    );
                    inner.dead_letters.push(DeadLetter {
                        event_type: dead.attributes.get(EVENT_TYPE_ATTRIBUTE).cloned(),
                        message_id: dead.id,
                        body: dead.body,
                        attributes: dead.attributes,
                        delivery_count: dead.delivery_count,
                        reason: DeadLetterReason::MaxDeliveries,
                        dead_lettered_at: Utc::now(),
                    });
                }
                continue;
            }

            if batch.len() < max {
                message.delivery_count += 1;
                let receipt = format!("{}#{}", message.id, message.delivery_count);
                let deadline = now + config.visibility_timeout;
                message.invisible_until = Some(deadline);
                message.receipt = Some(receipt.clone());

                batch.push(QueueMessage {
                    message_id: message.id.clone(),
                    receipt_handle: ReceiptHandle::new(receipt),
                    body: message.body.clone(),
                    attributes: message.attributes.clone(),
                    delivery_count: message.delivery_count,
                    visibility_deadline: deadline,
                });

                next_wakeup = Some(next_wakeup.map_or(deadline, |t| t.min(deadline)));
            }
            index += 1;
        }

        (batch, next_wakeup)
    }
}

#[async_trait]
impl Queue for InMemoryQueue {
    async fn receive(&self, request: ReceiveRequest) -> BusResult<Vec<QueueMessage>> {
        self.check_available()?;

        let poll_deadline = Instant::now() + request.wait;
        let max = request.max_messages.max(1) as usize;

        loop {
            let now = Instant::now();
            let (batch, next_wakeup) = self.take_visible(max, now);
            if !batch.is_empty() {
                return Ok(batch);
            }
            if now >= poll_deadline {
                return Ok(Vec::new());
            }

            let wake_at = next_wakeup.map_or(poll_deadline, |t| t.min(poll_deadline));

            // Wake on a publish/replay or when a hidden message becomes visible.
            tokio::select! {
                _ = self.state.notify.notified() => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> BusResult<()> {
        self.check_available()?;

        let now = Instant::now();
        let mut inner = lock(&self.state.inner);
        let position = inner.messages.iter().position(|m| m.owns(receipt, now));

        match position {
            Some(index) => {
                inner.messages.remove(index);
                Ok(())
            }
            None => Err(BusError::StaleReceipt(receipt.to_string())),
        }
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        extension: Duration,
    ) -> BusResult<()> {
        self.check_available()?;

        let now = Instant::now();
        let mut inner = lock(&self.state.inner);
        let message = inner
            .messages
            .iter_mut()
            .find(|m| m.owns(receipt, now))
            .ok_or_else(|| BusError::StaleReceipt(receipt.to_string()))?;

        message.invisible_until = Some(now + extension);
        Ok(())
    }
}
