//! In-process transport.
//!
//! Behaves like a single NATS server with JetStream enabled, closely enough
//! for the router to be exercised end to end without a network:
//! wildcard subjects, queue groups (round-robin inside a group), request/reply
//! through `_INBOX.` subjects, graceful drain, and streams with durable pull
//! consumers (explicit ack, nak, ack-wait expiry, max-deliver, deliver
//! policies, `Nats-Msg-Id` de-duplication).
//!
//! Subject permissions can be denied per pattern to reproduce authorization
//! failures on subscribe and publish.

use crate::{
    subject, DeliverPolicy, DurableConsumer, DurableConsumerConfig, Result, StreamMessage,
    Subscription, Transport, TransportError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nr_common::{InboundMessage, OutboundMessage, HEADER_MSG_ID};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// In-process transport. Clones share the same "server".
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    registry: Mutex<Registry>,
    streams: Mutex<HashMap<String, Arc<MemoryStream>>>,
    permissions: Mutex<Permissions>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

#[derive(Default)]
struct Registry {
    entries: Vec<SubscriptionEntry>,
    /// Next member index per (subject pattern, queue group)
    round_robin: HashMap<(String, String), usize>,
}

struct SubscriptionEntry {
    id: u64,
    pattern: String,
    queue_group: Option<String>,
    sender: mpsc::UnboundedSender<InboundMessage>,
}

#[derive(Default)]
struct Permissions {
    deny_publish: Vec<String>,
    deny_subscribe: Vec<String>,
}

fn denied(rules: &[String], subject: &str) -> bool {
    rules
        .iter()
        .any(|rule| rule == subject || subject::matches(rule, subject))
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse publishes (and requests) to subjects matching `pattern`
    pub fn deny_publish(&self, pattern: impl Into<String>) {
        self.inner.permissions.lock().deny_publish.push(pattern.into());
    }

    /// Refuse subscriptions to subjects matching `pattern`
    pub fn deny_subscribe(&self, pattern: impl Into<String>) {
        self.inner.permissions.lock().deny_subscribe.push(pattern.into());
    }

    /// Create a stream capturing `subjects`, or update an existing one.
    ///
    /// Messages carrying a `Nats-Msg-Id` already seen within
    /// `duplicate_window` are dropped.
    pub fn add_stream<I, S>(&self, name: &str, subjects: I, duplicate_window: Duration)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subjects: Vec<String> = subjects.into_iter().map(Into::into).collect();
        let mut streams = self.inner.streams.lock();
        match streams.get(name) {
            Some(existing) => {
                let mut state = existing.state.lock();
                state.subjects = subjects;
                state.duplicate_window = duplicate_window;
            }
            None => {
                debug!(stream = %name, ?subjects, "Stream created");
                streams.insert(
                    name.to_string(),
                    Arc::new(MemoryStream {
                        state: Mutex::new(StreamState {
                            subjects,
                            duplicate_window,
                            ..StreamState::default()
                        }),
                        notify: Notify::new(),
                    }),
                );
            }
        }
    }

    /// Number of messages stored in a stream
    pub fn stream_len(&self, name: &str) -> Option<usize> {
        let streams = self.inner.streams.lock();
        streams.get(name).map(|s| s.state.lock().messages.len())
    }

    /// Messages delivered to a durable consumer and not yet acknowledged
    pub fn consumer_pending(&self, stream: &str, durable: &str) -> Option<usize> {
        let streams = self.inner.streams.lock();
        let stream = streams.get(stream)?;
        let state = stream.state.lock();
        state.consumers.get(durable).map(|c| c.pending.len())
    }

    /// Number of live subscriptions, including request inboxes
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.lock().entries.len()
    }

    /// Close the transport: every subscription ends and further operations fail
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.registry.lock().entries.clear();
        for stream in self.inner.streams.lock().values() {
            stream.notify.notify_waiters();
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn check_publish(&self, subject: &str) -> Result<()> {
        if !subject::is_valid_subject(subject) {
            return Err(TransportError::Publish {
                subject: subject.to_string(),
                reason: "invalid subject".to_string(),
            });
        }
        if denied(&self.inner.permissions.lock().deny_publish, subject) {
            return Err(TransportError::Publish {
                subject: subject.to_string(),
                reason: "permissions violation".to_string(),
            });
        }
        Ok(())
    }

    fn register(&self, pattern: &str, queue_group: Option<&str>) -> MemorySubscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.registry.lock().entries.push(SubscriptionEntry {
            id,
            pattern: pattern.to_string(),
            queue_group: queue_group.map(str::to_string),
            sender,
        });
        MemorySubscription {
            id,
            receiver,
            inner: self.inner.clone(),
            registered: true,
        }
    }
}

impl Inner {
    fn unregister(&self, id: u64) {
        self.registry.lock().entries.retain(|e| e.id != id);
    }

    /// Hand a message to matching subscribers; returns how many received it
    fn route(&self, message: &InboundMessage) -> usize {
        let mut guard = self.registry.lock();
        let registry = &mut *guard;

        let mut delivered = 0;
        let mut groups: HashMap<(String, String), Vec<usize>> = HashMap::new();

        for (idx, entry) in registry.entries.iter().enumerate() {
            if !subject::matches(&entry.pattern, &message.subject) {
                continue;
            }
            match &entry.queue_group {
                None => {
                    if entry.sender.send(message.clone()).is_ok() {
                        delivered += 1;
                    }
                }
                Some(group) => groups
                    .entry((entry.pattern.clone(), group.clone()))
                    .or_default()
                    .push(idx),
            }
        }

        for (key, members) in groups {
            let counter = registry.round_robin.entry(key).or_insert(0);
            let pick = members[*counter % members.len()];
            *counter = counter.wrapping_add(1);
            if registry.entries[pick].sender.send(message.clone()).is_ok() {
                delivered += 1;
            }
        }

        delivered
    }

    /// Append a message to every stream capturing its subject
    fn store(&self, message: &InboundMessage) {
        let streams: Vec<Arc<MemoryStream>> = self.streams.lock().values().cloned().collect();
        for stream in streams {
            if stream.append(message) {
                stream.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Box<dyn Subscription>> {
        self.ensure_open()?;
        if subject.is_empty() || denied(&self.inner.permissions.lock().deny_subscribe, subject) {
            return Err(TransportError::Subscribe {
                subject: subject.to_string(),
                reason: "permissions violation".to_string(),
            });
        }
        debug!(subject = %subject, queue_group = ?queue_group, "Subscribed");
        Ok(Box::new(self.register(subject, queue_group)))
    }

    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        self.ensure_open()?;
        self.check_publish(&message.subject)?;

        let inbound = InboundMessage {
            subject: message.subject,
            reply: None,
            payload: message.payload,
            headers: message.headers,
        };
        self.inner.store(&inbound);
        let delivered = self.inner.route(&inbound);
        trace!(subject = %inbound.subject, delivered, "Published");
        Ok(())
    }

    async fn request(&self, message: OutboundMessage, timeout: Duration) -> Result<InboundMessage> {
        self.ensure_open()?;
        self.check_publish(&message.subject)?;

        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut replies = self.register(&inbox, None);

        let inbound = InboundMessage {
            subject: message.subject,
            reply: Some(inbox),
            payload: message.payload,
            headers: message.headers,
        };
        if self.inner.route(&inbound) == 0 {
            return Err(TransportError::NoResponders(inbound.subject));
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    async fn durable_consumer(
        &self,
        stream: &str,
        config: DurableConsumerConfig,
    ) -> Result<Box<dyn DurableConsumer>> {
        self.ensure_open()?;
        if config.durable_name.is_empty() {
            return Err(TransportError::Consumer("durable name is required".to_string()));
        }
        if config.ack_wait.is_zero() {
            return Err(TransportError::Consumer("ack wait must be positive".to_string()));
        }

        let stream_handle = self
            .inner
            .streams
            .lock()
            .get(stream)
            .cloned()
            .ok_or_else(|| TransportError::StreamNotFound(stream.to_string()))?;

        stream_handle.create_or_update(&config)?;
        debug!(
            stream = %stream,
            durable = %config.durable_name,
            filter = %config.filter_subject,
            "Durable consumer attached"
        );

        Ok(Box::new(MemoryDurableConsumer {
            stream: stream_handle,
            durable: config.durable_name,
            transport: self.inner.clone(),
            stopped: false,
        }))
    }
}

// ============================================================================
// Subscriptions
// ============================================================================

struct MemorySubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<InboundMessage>,
    inner: Arc<Inner>,
    registered: bool,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<InboundMessage> {
        self.receiver.recv().await
    }

    async fn drain(&mut self) -> Result<()> {
        if self.registered {
            // Dropping the registry's sender closes the channel once the buffer is empty
            self.inner.unregister(self.id);
            self.registered = false;
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        if self.registered {
            self.inner.unregister(self.id);
        }
    }
}

// ============================================================================
// Streams
// ============================================================================

struct MemoryStream {
    state: Mutex<StreamState>,
    notify: Notify,
}

#[derive(Default)]
struct StreamState {
    subjects: Vec<String>,
    duplicate_window: Duration,
    /// Sequence n lives at index n - 1
    messages: Vec<StoredMessage>,
    recent_ids: HashMap<String, Instant>,
    consumers: HashMap<String, ConsumerState>,
}

struct StoredMessage {
    message: InboundMessage,
    stored_at: DateTime<Utc>,
}

struct ConsumerState {
    config: DurableConsumerConfig,
    /// Index of the next never-delivered message
    cursor: usize,
    /// Sequences to deliver before the cursor (last-per-subject start)
    backlog: VecDeque<u64>,
    pending: HashMap<u64, Pending>,
    redeliver: VecDeque<u64>,
}

struct Pending {
    deliveries: u64,
    deadline: Instant,
    queued: bool,
}

struct Delivery {
    seq: u64,
    deliveries: u64,
    message: InboundMessage,
}

enum Poll {
    Ready(Delivery),
    Wait(Option<Instant>),
}

impl MemoryStream {
    /// Returns true when the message was stored
    fn append(&self, message: &InboundMessage) -> bool {
        let mut state = self.state.lock();
        if !state
            .subjects
            .iter()
            .any(|pattern| subject::matches(pattern, &message.subject))
        {
            return false;
        }

        if let Some(id) = message.headers.get(HEADER_MSG_ID) {
            let now = Instant::now();
            let window = state.duplicate_window;
            state.recent_ids.retain(|_, seen| now.duration_since(*seen) < window);
            if state.recent_ids.contains_key(id) {
                trace!(msg_id = %id, "Duplicate message dropped");
                return false;
            }
            state.recent_ids.insert(id.to_string(), now);
        }

        state.messages.push(StoredMessage {
            message: message.clone(),
            stored_at: Utc::now(),
        });
        true
    }

    fn create_or_update(&self, config: &DurableConsumerConfig) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(existing) = state.consumers.get_mut(&config.durable_name) {
            if existing.config.filter_subject != config.filter_subject {
                return Err(TransportError::Consumer(format!(
                    "durable '{}' is bound to '{}'",
                    config.durable_name, existing.config.filter_subject
                )));
            }
            existing.config.ack_wait = config.ack_wait;
            existing.config.max_deliver = config.max_deliver;
            return Ok(());
        }

        let matching = |stored: &StoredMessage| {
            subject::matches(&config.filter_subject, &stored.message.subject)
        };
        let len = state.messages.len();
        let mut backlog = VecDeque::new();

        let cursor = match config.deliver_policy {
            DeliverPolicy::All => 0,
            DeliverPolicy::New => len,
            DeliverPolicy::Last => state.messages.iter().rposition(matching).unwrap_or(len),
            DeliverPolicy::ByStartSequence(seq) => (seq.saturating_sub(1) as usize).min(len),
            DeliverPolicy::ByStartTime(start) => state
                .messages
                .iter()
                .position(|stored| stored.stored_at >= start)
                .unwrap_or(len),
            DeliverPolicy::LastPerSubject => {
                let mut last: HashMap<&str, u64> = HashMap::new();
                for (idx, stored) in state.messages.iter().enumerate() {
                    if matching(stored) {
                        last.insert(stored.message.subject.as_str(), idx as u64 + 1);
                    }
                }
                let mut seqs: Vec<u64> = last.into_values().collect();
                seqs.sort_unstable();
                backlog.extend(seqs);
                len
            }
        };

        state.consumers.insert(
            config.durable_name.clone(),
            ConsumerState {
                config: config.clone(),
                cursor,
                backlog,
                pending: HashMap::new(),
                redeliver: VecDeque::new(),
            },
        );
        Ok(())
    }
}

impl StreamState {
    fn poll(&mut self, durable: &str, now: Instant) -> Option<Poll> {
        let consumer = self.consumers.get_mut(durable)?;
        let messages = &self.messages;

        let mut expired: Vec<u64> = consumer
            .pending
            .iter()
            .filter(|(_, p)| !p.queued && p.deadline <= now)
            .map(|(seq, _)| *seq)
            .collect();
        expired.sort_unstable();
        for seq in expired {
            if let Some(p) = consumer.pending.get_mut(&seq) {
                p.queued = true;
            }
            consumer.redeliver.push_back(seq);
        }

        let ack_wait = consumer.config.ack_wait;
        let max_deliver = consumer.config.max_deliver;

        while let Some(seq) = consumer.redeliver.pop_front() {
            let Some(pending) = consumer.pending.get_mut(&seq) else {
                continue;
            };
            if max_deliver > 0 && pending.deliveries >= max_deliver {
                consumer.pending.remove(&seq);
                continue;
            }
            pending.deliveries += 1;
            pending.deadline = now + ack_wait;
            pending.queued = false;
            return Some(Poll::Ready(Delivery {
                seq,
                deliveries: pending.deliveries,
                message: messages[(seq - 1) as usize].message.clone(),
            }));
        }

        let next_new = match consumer.backlog.pop_front() {
            Some(seq) => Some(seq),
            None => {
                let found = messages[consumer.cursor.min(messages.len())..]
                    .iter()
                    .position(|stored| {
                        subject::matches(&consumer.config.filter_subject, &stored.message.subject)
                    });
                match found {
                    Some(offset) => {
                        let idx = consumer.cursor + offset;
                        consumer.cursor = idx + 1;
                        Some(idx as u64 + 1)
                    }
                    None => {
                        consumer.cursor = messages.len();
                        None
                    }
                }
            }
        };

        if let Some(seq) = next_new {
            consumer.pending.insert(
                seq,
                Pending {
                    deliveries: 1,
                    deadline: now + ack_wait,
                    queued: false,
                },
            );
            return Some(Poll::Ready(Delivery {
                seq,
                deliveries: 1,
                message: messages[(seq - 1) as usize].message.clone(),
            }));
        }

        let next_deadline = consumer
            .pending
            .values()
            .filter(|p| !p.queued)
            .map(|p| p.deadline)
            .min();
        Some(Poll::Wait(next_deadline))
    }
}

struct MemoryDurableConsumer {
    stream: Arc<MemoryStream>,
    durable: String,
    transport: Arc<Inner>,
    stopped: bool,
}

#[async_trait]
impl DurableConsumer for MemoryDurableConsumer {
    async fn next(&mut self) -> Option<Result<Box<dyn StreamMessage>>> {
        loop {
            if self.stopped || self.transport.closed.load(Ordering::SeqCst) {
                return None;
            }

            let notified = self.stream.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let polled = self.stream.state.lock().poll(&self.durable, Instant::now());
            let deadline = match polled {
                None => return None,
                Some(Poll::Ready(delivery)) => {
                    return Some(Ok(Box::new(MemoryStreamMessage {
                        stream: self.stream.clone(),
                        durable: self.durable.clone(),
                        seq: delivery.seq,
                        num_delivered: delivery.deliveries,
                        message: delivery.message,
                    })));
                }
                Some(Poll::Wait(deadline)) => deadline,
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified.as_mut() => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}

struct MemoryStreamMessage {
    stream: Arc<MemoryStream>,
    durable: String,
    seq: u64,
    num_delivered: u64,
    message: InboundMessage,
}

#[async_trait]
impl StreamMessage for MemoryStreamMessage {
    fn message(&self) -> &InboundMessage {
        &self.message
    }

    fn num_delivered(&self) -> u64 {
        self.num_delivered
    }

    async fn ack(&self) -> Result<()> {
        let mut state = self.stream.state.lock();
        let consumer = state
            .consumers
            .get_mut(&self.durable)
            .ok_or_else(|| TransportError::Ack(format!("consumer '{}' not found", self.durable)))?;
        consumer.pending.remove(&self.seq);
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        {
            let mut guard = self.stream.state.lock();
            let consumer = guard
                .consumers
                .get_mut(&self.durable)
                .ok_or_else(|| TransportError::Ack(format!("consumer '{}' not found", self.durable)))?;
            if let Some(pending) = consumer.pending.get_mut(&self.seq) {
                if !pending.queued {
                    pending.queued = true;
                    consumer.redeliver.push_back(self.seq);
                }
            }
        }
        self.stream.notify.notify_waiters();
        Ok(())
    }
}
