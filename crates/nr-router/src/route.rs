//! Route definitions.
//!
//! A [`Route`] describes one subscription: its subject, its delivery pattern
//! and the pattern's policy knobs. Routes are validated when built and are
//! immutable afterwards, so a dispatcher never sees an invalid one.

use crate::error::RouteError;
use crate::reply::ReplyBuilder;
use nr_config::RouteDefinition;
use nr_transport::{DeliverPolicy, DurableConsumerConfig};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Deliveries before a durable stream message is given up on
pub const DEFAULT_MAX_DELIVER: u64 = 10;

/// Time the transport waits for an ack before redelivering
pub const DEFAULT_ACK_WAIT: Duration = Duration::from_secs(30);

/// Prefix of the dead-letter subject; the route subject follows it
pub const DEAD_LETTER_PREFIX: &str = "dlq.";

/// Delivery pattern of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutePattern {
    /// Every subscriber gets every message, no acknowledgement
    Broadcast,
    /// Competing consumers in a queue group
    Queue,
    /// Queue plus a reply to the requester
    RequestReply,
    /// Durable, acknowledged consumption of a stream
    DurableStream,
}

impl RoutePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePattern::Broadcast => "broadcast",
            RoutePattern::Queue => "queue",
            RoutePattern::RequestReply => "request_reply",
            RoutePattern::DurableStream => "durable_stream",
        }
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutePattern {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "broadcast" | "pubsub" | "pub_sub" => Ok(RoutePattern::Broadcast),
            "queue" => Ok(RoutePattern::Queue),
            "request_reply" | "requestreply" => Ok(RoutePattern::RequestReply),
            "durable_stream" | "durablestream" | "jetstream" => Ok(RoutePattern::DurableStream),
            _ => Err(RouteError::UnsupportedPattern(s.to_string())),
        }
    }
}

/// Durable stream consumer settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableSettings {
    pub stream: String,
    pub durable: String,
    pub ack_wait: Duration,
    pub max_deliver: u64,
    pub deliver_policy: DeliverPolicy,
    /// Advisory; producers publishing with message ids rely on the stream's window
    pub dedup_window: Option<Duration>,
    pub dead_letter: bool,
}

impl DurableSettings {
    /// Consumer definition filtering on `subject`
    pub fn consumer_config(&self, subject: &str) -> DurableConsumerConfig {
        DurableConsumerConfig {
            durable_name: self.durable.clone(),
            filter_subject: subject.to_string(),
            deliver_policy: self.deliver_policy,
            ack_wait: self.ack_wait,
            max_deliver: self.max_deliver,
        }
    }
}

/// Pattern together with the fields that pattern requires
#[derive(Debug, Clone)]
pub enum RouteKind {
    Broadcast,
    Queue {
        queue_group: String,
    },
    RequestReply {
        queue_group: Option<String>,
        reply_builder: Option<ReplyBuilder>,
    },
    DurableStream(DurableSettings),
}

/// A validated, immutable route
#[derive(Debug, Clone)]
pub struct Route {
    subject: String,
    kind: RouteKind,
    handler_timeout: Option<Duration>,
}

impl Route {
    /// Route without options; fails for patterns that require some
    pub fn new(pattern: RoutePattern, subject: impl Into<String>) -> Result<Self, RouteError> {
        Self::builder(pattern, subject).build()
    }

    pub fn builder(pattern: RoutePattern, subject: impl Into<String>) -> RouteBuilder {
        RouteBuilder::new(pattern, subject)
    }

    /// Build a route from a config file definition
    pub fn from_definition(def: &RouteDefinition) -> Result<Self, RouteError> {
        let pattern: RoutePattern = def.pattern.parse()?;
        let mut builder = Route::builder(pattern, def.subject.clone())
            .dead_letter(def.dead_letter)
            .deliver_policy(parse_deliver_policy(def)?);

        if let Some(group) = &def.queue_group {
            builder = builder.queue_group(group.clone());
        }
        if let Some(stream) = &def.stream {
            builder = builder.stream(stream.clone());
        }
        if let Some(durable) = &def.durable {
            builder = builder.durable(durable.clone());
        }
        if let Some(secs) = def.ack_wait_secs {
            builder = builder.ack_wait(Duration::from_secs(secs));
        }
        if let Some(max) = def.max_deliver {
            builder = builder.max_deliver(max.max(0) as u64);
        }
        if let Some(secs) = def.dedup_window_secs {
            builder = builder.dedup_window(Duration::from_secs(secs));
        }
        if let Some(ms) = def.handler_timeout_ms {
            builder = builder.handler_timeout(Duration::from_millis(ms));
        }

        builder.build()
    }

    pub fn pattern(&self) -> RoutePattern {
        match &self.kind {
            RouteKind::Broadcast => RoutePattern::Broadcast,
            RouteKind::Queue { .. } => RoutePattern::Queue,
            RouteKind::RequestReply { .. } => RoutePattern::RequestReply,
            RouteKind::DurableStream(_) => RoutePattern::DurableStream,
        }
    }

    pub fn kind(&self) -> &RouteKind {
        &self.kind
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue_group(&self) -> Option<&str> {
        match &self.kind {
            RouteKind::Queue { queue_group } => Some(queue_group),
            RouteKind::RequestReply { queue_group, .. } => queue_group.as_deref(),
            _ => None,
        }
    }

    pub fn reply_builder(&self) -> Option<&ReplyBuilder> {
        match &self.kind {
            RouteKind::RequestReply { reply_builder, .. } => reply_builder.as_ref(),
            _ => None,
        }
    }

    pub fn durable_settings(&self) -> Option<&DurableSettings> {
        match &self.kind {
            RouteKind::DurableStream(settings) => Some(settings),
            _ => None,
        }
    }

    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout
    }

    /// Subject failed durable stream messages are republished to
    pub fn dead_letter_subject(&self) -> String {
        format!("{DEAD_LETTER_PREFIX}{}", self.subject)
    }

    /// Consumer definition for a durable stream route
    pub fn consumer_config(&self) -> Option<DurableConsumerConfig> {
        self.durable_settings()
            .map(|settings| settings.consumer_config(&self.subject))
    }
}

fn parse_deliver_policy(def: &RouteDefinition) -> Result<DeliverPolicy, RouteError> {
    let Some(name) = def.deliver_policy.as_deref() else {
        return Ok(DeliverPolicy::All);
    };
    match name.trim().to_ascii_lowercase().as_str() {
        "" | "all" => Ok(DeliverPolicy::All),
        "last" => Ok(DeliverPolicy::Last),
        "new" => Ok(DeliverPolicy::New),
        "last_per_subject" => Ok(DeliverPolicy::LastPerSubject),
        "by_start_sequence" => def
            .start_sequence
            .map(DeliverPolicy::ByStartSequence)
            .ok_or_else(|| RouteError::InvalidDeliverPolicy("by_start_sequence needs start_sequence".to_string())),
        "by_start_time" => def
            .start_time
            .map(DeliverPolicy::ByStartTime)
            .ok_or_else(|| RouteError::InvalidDeliverPolicy("by_start_time needs start_time".to_string())),
        other => Err(RouteError::InvalidDeliverPolicy(other.to_string())),
    }
}

/// Collects route options; `build` validates and fills defaults
#[derive(Debug, Clone)]
pub struct RouteBuilder {
    pattern: RoutePattern,
    subject: String,
    queue_group: Option<String>,
    stream: Option<String>,
    durable: Option<String>,
    ack_wait: Option<Duration>,
    max_deliver: Option<u64>,
    deliver_policy: DeliverPolicy,
    dedup_window: Option<Duration>,
    dead_letter: bool,
    reply_builder: Option<ReplyBuilder>,
    handler_timeout: Option<Duration>,
}

impl RouteBuilder {
    pub fn new(pattern: RoutePattern, subject: impl Into<String>) -> Self {
        Self {
            pattern,
            subject: subject.into(),
            queue_group: None,
            stream: None,
            durable: None,
            ack_wait: None,
            max_deliver: None,
            deliver_policy: DeliverPolicy::All,
            dedup_window: None,
            dead_letter: false,
            reply_builder: None,
            handler_timeout: None,
        }
    }

    pub fn queue_group(mut self, group: impl Into<String>) -> Self {
        self.queue_group = Some(group.into());
        self
    }

    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    pub fn durable(mut self, durable: impl Into<String>) -> Self {
        self.durable = Some(durable.into());
        self
    }

    /// Zero keeps the default
    pub fn ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = Some(ack_wait);
        self
    }

    /// Zero keeps the default
    pub fn max_deliver(mut self, max_deliver: u64) -> Self {
        self.max_deliver = Some(max_deliver);
        self
    }

    pub fn deliver_policy(mut self, policy: DeliverPolicy) -> Self {
        self.deliver_policy = policy;
        self
    }

    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = Some(window);
        self
    }

    /// Republish exhausted durable stream messages to `dlq.<subject>`
    pub fn dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn reply_builder(mut self, builder: ReplyBuilder) -> Self {
        self.reply_builder = Some(builder);
        self
    }

    /// Zero disables the timeout
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Route, RouteError> {
        if self.subject.trim().is_empty() {
            return Err(RouteError::MissingSubject);
        }

        let queue_group = self.queue_group.filter(|g| !g.is_empty());

        let kind = match self.pattern {
            RoutePattern::Broadcast => RouteKind::Broadcast,
            RoutePattern::Queue => RouteKind::Queue {
                queue_group: queue_group.ok_or(RouteError::MissingQueueGroup)?,
            },
            RoutePattern::RequestReply => RouteKind::RequestReply {
                queue_group,
                reply_builder: self.reply_builder,
            },
            RoutePattern::DurableStream => {
                let stream = self
                    .stream
                    .filter(|s| !s.is_empty())
                    .ok_or(RouteError::MissingStream)?;
                let durable = self
                    .durable
                    .filter(|d| !d.is_empty())
                    .ok_or(RouteError::MissingDurableName)?;
                RouteKind::DurableStream(DurableSettings {
                    stream,
                    durable,
                    ack_wait: self
                        .ack_wait
                        .filter(|d| !d.is_zero())
                        .unwrap_or(DEFAULT_ACK_WAIT),
                    max_deliver: self
                        .max_deliver
                        .filter(|m| *m > 0)
                        .unwrap_or(DEFAULT_MAX_DELIVER),
                    deliver_policy: self.deliver_policy,
                    dedup_window: self.dedup_window,
                    dead_letter: self.dead_letter,
                })
            }
        };

        Ok(Route {
            subject: self.subject,
            kind,
            handler_timeout: self.handler_timeout.filter(|d| !d.is_zero()),
        })
    }
}
