//! Opaque seam to the AMQP wire layer.
//!
//! The core never speaks the protocol; it drives a broker session
//! through these traits. An implementation wires them to a real AMQP
//! 0-9-1 client (framing, SASL, heartbeats, the confirm protocol);
//! tests supply an in-memory fake.

use crate::config::Config;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// One-shot notification that the broker closed the connection,
/// carrying the AMQP reply code and text.
pub type CloseHook = Box<dyn FnOnce(u16, String) + Send + 'static>;

/// Callback invoked for every message the broker pushes to a consumer.
pub type DeliverySink = Arc<dyn Fn(Delivery) + Send + Sync>;

/// A message delivered to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the message was consumed from.
    pub queue: String,
    /// Channel-scoped, monotonically increasing tag; used to ack/nack.
    pub delivery_tag: u64,
    /// Opaque message body.
    pub payload: Bytes,
    /// True when the broker re-delivered after an earlier attempt.
    pub redelivered: bool,
}

/// Parameters of a consume request.
#[derive(Debug, Clone)]
pub struct ConsumeSpec {
    pub queue: String,
    pub consumer_tag: String,
    /// When set, the broker considers deliveries acknowledged on send.
    pub no_ack: bool,
    /// Server-side cap on unacknowledged deliveries in flight.
    pub prefetch: u16,
}

/// Factory for broker sessions.
///
/// Owned by the supervisor; `connect` is called once at startup and
/// again on every reconnect attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: Channel;
    type Session: Session<Channel = Self::Channel>;

    async fn connect(&self, cfg: &Config) -> anyhow::Result<Arc<Self::Session>>;
}

/// A single authenticated connection to the broker.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Channel: Channel;

    /// Whether the connection is known dead. Polled by the health
    /// failsafe; must be cheap.
    fn is_closed(&self) -> bool;

    /// Register the asynchronous close notification. Invoked at most
    /// once, from runtime context, and must not be called with any
    /// library lock held.
    fn on_close(&self, hook: CloseHook);

    async fn open_channel(&self) -> anyhow::Result<Arc<Self::Channel>>;

    async fn close(&self);
}

/// A lightweight multiplexed stream within a session, with its own
/// confirm and ack state.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    /// Fire-and-forget publish: hand the frame to the wire without
    /// waiting. Must not suspend.
    fn publish(&self, queue: &str, payload: Bytes) -> anyhow::Result<()>;

    /// Publish and wait on this channel's confirm window. `Ok(true)` is
    /// a broker ack, `Ok(false)` a nack.
    async fn publish_confirm(&self, queue: &str, payload: Bytes) -> anyhow::Result<bool>;

    /// Start a consumer; `sink` is invoked for every delivery until the
    /// consumer is cancelled or the channel dies.
    async fn consume(&self, spec: ConsumeSpec, sink: DeliverySink) -> anyhow::Result<()>;

    /// Cancel a consumer previously started with [`consume`](Self::consume).
    async fn cancel(&self, consumer_tag: &str) -> anyhow::Result<()>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> anyhow::Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> anyhow::Result<()>;

    async fn close(&self);
}
