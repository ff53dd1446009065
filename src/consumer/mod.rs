//! Per-destination subscription engine.
//!
//! One consumer owns one queue subscription over its own dedicated
//! channel, so ack streams never interleave between consumers. On every
//! reconnect the supervisor asks it to resubscribe; the operation is
//! idempotent and safe to retry.

pub use ack::AckTracker;

use crate::error::{Error, Result};
use crate::supervisor::{ConnectionSupervisor, Resubscribe};
use crate::transport::{Channel, ConsumeSpec, Delivery, DeliverySink, Session, Transport};
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod ack;

/// User callback invoked for every delivery.
pub type DeliveryHandler = Box<dyn Fn(Delivery) + Send + Sync>;

struct Subscription<T: Transport> {
    channel: Arc<T::Channel>,
    consumer_tag: String,
}

/// Subscription engine bound to one queue.
pub struct Consumer<T: Transport> {
    supervisor: Arc<ConnectionSupervisor<T>>,
    queue: String,
    prefetch: u16,
    no_ack: AtomicBool,
    handler: ArcSwapOption<DeliveryHandler>,
    subscription: Mutex<Option<Subscription<T>>>,
    ack_tracker: Arc<AckTracker>,
    closed: AtomicBool,
    observer_id: u64,
}

impl<T: Transport> Consumer<T> {
    /// Create a consumer for `queue` and register it for resubscribe
    /// fan-out. Nothing touches the broker until
    /// [`subscribe`](Self::subscribe).
    pub fn new(
        supervisor: Arc<ConnectionSupervisor<T>>,
        queue: impl Into<String>,
        prefetch: u16,
    ) -> Arc<Self> {
        let observer_id = supervisor.allocate_observer_id();
        let consumer = Arc::new(Self {
            queue: queue.into(),
            prefetch,
            no_ack: AtomicBool::new(false),
            handler: ArcSwapOption::empty(),
            subscription: Mutex::new(None),
            ack_tracker: Arc::new(AckTracker::new()),
            closed: AtomicBool::new(false),
            observer_id,
            supervisor,
        });
        let observer = Arc::clone(&consumer) as Arc<dyn Resubscribe>;
        consumer
            .supervisor
            .register_consumer(observer_id, Arc::downgrade(&observer));
        consumer
    }

    /// Start consuming. The handler is retained for the lifetime of the
    /// consumer and re-attached on every reconnect.
    pub async fn subscribe(
        &self,
        no_ack: bool,
        handler: impl Fn(Delivery) + Send + Sync + 'static,
    ) -> Result<()> {
        if self.is_closed() || self.supervisor.is_closed() {
            return Err(Error::Closed);
        }
        self.no_ack.store(no_ack, Ordering::Release);
        self.handler.store(Some(Arc::new(Box::new(handler))));
        self.do_subscribe().await
    }

    /// Open a channel, set prefetch, and issue the consume request with
    /// a fresh unique tag. On failure nothing is kept, so a later
    /// attempt starts clean.
    async fn do_subscribe(&self) -> Result<()> {
        let Some(handler) = self.handler.load_full() else {
            return Ok(());
        };
        let session = self.supervisor.session().await?;
        let channel = session.open_channel().await.map_err(Error::connection)?;
        let consumer_tag = format!("consumer-{}-{}", self.queue, Uuid::new_v4().simple());
        let no_ack = self.no_ack.load(Ordering::Acquire);

        let tracker = Arc::clone(&self.ack_tracker);
        let sink: DeliverySink = Arc::new(move |delivery: Delivery| {
            if !no_ack {
                tracker.track(delivery.delivery_tag);
            }
            (**handler)(delivery);
        });

        let spec = ConsumeSpec {
            queue: self.queue.clone(),
            consumer_tag: consumer_tag.clone(),
            no_ack,
            prefetch: self.prefetch,
        };
        if let Err(err) = channel.consume(spec, sink).await {
            channel.close().await;
            return Err(Error::connection(err));
        }

        debug!(queue = %self.queue, %consumer_tag, "consume established");
        *self.subscription.lock() = Some(Subscription {
            channel,
            consumer_tag,
        });
        Ok(())
    }

    /// Acknowledge `delivery_tag` (everything up to it with `multiple`).
    ///
    /// Best effort: under reconnect the channel may be gone; the
    /// failure is logged, never propagated.
    pub async fn ack(&self, delivery_tag: u64, multiple: bool) {
        if self.is_closed() {
            return;
        }
        if let Some(channel) = self.current_channel()
            && let Err(err) = channel.ack(delivery_tag, multiple).await
        {
            warn!(queue = %self.queue, delivery_tag, error = %err, "ack failed");
        }
        self.ack_tracker.ack(delivery_tag, multiple);
    }

    /// Reject `delivery_tag`, optionally asking the broker to requeue.
    pub async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) {
        if self.is_closed() {
            return;
        }
        if let Some(channel) = self.current_channel()
            && let Err(err) = channel.nack(delivery_tag, multiple, requeue).await
        {
            warn!(queue = %self.queue, delivery_tag, error = %err, "nack failed");
        }
        self.ack_tracker.nack(delivery_tag, multiple);
    }

    /// Cancel the consume and close the channel. Terminal; later calls
    /// on this consumer are silent no-ops.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let subscription = self.subscription.lock().take();
        if let Some(subscription) = subscription {
            if let Err(err) = subscription.channel.cancel(&subscription.consumer_tag).await {
                debug!(queue = %self.queue, error = %err, "consume cancel failed");
            }
            subscription.channel.close().await;
        }
        self.ack_tracker.clear();
        self.supervisor.deregister_consumer(self.observer_id);
        info!(queue = %self.queue, "consumer closed");
    }

    // ---- introspection ----

    #[inline]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Outstanding delivery tags in ascending order.
    pub fn unacked_tags(&self) -> Vec<u64> {
        self.ack_tracker.unacked_tags()
    }

    pub fn unacked_count(&self) -> usize {
        self.ack_tracker.count()
    }

    /// Tag of the live consume, if subscribed.
    pub fn consumer_tag(&self) -> Option<String> {
        self.subscription
            .lock()
            .as_ref()
            .map(|s| s.consumer_tag.clone())
    }

    fn current_channel(&self) -> Option<Arc<T::Channel>> {
        self.subscription
            .lock()
            .as_ref()
            .map(|s| Arc::clone(&s.channel))
    }
}

#[async_trait]
impl<T: Transport> Resubscribe for Consumer<T> {
    /// Re-establish the subscription on the current connection.
    ///
    /// The stale channel reference is dropped, not closed: the broker
    /// already abandoned its deliveries with the old connection, and
    /// tag numbering starts fresh on the new channel. Residual tags in
    /// the tracker will simply never be acked.
    async fn resubscribe(&self) {
        if self.is_closed() || self.handler.load().is_none() {
            return;
        }
        self.subscription.lock().take();
        if let Err(err) = self.do_subscribe().await {
            warn!(
                queue = %self.queue,
                error = %err,
                "resubscribe failed, waiting for the next reconnect"
            );
        }
    }
}
