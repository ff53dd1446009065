//! Per-destination publish engine.
//!
//! `publish` never blocks and never fails except under the `Raise`
//! policy or after close. The fast path rides a cached channel installed
//! by the flush loop; everything that cannot go out immediately is
//! absorbed by the in-memory buffer and replayed in the background.

pub use hooks::{DropHook, ErrorHook, PayloadHook};

use crate::error::{DropReason, Error, Result};
use crate::io::MessageBuffer;
use crate::producer::hooks::ProducerHooks;
use crate::supervisor::{ConnState, ConnectionSupervisor, FlushSignal};
use crate::transport::{Channel, Session, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

mod hooks;

/// Attempts per buffered payload before it is dropped with
/// [`DropReason::FlushRetryExceeded`].
const MAX_FLUSH_RETRIES: u32 = 3;
/// Session acquisition budget inside `get_or_create_channel`.
const SESSION_RETRY_ATTEMPTS: u32 = 3;
const SESSION_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Room for `Connected`/`Close` nudges on top of the in-task timer.
const WAKE_QUEUE_CAPACITY: usize = 4;

/// How a publish relates to broker acknowledgement. Immutable per
/// producer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PublishMode {
    /// Publish without waiting for the broker.
    FireAndForget,
    /// Publish and wait on the channel's confirm window per message.
    Confirm,
}

/// What happens when the buffer is at capacity. Immutable per producer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BufferPolicy {
    /// Evict the oldest payload to make room; report it dropped.
    DropOldest,
    /// Fail the publish with [`Error::BufferFull`].
    Raise,
    /// Kept for API compatibility; behaves exactly like
    /// [`DropOldest`](BufferPolicy::DropOldest). `publish` must never
    /// suspend, so there is nothing to block on.
    Block,
}

/// A buffered payload plus its flush retry budget.
struct Pending {
    payload: Bytes,
    attempts: u32,
}

impl Pending {
    #[inline]
    fn new(payload: Bytes) -> Self {
        Self {
            payload,
            attempts: 0,
        }
    }
}

/// Failure modes of a single wire attempt.
enum SendFailure {
    /// The channel or connection is sick; the payload may be retried.
    Transport(anyhow::Error),
    /// The broker said no. Definitive; never retried.
    Nacked,
}

/// Publish engine bound to one destination queue.
pub struct Producer<T: Transport> {
    supervisor: Arc<ConnectionSupervisor<T>>,
    queue: String,
    mode: PublishMode,
    policy: BufferPolicy,
    buffer: MessageBuffer<Pending>,
    /// At most one cached channel at any moment; CAS on install and
    /// evict so races neither leak channels nor clobber a fresh one.
    channel_cache: arc_swap::ArcSwapOption<T::Channel>,
    closed: AtomicBool,
    hooks: ProducerHooks,
    wake_tx: mpsc::Sender<FlushSignal>,
    wake_id: u64,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> Producer<T> {
    /// Create a producer for `queue` and start its flush task.
    pub fn new(
        supervisor: Arc<ConnectionSupervisor<T>>,
        queue: impl Into<String>,
        mode: PublishMode,
        policy: BufferPolicy,
    ) -> Arc<Self> {
        let queue = queue.into();
        let buffer_size = supervisor.config().buffer_size;
        let flush_interval = supervisor.config().flush_interval();
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_QUEUE_CAPACITY);
        let wake_id = supervisor.register_flush_wake(wake_tx.clone());

        let producer = Arc::new(Self {
            buffer: MessageBuffer::new(buffer_size),
            channel_cache: arc_swap::ArcSwapOption::empty(),
            closed: AtomicBool::new(false),
            hooks: ProducerHooks::default(),
            wake_tx,
            wake_id,
            flush_task: Mutex::new(None),
            queue,
            mode,
            policy,
            supervisor,
        });

        let task = producer.supervisor.runtime().spawn(Self::flush_loop(
            Arc::downgrade(&producer),
            wake_rx,
            flush_interval,
        ));
        *producer.flush_task.lock() = Some(task);
        producer
    }

    // ---- hook registration (write-once before first publish) ----

    pub fn on_confirm(&self, hook: impl Fn(&Bytes, &str) + Send + Sync + 'static) {
        self.hooks.set_confirm(Box::new(hook));
    }

    pub fn on_nack(&self, hook: impl Fn(&Bytes, &str) + Send + Sync + 'static) {
        self.hooks.set_nack(Box::new(hook));
    }

    pub fn on_error(&self, hook: impl Fn(&Bytes, &str, &anyhow::Error) + Send + Sync + 'static) {
        self.hooks.set_error(Box::new(hook));
    }

    pub fn on_drop(&self, hook: impl Fn(&Bytes, &str, DropReason) + Send + Sync + 'static) {
        self.hooks.set_drop(Box::new(hook));
    }

    // ---- introspection ----

    /// Payloads currently buffered.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Payloads evicted from the buffer since creation.
    #[inline]
    pub fn dropped_count(&self) -> u64 {
        self.buffer.dropped_count()
    }

    #[inline]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[inline]
    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    #[inline]
    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---- publish ----

    /// Hand `payload` to the pipeline.
    ///
    /// Succeeds immediately over the cached channel when the connection
    /// is healthy; otherwise the payload is buffered for the flush loop.
    /// In `FireAndForget` mode this never suspends. Fails only with
    /// [`Error::BufferFull`] (`Raise` policy) or [`Error::Closed`].
    pub async fn publish(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() || self.supervisor.is_closed() {
            self.hooks.dropped(&payload, &self.queue, DropReason::Closed);
            return Err(Error::Closed);
        }

        if let Some(channel) = self.channel_cache.load_full() {
            if channel.is_closed() {
                self.evict(&channel);
            } else {
                match self.send_via(&channel, &payload).await {
                    Ok(()) => return Ok(()),
                    Err(SendFailure::Nacked) => {
                        // Terminal outcome already reported via on_nack;
                        // stop confirming on a channel the broker refuses.
                        self.evict(&channel);
                        return Ok(());
                    }
                    Err(SendFailure::Transport(err)) => {
                        self.evict(&channel);
                        if self.mode == PublishMode::Confirm {
                            self.hooks.errored(&payload, &self.queue, &err);
                        }
                        debug!(queue = %self.queue, error = %err, "fast path failed, buffering");
                    }
                }
            }
        }

        self.handle_buffering(payload)
    }

    /// One wire attempt on `channel`. Outcome hooks for confirm mode
    /// fire here so fast path and flush loop report identically.
    async fn send_via(
        &self,
        channel: &Arc<T::Channel>,
        payload: &Bytes,
    ) -> std::result::Result<(), SendFailure> {
        match self.mode {
            PublishMode::FireAndForget => channel
                .publish(&self.queue, payload.clone())
                .map_err(SendFailure::Transport),
            PublishMode::Confirm => {
                match channel.publish_confirm(&self.queue, payload.clone()).await {
                    Ok(true) => {
                        self.hooks.confirmed(payload, &self.queue);
                        Ok(())
                    }
                    Ok(false) => {
                        self.hooks.nacked(payload, &self.queue);
                        Err(SendFailure::Nacked)
                    }
                    Err(err) => Err(SendFailure::Transport(err)),
                }
            }
        }
    }

    /// Route a payload the fast path could not deliver.
    fn handle_buffering(&self, payload: Bytes) -> Result<()> {
        if self.is_closed() {
            self.hooks.dropped(&payload, &self.queue, DropReason::Closed);
            return Err(Error::Closed);
        }
        match self.policy {
            BufferPolicy::Raise => {
                if self.buffer.is_full() {
                    self.hooks
                        .dropped(&payload, &self.queue, DropReason::BufferFull);
                    return Err(Error::BufferFull);
                }
                self.buffer_with_drop_report(Pending::new(payload));
                Ok(())
            }
            BufferPolicy::DropOldest | BufferPolicy::Block => {
                self.buffer_with_drop_report(Pending::new(payload));
                Ok(())
            }
        }
    }

    fn buffer_with_drop_report(&self, pending: Pending) {
        if let Some(evicted) = self.buffer.enqueue(pending) {
            self.hooks
                .dropped(&evicted.payload, &self.queue, DropReason::BufferFull);
        }
    }

    // ---- channel cache ----

    /// Evict `stale` only if it is still the cached channel, so a
    /// racing install of a newer channel is never clobbered.
    fn evict(&self, stale: &Arc<T::Channel>) {
        let _ = self.channel_cache.compare_and_swap(stale, None);
    }

    /// Return the cached channel or open and install a fresh one.
    ///
    /// Two callers can race past an empty cache and both open channels;
    /// the CAS picks one winner and the loser closes its redundant
    /// channel, so exactly one durable channel exists per producer.
    async fn get_or_create_channel(&self) -> Result<Arc<T::Channel>> {
        if let Some(current) = self.channel_cache.load_full() {
            if !current.is_closed() {
                return Ok(current);
            }
            self.evict(&current);
        }

        let session = self
            .supervisor
            .session_with_retry(SESSION_RETRY_ATTEMPTS, SESSION_RETRY_DELAY)
            .await?;
        let fresh = session.open_channel().await.map_err(Error::connection)?;

        let prev = self
            .channel_cache
            .compare_and_swap(&None::<Arc<T::Channel>>, Some(Arc::clone(&fresh)));
        match prev.as_ref() {
            None => Ok(fresh),
            Some(winner) => {
                let winner = Arc::clone(winner);
                fresh.close().await;
                Ok(winner)
            }
        }
    }

    // ---- flush ----

    async fn flush_loop(
        weak: Weak<Producer<T>>,
        mut wake_rx: mpsc::Receiver<FlushSignal>,
        every: Duration,
    ) {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let signal = tokio::select! {
                _ = tick.tick() => FlushSignal::Tick,
                signal = wake_rx.recv() => signal.unwrap_or(FlushSignal::Close),
            };
            let Some(producer) = weak.upgrade() else {
                return;
            };
            if signal == FlushSignal::Close || producer.is_closed() {
                return;
            }
            if producer.supervisor.state() != ConnState::Connected {
                continue;
            }
            if producer.buffer.is_empty() {
                continue;
            }
            producer.flush_pass().await;
        }
    }

    /// Replay everything currently buffered, in order.
    ///
    /// A failed payload goes back to the tail with its attempt counter
    /// bumped: strict FIFO is traded for bounded memory and liveness
    /// under a sick channel.
    async fn flush_pass(&self) {
        let mut pending = self.buffer.drain().into_iter();
        while let Some(mut entry) = pending.next() {
            let channel = match self.get_or_create_channel().await {
                Ok(channel) => channel,
                Err(err) => {
                    // No usable session; put everything back untouched
                    // and wait for the next wake-up.
                    debug!(queue = %self.queue, error = %err, "flush paused, no channel");
                    self.buffer_with_drop_report(entry);
                    for rest in pending {
                        self.buffer_with_drop_report(rest);
                    }
                    return;
                }
            };

            match self.send_via(&channel, &entry.payload).await {
                Ok(()) => {}
                Err(SendFailure::Nacked) => {
                    self.evict(&channel);
                }
                Err(SendFailure::Transport(err)) => {
                    self.evict(&channel);
                    entry.attempts += 1;
                    if entry.attempts >= MAX_FLUSH_RETRIES {
                        warn!(
                            queue = %self.queue,
                            attempts = entry.attempts,
                            error = %err,
                            "dropping payload after exhausted flush retries"
                        );
                        self.hooks.dropped(
                            &entry.payload,
                            &self.queue,
                            DropReason::FlushRetryExceeded,
                        );
                    } else {
                        self.buffer_with_drop_report(entry);
                    }
                }
            }
        }
    }

    // ---- close ----

    /// Stop the flush task, drain the buffer best-effort, and release
    /// the cached channel. Duplicate calls are no-ops; after `close`
    /// returns no broker IO happens on behalf of this producer.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let _ = self.wake_tx.send(FlushSignal::Close).await;
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.drain_on_close().await;

        if let Some(channel) = self.channel_cache.swap(None) {
            channel.close().await;
        }
        self.supervisor.deregister_flush_wake(self.wake_id);
        info!(queue = %self.queue, "producer closed");
    }

    /// Final drain. Attempts are charged only for real send failures,
    /// exactly like the flush loop. Channel acquisition failure is
    /// handled differently here: close is terminal and no later flush
    /// exists to take the rest, so once no session can be obtained
    /// within the bounded wait, everything still pending is dropped in
    /// one sweep instead of being re-buffered.
    async fn drain_on_close(&self) {
        let mut pending = self.buffer.drain().into_iter();
        while let Some(mut entry) = pending.next() {
            loop {
                let Ok(channel) = self.get_or_create_channel().await else {
                    warn!(
                        queue = %self.queue,
                        "no session during close drain, dropping pending payloads"
                    );
                    self.hooks.dropped(
                        &entry.payload,
                        &self.queue,
                        DropReason::FlushRetryExceeded,
                    );
                    for rest in pending {
                        self.hooks.dropped(
                            &rest.payload,
                            &self.queue,
                            DropReason::FlushRetryExceeded,
                        );
                    }
                    return;
                };
                match self.send_via(&channel, &entry.payload).await {
                    Ok(()) => break,
                    Err(SendFailure::Nacked) => {
                        // on_nack already fired; that is this payload's
                        // terminal outcome.
                        self.evict(&channel);
                        break;
                    }
                    Err(SendFailure::Transport(err)) => {
                        self.evict(&channel);
                        entry.attempts += 1;
                        if entry.attempts >= MAX_FLUSH_RETRIES {
                            warn!(
                                queue = %self.queue,
                                attempts = entry.attempts,
                                error = %err,
                                "dropping payload during close after exhausted retries"
                            );
                            self.hooks.dropped(
                                &entry.payload,
                                &self.queue,
                                DropReason::FlushRetryExceeded,
                            );
                            break;
                        }
                    }
                }
            }
        }
    }
}
