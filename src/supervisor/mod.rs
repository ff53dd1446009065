//! Ownership of the single broker connection.
//!
//! The supervisor is the root of the recovery pipeline: it holds the
//! session, detects loss through both the transport's close event and a
//! polling failsafe, runs the exponential reconnect, and fans the
//! recovery out to registered consumers and producers.

pub use state::ConnState;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::supervisor::backoff::ReconnectBackoff;
use crate::supervisor::state::AtomicConnState;
use crate::transport::{Session, Transport};
use crate::warn_throttled;
use ahash::AHashMap;
use anyhow::anyhow;
use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub(crate) mod backoff;
mod state;

/// How long `session()` sleeps between polls of the session slot.
const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Buffered state-change events per subscriber.
const STATE_EVENTS_CAPACITY: usize = 16;

/// Wake-up sent to a producer's flush task.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FlushSignal {
    /// Periodic timer fired.
    Tick,
    /// The supervisor just (re)connected; flush out of phase with the
    /// timer so recovery latency is one round-trip, not one interval.
    Connected,
    /// The producer is closing; the task must exit.
    Close,
}

/// Implemented by consumers so the supervisor can re-establish their
/// subscriptions after every successful connect.
#[async_trait]
pub(crate) trait Resubscribe: Send + Sync {
    async fn resubscribe(&self);
}

/// Owns the session to the broker and drives recovery.
///
/// State transitions are published on a broadcast channel
/// ([`subscribe_state`](Self::subscribe_state)); producers and
/// consumers observe the supervisor through atomics and never block it.
pub struct ConnectionSupervisor<T: Transport> {
    transport: T,
    cfg: Config,
    runtime: Handle,
    state: AtomicConnState,
    session: ArcSwapOption<T::Session>,
    /// CAS-guarded ownership of the reconnect task; whoever flips
    /// `false → true` runs it, everyone else backs off.
    reconnecting: AtomicBool,
    closed: AtomicBool,
    state_tx: broadcast::Sender<ConnState>,
    consumers: Mutex<AHashMap<u64, Weak<dyn Resubscribe>>>,
    flush_wakes: Mutex<AHashMap<u64, mpsc::Sender<FlushSignal>>>,
    next_observer_id: AtomicU64,
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Establish the initial connection and start the health failsafe.
    ///
    /// Fails with [`Error::Connection`] if the broker cannot be reached
    /// within the configured connect timeout; no partial state remains.
    pub async fn connect(transport: T, cfg: Config) -> Result<Arc<Self>> {
        cfg.validate()?;
        let (state_tx, _) = broadcast::channel(STATE_EVENTS_CAPACITY);
        let supervisor = Arc::new(Self {
            transport,
            runtime: Handle::current(),
            state: AtomicConnState::new(ConnState::Connecting),
            session: ArcSwapOption::empty(),
            reconnecting: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state_tx,
            consumers: Mutex::new(AHashMap::new()),
            flush_wakes: Mutex::new(AHashMap::new()),
            next_observer_id: AtomicU64::new(1),
            cfg,
        });

        let timeout = supervisor.cfg.connect_timeout();
        let session = match tokio::time::timeout(
            timeout,
            supervisor.transport.connect(&supervisor.cfg),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => return Err(Error::connection(err.context("initial connect failed"))),
            Err(_) => {
                return Err(Error::connection(anyhow!(
                    "initial connect timed out after {timeout:?}"
                )));
            }
        };

        supervisor.install_session(session);
        supervisor.set_state(ConnState::Connected);
        info!(uri = %supervisor.cfg.uri, "connected to broker");
        supervisor.spawn_health_probe();
        supervisor.notify_connected();
        Ok(supervisor)
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state.load()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Observe state transitions. Every transition is sent at least
    /// once; `Closed` is the last event a receiver will see.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnState> {
        self.state_tx.subscribe()
    }

    /// Current session without waiting; `None` while down.
    #[inline]
    pub fn try_session(&self) -> Option<Arc<T::Session>> {
        self.session.load_full()
    }

    /// Current session, polling until one is live. Returns
    /// [`Error::Closed`] once the supervisor is closed.
    pub async fn session(&self) -> Result<Arc<T::Session>> {
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if let Some(session) = self.try_session()
                && !session.is_closed()
            {
                return Ok(session);
            }
            tokio::time::sleep(SESSION_POLL_INTERVAL).await;
        }
    }

    /// Bounded variant of [`session`](Self::session) for callers that
    /// would rather fail than wait out a long outage.
    pub async fn session_with_retry(
        &self,
        attempts: u32,
        delay: Duration,
    ) -> Result<Arc<T::Session>> {
        for attempt in 0..attempts {
            if self.is_closed() {
                return Err(Error::Closed);
            }
            if let Some(session) = self.try_session()
                && !session.is_closed()
            {
                return Ok(session);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(Error::connection(anyhow!(
            "no live session after {attempts} attempts"
        )))
    }

    /// Tear down the connection. Terminal; duplicate calls are no-ops.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.set_state(ConnState::Closed);
        if let Some(session) = self.session.swap(None) {
            session.close().await;
        }
        info!("connection supervisor closed");
    }

    // ---- loss detection and recovery ----

    /// Single entry point for both reconnect triggers. The CAS on
    /// `reconnecting` makes sure exactly one task runs recovery no
    /// matter how many triggers fire.
    pub(crate) fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let supervisor = Arc::clone(self);
        self.runtime.spawn(async move {
            supervisor.run_reconnect().await;
        });
    }

    async fn run_reconnect(self: Arc<Self>) {
        self.set_state(ConnState::Reconnecting);
        // Drop the dead session so session() callers wait for the new one.
        self.session.store(None);

        let mut backoff = ReconnectBackoff::new(&self.cfg);
        loop {
            if self.is_closed() {
                self.reconnecting.store(false, Ordering::Release);
                return;
            }
            let delay = backoff.next_delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.is_closed() {
                self.reconnecting.store(false, Ordering::Release);
                return;
            }

            match self.transport.connect(&self.cfg).await {
                Ok(session) => {
                    if self.is_closed() {
                        // Closed while connecting; honor the terminal state.
                        session.close().await;
                        self.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    self.install_session(session);
                    if self.is_closed() {
                        // close() ran between the check above and the
                        // install; it may have missed the new session.
                        if let Some(session) = self.session.swap(None) {
                            session.close().await;
                        }
                        self.reconnecting.store(false, Ordering::Release);
                        return;
                    }
                    self.set_state(ConnState::Connected);
                    info!(uri = %self.cfg.uri, "reconnected to broker");
                    self.reconnecting.store(false, Ordering::Release);
                    self.notify_connected();
                    return;
                }
                Err(err) => {
                    warn_throttled!(
                        Duration::from_secs(5),
                        error = %err,
                        "reconnect attempt failed"
                    );
                }
            }
        }
    }

    /// Publish the session and hook its close notification.
    ///
    /// The hook only schedules; it must never take a lock or do broker
    /// IO, because the transport invokes it from its own task.
    fn install_session(self: &Arc<Self>, session: Arc<T::Session>) {
        let weak = Arc::downgrade(self);
        session.on_close(Box::new(move |code, reason| {
            if let Some(supervisor) = weak.upgrade() {
                warn!(code, %reason, "broker closed the connection");
                supervisor.schedule_reconnect();
            }
        }));
        self.session.store(Some(session));
    }

    /// Polling failsafe for brokers (or load conditions) where the
    /// close event never arrives.
    fn spawn_health_probe(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let every = self.cfg.health_check_interval();
        self.runtime.spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(supervisor) = weak.upgrade() else {
                    return;
                };
                if supervisor.is_closed() {
                    return;
                }
                if supervisor.state() == ConnState::Connected {
                    let dead = supervisor
                        .try_session()
                        .map_or(true, |session| session.is_closed());
                    if dead {
                        warn_throttled!(
                            Duration::from_secs(5),
                            "health probe found a dead session"
                        );
                        supervisor.schedule_reconnect();
                    }
                }
            }
        });
    }

    fn set_state(&self, next: ConnState) {
        // Store before notifying so every observer that reacts to the
        // event reads the new state.
        if self.state.set(next) {
            debug!(state = %next, "connection state change");
            let _ = self.state_tx.send(next);
        }
    }

    /// Fan recovery out after every successful connect, the first one
    /// included. Each consumer resubscribes on its own task so one slow
    /// queue cannot hold up the rest; producers get an out-of-phase
    /// flush nudge.
    fn notify_connected(&self) {
        let consumers: Vec<Arc<dyn Resubscribe>> = {
            let mut registry = self.consumers.lock();
            registry.retain(|_, weak| weak.strong_count() > 0);
            registry.values().filter_map(Weak::upgrade).collect()
        };
        for consumer in consumers {
            self.runtime.spawn(async move {
                consumer.resubscribe().await;
            });
        }

        let wakes: Vec<mpsc::Sender<FlushSignal>> =
            self.flush_wakes.lock().values().cloned().collect();
        for wake in wakes {
            let _ = wake.try_send(FlushSignal::Connected);
        }
    }

    // ---- observer registry ----

    pub(crate) fn allocate_observer_id(&self) -> u64 {
        self.next_observer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_consumer(&self, id: u64, consumer: Weak<dyn Resubscribe>) {
        self.consumers.lock().insert(id, consumer);
    }

    pub(crate) fn deregister_consumer(&self, id: u64) {
        self.consumers.lock().remove(&id);
    }

    pub(crate) fn register_flush_wake(&self, wake: mpsc::Sender<FlushSignal>) -> u64 {
        let id = self.allocate_observer_id();
        self.flush_wakes.lock().insert(id, wake);
        id
    }

    pub(crate) fn deregister_flush_wake(&self, id: u64) {
        self.flush_wakes.lock().remove(&id);
    }

    #[inline]
    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }
}
