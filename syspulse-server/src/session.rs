use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::future::BoxFuture;
use syspulse_proto::Snapshot;
use tokio::{
    sync::{Mutex, RwLock},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::sampler::{Sampled, Sampler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Attaching = 0,
    Active = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Attaching,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer went away or asked to close.
    PeerGone,
    DeliveryFailed,
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("failed to serialize snapshot: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("observer unreachable: {0}")]
    Unreachable(String),
}

/// Outbound half of an observer's push channel.
pub trait SnapshotSink: Send + 'static {
    fn send(&mut self, payload: String) -> BoxFuture<'_, Result<(), DeliveryError>>;

    fn close(&mut self, reason: CloseReason) -> BoxFuture<'_, ()>;
}

struct ObserverSession {
    state: AtomicU8,
    sink: Mutex<Box<dyn SnapshotSink>>,
    timer: CancellationToken,
}

impl ObserverSession {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `Closing` from any earlier state. Only the caller that wins
    /// this transition releases the session.
    fn begin_close(&self) -> bool {
        self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Attaching, SessionState::Closing)
    }
}

/// Owns every observer session and its recurring timer.
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<ObserverSession>>>,
    next_id: AtomicU64,
    sampler: Arc<Sampler>,
    interval: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("interval", &self.interval)
            .field("next_id", &self.next_id)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    pub fn new(
        sampler: Arc<Sampler>,
        interval: Duration,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        SessionManager {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            sampler,
            interval,
            shutdown,
            tracker,
        }
    }

    /// Register `sink`, push one snapshot right away and start its timer.
    pub async fn attach<S: SnapshotSink>(self: &Arc<Self>, sink: S) -> SessionId {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(ObserverSession {
            state: AtomicU8::new(SessionState::Attaching as u8),
            sink: Mutex::new(Box::new(sink)),
            timer: self.shutdown.child_token(),
        });
        self.sessions.write().await.insert(id, session.clone());

        if !session.transition(SessionState::Attaching, SessionState::Active) {
            // detached while registering
            return id;
        }
        debug!(%id, "session attached");

        if let Some(snapshot) = self.sample().await {
            if self.deliver(id, &snapshot).await.is_err() {
                return id;
            }
        }

        self.spawn_timer(id, session.timer.clone());
        id
    }

    fn spawn_timer(self: &Arc<Self>, id: SessionId, cancelled: CancellationToken) {
        let mgr = self.clone();
        let period = self.interval;
        self.tracker.spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        biased;

                        _ = cancelled.cancelled() => break,
                        _ = ticker.tick() => {
                            let Some(snapshot) = mgr.sample().await else {
                                continue;
                            };
                            if let Err(e) = mgr.deliver(id, &snapshot).await {
                                debug!("stopping timer after failed delivery: {e}");
                                break;
                            }
                        }
                    }
                }

                // a shutdown reaches the timer before anyone detaches the session
                if mgr.shutdown.is_cancelled() {
                    mgr.close(id, CloseReason::Shutdown).await;
                }
                trace!("timer stopped");
            }
            .instrument(debug_span!("session_timer", session_id = id.0)),
        );
    }

    /// `None` only if the sampling task itself died; the tick is skipped.
    async fn sample(&self) -> Option<Snapshot> {
        match self.sampler.clone().sample_blocking().await {
            Ok(Sampled { snapshot, degraded }) => {
                for e in degraded {
                    debug!("degraded snapshot: {e}");
                }
                Some(snapshot)
            }
            Err(e) => {
                warn!("sampling task failed: {e}");
                None
            }
        }
    }

    /// Push `snapshot` to one session.
    ///
    /// Sessions that are not `Active`, or that already have a delivery in
    /// flight, are skipped without error. A failed send closes the session.
    pub async fn deliver(&self, id: SessionId, snapshot: &Snapshot) -> Result<(), DeliveryError> {
        let Some(session) = self.sessions.read().await.get(&id).cloned() else {
            return Ok(());
        };
        if session.state() != SessionState::Active {
            return Ok(());
        }

        let res = {
            let Ok(mut sink) = session.sink.try_lock() else {
                trace!(%id, "delivery in flight, skipping tick");
                return Ok(());
            };
            // re-check under the lock so a concurrent detach wins
            if session.state() != SessionState::Active {
                return Ok(());
            }
            let payload = serde_json::to_string(snapshot)?;
            sink.send(payload).await
        };

        if let Err(e) = res {
            warn!(%id, "delivery failed: {e}");
            self.close(id, CloseReason::DeliveryFailed).await;
            return Err(e);
        }
        Ok(())
    }

    /// Stop pushing to `id` and release it. Safe to call any number of times.
    pub async fn detach(&self, id: SessionId) {
        self.close(id, CloseReason::PeerGone).await;
    }

    async fn close(&self, id: SessionId, reason: CloseReason) {
        let Some(session) = self.sessions.read().await.get(&id).cloned() else {
            return;
        };
        if !session.begin_close() {
            return;
        }

        session.timer.cancel();
        // waits for an in-flight delivery to finish
        session.sink.lock().await.close(reason).await;
        session.state.store(SessionState::Closed as u8, Ordering::Release);
        self.sessions.write().await.remove(&id);
        debug!(%id, ?reason, "session closed");
    }

    /// Resolves once `id` starts closing, or immediately if it is unknown.
    pub async fn closed(&self, id: SessionId) {
        let token = self
            .sessions
            .read()
            .await
            .get(&id)
            .map(|s| s.timer.clone());
        if let Some(token) = token {
            token.cancelled().await;
        }
    }

    pub async fn state(&self, id: SessionId) -> SessionState {
        self.sessions
            .read()
            .await
            .get(&id)
            .map_or(SessionState::Closed, |s| s.state())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}
