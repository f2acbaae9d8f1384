//! Session Pool - bounded, thread-safe pool of remote sessions
//!
//! The SessionPool opens `min_sessions` sessions at startup and keeps them
//! idle until a dispatch borrows one. When every idle session is borrowed and
//! the pool is below `max_sessions`, a new one is opened on demand.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Session Pool                         permits: max_sessions     │
//! │                                                                 │
//! │  ┌───────────────┐     ┌───────────────┐     ┌───────────────┐ │
//! │  │   Session     │     │   Session     │     │  (open on     │ │
//! │  │   (idle)      │     │   (idle)      │     │   demand)     │ │
//! │  └───────────────┘     └───────────────┘     └───────────────┘ │
//! │         │                                                       │
//! │         ▼                                                       │
//! │    acquire() ──► SessionLease (exclusive)                       │
//! │         │                                                       │
//! │         ▼                                                       │
//! │    drop(lease) ──► back to idle, or discarded + replaced        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All bookkeeping (idle queue, live count, closed flag) sits behind one
//! mutex. A semaphore with `max_sessions` permits bounds the number of
//! concurrent leases and queues waiters in FIFO order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::connector::{CommandResult, ConnectError, Connector, InvokeError};
use super::handle::RemoteSession;
use crate::command::CommandTemplate;
use crate::metrics::{
    POOL_BORROWED_SESSIONS, POOL_IDLE_SESSIONS, POOL_LIVE_SESSIONS, SESSIONS_DISCARDED_TOTAL,
    SESSIONS_OPENED_TOTAL, SESSION_ACQUIRE_DURATION,
};

/// Pool sizing and supervision settings
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Sessions opened at startup and kept alive by the supervisor
    pub min_sessions: usize,
    /// Hard upper bound on live sessions
    pub max_sessions: usize,
    /// Idle sessions above `min_sessions` older than this are closed
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            max_sessions: 1,
            idle_timeout: None,
        }
    }
}

/// Statistics about the pool state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Sessions waiting in the idle queue
    pub idle: usize,
    /// Sessions currently leased (or being opened for a lease)
    pub borrowed: usize,
    /// All sessions the pool is accountable for
    pub live: usize,
    pub min_sessions: usize,
    pub max_sessions: usize,
    pub closed: bool,
}

/// Failure to obtain a session
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no session became available within {0:?}")]
    Timeout(Duration),
    #[error("session pool is shut down")]
    Closed,
    #[error("failed to open a session on demand: {0}")]
    Connect(#[from] ConnectError),
}

/// The pool could not be brought up
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("invalid pool bounds: min_sessions={min}, max_sessions={max}")]
    InvalidBounds { min: usize, max: usize },
    #[error("cannot open {required} session(s) to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        required: usize,
        #[source]
        source: ConnectError,
    },
}

struct PoolState {
    idle: VecDeque<RemoteSession>,
    live: usize,
    closed: bool,
    /// Set while `shutdown` waits for leases; checked-in sessions are parked
    /// in `retired` for it to close
    draining: bool,
    retired: Vec<RemoteSession>,
}

impl PoolState {
    fn stats(&self, config: &PoolConfig) -> PoolStats {
        PoolStats {
            idle: self.idle.len(),
            borrowed: self.live.saturating_sub(self.idle.len()),
            live: self.live,
            min_sessions: config.min_sessions,
            max_sessions: config.max_sessions,
            closed: self.closed,
        }
    }

    fn publish(&self) {
        POOL_LIVE_SESSIONS.set(self.live as f64);
        POOL_IDLE_SESSIONS.set(self.idle.len() as f64);
        POOL_BORROWED_SESSIONS.set(self.live.saturating_sub(self.idle.len()) as f64);
    }
}

/// Bounded pool of remote sessions
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    permits: Arc<Semaphore>,
    available: Notify,
    /// Signalled whenever the live count drops after shutdown began
    drained: Notify,
}

/// A live-count slot claimed ahead of an open; released again on drop unless committed
struct SlotReservation<'a> {
    pool: &'a SessionPool,
    armed: bool,
}

impl SlotReservation<'_> {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            state.live = state.live.saturating_sub(1);
            state.publish();
            drop(state);
            self.pool.available.notify_one();
            self.pool.drained.notify_waiters();
        }
    }
}

enum Step {
    Ready(RemoteSession),
    Open,
    Wait,
    Closed,
}

impl SessionPool {
    /// Open `min_sessions` sessions and return the running pool
    ///
    /// Fails fast: if any open fails the others are dropped and the
    /// connection error is returned.
    pub async fn start(
        connector: Arc<dyn Connector>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, StartupError> {
        if config.max_sessions == 0 || config.min_sessions > config.max_sessions {
            return Err(StartupError::InvalidBounds {
                min: config.min_sessions,
                max: config.max_sessions,
            });
        }

        tracing::info!(
            endpoint = connector.endpoint(),
            min_sessions = config.min_sessions,
            max_sessions = config.max_sessions,
            "Opening session pool"
        );

        let opens = (0..config.min_sessions).map(|_| RemoteSession::open(connector.as_ref()));
        let sessions = try_join_all(opens)
            .await
            .map_err(|source| StartupError::Connect {
                endpoint: connector.endpoint().to_string(),
                required: config.min_sessions,
                source,
            })?;

        SESSIONS_OPENED_TOTAL.inc_by(sessions.len() as f64);

        let state = PoolState {
            live: sessions.len(),
            idle: sessions.into(),
            closed: false,
            draining: false,
            retired: Vec::new(),
        };
        state.publish();

        let pool = Arc::new(Self {
            permits: Arc::new(Semaphore::new(config.max_sessions)),
            connector,
            config,
            state: Mutex::new(state),
            available: Notify::new(),
            drained: Notify::new(),
        });

        tracing::info!(
            min_sessions = pool.config.min_sessions,
            max_sessions = pool.config.max_sessions,
            "Session pool opened"
        );

        Ok(pool)
    }

    /// Borrow a session, waiting at most `wait`
    ///
    /// Takes an idle session if there is one; otherwise opens a new one while
    /// the pool is below `max_sessions`; otherwise waits for a release.
    pub async fn acquire(self: &Arc<Self>, wait: Duration) -> Result<SessionLease, PoolError> {
        let start = Instant::now();
        let deadline = tokio::time::Instant::now() + wait;

        let permit = match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed),
            Err(_) => return Err(PoolError::Timeout(wait)),
        };

        let session = loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let step = {
                let mut state = self.state.lock();
                let step = if state.closed {
                    Step::Closed
                } else if let Some(session) = state.idle.pop_front() {
                    Step::Ready(session)
                } else if state.live < self.config.max_sessions {
                    state.live += 1;
                    Step::Open
                } else {
                    Step::Wait
                };
                state.publish();
                step
            };

            match step {
                Step::Ready(session) => break session,
                Step::Closed => return Err(PoolError::Closed),
                Step::Open => {
                    let reservation = SlotReservation {
                        pool: &**self,
                        armed: true,
                    };
                    let opened = tokio::time::timeout_at(
                        deadline,
                        RemoteSession::open(self.connector.as_ref()),
                    )
                    .await;
                    match opened {
                        Ok(Ok(session)) => {
                            reservation.commit();
                            SESSIONS_OPENED_TOTAL.inc();
                            tracing::info!(
                                session_id = %session.session_id,
                                "Opened additional session on demand"
                            );
                            break session;
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(error = %e, "On-demand session open failed");
                            return Err(PoolError::Connect(e));
                        }
                        Err(_) => return Err(PoolError::Timeout(wait)),
                    }
                }
                // Live count is at max while a replacement is in flight or
                // a discarded session is being accounted for.
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(PoolError::Timeout(wait));
                    }
                }
            }
        };

        SESSION_ACQUIRE_DURATION.observe(start.elapsed().as_secs_f64());
        tracing::debug!(
            session_id = %session.session_id,
            waited_ms = start.elapsed().as_millis() as u64,
            "Session acquired"
        );

        Ok(SessionLease {
            session_id: session.session_id.clone(),
            session: Some(session),
            pool: Arc::clone(self),
            _permit: permit,
        })
    }

    /// Return a session to the pool
    ///
    /// Equivalent to dropping the lease.
    pub fn release(&self, lease: SessionLease) {
        drop(lease);
    }

    /// Put a session back, or discard it if it is broken or the pool is closed
    fn checkin(self: &Arc<Self>, mut session: RemoteSession) {
        let mut state = self.state.lock();

        if !state.closed && session.is_usable() {
            session.touch();
            let session_id = session.session_id.clone();
            state.idle.push_back(session);
            state.publish();
            drop(state);
            self.available.notify_one();
            tracing::debug!(session_id = %session_id, "Session released");
            return;
        }

        state.live = state.live.saturating_sub(1);
        state.publish();
        let replace = !state.closed;
        if state.draining {
            state.retired.push(session);
            drop(state);
            self.drained.notify_waiters();
            return;
        }
        drop(state);
        self.available.notify_one();
        self.drained.notify_waiters();

        if replace {
            SESSIONS_DISCARDED_TOTAL.inc();
            tracing::warn!(
                session_id = %session.session_id,
                state = ?session.state(),
                "Discarding unusable session"
            );
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime to close on; dropping the channel tears it down.
            return;
        };

        runtime.spawn(async move {
            let session_id = session.session_id.clone();
            if let Err(e) = session.close().await {
                tracing::debug!(session_id = %session_id, error = %e, "Session close failed");
            }
        });

        if replace {
            let pool = Arc::clone(self);
            runtime.spawn(async move {
                match pool.open_idle().await {
                    Ok(true) => tracing::info!("Replacement session opened"),
                    Ok(false) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to open replacement session"),
                }
            });
        }
    }

    /// Claim a live-count slot if the pool has room
    fn reserve_slot(&self) -> Option<SlotReservation<'_>> {
        let mut state = self.state.lock();
        if state.closed || state.live >= self.config.max_sessions {
            return None;
        }
        state.live += 1;
        state.publish();
        Some(SlotReservation {
            pool: self,
            armed: true,
        })
    }

    /// Open one session straight into the idle queue
    ///
    /// Returns `Ok(false)` when the pool is closed or already at max.
    async fn open_idle(&self) -> Result<bool, ConnectError> {
        let Some(reservation) = self.reserve_slot() else {
            return Ok(false);
        };

        let session = RemoteSession::open(self.connector.as_ref()).await?;
        reservation.commit();
        SESSIONS_OPENED_TOTAL.inc();

        let leftover = {
            let mut state = self.state.lock();
            if !state.closed {
                state.idle.push_back(session);
                state.publish();
                None
            } else {
                state.live = state.live.saturating_sub(1);
                state.publish();
                if state.draining {
                    state.retired.push(session);
                    drop(state);
                    self.drained.notify_waiters();
                    return Ok(false);
                }
                Some(session)
            }
        };

        match leftover {
            Some(session) => {
                if let Err(e) = session.close().await {
                    tracing::debug!(error = %e, "Session close failed");
                }
                Ok(false)
            }
            None => {
                self.available.notify_one();
                Ok(true)
            }
        }
    }

    /// Top the pool back up to `min_sessions`
    ///
    /// Called periodically by the background supervisor task.
    pub async fn replenish(&self) -> Result<usize, ConnectError> {
        let mut opened = 0;
        loop {
            let needed = {
                let state = self.state.lock();
                !state.closed && state.live < self.config.min_sessions
            };
            if !needed {
                return Ok(opened);
            }
            match self.open_idle().await? {
                true => opened += 1,
                false => return Ok(opened),
            }
        }
    }

    /// Close idle sessions above `min_sessions` that sat unused past `idle_timeout`
    pub async fn reap_idle(&self) -> usize {
        let Some(idle_timeout) = self.config.idle_timeout else {
            return 0;
        };

        let expired: Vec<RemoteSession> = {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(session) = state.idle.pop_front() {
                if state.live > self.config.min_sessions && session.idle_for() > idle_timeout {
                    state.live -= 1;
                    expired.push(session);
                } else {
                    kept.push_back(session);
                }
            }
            state.idle = kept;
            state.publish();
            expired
        };

        let count = expired.len();
        for session in expired {
            let session_id = session.session_id.clone();
            tracing::debug!(session_id = %session_id, "Closing idle session");
            if let Err(e) = session.close().await {
                tracing::warn!(
                    session_id = %session_id,
                    error = %e,
                    "Failed to close idle session"
                );
            }
        }
        count
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats(&self.config)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Graceful shutdown: close every session
    ///
    /// Idle sessions are closed at once. Leased sessions are closed as their
    /// leases come back, for at most `grace`; anything still leased after
    /// that is logged and closed whenever it returns. Close failures are
    /// logged, never returned.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!(grace_ms = grace.as_millis() as u64, "Shutting down session pool");
        let deadline = tokio::time::Instant::now() + grace;

        let idle: Vec<RemoteSession> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.draining = true;
            let drained: Vec<RemoteSession> = state.idle.drain(..).collect();
            state.live = state.live.saturating_sub(drained.len());
            state.publish();
            drained
        };

        self.permits.close();
        self.available.notify_waiters();
        close_all(idle).await;

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (retired, live) = {
                let mut state = self.state.lock();
                (std::mem::take(&mut state.retired), state.live)
            };
            close_all(retired).await;
            if live == 0 {
                break;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                tracing::warn!(leased = live, "Shutdown grace elapsed with sessions still leased");
                break;
            }
        }

        let retired = {
            let mut state = self.state.lock();
            state.draining = false;
            std::mem::take(&mut state.retired)
        };
        close_all(retired).await;

        tracing::info!(leased = self.stats().live, "Session pool shut down");
    }

    /// Start the background supervisor task
    ///
    /// Keeps the pool at `min_sessions` and closes expired idle sessions.
    /// Exits once the pool is shut down.
    pub fn start_supervisor(pool: Arc<SessionPool>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if pool.is_closed() {
                    break;
                }

                if let Err(e) = pool.replenish().await {
                    tracing::warn!(error = %e, "Pool replenish failed");
                }
                let reaped = pool.reap_idle().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "Closed idle sessions");
                }
            }
        })
    }
}

async fn close_all(sessions: Vec<RemoteSession>) {
    for session in sessions {
        let session_id = session.session_id.clone();
        if let Err(e) = session.close().await {
            tracing::warn!(
                session_id = %session_id,
                error = %e,
                "Failed to close session during shutdown"
            );
        }
    }
}

/// Exclusive use of one pooled session
///
/// Dropping the lease returns the session to the pool; a session left
/// broken by its last command is discarded and replaced instead.
pub struct SessionLease {
    session_id: String,
    session: Option<RemoteSession>,
    pool: Arc<SessionPool>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Run a template on the leased session
    pub async fn invoke(
        &mut self,
        template: &CommandTemplate,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandResult, InvokeError> {
        match self.session.as_mut() {
            Some(session) => session.invoke(template, args, timeout).await,
            None => Err(InvokeError::Connection("lease already released".to_string())),
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.checkin(session);
        }
    }
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("session", &self.session)
            .finish()
    }
}
