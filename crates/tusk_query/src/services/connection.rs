//! Per-profile connection pooling on top of `deadpool::managed`.
//!
//! - Bounded capacity; excess `acquire` calls wait in FIFO order up to the acquire timeout
//! - Leases are returned with a `ReleaseHealth`; broken sessions are detached so capacity
//!   frees up
//! - Sessions flagged for validation (after a cancel, or idle for a while) are pinged at checkout
//! - A background sweep discards sessions idle past the idle timeout and pings the ones idle
//!   past the validation age

use crate::error::TuskError;
use crate::models::PoolStatus;
use crate::services::session::{Connector, Session};

use deadpool::managed::{
    self, Metrics, Object, Pool, PoolError, RecycleError, RecycleResult, TimeoutType, Timeouts,
};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Lease state of a pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// In the pool, available for lease.
    Idle,
    /// Exclusively held by one execution.
    Leased,
    /// Unusable; never handed out again.
    Broken,
}

/// How a lease ended, decided by the execution that held it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseHealth {
    /// Protocol state is clean; reuse as-is.
    Healthy,
    /// Possibly mid-protocol (e.g. after a cancel); ping before the next lease.
    NeedsCheck,
    /// Transport or protocol failure; discard and free the capacity slot.
    Broken,
}

/// A session plus the bookkeeping the pool keeps for it.
pub struct SessionSlot {
    session: Box<dyn Session>,
    state: LeaseState,
    idle_since: Instant,
    checked_at: Instant,
    needs_check: AtomicBool,
}

impl SessionSlot {
    fn new(session: Box<dyn Session>) -> Self {
        Self {
            session,
            state: LeaseState::Idle,
            idle_since: Instant::now(),
            checked_at: Instant::now(),
            needs_check: AtomicBool::new(false),
        }
    }
}

/// Capacity and timing limits of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Maximum live sessions.
    pub max_size: usize,
    /// How long `acquire` waits for a free session.
    pub acquire_timeout: Duration,
    /// Bound on opening or validating one session.
    pub connect_timeout: Duration,
    /// Idle sessions older than this are discarded.
    pub idle_timeout: Duration,
    /// Idle sessions older than this are pinged before their next lease.
    pub validate_after: Duration,
}

impl PoolLimits {
    /// Limits from engine settings and a profile's own overrides.
    pub fn new(
        settings: &crate::config::PoolSettings,
        max_size: Option<usize>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            max_size: max_size.unwrap_or(settings.max_size),
            acquire_timeout: settings.acquire_timeout(),
            connect_timeout,
            idle_timeout: settings.idle_timeout(),
            validate_after: settings.validate_after(),
        }
    }
}

/// deadpool manager creating and recycling sessions of one profile.
pub struct SessionManager {
    connector: Arc<dyn Connector>,
    profile_id: Uuid,
    idle_timeout: Duration,
}

impl managed::Manager for SessionManager {
    type Type = SessionSlot;
    type Error = TuskError;

    async fn create(&self) -> Result<SessionSlot, TuskError> {
        let session = self.connector.connect().await?;
        tracing::debug!(profile_id = %self.profile_id, "Created pooled session");
        Ok(SessionSlot::new(session))
    }

    async fn recycle(
        &self,
        slot: &mut SessionSlot,
        _metrics: &Metrics,
    ) -> RecycleResult<TuskError> {
        if slot.session.is_closed() {
            return Err(RecycleError::Message("Session closed by server".into()));
        }
        if slot.idle_since.elapsed() >= self.idle_timeout {
            return Err(RecycleError::Message("Session exceeded idle timeout".into()));
        }

        // A slot still marked Leased was dropped without an explicit release.
        let unreleased = slot.state == LeaseState::Leased;
        if slot.needs_check.swap(false, Ordering::AcqRel) || unreleased {
            if let Err(e) = slot.session.ping().await {
                tracing::debug!(
                    profile_id = %self.profile_id,
                    error = %e,
                    "Discarding session that failed validation"
                );
                return Err(RecycleError::Backend(e));
            }
            slot.checked_at = Instant::now();
        }
        Ok(())
    }
}

/// A bounded pool of sessions for a single connection profile.
pub struct ConnectionPool {
    profile_id: Uuid,
    pool: Pool<SessionManager>,
    limits: PoolLimits,
}

impl ConnectionPool {
    /// Create an empty pool. Sessions are opened lazily by `acquire`.
    pub fn new(
        profile_id: Uuid,
        connector: Arc<dyn Connector>,
        limits: PoolLimits,
    ) -> Result<Self, TuskError> {
        let manager = SessionManager { connector, profile_id, idle_timeout: limits.idle_timeout };

        let pool = Pool::builder(manager)
            .max_size(limits.max_size)
            .wait_timeout(Some(limits.acquire_timeout))
            .create_timeout(Some(limits.connect_timeout))
            .recycle_timeout(Some(limits.connect_timeout))
            .runtime(deadpool::Runtime::Tokio1)
            .build()
            .map_err(|e| TuskError::internal(format!("Failed to create pool: {e}")))?;

        tracing::info!(%profile_id, max_size = limits.max_size, "Connection pool created");

        Ok(Self { profile_id, pool, limits })
    }

    /// Profile this pool serves.
    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    /// Lease a session, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection, TuskError> {
        let mut object = self.pool.get().await.map_err(|e| self.map_pool_error(e))?;
        object.state = LeaseState::Leased;

        tracing::trace!(profile_id = %self.profile_id, "Session leased");
        Ok(PooledConnection { object, profile_id: self.profile_id })
    }

    fn map_pool_error(&self, error: PoolError<TuskError>) -> TuskError {
        match error {
            PoolError::Timeout(TimeoutType::Wait) => {
                // This caller has already left the queue
                let waiting = self.pool.status().waiting + 1;
                tracing::warn!(
                    profile_id = %self.profile_id,
                    waiting,
                    "Timed out waiting for a connection"
                );
                TuskError::pool_timeout(
                    format!(
                        "No connection available after {}ms (pool size {})",
                        self.limits.acquire_timeout.as_millis(),
                        self.limits.max_size
                    ),
                    waiting,
                )
            }
            PoolError::Timeout(_) => TuskError::connection(format!(
                "Timed out after {}s connecting to the server",
                self.limits.connect_timeout.as_secs()
            )),
            PoolError::Backend(e) => e,
            PoolError::Closed => TuskError::connection("Connection pool is closed"),
            other => TuskError::internal(format!("Connection pool error: {other}")),
        }
    }

    /// Current pool status.
    pub fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        PoolStatus {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }

    /// Discard idle sessions past the idle timeout and flag for validation those that have
    /// been neither used nor checked for the validation age.
    ///
    /// Returns the number of discarded sessions. Leased sessions are not visited.
    pub fn prune_idle(&self) -> usize {
        let flagged = Cell::new(0usize);
        let result = self.pool.retain(|slot, _| {
            let idle_for = slot.idle_since.elapsed();
            if slot.session.is_closed() || idle_for >= self.limits.idle_timeout {
                return false;
            }
            let quiet_for = idle_for.min(slot.checked_at.elapsed());
            if quiet_for >= self.limits.validate_after
                && !slot.needs_check.swap(true, Ordering::AcqRel)
            {
                flagged.set(flagged.get() + 1);
            }
            true
        });

        let removed = result.removed.len();
        if removed > 0 || flagged.get() > 0 {
            tracing::debug!(
                profile_id = %self.profile_id,
                removed,
                flagged = flagged.get(),
                "Pruned idle sessions"
            );
        }
        removed
    }

    /// Ping the idle sessions flagged for validation, discarding those that fail.
    ///
    /// Idle sessions are checked out without waiting and returned together, so the sweep
    /// backs off while executions hold the capacity. A session that fails is replaced by the
    /// pool during the same checkout. Returns how many sessions were checked out.
    pub async fn validate_idle(&self) -> usize {
        let flagged = Cell::new(0usize);
        self.pool.retain(|slot, _| {
            if slot.needs_check.load(Ordering::Acquire) {
                flagged.set(flagged.get() + 1);
            }
            true
        });
        if flagged.get() == 0 {
            return 0;
        }

        let timeouts = Timeouts {
            wait: Some(Duration::ZERO),
            create: Some(self.limits.connect_timeout),
            recycle: Some(self.limits.connect_timeout),
        };
        let mut held = Vec::new();
        for _ in 0..self.pool.status().available {
            match self.pool.timeout_get(&timeouts).await {
                Ok(object) => held.push(object),
                Err(e) => {
                    tracing::debug!(
                        profile_id = %self.profile_id,
                        error = %e,
                        "Validation sweep stopped"
                    );
                    break;
                }
            }
        }

        let checked = held.len();
        drop(held);
        tracing::debug!(
            profile_id = %self.profile_id,
            flagged = flagged.get(),
            checked,
            "Validated idle sessions"
        );
        checked
    }

    /// Run `prune_idle` and `validate_idle` every `interval` until the pool is closed or
    /// dropped.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        interval: Duration,
        runtime: &Handle,
    ) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if pool.is_closed() {
                    break;
                }
                pool.prune_idle();
                pool.validate_idle().await;
            }
        })
    }

    /// Close the pool. Idle sessions are dropped; leased ones are dropped on release.
    pub fn close(&self) {
        self.pool.close();
        tracing::info!(profile_id = %self.profile_id, "Connection pool closed");
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("profile_id", &self.profile_id)
            .field("status", &self.status())
            .finish()
    }
}

/// An exclusively leased session.
///
/// Return it with [`release`](Self::release). Dropping it without a release returns the
/// session to the pool, where it is validated before being leased again.
pub struct PooledConnection {
    object: Object<SessionManager>,
    profile_id: Uuid,
}

impl PooledConnection {
    /// Profile of the pool this lease came from.
    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    /// Current lease state.
    pub fn state(&self) -> LeaseState {
        self.object.state
    }

    /// The leased session.
    pub fn session_mut(&mut self) -> &mut dyn Session {
        self.object.session.as_mut()
    }

    /// Return the session to the pool.
    pub fn release(mut self, health: ReleaseHealth) {
        match health {
            ReleaseHealth::Healthy | ReleaseHealth::NeedsCheck => {
                self.object.state = LeaseState::Idle;
                self.object.idle_since = Instant::now();
                if health == ReleaseHealth::NeedsCheck {
                    self.object.needs_check.store(true, Ordering::Release);
                }
            }
            ReleaseHealth::Broken => {
                self.object.state = LeaseState::Broken;
                // Detaching decrements the pool size so a replacement can be created.
                let slot = Object::take(self.object);
                drop(slot);
                tracing::debug!(profile_id = %self.profile_id, "Discarded broken session");
            }
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("profile_id", &self.profile_id)
            .field("state", &self.object.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedConnector, Script};

    fn limits(max_size: usize) -> PoolLimits {
        PoolLimits {
            max_size,
            acquire_timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            validate_after: Duration::from_secs(60),
        }
    }

    fn pool(connector: &Arc<ScriptedConnector>, limits: PoolLimits) -> ConnectionPool {
        ConnectionPool::new(Uuid::new_v4(), connector.clone(), limits).unwrap()
    }

    #[tokio::test]
    async fn test_healthy_release_reuses_session() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(2));

        let conn = pool.acquire().await.unwrap();
        assert_eq!(conn.state(), LeaseState::Leased);
        assert_eq!(pool.status().leased(), 1);
        conn.release(ReleaseHealth::Healthy);

        let conn = pool.acquire().await.unwrap();
        conn.release(ReleaseHealth::Healthy);

        assert_eq!(connector.stats().connects(), 1);
        assert_eq!(connector.stats().pings(), 0);
        assert_eq!(pool.status().size, 1);
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn test_broken_release_frees_capacity() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));

        let conn = pool.acquire().await.unwrap();
        conn.release(ReleaseHealth::Broken);
        assert_eq!(pool.status().size, 0);

        let conn = pool.acquire().await.unwrap();
        conn.release(ReleaseHealth::Healthy);
        assert_eq!(connector.stats().connects(), 2);
    }

    #[tokio::test]
    async fn test_needs_check_pings_before_next_lease() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));

        pool.acquire().await.unwrap().release(ReleaseHealth::NeedsCheck);
        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);
        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);

        assert_eq!(connector.stats().pings(), 1);
        assert_eq!(connector.stats().connects(), 1);
    }

    #[tokio::test]
    async fn test_failed_validation_replaces_session() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));

        pool.acquire().await.unwrap().release(ReleaseHealth::NeedsCheck);
        connector.fail_pings(true);

        let conn = pool.acquire().await.unwrap();
        conn.release(ReleaseHealth::Healthy);
        assert_eq!(connector.stats().connects(), 2);
    }

    #[tokio::test]
    async fn test_dropped_lease_is_validated() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));

        drop(pool.acquire().await.unwrap());
        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);

        assert_eq!(connector.stats().pings(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out_with_waiters() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, TuskError::PoolTimeout { waiting, .. } if waiting >= 1));
        held.release(ReleaseHealth::Healthy);
    }

    #[tokio::test]
    async fn test_waiter_gets_released_session() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = Arc::new(pool(&connector, limits(1)));

        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire().await.map(|c| c.release(ReleaseHealth::Healthy))
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().waiting, 1);
        held.release(ReleaseHealth::Healthy);

        waiter.await.unwrap().unwrap();
        assert_eq!(connector.stats().connects(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_surfaces_backend_error() {
        let connector = ScriptedConnector::new(Script::command(1));
        connector.fail_connects(true);
        let pool = pool(&connector, limits(1));

        let err = pool.acquire().await.unwrap_err();
        assert!(err.is_connection_lost());
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test]
    async fn test_prune_discards_expired_and_flags_stale() {
        let connector = ScriptedConnector::new(Script::command(1));
        let mut short = limits(2);
        short.validate_after = Duration::from_millis(10);
        short.idle_timeout = Duration::from_millis(80);
        let pool = pool(&connector, short);

        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.prune_idle(), 0);
        assert_eq!(pool.status().size, 1);

        // Flagged sessions are pinged on their next lease
        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);
        assert_eq!(connector.stats().pings(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.prune_idle(), 1);
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test]
    async fn test_sweep_pings_stale_idle_sessions() {
        let connector = ScriptedConnector::new(Script::command(1));
        let mut short = limits(2);
        short.validate_after = Duration::from_millis(10);
        let pool = pool(&connector, short);

        assert_eq!(pool.validate_idle().await, 0);
        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.prune_idle();

        assert_eq!(pool.validate_idle().await, 1);
        assert_eq!(connector.stats().pings(), 1);
        assert_eq!(pool.status().available, 1);

        // Just checked, so the next sweep leaves it alone
        pool.prune_idle();
        assert_eq!(pool.validate_idle().await, 0);
        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);
        assert_eq!(connector.stats().pings(), 1);
        assert_eq!(connector.stats().connects(), 1);
    }

    #[tokio::test]
    async fn test_sweep_replaces_session_that_fails_ping() {
        let connector = ScriptedConnector::new(Script::command(1));
        let mut short = limits(1);
        short.validate_after = Duration::from_millis(10);
        let pool = pool(&connector, short);

        pool.acquire().await.unwrap().release(ReleaseHealth::Healthy);
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.prune_idle();
        connector.fail_pings(true);

        pool.validate_idle().await;
        assert_eq!(connector.stats().pings(), 1);
        assert_eq!(connector.stats().connects(), 2);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn test_sweep_skips_leased_sessions() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));

        let held = pool.acquire().await.unwrap();
        held.release(ReleaseHealth::NeedsCheck);
        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.validate_idle().await, 0);
        held.release(ReleaseHealth::Healthy);
        assert_eq!(connector.stats().pings(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_acquire() {
        let connector = ScriptedConnector::new(Script::command(1));
        let pool = pool(&connector, limits(1));
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.acquire().await.is_err());
    }
}
