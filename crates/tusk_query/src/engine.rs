//! Consumer-facing entry point: submit statements, cancel them, observe and close pools.

use crate::config::{EngineConfig, ExecutionSettings};
use crate::error::{CancelReason, TuskError};
use crate::models::{PoolStatus, QueryEvent, QueryHandle};
use crate::services::cancellation::ExecutionRegistry;
use crate::services::channel::{event_channel, EventSink, QueryStream};
use crate::services::connection::{ConnectionPool, PoolLimits, PooledConnection};
use crate::services::credentials::CredentialService;
use crate::services::postgres::PgConnectorFactory;
use crate::services::profiles::ProfileStore;
use crate::services::query::QueryService;
use crate::services::session::ConnectorFactory;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use uuid::Uuid;

/// A pool together with the execution settings of the profile it serves.
#[derive(Clone)]
struct PoolEntry {
    pool: Arc<ConnectionPool>,
    execution: ExecutionSettings,
}

struct EngineInner {
    config: EngineConfig,
    profiles: Arc<dyn ProfileStore>,
    credentials: CredentialService,
    connectors: Arc<dyn ConnectorFactory>,
    pools: RwLock<HashMap<Uuid, PoolEntry>>,
    executions: ExecutionRegistry,
    runtime: Handle,
}

/// Query engine shared by every tab of the application.
///
/// Cheap to clone. Pools are created lazily, one per profile, on the first execution
/// against that profile.
#[derive(Clone)]
pub struct QueryEngine {
    inner: Arc<EngineInner>,
}

impl QueryEngine {
    /// Create an engine. Must be called from within a Tokio runtime; executions are spawned
    /// onto that runtime.
    pub fn new(
        config: EngineConfig,
        profiles: Arc<dyn ProfileStore>,
        credentials: CredentialService,
        connectors: Arc<dyn ConnectorFactory>,
    ) -> Result<Self, TuskError> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            TuskError::internal(format!("QueryEngine requires a Tokio runtime: {e}"))
        })?;

        tracing::info!(
            pool_max_size = config.pool.max_size,
            batch_size = config.execution.batch_size,
            credentials = credentials.provider_name(),
            "Query engine initialized"
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                profiles,
                credentials,
                connectors,
                pools: RwLock::new(HashMap::new()),
                executions: ExecutionRegistry::new(),
                runtime,
            }),
        })
    }

    /// Engine connecting to PostgreSQL, with credentials from the configured backend.
    ///
    /// Keep a clone of `connectors` to register forwarded endpoints with
    /// [`PgConnectorFactory::route_through`].
    pub fn postgres(
        config: EngineConfig,
        profiles: Arc<dyn ProfileStore>,
        connectors: Arc<PgConnectorFactory>,
    ) -> Result<Self, TuskError> {
        let credentials = CredentialService::from_backend(config.credentials);
        Self::new(config, profiles, credentials, connectors)
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// The credential service passwords are resolved through.
    pub fn credentials(&self) -> &CredentialService {
        &self.inner.credentials
    }

    /// Submit `sql` for execution against `profile_id`.
    ///
    /// Returns immediately. Every outcome, including pool timeouts and credential failures,
    /// arrives on the returned stream as its terminal event.
    pub fn execute(&self, profile_id: Uuid, sql: impl Into<String>) -> QueryStream {
        let handle = Arc::new(QueryHandle::new(profile_id, sql));
        let (sink, stream) =
            event_channel(handle.clone(), self.inner.config.execution.channel_capacity);
        self.inner.executions.register(handle.clone());

        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            inner.run_execution(&handle, sink).await;
            inner.executions.unregister(&handle.id());
        });

        stream
    }

    /// Cancel an execution. Returns `false` if it is unknown, already terminated or already
    /// being cancelled.
    pub fn cancel(&self, query_id: Uuid) -> bool {
        self.inner.executions.cancel(&query_id)
    }

    /// Executions that have not produced their terminal event yet.
    pub fn active_query_ids(&self) -> Vec<Uuid> {
        self.inner.executions.active_ids()
    }

    /// Status of the pool for a profile, if one is open.
    pub fn pool_status(&self, profile_id: &Uuid) -> Option<PoolStatus> {
        self.inner.pools.read().get(profile_id).map(|entry| entry.pool.status())
    }

    /// Status of every open pool.
    pub fn all_pool_statuses(&self) -> HashMap<Uuid, PoolStatus> {
        self.inner.pools.read().iter().map(|(id, entry)| (*id, entry.pool.status())).collect()
    }

    /// Close the pool of a profile. Running executions finish on their leased sessions, which
    /// are dropped on release. Returns whether a pool was open.
    pub fn disconnect(&self, profile_id: &Uuid) -> bool {
        match self.inner.pools.write().remove(profile_id) {
            Some(entry) => {
                entry.pool.close();
                true
            }
            None => false,
        }
    }

    /// Cancel every running execution and close every pool.
    pub fn close(&self) {
        let cancelled = self.inner.executions.cancel_all();
        let pools: Vec<_> = self.inner.pools.write().drain().map(|(_, entry)| entry.pool).collect();
        for pool in &pools {
            pool.close();
        }
        tracing::info!(cancelled, pools = pools.len(), "Query engine closed");
    }
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("pools", &self.inner.pools.read().len())
            .field("executions", &self.inner.executions.len())
            .finish()
    }
}

impl EngineInner {
    async fn run_execution(self: &Arc<Self>, handle: &QueryHandle, sink: EventSink) {
        match self.lease(handle).await {
            Ok((conn, settings)) => {
                QueryService::execute(conn, handle.sql(), handle, &settings, sink).await;
            }
            Err(error) => {
                tracing::debug!(
                    query_id = %handle.id(),
                    error = %error,
                    "Execution failed before it started"
                );
                handle.terminate();
                sink.finish(QueryEvent::error(error)).await;
            }
        }
    }

    /// Lease a session for `handle`, giving up early if the execution is cancelled while
    /// waiting in the acquire queue.
    async fn lease(
        self: &Arc<Self>,
        handle: &QueryHandle,
    ) -> Result<(PooledConnection, ExecutionSettings), TuskError> {
        let acquire = async {
            let entry = self.pool_for(handle.profile_id()).await?;
            let conn = entry.pool.acquire().await?;
            Ok::<_, TuskError>((conn, entry.execution))
        };

        tokio::select! {
            biased;
            _ = handle.cancelled() => Err(TuskError::query_cancelled(
                handle.id(),
                handle.cancel_reason().unwrap_or(CancelReason::Requested),
            )),
            leased = acquire => leased,
        }
    }

    /// Get the open pool for a profile, creating it on first use.
    async fn pool_for(self: &Arc<Self>, profile_id: Uuid) -> Result<PoolEntry, TuskError> {
        let existing = self.pools.read().get(&profile_id).cloned();
        if let Some(entry) = existing.filter(|entry| !entry.pool.is_closed()) {
            return Ok(entry);
        }

        let profile = self
            .profiles
            .profile(&profile_id)
            .ok_or_else(|| TuskError::config(format!("Unknown connection profile {profile_id}")))?;
        profile.validate().map_err(TuskError::config)?;

        // Keychain access blocks
        let inner = self.clone();
        let lookup = profile.clone();
        let credentials = tokio::task::spawn_blocking(move || inner.credentials.resolve(&lookup))
            .await
            .map_err(|e| TuskError::internal(format!("Credential lookup task failed: {e}")))??;

        let connector = self.connectors.connector(&profile, &credentials)?;
        let limits = PoolLimits::new(
            &self.config.pool,
            profile.options.pool_size,
            Duration::from_secs(u64::from(profile.options.connect_timeout_secs)),
        );
        let statement_timeout_secs = profile.options.statement_timeout_secs;
        let execution = self.config.execution.with_statement_timeout_secs(statement_timeout_secs);

        let mut pools = self.pools.write();
        if let Some(entry) = pools.get(&profile_id).filter(|entry| !entry.pool.is_closed()) {
            return Ok(entry.clone());
        }
        let pool = Arc::new(ConnectionPool::new(profile_id, connector, limits)?);
        drop(pool.spawn_maintenance(self.config.pool.maintenance_interval(), &self.runtime));

        let entry = PoolEntry { pool, execution };
        pools.insert(profile_id, entry.clone());
        Ok(entry)
    }
}
