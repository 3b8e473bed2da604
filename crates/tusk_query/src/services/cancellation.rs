//! Registry of in-flight executions, addressable by id for cancellation.

use crate::models::QueryHandle;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Active executions by id.
#[derive(Debug, Default)]
pub struct ExecutionRegistry {
    handles: RwLock<HashMap<Uuid, Arc<QueryHandle>>>,
}

impl ExecutionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an execution.
    pub fn register(&self, handle: Arc<QueryHandle>) {
        tracing::debug!(
            query_id = %handle.id(),
            profile_id = %handle.profile_id(),
            "Execution registered"
        );
        self.handles.write().insert(handle.id(), handle);
    }

    /// Look up an execution.
    pub fn get(&self, id: &Uuid) -> Option<Arc<QueryHandle>> {
        self.handles.read().get(id).cloned()
    }

    /// Stop tracking an execution.
    pub fn unregister(&self, id: &Uuid) -> Option<Arc<QueryHandle>> {
        let handle = self.handles.write().remove(id);
        if handle.is_some() {
            tracing::debug!(query_id = %id, "Execution unregistered");
        }
        handle
    }

    /// Cancel an execution.
    ///
    /// Returns `false` for unknown ids, executions that already terminated and executions
    /// that are already being cancelled.
    pub fn cancel(&self, id: &Uuid) -> bool {
        let Some(handle) = self.get(id) else {
            tracing::debug!(query_id = %id, "Cancel requested for unknown execution");
            return false;
        };
        handle.cancel()
    }

    /// Cancel every execution that has not terminated. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<_> = self.handles.read().values().cloned().collect();
        handles.iter().filter(|handle| handle.cancel()).count()
    }

    /// Ids of executions that have not produced their terminal event yet.
    pub fn active_ids(&self) -> Vec<Uuid> {
        self.handles
            .read()
            .values()
            .filter(|handle| !handle.is_terminated())
            .map(|handle| handle.id())
            .collect()
    }

    /// Number of tracked executions.
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    /// Whether no executions are tracked.
    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_idempotent_and_skips_terminated() {
        let registry = ExecutionRegistry::new();
        let running = Arc::new(QueryHandle::new(Uuid::new_v4(), "SELECT pg_sleep(60)"));
        let finished = Arc::new(QueryHandle::new(Uuid::new_v4(), "SELECT 1"));
        finished.terminate();
        registry.register(running.clone());
        registry.register(finished.clone());

        assert_eq!(registry.active_ids(), vec![running.id()]);
        assert!(registry.cancel(&running.id()));
        assert!(!registry.cancel(&running.id()));
        assert!(!registry.cancel(&finished.id()));
        assert!(!registry.cancel(&Uuid::new_v4()));

        assert!(registry.unregister(&running.id()).is_some());
        assert!(registry.unregister(&running.id()).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_all_signals_running_only() {
        let registry = ExecutionRegistry::new();
        for _ in 0..3 {
            registry.register(Arc::new(QueryHandle::new(Uuid::new_v4(), "SELECT 1")));
        }
        let done = Arc::new(QueryHandle::new(Uuid::new_v4(), "SELECT 1"));
        done.terminate();
        registry.register(done);

        assert_eq!(registry.cancel_all(), 3);
        assert_eq!(registry.cancel_all(), 0);
    }
}
