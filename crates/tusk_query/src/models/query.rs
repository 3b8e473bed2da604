//! Query execution models.

use crate::error::{CancelReason, TuskError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A single result row, one JSON value per column.
pub type Row = Vec<serde_json::Value>;

/// Type of SQL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    /// SELECT, WITH, VALUES, TABLE, SHOW
    Select,
    /// INSERT operation
    Insert,
    /// UPDATE operation
    Update,
    /// DELETE operation
    Delete,
    /// MERGE operation
    Merge,
    /// DDL, COPY, or other operations
    Other,
}

impl QueryType {
    /// Whether the statement modifies table data (and reports a row count).
    pub fn mutates_data(&self) -> bool {
        matches!(self, Self::Insert | Self::Update | Self::Delete | Self::Merge)
    }
}

/// Column metadata from query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name
    pub name: String,
    /// PostgreSQL type OID
    pub type_oid: u32,
    /// Human-readable type name
    pub type_name: String,
}

/// Events streamed from the execution coordinator to the consumer.
///
/// Per execution the sequence is: at most one `Columns` (always first), any number of `Rows`
/// and `Progress`, then exactly one of `Complete` or `Error`.
#[derive(Debug)]
pub enum QueryEvent {
    /// Column metadata for statements that return a result set.
    Columns {
        /// Result columns, in order.
        columns: Vec<ColumnInfo>,
    },
    /// A batch of rows in server order.
    Rows {
        /// The batch.
        rows: Vec<Row>,
        /// Rows delivered so far, including this batch.
        total_so_far: usize,
    },
    /// Liveness update for large result sets.
    Progress {
        /// Rows received from the server so far.
        rows_so_far: usize,
    },
    /// Successful terminal event.
    Complete {
        /// Total rows delivered across all `Rows` events.
        total_rows: usize,
        /// Wall-clock execution time.
        execution_time_ms: u64,
        /// Rows affected, for data-modifying statements only.
        rows_affected: Option<u64>,
    },
    /// Failed terminal event.
    Error {
        /// What went wrong.
        error: TuskError,
    },
}

impl QueryEvent {
    /// Create a columns event.
    pub fn columns(columns: Vec<ColumnInfo>) -> Self {
        Self::Columns { columns }
    }

    /// Create a rows event. Takes ownership of the batch.
    pub fn rows(rows: Vec<Row>, total_so_far: usize) -> Self {
        Self::Rows { rows, total_so_far }
    }

    /// Create a progress event.
    pub fn progress(rows_so_far: usize) -> Self {
        Self::Progress { rows_so_far }
    }

    /// Create a completion event.
    pub fn complete(total_rows: usize, execution_time_ms: u64, rows_affected: Option<u64>) -> Self {
        Self::Complete { total_rows, execution_time_ms, rows_affected }
    }

    /// Create an error event.
    pub fn error(error: TuskError) -> Self {
        Self::Error { error }
    }

    /// Whether this event ends the execution.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Columns { .. } => "columns",
            Self::Rows { .. } => "rows",
            Self::Progress { .. } => "progress",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

const RUNNING: u8 = 0;
const CANCELLING: u8 = 1;
const TERMINATED: u8 = 2;

/// Handle for tracking and cancelling one in-flight execution.
///
/// Shared between the coordinator running the statement, the execution registry and the
/// consumer's stream. A cancel request and the coordinator's terminal transition race on a
/// single atomic state, so exactly one of them wins.
pub struct QueryHandle {
    /// Unique execution identifier
    id: Uuid,
    /// Profile the execution runs against
    profile_id: Uuid,
    /// The SQL being executed
    sql: String,
    /// Cancellation token checked at every checkpoint
    cancel_token: CancellationToken,
    /// First cancellation reason wins
    cancel_reason: OnceLock<CancelReason>,
    /// RUNNING, CANCELLING or TERMINATED
    state: AtomicU8,
    /// Execution start time
    started_at: DateTime<Utc>,
}

impl QueryHandle {
    /// Create a new query handle.
    pub fn new(profile_id: Uuid, sql: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile_id,
            sql: sql.into(),
            cancel_token: CancellationToken::new(),
            cancel_reason: OnceLock::new(),
            state: AtomicU8::new(RUNNING),
            started_at: Utc::now(),
        }
    }

    /// Get the unique execution identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the profile this execution runs against.
    pub fn profile_id(&self) -> Uuid {
        self.profile_id
    }

    /// Get the SQL being executed.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Get when execution started.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Request cancellation of the execution.
    ///
    /// Returns `false` without doing anything when the execution already terminated or a
    /// cancellation is already pending.
    pub fn cancel(&self) -> bool {
        self.cancel_with_reason(CancelReason::Requested)
    }

    /// Request cancellation with an explicit reason.
    pub fn cancel_with_reason(&self, reason: CancelReason) -> bool {
        let claimed = self
            .state
            .compare_exchange(RUNNING, CANCELLING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !claimed {
            return false;
        }
        // Only the winner of the exchange gets here
        let _ = self.cancel_reason.set(reason);
        tracing::debug!(query_id = %self.id, %reason, "Cancellation requested");
        self.cancel_token.cancel();
        true
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Why the execution was cancelled, if it was.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason.get().copied()
    }

    /// Wait for cancellation.
    pub async fn cancelled(&self) {
        self.cancel_token.cancelled().await
    }

    /// Claim the terminal state. Later cancel requests are no-ops.
    ///
    /// Returns the cancellation reason if a cancel won the race before this call, in which
    /// case the execution must end as cancelled.
    pub fn terminate(&self) -> Option<CancelReason> {
        match self.state.swap(TERMINATED, Ordering::AcqRel) {
            CANCELLING => Some(self.cancel_reason().unwrap_or(CancelReason::Requested)),
            _ => None,
        }
    }

    /// Whether the terminal state has been claimed.
    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) == TERMINATED
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("id", &self.id)
            .field("profile_id", &self.profile_id)
            .field("sql", &self.sql)
            .field("started_at", &self.started_at)
            .field("is_cancelled", &self.is_cancelled())
            .field("is_terminated", &self.is_terminated())
            .finish()
    }
}
