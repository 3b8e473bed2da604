//! Backend seams between the pool/coordinator and the database client.
//!
//! The pool leases `dyn Session`s created by a `dyn Connector`; the coordinator only ever talks
//! to a session through `execute`, `ping` and the out-of-band `ServerCancel`. The PostgreSQL
//! implementation lives in `services::postgres`.

use crate::error::TuskError;
use crate::models::{ColumnInfo, ConnectionProfile, Row};
use crate::services::credentials::Credentials;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;

/// One message read from the server while a statement runs.
#[derive(Debug)]
pub enum ServerMessage {
    /// A result row, in server order.
    Row(Row),
    /// End of results. Carries the command tag row count when the server reported one.
    Done {
        /// Row count from the command completion tag.
        rows_affected: Option<u64>,
    },
}

/// The server's response to an issued statement.
///
/// Rows are pulled lazily from `messages`; a consumer that stops polling stops reading from
/// the socket.
pub struct ResultStream<'a> {
    /// Result set description. Empty for command statements.
    pub columns: Vec<ColumnInfo>,
    /// Rows followed by exactly one `Done`, or an error.
    pub messages: BoxStream<'a, Result<ServerMessage, TuskError>>,
}

impl std::fmt::Debug for ResultStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream").field("columns", &self.columns).finish_non_exhaustive()
    }
}

/// A live, authenticated server session.
#[async_trait]
pub trait Session: Send + 'static {
    /// Issue a statement and return its result description and row stream.
    ///
    /// Server-side errors detected before any row is produced (syntax, missing relation)
    /// are returned here rather than through the stream.
    async fn execute<'a>(&'a mut self, sql: &'a str) -> Result<ResultStream<'a>, TuskError>;

    /// Lightweight liveness check.
    async fn ping(&mut self) -> Result<(), TuskError>;

    /// Whether the underlying transport is known to be closed.
    fn is_closed(&self) -> bool;

    /// Handle for the out-of-band cancel request of this session.
    fn cancel_handle(&self) -> Box<dyn ServerCancel>;
}

/// Out-of-band server cancellation.
///
/// Sent on a separate connection, keyed by the backend process of the session it came from.
#[async_trait]
pub trait ServerCancel: Send + Sync {
    /// Ask the server to abort whatever the session is currently running.
    async fn cancel(&self) -> Result<(), TuskError>;
}

/// Opens new sessions for one profile.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish and authenticate a new session.
    async fn connect(&self) -> Result<Box<dyn Session>, TuskError>;
}

/// Builds connectors from a profile and its resolved credentials.
pub trait ConnectorFactory: Send + Sync + 'static {
    /// Create the connector used by the pool of `profile`.
    fn connector(
        &self,
        profile: &ConnectionProfile,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connector>, TuskError>;
}
