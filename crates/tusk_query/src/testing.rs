//! Scripted in-process backend for driving the pool and coordinator without a server.

use crate::error::TuskError;
use crate::models::{ColumnInfo, ConnectionProfile};
use crate::services::credentials::{Credentials, CredentialsProvider};
use crate::services::session::{
    Connector, ConnectorFactory, ResultStream, ServerCancel, ServerMessage, Session,
};

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type ErrorFn = Arc<dyn Fn() -> TuskError + Send + Sync>;

/// What the server does after the scripted rows.
#[derive(Clone)]
pub(crate) enum Tail {
    /// Command completion.
    Done,
    /// Never answers again.
    Hang,
    /// Transport dies.
    Disconnect,
    /// Server error mid-stream.
    Fail(ErrorFn),
}

/// Scripted server behavior for one statement.
#[derive(Clone)]
pub(crate) enum Script {
    /// `count` rows of (id int4, name text), then `tail`.
    Rows { count: usize, tail: Tail },
    /// A command without a result set.
    Command { rows_affected: u64 },
    /// Rejected before any result is produced.
    Reject(ErrorFn),
    /// Accepted, but no response ever arrives.
    Stall,
}

impl Script {
    pub(crate) fn rows(count: usize) -> Self {
        Self::Rows { count, tail: Tail::Done }
    }

    pub(crate) fn rows_then_hang(count: usize) -> Self {
        Self::Rows { count, tail: Tail::Hang }
    }

    pub(crate) fn rows_then_disconnect(count: usize) -> Self {
        Self::Rows { count, tail: Tail::Disconnect }
    }

    pub(crate) fn rows_then_error(
        count: usize,
        error: impl Fn() -> TuskError + Send + Sync + 'static,
    ) -> Self {
        Self::Rows { count, tail: Tail::Fail(Arc::new(error)) }
    }

    pub(crate) fn command(rows_affected: u64) -> Self {
        Self::Command { rows_affected }
    }

    pub(crate) fn reject(error: impl Fn() -> TuskError + Send + Sync + 'static) -> Self {
        Self::Reject(Arc::new(error))
    }

    pub(crate) fn syntax_error(position: usize) -> Self {
        Self::reject(move || {
            TuskError::query(
                "syntax error at or near \"SELEC\"",
                None,
                None,
                Some(position),
                Some("42601".to_string()),
            )
        })
    }
}

/// Counters observed by tests.
#[derive(Debug, Default)]
pub(crate) struct Stats {
    connects: AtomicUsize,
    executes: AtomicUsize,
    pings: AtomicUsize,
    server_cancels: AtomicUsize,
    rows_pulled: AtomicUsize,
}

impl Stats {
    pub(crate) fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub(crate) fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub(crate) fn server_cancels(&self) -> usize {
        self.server_cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn rows_pulled(&self) -> usize {
        self.rows_pulled.load(Ordering::SeqCst)
    }
}

struct Shared {
    default: Script,
    scripts: Mutex<HashMap<String, Script>>,
    stats: Stats,
    fail_connects: AtomicBool,
    fail_pings: AtomicBool,
    fail_cancels: AtomicBool,
}

impl Shared {
    fn script_for(&self, sql: &str) -> Script {
        self.scripts.lock().get(sql.trim()).cloned().unwrap_or_else(|| self.default.clone())
    }
}

/// Connector handing out scripted sessions.
pub(crate) struct ScriptedConnector {
    shared: Arc<Shared>,
}

impl ScriptedConnector {
    /// Connector whose sessions answer every statement with `default`.
    pub(crate) fn new(default: Script) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                default,
                scripts: Mutex::new(HashMap::new()),
                stats: Stats::default(),
                fail_connects: AtomicBool::new(false),
                fail_pings: AtomicBool::new(false),
                fail_cancels: AtomicBool::new(false),
            }),
        })
    }

    /// Answer the exact statement `sql` with `script`.
    pub(crate) fn script(&self, sql: &str, script: Script) {
        self.shared.scripts.lock().insert(sql.trim().to_string(), script);
    }

    pub(crate) fn stats(&self) -> &Stats {
        &self.shared.stats
    }

    pub(crate) fn fail_connects(&self, fail: bool) {
        self.shared.fail_connects.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_cancels(&self, fail: bool) {
        self.shared.fail_cancels.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self) -> Result<Box<dyn Session>, TuskError> {
        if self.shared.fail_connects.load(Ordering::SeqCst) {
            return Err(TuskError::connection("could not connect to server: Connection refused"));
        }
        self.shared.stats.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
    closed: Arc<AtomicBool>,
}

fn scripted_columns() -> Vec<ColumnInfo> {
    vec![
        ColumnInfo { name: "id".to_string(), type_oid: 23, type_name: "int4".to_string() },
        ColumnInfo { name: "name".to_string(), type_oid: 25, type_name: "text".to_string() },
    ]
}

#[async_trait]
impl Session for ScriptedSession {
    async fn execute<'a>(&'a mut self, sql: &'a str) -> Result<ResultStream<'a>, TuskError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TuskError::connection("Connection to server lost"));
        }
        self.shared.stats.executes.fetch_add(1, Ordering::SeqCst);

        let (count, tail) = match self.shared.script_for(sql) {
            Script::Command { rows_affected } => {
                let done = ServerMessage::Done { rows_affected: Some(rows_affected) };
                let messages = stream::iter([Ok(done)]);
                return Ok(ResultStream { columns: Vec::new(), messages: messages.boxed() });
            }
            Script::Reject(error) => return Err(error()),
            Script::Stall => futures_util::future::pending().await,
            Script::Rows { count, tail } => (count, tail),
        };

        let shared = self.shared.clone();
        let closed = self.closed.clone();
        let messages = stream::unfold(Some(0usize), move |state| {
            let shared = shared.clone();
            let closed = closed.clone();
            let tail = tail.clone();
            async move {
                let next = state?;
                if next < count {
                    shared.stats.rows_pulled.fetch_add(1, Ordering::SeqCst);
                    let id = next + 1;
                    let row = vec![serde_json::json!(id), serde_json::json!(format!("row {id}"))];
                    return Some((Ok(ServerMessage::Row(row)), Some(next + 1)));
                }
                match tail {
                    Tail::Done => {
                        Some((Ok(ServerMessage::Done { rows_affected: Some(count as u64) }), None))
                    }
                    Tail::Hang => futures_util::future::pending().await,
                    Tail::Disconnect => {
                        closed.store(true, Ordering::SeqCst);
                        Some((Err(TuskError::connection("Connection to server lost")), None))
                    }
                    Tail::Fail(error) => Some((Err(error()), None)),
                }
            }
        });

        Ok(ResultStream { columns: scripted_columns(), messages: messages.boxed() })
    }

    async fn ping(&mut self) -> Result<(), TuskError> {
        self.shared.stats.pings.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_pings.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TuskError::connection("server closed the connection unexpectedly"));
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn cancel_handle(&self) -> Box<dyn ServerCancel> {
        Box::new(ScriptedCancel { shared: self.shared.clone() })
    }
}

struct ScriptedCancel {
    shared: Arc<Shared>,
}

#[async_trait]
impl ServerCancel for ScriptedCancel {
    async fn cancel(&self) -> Result<(), TuskError> {
        self.shared.stats.server_cancels.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_cancels.load(Ordering::SeqCst) {
            return Err(TuskError::connection("could not send cancel request"));
        }
        Ok(())
    }
}

/// Factory that hands every profile the same scripted connector and records credentials.
pub(crate) struct ScriptedFactory {
    connector: Arc<ScriptedConnector>,
    resolved: Mutex<Vec<Credentials>>,
}

impl ScriptedFactory {
    pub(crate) fn new(connector: Arc<ScriptedConnector>) -> Arc<Self> {
        Arc::new(Self { connector, resolved: Mutex::new(Vec::new()) })
    }

    pub(crate) fn resolved(&self) -> Vec<Credentials> {
        self.resolved.lock().clone()
    }
}

impl ConnectorFactory for ScriptedFactory {
    fn connector(
        &self,
        _profile: &ConnectionProfile,
        credentials: &Credentials,
    ) -> Result<Arc<dyn Connector>, TuskError> {
        self.resolved.lock().push(credentials.clone());
        Ok(self.connector.clone())
    }
}

/// Secret store whose keychain is locked.
pub(crate) struct LockedKeychain;

impl CredentialsProvider for LockedKeychain {
    fn store(&self, _key: &str, _value: &str) -> Result<(), TuskError> {
        Err(TuskError::keyring("The keychain is locked", Some("Unlock your keychain")))
    }

    fn get(&self, _key: &str) -> Result<Option<String>, TuskError> {
        Err(TuskError::keyring("The keychain is locked", Some("Unlock your keychain")))
    }

    fn delete(&self, _key: &str) -> Result<(), TuskError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "locked"
    }
}
