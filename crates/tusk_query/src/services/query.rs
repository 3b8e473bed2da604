//! Execution coordinator: runs one statement on a leased session and turns the server's
//! response into the `QueryEvent` sequence.
//!
//! Event order per execution:
//! 1. `Columns` - only for statements that describe a result set
//! 2. `Rows` - batches of `batch_size`, plus a final partial batch
//! 3. `Progress` - every `progress_interval` rows once the large-result threshold is reached
//! 4. `Complete` or `Error` - exactly one, always last
//!
//! Cancellation is cooperative. It is observed before the statement is issued, before every
//! send and while waiting on the server or on channel capacity. Once the statement has been
//! issued, a cancel also sends the server's out-of-band cancel request and the session goes
//! back to the pool flagged for validation.

use crate::config::ExecutionSettings;
use crate::error::{CancelReason, TuskError};
use crate::models::{QueryEvent, QueryHandle, QueryType, Row};
use crate::services::channel::EventSink;
use crate::services::connection::{PooledConnection, ReleaseHealth};
use crate::services::session::{ResultStream, ServerMessage};

use futures_util::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::time::Instant;
use tokio::select;
use tokio::time::Instant as Deadline;

/// Longest SQL prefix written to logs.
const SQL_LOG_PREVIEW: usize = 120;

/// Why a run stopped early.
enum Stop {
    Cancelled(CancelReason),
    ConsumerGone,
    Failed(TuskError),
}

/// Successful end of a statement.
struct Finished {
    total_rows: usize,
    rows_affected: Option<u64>,
}

/// Where the statement is in its protocol exchange.
#[derive(Default)]
struct Progression {
    issued: bool,
    server_done: bool,
}

/// Service for executing statements with streaming results and cancellation.
pub struct QueryService;

impl QueryService {
    /// Execute `sql` on `conn`, delivering every outcome through `sink`.
    ///
    /// The handle is claimed as terminated before the outcome is decided, so a cancel either
    /// lands first and turns the outcome into a cancellation or becomes a no-op. The
    /// connection is released to the pool before the terminal event is sent.
    pub async fn execute(
        mut conn: PooledConnection,
        sql: &str,
        handle: &QueryHandle,
        settings: &ExecutionSettings,
        mut sink: EventSink,
    ) {
        let start = Instant::now();
        let query_type = Self::detect_query_type(sql);
        let deadline = settings.statement_timeout().map(|timeout| Deadline::now() + timeout);

        tracing::debug!(
            query_id = %handle.id(),
            profile_id = %handle.profile_id(),
            query_type = ?query_type,
            batch_size = settings.batch_size,
            sql = %sql_preview(sql),
            "Executing query"
        );

        let canceller = conn.session_mut().cancel_handle();
        let mut progression = Progression::default();
        let outcome =
            Self::run(&mut conn, sql, handle, settings, deadline, &mut sink, &mut progression)
                .await;

        // A cancel that lands before the terminal claim still wins over a completed run
        let outcome = match (outcome, handle.terminate()) {
            (Ok(_), Some(reason)) => Err(Stop::Cancelled(reason)),
            (outcome, _) => outcome,
        };

        let needs_server_cancel = progression.issued && !progression.server_done;
        let (terminal, health) = match outcome {
            Ok(finished) => {
                let execution_time_ms = start.elapsed().as_millis() as u64;
                let rows_affected =
                    if query_type.mutates_data() { finished.rows_affected } else { None };
                tracing::debug!(
                    query_id = %handle.id(),
                    execution_time_ms,
                    total_rows = finished.total_rows,
                    ?rows_affected,
                    "Query completed"
                );
                let event =
                    QueryEvent::complete(finished.total_rows, execution_time_ms, rows_affected);
                (Some(event), ReleaseHealth::Healthy)
            }
            Err(Stop::Cancelled(reason)) => {
                tracing::debug!(query_id = %handle.id(), %reason, "Query cancelled");
                let health = Self::cancel_on_server(handle, &*canceller, needs_server_cancel).await;
                (Some(QueryEvent::error(TuskError::query_cancelled(handle.id(), reason))), health)
            }
            Err(Stop::ConsumerGone) => {
                tracing::debug!(
                    query_id = %handle.id(),
                    "Consumer dropped the stream, stopping query"
                );
                let health = Self::cancel_on_server(handle, &*canceller, needs_server_cancel).await;
                (None, health)
            }
            Err(Stop::Failed(error)) => {
                tracing::warn!(query_id = %handle.id(), error = %error, "Query failed");
                let health = if error.is_connection_lost() {
                    ReleaseHealth::Broken
                } else {
                    ReleaseHealth::Healthy
                };
                (Some(QueryEvent::error(error)), health)
            }
        };

        conn.release(health);
        if let Some(terminal) = terminal {
            sink.finish(terminal).await;
        }
    }

    async fn run(
        conn: &mut PooledConnection,
        sql: &str,
        handle: &QueryHandle,
        settings: &ExecutionSettings,
        deadline: Option<Deadline>,
        sink: &mut EventSink,
        progression: &mut Progression,
    ) -> Result<Finished, Stop> {
        if let Some(reason) = checkpoint(handle, deadline) {
            return Err(Stop::Cancelled(reason));
        }

        let interrupt = interrupted(handle, deadline);
        tokio::pin!(interrupt);

        progression.issued = true;
        let session = conn.session_mut();
        let response = select! {
            biased;
            reason = interrupt.as_mut() => return Err(Stop::Cancelled(reason)),
            response = session.execute(sql) => response,
        };
        let ResultStream { columns, mut messages } = response.map_err(|error| {
            // The server rejected the statement before producing results
            progression.server_done = !error.is_connection_lost();
            Stop::Failed(error)
        })?;

        if !columns.is_empty() {
            send(sink, QueryEvent::columns(columns), handle, deadline, interrupt.as_mut()).await?;
        }

        let batch_size = settings.batch_size.max(1);
        let progress_interval = settings.progress_interval.max(1);
        let mut next_progress = settings.large_result_threshold.max(1);
        let mut batch: Vec<Row> = Vec::with_capacity(batch_size);
        let mut total_rows = 0usize;

        loop {
            let message = select! {
                biased;
                reason = interrupt.as_mut() => return Err(Stop::Cancelled(reason)),
                message = messages.next() => message,
            };

            match message {
                Some(Ok(ServerMessage::Row(row))) => {
                    batch.push(row);
                    total_rows += 1;

                    if batch.len() >= batch_size {
                        let rows = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                        let event = QueryEvent::rows(rows, total_rows);
                        send(sink, event, handle, deadline, interrupt.as_mut()).await?;
                    }

                    if total_rows >= next_progress {
                        next_progress += progress_interval;
                        let event = QueryEvent::progress(total_rows);
                        send(sink, event, handle, deadline, interrupt.as_mut()).await?;
                    }
                }
                Some(Ok(ServerMessage::Done { rows_affected })) => {
                    progression.server_done = true;
                    if !batch.is_empty() {
                        let event = QueryEvent::rows(batch, total_rows);
                        send(sink, event, handle, deadline, interrupt.as_mut()).await?;
                    }
                    return Ok(Finished { total_rows, rows_affected });
                }
                Some(Err(error)) => {
                    progression.server_done = !error.is_connection_lost();
                    tracing::debug!(
                        query_id = %handle.id(),
                        rows_received = total_rows,
                        dropped_rows = batch.len(),
                        "Server error during streaming"
                    );
                    return Err(Stop::Failed(error));
                }
                None => {
                    return Err(Stop::Failed(TuskError::connection(
                        "Result stream ended without a completion message",
                    )));
                }
            }
        }
    }

    /// Send the out-of-band cancel when the statement may still be running, and decide how
    /// the session goes back to the pool.
    async fn cancel_on_server(
        handle: &QueryHandle,
        canceller: &dyn crate::services::session::ServerCancel,
        needed: bool,
    ) -> ReleaseHealth {
        if !needed {
            return ReleaseHealth::Healthy;
        }
        match canceller.cancel().await {
            Ok(()) => ReleaseHealth::NeedsCheck,
            Err(e) => {
                tracing::warn!(
                    query_id = %handle.id(),
                    error = %e,
                    "Server cancel request failed, discarding session"
                );
                ReleaseHealth::Broken
            }
        }
    }

    /// Classify a statement by its leading keyword, skipping whitespace, comments and
    /// opening parentheses. A `WITH` statement is classified by the statement that follows
    /// its CTE list, so a writable CTE feeding an `INSERT` reports rows affected.
    pub fn detect_query_type(sql: &str) -> QueryType {
        let keyword = statement_keyword(sql).to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "VALUES" | "TABLE" | "SHOW" | "EXPLAIN" => QueryType::Select,
            "INSERT" => QueryType::Insert,
            "UPDATE" => QueryType::Update,
            "DELETE" => QueryType::Delete,
            "MERGE" => QueryType::Merge,
            _ => QueryType::Other,
        }
    }
}

/// Keyword that decides what a statement does. Empty when there is none.
fn statement_keyword(sql: &str) -> &str {
    let mut rest = skip_trivia(sql);
    while let Some(inner) = rest.strip_prefix('(') {
        rest = skip_trivia(inner);
    }
    let (word, after) = split_word(rest);
    if word.eq_ignore_ascii_case("WITH") {
        main_after_ctes(after)
    } else {
        word
    }
}

/// Walk `[RECURSIVE] name [(columns)] AS [[NOT] MATERIALIZED] (body), ...` and return the
/// keyword of the statement after the last body.
fn main_after_ctes(sql: &str) -> &str {
    let mut rest = sql;
    let mut expect_body = false;
    let mut after_body = false;
    loop {
        rest = skip_trivia(rest);
        if rest.starts_with('(') {
            if expect_body {
                expect_body = false;
                after_body = true;
            } else if after_body {
                return statement_keyword(rest);
            }
            // Column list or body
            match skip_group(rest) {
                Some(tail) => rest = tail,
                None => return "",
            }
        } else if let Some(tail) = rest.strip_prefix(',') {
            after_body = false;
            rest = tail;
        } else if let Some(quoted) = rest.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => rest = &quoted[end + 1..],
                None => return "",
            }
        } else {
            let (word, tail) = split_word(rest);
            if word.is_empty() || after_body {
                return word;
            }
            if word.eq_ignore_ascii_case("AS") {
                expect_body = true;
            }
            rest = tail;
        }
    }
}

fn skip_trivia(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        rest = rest.trim_start();
        if let Some(comment) = rest.strip_prefix("--") {
            rest = comment.find('\n').map_or("", |end| &comment[end + 1..]);
        } else if let Some(comment) = rest.strip_prefix("/*") {
            rest = comment.find("*/").map_or("", |end| &comment[end + 2..]);
        } else {
            return rest;
        }
    }
}

fn split_word(sql: &str) -> (&str, &str) {
    let end = sql
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '$'))
        .unwrap_or(sql.len());
    sql.split_at(end)
}

/// Skip the parenthesized group `sql` starts with. Quotes, comments and dollar-quoted
/// bodies may contain unbalanced parentheses. `None` if the group is never closed.
fn skip_group(sql: &str) -> Option<&str> {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&sql[i + 1..]);
                }
            }
            quote @ (b'\'' | b'"') => {
                i += 1 + sql[i + 1..].find(char::from(quote))?;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i += sql[i..].find('\n')?;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 3 + sql[i + 2..].find("*/")?;
            }
            b'$' => {
                if let Some(tag) = dollar_tag(&sql[i..]) {
                    let body = i + tag.len();
                    i = body + sql[body..].find(tag)? + tag.len() - 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// The `$$` or `$tag$` opening a dollar-quoted string at the start of `sql`.
fn dollar_tag(sql: &str) -> Option<&str> {
    let inner = sql.strip_prefix('$')?;
    let end = inner.find('$')?;
    let tag = &inner[..end];
    let valid = !tag.starts_with(|c: char| c.is_ascii_digit())
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| &sql[..end + 2])
}

fn sql_preview(sql: &str) -> &str {
    let sql = sql.trim();
    match sql.char_indices().nth(SQL_LOG_PREVIEW) {
        Some((end, _)) => &sql[..end],
        None => sql,
    }
}

/// Non-blocking cancellation check.
fn checkpoint(handle: &QueryHandle, deadline: Option<Deadline>) -> Option<CancelReason> {
    if handle.is_cancelled() {
        return Some(handle.cancel_reason().unwrap_or(CancelReason::Requested));
    }
    if deadline.is_some_and(|deadline| Deadline::now() >= deadline) {
        return Some(expire(handle));
    }
    None
}

/// Resolves when the execution is cancelled or its statement timeout elapses.
async fn interrupted(handle: &QueryHandle, deadline: Option<Deadline>) -> CancelReason {
    match deadline {
        Some(deadline) => select! {
            biased;
            _ = handle.cancelled() => handle.cancel_reason().unwrap_or(CancelReason::Requested),
            _ = tokio::time::sleep_until(deadline) => expire(handle),
        },
        None => {
            handle.cancelled().await;
            handle.cancel_reason().unwrap_or(CancelReason::Requested)
        }
    }
}

/// Cancel for a statement timeout. A cancel that got there first keeps its reason.
fn expire(handle: &QueryHandle) -> CancelReason {
    handle.cancel_with_reason(CancelReason::StatementTimeout);
    handle.cancel_reason().unwrap_or(CancelReason::StatementTimeout)
}

/// Pre-send checkpoint, then send while still observing cancellation through the
/// execution's `interrupt` future.
async fn send<F>(
    sink: &mut EventSink,
    event: QueryEvent,
    handle: &QueryHandle,
    deadline: Option<Deadline>,
    interrupt: Pin<&mut F>,
) -> Result<(), Stop>
where
    F: Future<Output = CancelReason>,
{
    if let Some(reason) = checkpoint(handle, deadline) {
        return Err(Stop::Cancelled(reason));
    }
    select! {
        biased;
        reason = interrupt => Err(Stop::Cancelled(reason)),
        sent = sink.send(event) => sent.map_err(|_| Stop::ConsumerGone),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_query_type() {
        assert_eq!(QueryService::detect_query_type("SELECT * FROM users"), QueryType::Select);
        assert_eq!(QueryService::detect_query_type("  select 1"), QueryType::Select);
        assert_eq!(
            QueryService::detect_query_type("WITH cte AS (SELECT 1) SELECT * FROM cte"),
            QueryType::Select
        );
        assert_eq!(QueryService::detect_query_type("INSERT INTO t VALUES (1)"), QueryType::Insert);
        assert_eq!(QueryService::detect_query_type("update t set x = 1"), QueryType::Update);
        assert_eq!(QueryService::detect_query_type("DELETE FROM t"), QueryType::Delete);
        assert_eq!(
            QueryService::detect_query_type("MERGE INTO t USING s ON true"),
            QueryType::Merge
        );
        assert_eq!(QueryService::detect_query_type("CREATE TABLE t (id int)"), QueryType::Other);
        assert_eq!(QueryService::detect_query_type(""), QueryType::Other);
    }

    #[test]
    fn test_detect_query_type_skips_comments() {
        assert_eq!(
            QueryService::detect_query_type("-- bump counters\nUPDATE t SET x = x + 1"),
            QueryType::Update
        );
        assert_eq!(
            QueryService::detect_query_type("/* report */ /* v2 */\n  (SELECT 1)"),
            QueryType::Select
        );
        assert_eq!(QueryService::detect_query_type("-- only a comment"), QueryType::Other);
        assert_eq!(QueryService::detect_query_type("/* unterminated DELETE"), QueryType::Other);
    }

    #[test]
    fn test_detect_query_type_uses_statement_after_ctes() {
        let cases = [
            (
                "WITH moved AS (DELETE FROM a RETURNING *) INSERT INTO b SELECT * FROM moved",
                QueryType::Insert,
            ),
            (
                "WITH RECURSIVE t(n) AS (VALUES (1) UNION ALL SELECT n + 1 FROM t WHERE n < 5)\n\
                 SELECT n FROM t",
                QueryType::Select,
            ),
            (
                "with a as (select ')' as p), \"b(\" as materialized \
                 (update t set x = 1 returning x) update t set y = 2",
                QueryType::Update,
            ),
            (
                "WITH f AS NOT MATERIALIZED (SELECT $body$ ) -- ( $body$ /* ( */)\nDELETE FROM t",
                QueryType::Delete,
            ),
            ("WITH x AS (SELECT 1) (SELECT * FROM x)", QueryType::Select),
            ("(WITH x AS (SELECT 1) MERGE INTO t USING x ON true)", QueryType::Merge),
            ("WITH x AS (SELECT 1", QueryType::Other),
        ];
        for (sql, expected) in cases {
            assert_eq!(QueryService::detect_query_type(sql), expected, "{sql}");
        }
    }

    #[test]
    fn test_skip_group_ignores_quoted_parentheses() {
        assert_eq!(skip_group("(a, (b)) tail"), Some(" tail"));
        assert_eq!(skip_group("('(' || $$)$$ || \"x)\") rest"), Some(" rest"));
        assert_eq!(skip_group("(select $1)"), Some(""));
        assert_eq!(skip_group("(unclosed"), None);
        assert_eq!(dollar_tag("$tag$ x"), Some("$tag$"));
        assert_eq!(dollar_tag("$1, $2"), None);
    }

    #[test]
    fn test_sql_preview_truncates_on_char_boundary() {
        let long = "é".repeat(SQL_LOG_PREVIEW + 10);
        assert_eq!(sql_preview(&long).chars().count(), SQL_LOG_PREVIEW);
        assert_eq!(sql_preview("  SELECT 1  "), "SELECT 1");
    }

    #[tokio::test]
    async fn test_deadline_marks_statement_timeout() {
        let handle = QueryHandle::new(uuid::Uuid::new_v4(), "SELECT pg_sleep(1)");
        let deadline = Deadline::now() + std::time::Duration::from_millis(10);
        assert_eq!(checkpoint(&handle, Some(deadline)), None);

        let reason = interrupted(&handle, Some(deadline)).await;
        assert_eq!(reason, CancelReason::StatementTimeout);
        assert!(handle.is_cancelled());
        assert_eq!(checkpoint(&handle, Some(deadline)), Some(CancelReason::StatementTimeout));
    }
}
