//! Bounded, ordered event delivery from one coordinator to one consumer.
//!
//! The producer half (`EventSink`) can only emit a terminal event through `finish`, which
//! consumes it, so nothing can be sent after the terminal event. A full channel suspends the
//! coordinator; that is the only backpressure towards the server.

use crate::error::TuskError;
use crate::models::{QueryEvent, QueryHandle};

use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Create a channel for the execution tracked by `handle`.
pub fn event_channel(handle: Arc<QueryHandle>, capacity: usize) -> (EventSink, QueryStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let sink = EventSink { tx, query_id: handle.id() };
    let stream = QueryStream { handle, receiver: rx };
    (sink, stream)
}

/// The consumer dropped its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerGone;

/// Producer half of an execution's event channel.
#[derive(Debug)]
pub struct EventSink {
    tx: mpsc::Sender<QueryEvent>,
    query_id: Uuid,
}

impl EventSink {
    /// Execution this sink belongs to.
    pub fn query_id(&self) -> Uuid {
        self.query_id
    }

    /// Send a non-terminal event, waiting for channel capacity.
    pub async fn send(&mut self, event: QueryEvent) -> Result<(), ConsumerGone> {
        debug_assert!(!event.is_terminal(), "terminal events go through EventSink::finish");
        self.tx.send(event).await.map_err(|_| ConsumerGone)
    }

    /// Whether the consumer has dropped its stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Send the terminal event and close the channel.
    pub async fn finish(self, event: QueryEvent) {
        debug_assert!(event.is_terminal(), "EventSink::finish takes Complete or Error");
        if self.tx.send(event).await.is_err() {
            tracing::debug!(query_id = %self.query_id, "Consumer gone before terminal event");
        }
    }
}

/// Consumer half: the ordered events of one execution plus its cancel entry point.
///
/// `recv` returns `None` once the terminal event has been taken.
#[derive(Debug)]
pub struct QueryStream {
    handle: Arc<QueryHandle>,
    receiver: mpsc::Receiver<QueryEvent>,
}

impl QueryStream {
    /// Execution identifier.
    pub fn id(&self) -> Uuid {
        self.handle.id()
    }

    /// The execution's handle.
    pub fn handle(&self) -> &Arc<QueryHandle> {
        &self.handle
    }

    /// Receive the next event.
    pub async fn recv(&mut self) -> Option<QueryEvent> {
        self.receiver.recv().await
    }

    /// Request cancellation. No-op once the execution has terminated.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }

    /// Drain the remaining events, returning them in order.
    pub async fn collect_events(mut self) -> Vec<QueryEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            events.push(event);
        }
        events
    }

    /// Drain the stream and return the terminal outcome, discarding rows.
    pub async fn finish(mut self) -> Result<QueryEvent, TuskError> {
        while let Some(event) = self.recv().await {
            match event {
                QueryEvent::Error { error } => return Err(error),
                terminal @ QueryEvent::Complete { .. } => return Ok(terminal),
                _ => {}
            }
        }
        Err(TuskError::internal("Event stream closed without a terminal event"))
    }
}

impl Stream for QueryStream {
    type Item = QueryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<QueryEvent>> {
        self.receiver.poll_recv(cx)
    }
}
