//! Event stream multiplexer.
//!
//! The turn runs as its own task and pushes onto an unbounded channel; the
//! caller drains the channel as a [`Stream`]. Sending never waits on the
//! consumer.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::events::TurnEvent;

/// Producer side of a turn stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: UnboundedSender<TurnEvent>,
}

impl EventSink {
    /// Push an event. Returns `false` once the consumer has gone away.
    pub fn emit(&self, event: TurnEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a turn stream. Dropping it cancels the turn.
pub struct TurnStream {
    rx: UnboundedReceiver<TurnEvent>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TurnStream {
    /// Next event, or `None` once the turn task has finished.
    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.rx.recv().await
    }

    /// Stop the turn. Events already queued stay readable; nothing new is sent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel and wait until the turn task has released its state.
    pub async fn cancel_and_wait(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "turn task ended abnormally");
            }
        }
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for TurnStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Spawn `produce` as the turn task and return the stream it feeds.
pub fn spawn_turn<F, Fut>(produce: F) -> TurnStream
where
    F: FnOnce(EventSink, CancellationToken) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(produce(EventSink { tx }, cancel.clone()));
    TurnStream {
        rx,
        cancel,
        handle: Some(handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let stream = spawn_turn(|sink, _cancel| async move {
            for i in 0..50 {
                sink.emit(TurnEvent::Text(i.to_string()));
            }
        });
        let events: Vec<TurnEvent> = stream.collect().await;
        let texts: Vec<String> = events
            .into_iter()
            .map(|e| match e {
                TurnEvent::Text(t) => t,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(texts, (0..50).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_producer() {
        let (seen_tx, seen_rx) = tokio::sync::oneshot::channel();
        let stream = spawn_turn(|_sink, cancel| async move {
            cancel.cancelled().await;
            let _ = seen_tx.send(());
        });
        drop(stream);
        seen_rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_emit_reports_closed_consumer() {
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut stream = spawn_turn(|sink, cancel| async move {
            cancel.cancelled().await;
            let _ = done_tx.send(sink);
        });
        stream.cancel();
        let sink = done_rx.await.unwrap();
        assert!(sink.emit(TurnEvent::Status("still open".into())));
        assert_eq!(stream.recv().await, Some(TurnEvent::Status("still open".into())));
        drop(stream);
        assert!(!sink.emit(TurnEvent::Status("late".into())));
        assert!(sink.is_closed());
    }
}
