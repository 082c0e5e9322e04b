//! Bounded event channel plus a single-slot steering mailbox.
//!
//! The turn loop pushes; the transport consumes. Pushing into a full
//! channel suspends the loop (backpressure from a slow consumer).
//! Steering messages are mid-run user injections, delivered out-of-band
//! and consumed exactly once between turns.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::StreamEvent;

pub struct EventStream {
    tx: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    steering: Mutex<Option<String>>,
}

impl EventStream {
    /// Create a bounded stream; the receiver goes to the transport.
    pub fn bounded(capacity: usize) -> (Arc<Self>, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                steering: Mutex::new(None),
            }),
            rx,
        )
    }

    /// Push an event. After `close`, or when the consumer is gone,
    /// pushes are silently dropped — the run itself must not fail
    /// because nobody is listening.
    pub async fn push(&self, event: StreamEvent) {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            if tx.send(event).await.is_err() {
                tracing::debug!("event stream consumer dropped; event discarded");
            }
        }
    }

    /// Close the stream. Idempotent; the consumer sees end-of-stream
    /// once in-flight events drain.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    // ── Steering mailbox ───────────────────────────────────────────

    /// Inject a steering message. A second injection before the first
    /// is consumed replaces it.
    pub fn inject(&self, text: impl Into<String>) {
        *self.steering.lock() = Some(text.into());
    }

    pub fn has_injection(&self) -> bool {
        self.steering.lock().is_some()
    }

    /// Atomically take the pending injection, if any.
    pub fn take_injection(&self) -> Option<String> {
        self.steering.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    #[tokio::test]
    async fn events_arrive_in_push_order() {
        let (stream, mut rx) = EventStream::bounded(8);
        for turn in 1..=3 {
            stream
                .push(StreamEvent::new(turn, EventPayload::TurnStart { max_turns: 5 }))
                .await;
        }
        stream.close();

        let mut turns = Vec::new();
        while let Some(event) = rx.recv().await {
            turns.push(event.turn);
        }
        assert_eq!(turns, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn push_after_close_is_dropped() {
        let (stream, mut rx) = EventStream::bounded(8);
        stream.close();
        stream
            .push(StreamEvent::new(1, EventPayload::TurnStart { max_turns: 1 }))
            .await;
        assert!(rx.recv().await.is_none());
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn push_survives_dropped_consumer() {
        let (stream, rx) = EventStream::bounded(1);
        drop(rx);
        // Must not hang or panic.
        stream
            .push(StreamEvent::new(1, EventPayload::TurnStart { max_turns: 1 }))
            .await;
    }

    #[test]
    fn injection_is_taken_exactly_once() {
        let (stream, _rx) = EventStream::bounded(1);
        assert!(!stream.has_injection());

        stream.inject("look at the logs first");
        assert!(stream.has_injection());

        assert_eq!(stream.take_injection().as_deref(), Some("look at the logs first"));
        assert!(!stream.has_injection());
        assert!(stream.take_injection().is_none());
    }

    #[test]
    fn later_injection_replaces_earlier() {
        let (stream, _rx) = EventStream::bounded(1);
        stream.inject("first");
        stream.inject("second");
        assert_eq!(stream.take_injection().as_deref(), Some("second"));
        assert!(stream.take_injection().is_none());
    }
}
