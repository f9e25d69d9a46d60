//! Event delivery: one producer, any number of bounded subscribers.
//!
//! Subscribers are attached to an [`EventHub`] before the run starts. The
//! producer side ([`EventSink`]) hands every event to each live subscriber in
//! turn and suspends while a subscriber's buffer is full, so memory stays
//! bounded no matter how slow a consumer is. A subscriber that goes away is
//! pruned and never stalls the run.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::{EventObserver, ExecutionEvent};

/// Collects subscribers for a run that has not started yet.
pub struct EventHub {
    capacity: usize,
    senders: Vec<mpsc::Sender<ExecutionEvent>>,
}

impl EventHub {
    /// `capacity` is the per-subscriber buffer size (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            senders: Vec::new(),
        }
    }

    /// Attach a new consumer.
    pub fn subscribe(&mut self) -> EventStream {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.senders.push(tx);
        EventStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn into_sink(self, observers: Vec<Arc<dyn EventObserver>>) -> EventSink {
        EventSink {
            senders: self.senders,
            observers,
            emitted: 0,
        }
    }
}

/// The producing end, owned by the execution loop.
pub(crate) struct EventSink {
    senders: Vec<mpsc::Sender<ExecutionEvent>>,
    observers: Vec<Arc<dyn EventObserver>>,
    emitted: u64,
}

impl EventSink {
    pub(crate) async fn emit(&mut self, event: ExecutionEvent) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
        self.emitted += 1;

        // Senders stay in place while sending so a dropped emit loses none.
        let mut closed = false;
        for tx in &self.senders {
            if tx.send(event.clone()).await.is_err() {
                debug!(event = event.event_type(), "event subscriber dropped");
                closed = true;
            }
        }
        if closed {
            self.senders.retain(|tx| !tx.is_closed());
        }
    }

    pub(crate) fn emitted(&self) -> u64 {
        self.emitted
    }
}

/// A consumer's ordered view of a run's events.
///
/// The stream ends after the terminal event, once the producer is gone.
pub struct EventStream {
    rx: mpsc::Receiver<ExecutionEvent>,
}

impl EventStream {
    /// Wait for the next event.
    pub async fn next(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event.
    pub async fn collect_all(mut self) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl futures::Stream for EventStream {
    type Item = ExecutionEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn delta(s: &str) -> ExecutionEvent {
        ExecutionEvent::ContentDelta { content: s.into() }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event_in_order() {
        let mut hub = EventHub::new(8);
        let a = hub.subscribe();
        let b = hub.subscribe();
        let mut sink = hub.into_sink(vec![]);

        for s in ["one", "two", "three"] {
            sink.emit(delta(s)).await;
        }
        drop(sink);

        let expected = vec![delta("one"), delta("two"), delta("three")];
        assert_eq!(a.collect_all().await, expected);
        assert_eq!(b.collect_all().await, expected);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let mut hub = EventHub::new(1);
        let gone = hub.subscribe();
        let mut kept = hub.subscribe();
        drop(gone);
        let mut sink = hub.into_sink(vec![]);

        sink.emit(delta("a")).await;
        assert_eq!(sink.senders.len(), 1);
        assert_eq!(kept.next().await, Some(delta("a")));
    }

    #[tokio::test]
    async fn full_buffer_suspends_producer() {
        let mut hub = EventHub::new(1);
        let mut stream = hub.subscribe();
        let mut sink = hub.into_sink(vec![]);

        sink.emit(delta("fills buffer")).await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), sink.emit(delta("waits"))).await;
        assert!(blocked.is_err(), "producer should wait for the consumer");

        assert_eq!(stream.next().await, Some(delta("fills buffer")));
    }

    #[tokio::test]
    async fn abandoned_emit_keeps_subscribers() {
        let mut hub = EventHub::new(1);
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();
        let mut sink = hub.into_sink(vec![]);

        sink.emit(delta("a")).await;
        let abandoned = tokio::time::timeout(Duration::from_millis(20), sink.emit(delta("b"))).await;
        assert!(abandoned.is_err());
        assert_eq!(sink.senders.len(), 2);

        assert_eq!(first.next().await, Some(delta("a")));
        assert_eq!(second.next().await, Some(delta("a")));
        sink.emit(delta("done")).await;
        drop(sink);

        assert_eq!(first.collect_all().await.last(), Some(&delta("done")));
        assert_eq!(second.collect_all().await.last(), Some(&delta("done")));
    }

    #[tokio::test]
    async fn observers_run_without_subscribers() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let observer: Arc<dyn EventObserver> = Arc::new(move |_: &ExecutionEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let hub = EventHub::new(4);
        let mut sink = hub.into_sink(vec![observer]);

        sink.emit(delta("x")).await;
        sink.emit(delta("y")).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(sink.emitted(), 2);
    }

    #[tokio::test]
    async fn works_as_futures_stream() {
        use futures::StreamExt;

        let mut hub = EventHub::new(4);
        let stream = hub.subscribe();
        let mut sink = hub.into_sink(vec![]);
        sink.emit(delta("p")).await;
        sink.emit(delta("q")).await;
        drop(sink);

        let got: Vec<_> = stream.collect().await;
        assert_eq!(got.len(), 2);
    }
}
