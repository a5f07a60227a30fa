//! Bounded channel carrying execution events from backends to the engine.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::core::ExecutionEvent;

/// Creates a publisher/stream pair with room for `capacity` buffered events.
#[must_use]
pub fn event_channel(capacity: usize) -> (EventPublisher, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventPublisher { tx }, EventStream { rx })
}

/// Sending half, cloned into every backend.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<ExecutionEvent>,
}

impl EventPublisher {
    /// Publishes an event, waiting for buffer space.
    ///
    /// Returns false if the engine has shut down.
    pub async fn publish(&self, event: ExecutionEvent) -> bool {
        match self.tx.send(event).await {
            Ok(()) => true,
            Err(err) => {
                warn!(job_id = %err.0.job_id, "event stream closed, dropping event");
                false
            }
        }
    }

    /// Publishes without waiting. Returns false if the buffer is full or closed.
    pub fn try_publish(&self, event: ExecutionEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(job_id = %event.job_id, "event stream full, dropping event");
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(job_id = %event.job_id, "event stream closed, dropping event");
                false
            }
        }
    }

    /// Returns true if the receiving side is gone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half, consumed by the engine's router.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<ExecutionEvent>,
}

impl EventStream {
    /// Waits for the next event. `None` once every publisher is dropped.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.recv().await
    }

    /// Returns a buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<ExecutionEvent> {
        self.rx.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_and_receive_in_order() {
        let (publisher, mut stream) = event_channel(4);
        let run_id = Uuid::now_v7();

        assert!(publisher.publish(ExecutionEvent::running(run_id, "a")).await);
        assert!(publisher.try_publish(ExecutionEvent::succeeded(run_id, "a")));

        assert_eq!(stream.recv().await.unwrap().job_id, "a");
        assert!(stream.try_recv().unwrap().is_terminal());
        assert!(stream.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_try_publish_full_buffer() {
        let (publisher, _stream) = event_channel(1);
        assert!(publisher.try_publish(ExecutionEvent::running(Uuid::nil(), "a")));
        assert!(!publisher.try_publish(ExecutionEvent::running(Uuid::nil(), "b")));
    }

    #[tokio::test]
    async fn test_publish_after_close() {
        let (publisher, stream) = event_channel(1);
        drop(stream);
        assert!(publisher.is_closed());
        assert!(!publisher.publish(ExecutionEvent::running(Uuid::nil(), "a")).await);
    }
}
