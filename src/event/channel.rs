use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Receiving half of an event channel, owned by the event loop.
pub struct EventConsumer<E>(UnboundedReceiver<E>);

impl<E> From<UnboundedReceiver<E>> for EventConsumer<E> {
    fn from(value: UnboundedReceiver<E>) -> Self {
        Self(value)
    }
}

/// Sending half of an event channel, cloned into watcher and timer tasks.
/// Publishing never blocks, so it is safe from any task.
pub struct EventPublisher<E>(UnboundedSender<E>);

impl<E> From<UnboundedSender<E>> for EventPublisher<E> {
    fn from(value: UnboundedSender<E>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum EventPublisherError {
    #[error("error while publishing event: {0}")]
    SendError(String),
}

pub fn pub_sub<E>() -> (EventPublisher<E>, EventConsumer<E>) {
    let (s, r) = unbounded_channel();
    (EventPublisher(s), EventConsumer(r))
}

impl<E> EventPublisher<E> {
    pub fn publish(&self, event: E) -> Result<(), EventPublisherError> {
        self.0
            .send(event)
            .map_err(|err| EventPublisherError::SendError(err.to_string()))
    }
}

impl<E> Clone for EventPublisher<E> {
    fn clone(&self) -> Self {
        EventPublisher(self.0.clone())
    }
}

impl<E> EventConsumer<E> {
    /// Waits for the next event; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<E> {
        self.0.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.0.try_recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_and_consume() {
        let (publisher, mut consumer) = pub_sub::<u32>();
        publisher.publish(7).unwrap();
        assert_eq!(consumer.recv().await, Some(7));
    }

    #[tokio::test]
    async fn publish_after_consumer_dropped_errors() {
        let (publisher, consumer) = pub_sub::<u32>();
        drop(consumer);
        assert!(publisher.publish(7).is_err());
    }
}
