//! Outbound transport seam.
//!
//! Capture hands finished envelopes to a [`Publisher`]. Publishing is
//! fire-and-forget from the caller's point of view: errors are returned so
//! the caller can log them, never retried here.

use crate::envelope::Envelope;
use tokio::sync::mpsc;

/// Sink for outbound envelopes.
pub trait Publisher: Send + Sync {
    /// Hand an envelope to the transport.
    ///
    /// # Errors
    ///
    /// Returns error if the transport refuses the envelope.
    fn publish(&self, envelope: Envelope) -> Result<(), TransportError>;
}

/// Publisher feeding an in-process channel.
///
/// Used for loopback wiring between two stores in one process and by tests.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiving end of its channel.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Publisher for ChannelPublisher {
    fn publish(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx.send(envelope).map_err(|_| TransportError::Closed)
    }
}

/// Errors from a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Envelope could not be encoded for the wire
    #[error("encoding failed: {0}")]
    Encode(String),
    /// Transport rejected or could not queue the envelope
    #[error("publish failed: {0}")]
    Publish(String),
    /// The receiving side is gone
    #[error("transport closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_publisher_delivers() {
        let (publisher, mut rx) = ChannelPublisher::new();
        publisher
            .publish(Envelope::new().with_property("k", "v"))
            .unwrap();
        let received = rx.try_recv().unwrap();
        assert_eq!(received.property_str("k"), Some("v"));
    }

    #[test]
    fn closed_channel_reports_error() {
        let (publisher, rx) = ChannelPublisher::new();
        drop(rx);
        assert_eq!(
            publisher.publish(Envelope::new()),
            Err(TransportError::Closed)
        );
    }
}
