//! Notifications to the node's message queue
//!
//! The consensus/transaction side learns about peer and network state
//! through a `QueueClient`; what it does with the events is its own business.

use crate::network::message::ServiceFlags;
use tokio::sync::mpsc;

/// Peer and network state changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    PeerAdded(String),
    PeerRemoved(String),
    ServiceChanged(ServiceFlags),
    /// NAT negotiation finished; `true` if a mapping is live
    NatFinished(bool),
}

pub trait QueueClient: Send + Sync {
    fn notify(&self, event: NetworkEvent);
}

impl QueueClient for mpsc::UnboundedSender<NetworkEvent> {
    fn notify(&self, event: NetworkEvent) {
        if self.send(event).is_err() {
            log::debug!("Queue client dropped, event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_client() {
        let (tx, mut rx) = mpsc::unbounded_channel::<NetworkEvent>();
        tx.notify(NetworkEvent::PeerAdded("1.1.1.1:1".to_string()));
        assert_eq!(
            rx.try_recv().unwrap(),
            NetworkEvent::PeerAdded("1.1.1.1:1".to_string())
        );

        drop(rx);
        // no panic once the receiver is gone
        tx.notify(NetworkEvent::NatFinished(false));
    }
}
