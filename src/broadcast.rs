//! Fan-out of one message to every other live session.
//!
//! Delivery is best effort: a recipient whose write fails is evicted (removed
//! from the registry and closed) and the broadcast carries on with the rest.
//! There is no retry and no ordering guarantee across recipients.

use crate::registry::Registry;
use crate::session::{Peer, SessionId};
use std::sync::Arc;
use tracing::{trace, warn};

/// Outcome of a single broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Recipients the message was written to.
    pub delivered: usize,
    /// Recipients whose write failed; all of them have been evicted.
    pub failed: Vec<SessionId>,
}

#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Send `message` to every session in the registry except `sender`.
    ///
    /// Recipients come from a snapshot, so sessions joining while the
    /// broadcast runs miss it and sessions leaving while it runs fail
    /// harmlessly.
    pub async fn deliver(&self, sender: SessionId, message: &[u8]) -> Delivery {
        let mut delivery = Delivery::default();

        for peer in self.registry.snapshot() {
            if peer.id() == sender {
                continue;
            }

            match peer.deliver(message).await {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    warn!(
                        session = %peer.id(),
                        name = peer.name().unwrap_or_default(),
                        error = %e,
                        "Delivery failed, evicting session"
                    );
                    self.evict(&peer).await;
                    delivery.failed.push(peer.id());
                }
            }
        }

        trace!(
            sender = %sender,
            delivered = delivery.delivered,
            failed = delivery.failed.len(),
            "Broadcast complete"
        );
        delivery
    }

    async fn evict(&self, peer: &Peer) {
        self.registry.remove(peer.id());
        peer.close().await;
    }
}
