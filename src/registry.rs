//! Live membership index of sessions.
//!
//! The registry is a back-reference index used for fan-out. It does not own
//! session lifetimes: each session tears itself down and only asks the
//! registry to forget it.
//!
//! Broadcasting never iterates the registry directly. It takes a snapshot
//! under a short lock and performs network writes on the copy, so one stalled
//! peer cannot hold up joins, leaves, or other broadcasts.

use crate::session::{Peer, SessionId};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::trace;

/// Thread-safe set of live sessions keyed by session id.
#[derive(Default)]
pub struct Registry {
    members: Mutex<BTreeMap<SessionId, Arc<Peer>>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a session.
    ///
    /// Returns `false` and leaves the registry untouched if the id is
    /// already present.
    pub fn add(&self, peer: Arc<Peer>) -> bool {
        let id = peer.id();
        let mut members = self.members();
        if members.contains_key(&id) {
            return false;
        }
        members.insert(id, peer);
        trace!(session = %id, members = members.len(), "Session registered");
        true
    }

    /// Remove a session, returning it if it was present.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Peer>> {
        let mut members = self.members();
        let removed = members.remove(&id);
        if removed.is_some() {
            trace!(session = %id, members = members.len(), "Session removed");
        }
        removed
    }

    /// Copy of the current membership, ordered by session id.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.members().values().cloned().collect()
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.members().contains_key(&id)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }

    // The map stays consistent even if a holder panicked: every critical
    // section is a single map operation.
    fn members(&self) -> MutexGuard<'_, BTreeMap<SessionId, Arc<Peer>>> {
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameWriter;
    use std::thread;
    use tokio::io::sink;

    fn peer(id: u64) -> Arc<Peer> {
        Arc::new(Peer::new(SessionId::new(id), Arc::new(FrameWriter::new(sink()))))
    }

    #[test]
    fn test_add_remove() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        assert!(registry.add(peer(1)));
        assert!(registry.add(peer(2)));
        assert_eq!(registry.len(), 2);
        assert!(registry.contains(SessionId::new(1)));

        let removed = registry.remove(SessionId::new(1)).unwrap();
        assert_eq!(removed.id(), SessionId::new(1));
        assert!(!registry.contains(SessionId::new(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_add_is_rejected() {
        let registry = Registry::new();
        let first = peer(7);
        assert!(registry.add(first.clone()));
        assert!(!registry.add(peer(7)));

        assert_eq!(registry.len(), 1);
        let kept = registry.snapshot().pop().unwrap();
        assert!(Arc::ptr_eq(&kept, &first));
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = Registry::new();
        registry.add(peer(1));

        assert!(registry.remove(SessionId::new(9)).is_none());
        assert!(registry.remove(SessionId::new(1)).is_some());
        assert!(registry.remove(SessionId::new(1)).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let registry = Registry::new();
        for id in [3, 1, 2] {
            registry.add(peer(id));
        }

        let snapshot = registry.snapshot();
        let ids: Vec<u64> = snapshot.iter().map(|p| p.id().get()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        // Mutation after the snapshot does not affect the copy.
        registry.remove(SessionId::new(2));
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.snapshot().len(), 2);
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Registry::new();
        let mut handles = Vec::new();

        for t in 0..8u64 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                for i in 0..100u64 {
                    let id = t * 1000 + i;
                    assert!(registry.add(peer(id)));
                    let _ = registry.snapshot();
                    if i % 2 == 0 {
                        assert!(registry.remove(SessionId::new(id)).is_some());
                    }
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 50);
    }
}
