//! Who is online, and how to reach them.
//!
//! The registry maps a nickname to the [`ConnectionHandle`] of the connection
//! that logged in under it. Every operation takes the same lock, so a reader
//! never observes a half-applied update. Nothing here performs socket I/O:
//! delivery only enqueues onto the connection's outbound queue.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use tokio::sync::{
    Mutex, Notify,
    mpsc::{self, error::TrySendError},
};

pub type Identity = String;
pub type ConnectionId = u64;

/// A cloneable reference to one live client connection.
///
/// The connection's own task owns the socket. Everyone else talks to it through
/// this handle: by queueing serialized frames for it, or by asking it to close.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    outbound: mpsc::Sender<Arc<str>>,
    close: Arc<Notify>,
}

/// The receiving side of a [`ConnectionHandle`], held by the connection task.
#[derive(Debug)]
pub struct Mailbox {
    pub(crate) frames: mpsc::Receiver<Arc<str>>,
    pub(crate) close: Arc<Notify>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, peer: SocketAddr, capacity: usize) -> (Self, Mailbox) {
        let (outbound, frames) = mpsc::channel(capacity.max(1));
        let close = Arc::new(Notify::new());
        let handle = Self {
            id,
            peer,
            outbound,
            close: Arc::clone(&close),
        };
        (handle, Mailbox { frames, close })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues a frame without waiting; a full queue is the caller's problem.
    pub fn deliver(&self, frame: Arc<str>) -> Result<(), TrySendError<Arc<str>>> {
        self.outbound.try_send(frame)
    }

    /// Asks the owning task to shut the connection down.
    pub fn close(&self) {
        self.close.notify_one();
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<Identity, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `identity` to `handle`, returning whatever it was bound to before.
    ///
    /// The displaced handle is returned untouched; closing it is a policy
    /// decision left to the caller.
    pub async fn put(
        &self,
        identity: Identity,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut entries = self.entries.lock().await;
        entries.insert(identity, handle)
    }

    /// Removes `identity`. Removing an absent identity is a no-op.
    pub async fn remove(&self, identity: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(identity);
    }

    /// Removes `identity` only while it is still bound to connection `id`.
    ///
    /// A connection that lost its nickname to a newer login must not unbind
    /// the newcomer on its way out.
    pub async fn remove_connection(&self, identity: &str, id: ConnectionId) -> bool {
        let mut entries = self.entries.lock().await;
        match entries.get(identity) {
            Some(handle) if handle.id == id => {
                entries.remove(identity);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, identity: &str) -> Option<ConnectionHandle> {
        let entries = self.entries.lock().await;
        entries.get(identity).cloned()
    }

    /// A point-in-time copy that can be iterated without holding the lock.
    pub async fn snapshot(&self) -> Vec<(Identity, ConnectionHandle)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .map(|(identity, handle)| (identity.clone(), handle.clone()))
            .collect()
    }

    /// Every online nickname except `identity`, sorted.
    pub async fn identities_except(&self, identity: &str) -> Vec<Identity> {
        let entries = self.entries.lock().await;
        let mut others: Vec<Identity> = entries
            .keys()
            .filter(|candidate| candidate.as_str() != identity)
            .cloned()
            .collect();
        others.sort();
        others
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(id: ConnectionId) -> (ConnectionHandle, Mailbox) {
        let peer = SocketAddr::from(([127, 0, 0, 1], 40_000 + id as u16));
        ConnectionHandle::new(id, peer, 8)
    }

    #[tokio::test]
    async fn put_replaces_and_returns_previous_handle() {
        let registry = ConnectionRegistry::new();
        let (first, mut first_mailbox) = handle(1);
        let (second, _second_mailbox) = handle(2);

        assert!(registry.put("alice".into(), first).await.is_none());
        let displaced = registry
            .put("alice".into(), second)
            .await
            .expect("first handle should be displaced");
        assert_eq!(displaced.id(), 1);
        assert_eq!(registry.get("alice").await.map(|h| h.id()), Some(2));

        // The registry leaves the displaced connection alone.
        displaced.deliver(Arc::from("still open")).expect("queue open");
        assert_eq!(first_mailbox.frames.recv().await.as_deref(), Some("still open"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (alice, _mailbox) = handle(1);
        registry.put("alice".into(), alice).await;

        registry.remove("alice").await;
        registry.remove("alice").await;
        registry.remove("nobody").await;

        assert!(registry.get("alice").await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_connection_ignores_stale_owner() {
        let registry = ConnectionRegistry::new();
        let (old, _old_mailbox) = handle(1);
        let (new, _new_mailbox) = handle(2);
        registry.put("alice".into(), old).await;
        registry.put("alice".into(), new).await;

        assert!(!registry.remove_connection("alice", 1).await);
        assert_eq!(registry.get("alice").await.map(|h| h.id()), Some(2));

        assert!(registry.remove_connection("alice", 2).await);
        assert!(registry.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_independent_of_later_changes() {
        let registry = ConnectionRegistry::new();
        let (alice, _a) = handle(1);
        let (bob, _b) = handle(2);
        registry.put("alice".into(), alice).await;
        registry.put("bob".into(), bob).await;

        let snapshot = registry.snapshot().await;
        registry.remove("alice").await;

        let mut names: Vec<_> = snapshot.into_iter().map(|(name, _)| name).collect();
        names.sort();
        assert_eq!(names, vec!["alice".to_string(), "bob".to_string()]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn identities_except_leaves_out_the_requester() {
        let registry = ConnectionRegistry::new();
        for (id, name) in [(1, "carol"), (2, "alice"), (3, "bob")] {
            let (h, _mailbox) = handle(id);
            registry.put(name.into(), h).await;
        }

        assert_eq!(
            registry.identities_except("alice").await,
            vec!["bob".to_string(), "carol".to_string()]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_put_and_remove_stay_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for id in 0..64u64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let name = format!("user-{id}");
                let (h, _mailbox) = handle(id);
                registry.put(name.clone(), h).await;
                assert_eq!(registry.get(&name).await.map(|h| h.id()), Some(id));
                if id % 2 == 0 {
                    registry.remove(&name).await;
                    assert!(registry.get(&name).await.is_none());
                }
            }));
        }
        for task in tasks {
            task.await.expect("task panicked");
        }

        assert_eq!(registry.len().await, 32);
        for id in (1..64u64).step_by(2) {
            assert_eq!(
                registry.get(&format!("user-{id}")).await.map(|h| h.id()),
                Some(id)
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn contended_key_keeps_the_last_writer() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut tasks = Vec::new();

        for id in 0..32u64 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let (h, _mailbox) = handle(id);
                registry.put("shared".into(), h).await.map(|prev| prev.id())
            }));
        }

        let mut displaced = Vec::new();
        for task in tasks {
            if let Some(id) = task.await.expect("task panicked") {
                displaced.push(id);
            }
        }

        // Each put displaced exactly one earlier writer, except the first.
        assert_eq!(displaced.len(), 31);
        let survivor = registry.get("shared").await.expect("key survives").id();
        assert!(!displaced.contains(&survivor));
    }
}
