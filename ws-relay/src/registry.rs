//! The live set of connected peers.
//!
//! A single actor task owns the membership map and serves requests one at a time from an
//! unbounded channel, so add, remove and snapshot never interleave. Callers only ever hold a
//! cloneable [`Registry`] handle.
//!
//! Fan-out works on an owned copy returned by [`Registry::snapshot`]: sends to slow peers happen
//! after the actor has already moved on to the next request.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::tungstenite::Utf8Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type ConnectionId = u64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is already registered")]
    Duplicate(ConnectionId),
    #[error("registry has shut down")]
    Closed,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("peer did not drain its queue in time and is being disconnected")]
    Overrun,
    #[error("peer has disconnected")]
    Closed,
}

/// Send side of one connection's outbound queue.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: ConnectionId,
    addr: Option<SocketAddr>,
    outbound: mpsc::Sender<Utf8Bytes>,
    overrun: CancellationToken,
}

impl PeerHandle {
    /// Creates a handle and the receiver its writer task drains.
    pub fn new(
        id: ConnectionId,
        addr: Option<SocketAddr>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (outbound, inbox) = mpsc::channel(capacity.max(1));
        let peer = Self {
            id,
            addr,
            outbound,
            overrun: CancellationToken::new(),
        };
        (peer, inbox)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Cancelled when a sender gave up waiting on this peer's queue. The owning dispatcher closes
    /// the connection when it fires, so a registered peer never silently misses a message.
    pub fn overrun_signal(&self) -> CancellationToken {
        self.overrun.clone()
    }

    /// Queues a frame, waiting up to `wait` for room.
    pub async fn deliver(&self, frame: Utf8Bytes, wait: Duration) -> Result<(), DeliveryError> {
        match self.outbound.send_timeout(frame, wait).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.overrun.cancel();
                Err(DeliveryError::Overrun)
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

enum RegistryCommand {
    Add {
        peer: PeerHandle,
        respond_to: oneshot::Sender<Result<usize, RegistryError>>,
    },
    Remove {
        id: ConnectionId,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<PeerHandle>>,
    },
    Count {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Handle to the registry actor. The actor stops once every handle is dropped.
#[derive(Clone)]
pub struct Registry {
    commands: mpsc::UnboundedSender<RegistryCommand>,
    next_id: Arc<AtomicU64>,
}

impl Registry {
    /// Starts the actor on the current tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (commands, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_registry(inbox));
        let registry = Self {
            commands,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (registry, task)
    }

    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a peer and returns the new membership size. Once this returns the peer is part of
    /// every later snapshot.
    pub async fn add(&self, peer: PeerHandle) -> Result<usize, RegistryError> {
        let (respond_to, response) = oneshot::channel();
        self.send(RegistryCommand::Add { peer, respond_to })?;
        response.await.map_err(|_| RegistryError::Closed)?
    }

    /// Removes a peer if present. Does not wait for the actor, so it is usable from `Drop`;
    /// requests issued afterwards from the same task still observe the removal.
    pub fn remove(&self, id: ConnectionId) -> Result<(), RegistryError> {
        self.send(RegistryCommand::Remove { id })
    }

    pub async fn snapshot(&self) -> Result<Vec<PeerHandle>, RegistryError> {
        let (respond_to, response) = oneshot::channel();
        self.send(RegistryCommand::Snapshot { respond_to })?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    pub async fn count(&self) -> Result<usize, RegistryError> {
        let (respond_to, response) = oneshot::channel();
        self.send(RegistryCommand::Count { respond_to })?;
        response.await.map_err(|_| RegistryError::Closed)
    }

    /// Adds the peer and ties its removal to the returned guard.
    pub async fn register(&self, peer: PeerHandle) -> Result<Registration, RegistryError> {
        let id = peer.id();
        let online = self.add(peer).await?;
        debug!(conn = id, online, "connection registered");
        Ok(Registration {
            id,
            online,
            registry: self.clone(),
        })
    }

    fn send(&self, command: RegistryCommand) -> Result<(), RegistryError> {
        self.commands
            .send(command)
            .map_err(|_| RegistryError::Closed)
    }
}

/// Membership of one connection. Dropping it deregisters the connection, which happens exactly
/// once whether the owner exits normally, returns early with an error, or unwinds.
pub struct Registration {
    id: ConnectionId,
    online: usize,
    registry: Registry,
}

impl Registration {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Membership size right after this connection was added.
    pub fn online_at_join(&self) -> usize {
        self.online
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Err(err) = self.registry.remove(self.id) {
            debug!(conn = self.id, error = %err, "registry gone before deregistration");
        }
    }
}

async fn run_registry(mut inbox: mpsc::UnboundedReceiver<RegistryCommand>) {
    let mut members: BTreeMap<ConnectionId, PeerHandle> = BTreeMap::new();

    while let Some(command) = inbox.recv().await {
        match command {
            RegistryCommand::Add { peer, respond_to } => {
                let result = insert_member(&mut members, peer);
                let _ = respond_to.send(result);
            }
            RegistryCommand::Remove { id } => {
                if let Some(peer) = members.remove(&id) {
                    info!(
                        conn = id,
                        peer = ?peer.addr(),
                        online = members.len(),
                        "client left"
                    );
                }
            }
            RegistryCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(members.values().cloned().collect());
            }
            RegistryCommand::Count { respond_to } => {
                let _ = respond_to.send(members.len());
            }
        }
    }

    debug!(remaining = members.len(), "registry stopped");
}

fn insert_member(
    members: &mut BTreeMap<ConnectionId, PeerHandle>,
    peer: PeerHandle,
) -> Result<usize, RegistryError> {
    let id = peer.id();
    if members.contains_key(&id) {
        warn!(conn = id, "rejected duplicate registration");
        return Err(RegistryError::Duplicate(id));
    }

    let addr = peer.addr();
    members.insert(id, peer);
    info!(conn = id, peer = ?addr, online = members.len(), "client joined");
    Ok(members.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(registry: &Registry) -> (PeerHandle, mpsc::Receiver<Utf8Bytes>) {
        PeerHandle::new(registry.next_id(), None, 4)
    }

    fn frame(text: &str) -> Utf8Bytes {
        Utf8Bytes::from(text.to_string())
    }

    #[tokio::test]
    async fn add_then_remove_updates_count() {
        let (registry, _task) = Registry::spawn();
        let (a, _rx_a) = peer(&registry);
        let (b, _rx_b) = peer(&registry);
        let a_id = a.id();

        assert_eq!(registry.add(a).await.expect("add a"), 1);
        assert_eq!(registry.add(b).await.expect("add b"), 2);

        registry.remove(a_id).expect("remove a");
        assert_eq!(registry.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (registry, _task) = Registry::spawn();
        let (a, _rx) = peer(&registry);
        let id = a.id();
        registry.add(a).await.expect("add");

        registry.remove(id).expect("first remove");
        registry.remove(id).expect("second remove");
        registry.remove(9_999).expect("unknown id");

        assert_eq!(registry.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let (registry, _task) = Registry::spawn();
        let (a, _rx) = peer(&registry);
        let copy = a.clone();

        registry.add(a).await.expect("first add");
        let err = registry.add(copy).await.expect_err("duplicate add");

        assert!(matches!(err, RegistryError::Duplicate(_)));
        assert_eq!(registry.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn snapshot_is_a_copy() {
        let (registry, _task) = Registry::spawn();
        let (a, _rx_a) = peer(&registry);
        let (b, _rx_b) = peer(&registry);
        let a_id = a.id();
        registry.add(a).await.expect("add a");
        registry.add(b).await.expect("add b");

        let snapshot = registry.snapshot().await.expect("snapshot");
        registry.remove(a_id).expect("remove a");

        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.snapshot().await.expect("snapshot").len(), 1);
    }

    #[tokio::test]
    async fn dropping_registration_deregisters() {
        let (registry, _task) = Registry::spawn();
        let (a, _rx) = peer(&registry);

        let registration = registry.register(a).await.expect("register");
        assert_eq!(registration.online_at_join(), 1);
        drop(registration);

        assert_eq!(registry.count().await.expect("count"), 0);
    }

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn delivery_waits_for_a_slow_reader() {
        let (slow, mut rx) = PeerHandle::new(1, None, 1);
        slow.deliver(frame("first"), WAIT).await.expect("room for one frame");

        let reader = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let first = rx.recv().await.expect("first frame");
            let second = rx.recv().await.expect("second frame");
            (first, second)
        });
        slow.deliver(frame("second"), Duration::from_secs(2))
            .await
            .expect("reader makes room");

        let (first, second) = reader.await.expect("reader task");
        assert_eq!((first.as_str(), second.as_str()), ("first", "second"));
        assert!(!slow.overrun_signal().is_cancelled());
    }

    #[tokio::test]
    async fn stalled_queue_signals_overrun() {
        let (stalled, _rx) = PeerHandle::new(1, None, 1);
        stalled.deliver(frame("first"), WAIT).await.expect("room for one frame");

        assert_eq!(
            stalled.deliver(frame("second"), WAIT).await,
            Err(DeliveryError::Overrun)
        );
        assert!(stalled.overrun_signal().is_cancelled());
    }

    #[tokio::test]
    async fn delivery_to_dropped_queue_is_closed() {
        let (gone, rx_gone) = PeerHandle::new(2, None, 4);
        drop(rx_gone);
        assert_eq!(
            gone.deliver(frame("hello"), WAIT).await,
            Err(DeliveryError::Closed)
        );
        assert!(!gone.overrun_signal().is_cancelled());
    }

    #[tokio::test]
    async fn operations_fail_after_actor_stops() {
        let (registry, task) = Registry::spawn();
        task.abort();
        let _ = task.await;

        assert_eq!(registry.count().await, Err(RegistryError::Closed));
        assert_eq!(registry.remove(1), Err(RegistryError::Closed));
    }
}
