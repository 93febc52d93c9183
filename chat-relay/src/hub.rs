//! The room's single serialization point.
//!
//! One task owns the registry of live sessions and processes join, leave and
//! broadcast requests strictly in the order they arrive on its queue. Sessions
//! talk to it only through a cloneable [`HubHandle`]; nothing else touches the
//! registry.
//!
//! Fan-out never waits on a recipient: every session has a bounded mailbox and
//! the hub uses `try_send`. A mailbox that is full or closed costs its owner
//! the registration, and the broadcast carries on with everyone else. The
//! evicted session learns about it through its [`Membership`].

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    config::{BroadcastPolicy, HubConfig},
    error::{HubClosed, JoinError, RegistryConflict},
    message::ChatMessage,
};

/// Per-session delivery conduit from the hub.
pub type Mailbox = mpsc::Sender<Arc<ChatMessage>>;

/// Resolves once the hub has dropped the session's registry entry, whether
/// through `leave`, eviction of a stalled mailbox, or hub shutdown.
#[derive(Debug)]
pub struct Membership {
    ended: oneshot::Receiver<()>,
}

impl Membership {
    pub async fn ended(&mut self) {
        let _ = (&mut self.ended).await;
    }
}

struct Entry {
    mailbox: Mailbox,
    // Dropped with the entry, which resolves the session's `Membership`.
    _membership: oneshot::Sender<()>,
}

/// Stable identity of one session: a sequence number drawn from the hub's
/// counter plus the peer address it came from, if known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    seq: u64,
    peer: Option<SocketAddr>,
}

impl SessionId {
    pub fn new(seq: u64, peer: Option<SocketAddr>) -> Self {
        Self { seq, peer }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.peer {
            Some(peer) => write!(f, "#{}@{}", self.seq, peer),
            None => write!(f, "#{}", self.seq),
        }
    }
}

enum HubRequest {
    Join {
        id: SessionId,
        mailbox: Mailbox,
        respond_to: oneshot::Sender<Result<Membership, RegistryConflict>>,
    },
    Leave {
        id: SessionId,
    },
    Broadcast {
        origin: Option<SessionId>,
        message: Arc<ChatMessage>,
    },
    Members {
        respond_to: oneshot::Sender<Vec<SessionId>>,
    },
    Shutdown,
}

/// Handle for submitting requests to a running hub.
///
/// Cloning is cheap; every clone feeds the same queue. The hub stops once
/// [`HubHandle::shutdown`] is processed or every handle has been dropped.
#[derive(Clone)]
pub struct HubHandle {
    requests: mpsc::Sender<HubRequest>,
    next_seq: Arc<AtomicU64>,
}

impl HubHandle {
    /// Draws a fresh id. Sequence numbers never repeat for one hub, so
    /// generated ids cannot collide even when a peer address is reused.
    pub fn next_session_id(&self, peer: Option<SocketAddr>) -> SessionId {
        SessionId::new(self.next_seq.fetch_add(1, Ordering::Relaxed), peer)
    }

    /// Registers `mailbox` under `id`.
    ///
    /// Resolves once the registry has been updated, so every broadcast the hub
    /// processes afterwards reaches this session. An id that is already
    /// registered is rejected and the existing entry is left in place.
    pub async fn join(&self, id: SessionId, mailbox: Mailbox) -> Result<Membership, JoinError> {
        let (respond_to, response) = oneshot::channel();
        self.submit(HubRequest::Join {
            id,
            mailbox,
            respond_to,
        })
        .await?;
        response.await.map_err(|_| HubClosed)?.map_err(JoinError::from)
    }

    /// Removes `id` from the registry. Leaving twice is harmless.
    pub async fn leave(&self, id: SessionId) -> Result<(), HubClosed> {
        self.submit(HubRequest::Leave { id }).await
    }

    /// Queues `message` for every session registered when the hub reaches
    /// this request. `origin` names the sending session, if any, so the
    /// configured [`BroadcastPolicy`] can skip it.
    pub async fn broadcast(
        &self,
        message: ChatMessage,
        origin: Option<SessionId>,
    ) -> Result<(), HubClosed> {
        self.submit(HubRequest::Broadcast {
            origin,
            message: Arc::new(message),
        })
        .await
    }

    /// Snapshot of the registered ids, sorted.
    pub async fn members(&self) -> Result<Vec<SessionId>, HubClosed> {
        let (respond_to, response) = oneshot::channel();
        self.submit(HubRequest::Members { respond_to }).await?;
        response.await.map_err(|_| HubClosed)
    }

    /// Stops the hub. Every mailbox is dropped, which closes all sessions.
    pub async fn shutdown(&self) -> Result<(), HubClosed> {
        self.submit(HubRequest::Shutdown).await
    }

    async fn submit(&self, request: HubRequest) -> Result<(), HubClosed> {
        self.requests.send(request).await.map_err(|_| HubClosed)
    }
}

/// Starts the hub task and returns a handle to it together with the task's
/// join handle.
pub fn spawn(config: HubConfig) -> (HubHandle, JoinHandle<()>) {
    let (requests, queue) = mpsc::channel(config.request_capacity.max(1));
    let hub = Hub {
        registry: HashMap::new(),
        policy: config.policy,
    };
    let task = tokio::spawn(hub.run(queue));

    let handle = HubHandle {
        requests,
        next_seq: Arc::new(AtomicU64::new(1)),
    };
    (handle, task)
}

struct Hub {
    registry: HashMap<SessionId, Entry>,
    policy: BroadcastPolicy,
}

impl Hub {
    async fn run(mut self, mut queue: mpsc::Receiver<HubRequest>) {
        while let Some(request) = queue.recv().await {
            match request {
                HubRequest::Join {
                    id,
                    mailbox,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.join(id, mailbox));
                }
                HubRequest::Leave { id } => self.leave(id),
                HubRequest::Broadcast { origin, message } => self.broadcast(origin, message),
                HubRequest::Members { respond_to } => {
                    let _ = respond_to.send(self.members());
                }
                HubRequest::Shutdown => break,
            }
        }

        info!(sessions = self.registry.len(), "hub stopped");
    }

    fn join(&mut self, id: SessionId, mailbox: Mailbox) -> Result<Membership, RegistryConflict> {
        if self.registry.contains_key(&id) {
            warn!(session = %id, "rejecting duplicate session id");
            return Err(RegistryConflict(id));
        }

        let (membership, ended) = oneshot::channel();
        self.registry.insert(
            id,
            Entry {
                mailbox,
                _membership: membership,
            },
        );
        info!(session = %id, total = self.registry.len(), "session joined");
        Ok(Membership { ended })
    }

    fn leave(&mut self, id: SessionId) {
        if self.registry.remove(&id).is_some() {
            info!(session = %id, total = self.registry.len(), "session left");
        }
    }

    fn broadcast(&mut self, origin: Option<SessionId>, message: Arc<ChatMessage>) {
        let mut failed = Vec::new();
        let mut delivered = 0usize;

        for (id, entry) in &self.registry {
            if self.policy == BroadcastPolicy::ExcludeSender && origin == Some(*id) {
                continue;
            }

            match entry.mailbox.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = %id, "mailbox full; dropping stalled session");
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = %id, "mailbox closed; dropping session");
                    failed.push(*id);
                }
            }
        }

        for id in &failed {
            self.leave(*id);
        }

        debug!(
            nick = message.nick(),
            delivered,
            dropped = failed.len(),
            "broadcast complete"
        );
    }

    fn members(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.registry.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
