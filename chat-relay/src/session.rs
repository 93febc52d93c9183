//! One worker per connected client.
//!
//! The worker registers a mailbox with the hub, then runs two activities side
//! by side: the read loop (in the caller's task) submits every decoded message
//! to the hub, and a spawned delivery task drains the mailbox into the
//! connection. Whichever side fails first ends the session: the worker leaves
//! the hub, stops the delivery task and the write half gets closed. Removal by
//! the hub (a stalled mailbox, or shutdown) ends the session the same way.
//!
//! A peer that stops reading can leave a send pending forever, so every send
//! races the stop signal and teardown gives the delivery task
//! [`CLOSE_GRACE`] before aborting it.

use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    connection::{Connection, MessageSink, MessageSource},
    error::{ReceiveError, SessionError, TransportError},
    hub::{HubHandle, SessionId},
    message::ChatMessage,
};

/// How long a stopped delivery task may spend closing the write half.
pub const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    Registered,
    Closing,
    Closed,
}

pub struct Session {
    id: SessionId,
    hub: HubHandle,
    config: SessionConfig,
    state: SessionState,
}

/// How the delivery task ended.
#[derive(Debug)]
enum DeliveryEnd {
    Stopped,
    MailboxClosed,
    SendFailed(TransportError),
}

impl Session {
    pub fn new(id: SessionId, hub: HubHandle, config: SessionConfig) -> Self {
        Self {
            id,
            hub,
            config,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Drives the session until the connection fails or the hub drops it.
    ///
    /// A clean close by the peer, or removal by the hub, returns `Ok`.
    pub async fn run<C: Connection>(mut self, connection: C) -> Result<(), SessionError> {
        let (mut sink, mut source) = connection.split();
        let (mailbox, inbox) = mpsc::channel(self.config.mailbox_capacity.max(1));

        let mut membership = match self.hub.join(self.id, mailbox).await {
            Ok(membership) => membership,
            Err(err) => {
                self.transition(SessionState::Closed);
                let _ = timeout(CLOSE_GRACE, sink.close()).await;
                return Err(err.into());
            }
        };
        self.transition(SessionState::Registered);

        let (stop_tx, stop_rx) = oneshot::channel();
        let mut delivery = tokio::spawn(deliver(self.id, sink, inbox, stop_rx));

        let (result, delivery_end) = select! {
            result = read_loop(self.id, &self.hub, &mut source) => (result, None),
            joined = &mut delivery => (Ok(()), Some(joined)),
            _ = membership.ended() => {
                debug!(session = %self.id, "removed by hub");
                (Ok(()), None)
            }
        };

        self.transition(SessionState::Closing);
        if self.hub.leave(self.id).await.is_err() {
            debug!(session = %self.id, "hub already stopped");
        }

        let delivery_end = match delivery_end {
            Some(joined) => joined,
            None => stop_delivery(stop_tx, delivery).await,
        };
        self.transition(SessionState::Closed);

        let result = match (result, delivery_end) {
            (Err(err), _) => Err(err),
            (Ok(()), Ok(DeliveryEnd::SendFailed(err))) => Err(SessionError::Send(err)),
            (Ok(()), _) => Ok(()),
        };

        match &result {
            Ok(()) => info!(session = %self.id, "session closed"),
            Err(err) => info!(session = %self.id, error = %err, "session closed with error"),
        }
        result
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session = %self.id, from = ?self.state, to = ?next, "session state");
        self.state = next;
    }
}

async fn read_loop<S: MessageSource>(
    id: SessionId,
    hub: &HubHandle,
    source: &mut S,
) -> Result<(), SessionError> {
    loop {
        let message = match source.receive().await {
            Ok(message) => message,
            Err(ReceiveError::Transport(TransportError::Closed)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        if message.text().trim().is_empty() {
            continue;
        }

        debug!(session = %id, nick = message.nick(), "inbound message");
        hub.broadcast(message, Some(id)).await?;
    }
}

async fn deliver<K: MessageSink>(
    id: SessionId,
    mut sink: K,
    mut inbox: mpsc::Receiver<Arc<ChatMessage>>,
    mut stop: oneshot::Receiver<()>,
) -> DeliveryEnd {
    let end = loop {
        select! {
            _ = &mut stop => break DeliveryEnd::Stopped,
            next = inbox.recv() => {
                let Some(message) = next else {
                    break DeliveryEnd::MailboxClosed;
                };
                select! {
                    _ = &mut stop => break DeliveryEnd::Stopped,
                    sent = sink.send(&message) => {
                        if let Err(err) = sent {
                            debug!(session = %id, error = %err, "failed to deliver message");
                            break DeliveryEnd::SendFailed(err);
                        }
                    }
                }
            }
        }
    };

    sink.close().await;
    end
}

async fn stop_delivery(
    stop: oneshot::Sender<()>,
    mut delivery: JoinHandle<DeliveryEnd>,
) -> Result<DeliveryEnd, tokio::task::JoinError> {
    let _ = stop.send(());
    let joined = match timeout(CLOSE_GRACE, &mut delivery).await {
        Ok(joined) => joined,
        Err(_) => {
            // Still stuck closing a peer that does not read; dropping the
            // task drops the write half.
            warn!("delivery task did not stop in time; aborting");
            delivery.abort();
            return Ok(DeliveryEnd::Stopped);
        }
    };
    if let Err(err) = &joined {
        warn!(error = ?err, "delivery task did not finish cleanly");
    }
    joined
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::time::timeout;

    use super::*;
    use crate::{config::HubConfig, error::DecodeError, hub, message};

    const WAIT: Duration = Duration::from_secs(1);

    /// In-memory connection: frames pushed by the test arrive as raw bytes and
    /// pass through the real codec.
    struct MemoryConnection {
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        outbound: mpsc::UnboundedSender<ChatMessage>,
        mode: SinkMode,
    }

    #[derive(Clone, Copy)]
    enum SinkMode {
        Deliver,
        Fail,
        /// A peer that never reads: sends and the close never complete.
        Stall,
    }

    struct MemorySink {
        outbound: mpsc::UnboundedSender<ChatMessage>,
        mode: SinkMode,
    }

    struct MemorySource {
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    struct Peer {
        frames: mpsc::UnboundedSender<Vec<u8>>,
        received: mpsc::UnboundedReceiver<ChatMessage>,
    }

    impl Peer {
        fn send(&self, message: &ChatMessage) {
            let bytes = message::encode(message).expect("encode");
            self.frames.send(bytes).expect("session reading");
        }

        async fn recv(&mut self) -> Option<ChatMessage> {
            timeout(WAIT, self.received.recv()).await.expect("timed out")
        }
    }

    fn memory_connection(mode: SinkMode) -> (MemoryConnection, Peer) {
        let (frames, inbound) = mpsc::unbounded_channel();
        let (outbound, received) = mpsc::unbounded_channel();
        let connection = MemoryConnection {
            inbound,
            outbound,
            mode,
        };
        (connection, Peer { frames, received })
    }

    impl Connection for MemoryConnection {
        type Sink = MemorySink;
        type Source = MemorySource;

        fn split(self) -> (MemorySink, MemorySource) {
            (
                MemorySink {
                    outbound: self.outbound,
                    mode: self.mode,
                },
                MemorySource {
                    inbound: self.inbound,
                },
            )
        }
    }

    #[async_trait]
    impl MessageSink for MemorySink {
        async fn send(&mut self, message: &ChatMessage) -> Result<(), TransportError> {
            match self.mode {
                SinkMode::Deliver => self
                    .outbound
                    .send(message.clone())
                    .map_err(|_| TransportError::Closed),
                SinkMode::Fail => Err(TransportError::io("broken pipe")),
                SinkMode::Stall => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            if let SinkMode::Stall = self.mode {
                std::future::pending::<()>().await;
            }
        }
    }

    #[async_trait]
    impl MessageSource for MemorySource {
        async fn receive(&mut self) -> Result<ChatMessage, ReceiveError> {
            match self.inbound.recv().await {
                Some(bytes) => Ok(message::decode(&bytes)?),
                None => Err(TransportError::Closed.into()),
            }
        }
    }

    async fn wait_for_members(hub: &HubHandle, expected: usize) -> Vec<SessionId> {
        timeout(WAIT, async {
            loop {
                let members = hub.members().await.expect("members");
                if members.len() == expected {
                    return members;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("registry never settled")
    }

    #[tokio::test]
    async fn relays_messages_between_sessions() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn_a, mut alice) = memory_connection(SinkMode::Deliver);
        let (conn_b, mut bob) = memory_connection(SinkMode::Deliver);

        let a = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let b = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        tokio::spawn(a.run(conn_a));
        tokio::spawn(b.run(conn_b));
        wait_for_members(&hub, 2).await;

        let hello = ChatMessage::new("alice", "hello bob");
        alice.send(&hello);

        assert_eq!(bob.recv().await, Some(hello.clone()));
        assert_eq!(alice.recv().await, Some(hello));
    }

    #[tokio::test]
    async fn blank_messages_are_not_broadcast() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn, mut alice) = memory_connection(SinkMode::Deliver);
        let session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        tokio::spawn(session.run(conn));
        wait_for_members(&hub, 1).await;

        alice.send(&ChatMessage::new("alice", "   "));
        alice.send(&ChatMessage::new("alice", "real"));

        assert_eq!(alice.recv().await.expect("echo").text(), "real");
    }

    #[tokio::test]
    async fn malformed_frame_ends_only_that_session() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn_bad, bad) = memory_connection(SinkMode::Deliver);
        let (conn_good, mut good) = memory_connection(SinkMode::Deliver);

        let bad_session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let good_session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let good_id = good_session.id();
        let bad_task = tokio::spawn(bad_session.run(conn_bad));
        tokio::spawn(good_session.run(conn_good));
        wait_for_members(&hub, 2).await;

        bad.frames.send(b"{\"nick\":".to_vec()).expect("send frame");
        let result = timeout(WAIT, bad_task).await.expect("timed out").expect("join");
        assert!(matches!(
            result,
            Err(SessionError::Receive(ReceiveError::Decode(DecodeError::Truncated(_))))
        ));
        assert_eq!(wait_for_members(&hub, 1).await, vec![good_id]);

        good.send(&ChatMessage::new("carol", "still flowing"));
        assert_eq!(good.recv().await.expect("echo").text(), "still flowing");
    }

    #[tokio::test]
    async fn clean_close_deregisters() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn, peer) = memory_connection(SinkMode::Deliver);
        let session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let task = tokio::spawn(session.run(conn));
        wait_for_members(&hub, 1).await;

        drop(peer);
        let result = timeout(WAIT, task).await.expect("timed out").expect("join");
        assert!(result.is_ok());
        assert!(hub.members().await.expect("members").is_empty());
    }

    #[tokio::test]
    async fn send_failure_ends_session_and_deregisters() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn, _peer) = memory_connection(SinkMode::Fail);
        let session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let task = tokio::spawn(session.run(conn));
        wait_for_members(&hub, 1).await;

        hub.broadcast(ChatMessage::new("alice", "undeliverable"), None)
            .await
            .expect("broadcast");

        let result = timeout(WAIT, task).await.expect("timed out").expect("join");
        assert!(matches!(result, Err(SessionError::Send(_))));
        assert!(hub.members().await.expect("members").is_empty());
    }

    #[tokio::test]
    async fn duplicate_id_fails_registration() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let id = hub.next_session_id(None);
        let (conn_a, _alice) = memory_connection(SinkMode::Deliver);
        let (conn_b, _bob) = memory_connection(SinkMode::Deliver);

        tokio::spawn(Session::new(id, hub.clone(), SessionConfig::default()).run(conn_a));
        wait_for_members(&hub, 1).await;

        let result = Session::new(id, hub.clone(), SessionConfig::default())
            .run(conn_b)
            .await;
        assert!(matches!(result, Err(SessionError::Join(_))));
        assert_eq!(hub.members().await.expect("members"), vec![id]);
    }

    #[tokio::test]
    async fn hub_shutdown_closes_sessions() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn, mut peer) = memory_connection(SinkMode::Deliver);
        let session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let task = tokio::spawn(session.run(conn));
        wait_for_members(&hub, 1).await;

        hub.shutdown().await.expect("shutdown");
        assert_eq!(peer.recv().await, None);

        drop(peer);
        let result = timeout(WAIT, task).await.expect("timed out").expect("join");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn read_error_ends_session_while_peer_stalls() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn, mut peer) = memory_connection(SinkMode::Stall);
        let session = Session::new(hub.next_session_id(None), hub.clone(), SessionConfig::default());
        let task = tokio::spawn(session.run(conn));
        wait_for_members(&hub, 1).await;

        hub.broadcast(ChatMessage::new("alice", "never read"), None)
            .await
            .expect("broadcast");
        tokio::task::yield_now().await;
        peer.frames.send(b"not json".to_vec()).expect("send frame");

        let result = timeout(CLOSE_GRACE + WAIT, task)
            .await
            .expect("session hung on a stalled peer")
            .expect("join");
        assert!(matches!(
            result,
            Err(SessionError::Receive(ReceiveError::Decode(_)))
        ));
        assert!(hub.members().await.expect("members").is_empty());
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn evicted_session_closes_its_connection() {
        let (hub, _task) = hub::spawn(HubConfig::default());
        let (conn, mut peer) = memory_connection(SinkMode::Stall);
        let config = SessionConfig { mailbox_capacity: 1 };
        let session = Session::new(hub.next_session_id(None), hub.clone(), config);
        let task = tokio::spawn(session.run(conn));
        wait_for_members(&hub, 1).await;

        // One send in flight, one buffered, the third overflows.
        for n in 0..3 {
            hub.broadcast(ChatMessage::new("alice", format!("burst {n}")), None)
                .await
                .expect("broadcast");
        }

        let result = timeout(CLOSE_GRACE + WAIT, task)
            .await
            .expect("evicted session kept running")
            .expect("join");
        assert!(result.is_ok());
        assert!(hub.members().await.expect("members").is_empty());
        assert_eq!(peer.recv().await, None);
    }
}
