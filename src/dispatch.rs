use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::ConnectionState;
use crate::message::Message;

/// Connection lifecycle notifications, surfaced alongside received messages.
#[derive(Clone)]
pub enum ConnectionEvent {
    /// an inbound handshake completed
    Accepted(Arc<ConnectionState>),
    /// an outbound handshake completed
    Connected(Arc<ConnectionState>),
    /// a lossy pipe died; its queued messages are gone
    Reset(Arc<ConnectionState>),
    /// the peer declared our session stale; queues were dropped and sequence
    ///  numbers restarted
    RemoteReset(Arc<ConnectionState>),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (name, conn) = match self {
            ConnectionEvent::Accepted(c) => ("accepted", c),
            ConnectionEvent::Connected(c) => ("connected", c),
            ConnectionEvent::Reset(c) => ("reset", c),
            ConnectionEvent::RemoteReset(c) => ("remote_reset", c),
        };
        write!(f, "{}({:?})", name, conn.peer_addr())
    }
}

/// The downstream consumer of everything a pipe receives. The messenger does
///  not interpret messages; it pushes them here in wire-arrival order per
///  (pipe, priority) and lets the sink do priority ordering and delivery.
#[async_trait::async_trait]
pub trait DispatchSink: Send + Sync {
    async fn enqueue(&self, msg: Message, priority: u8, conn_id: u64);

    async fn control(&self, event: ConnectionEvent);

    /// drop everything queued for one connection (pipe died before dispatch)
    async fn discard(&self, conn_id: u64);
}

/// What a [`ChannelDispatch`] delivers.
#[derive(Debug)]
pub enum DispatchItem {
    Message {
        msg: Message,
        priority: u8,
        conn_id: u64,
    },
    Event(ConnectionEvent),
    Discarded(u64),
}

/// A sink that forwards everything into an unbounded channel, in order.
///  Handy for tests and for embedders that already have their own executor
///  loop on the consuming side.
pub struct ChannelDispatch {
    tx: mpsc::UnboundedSender<DispatchItem>,
}

impl ChannelDispatch {
    pub fn new() -> (Arc<ChannelDispatch>, mpsc::UnboundedReceiver<DispatchItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelDispatch { tx }), rx)
    }
}

#[async_trait::async_trait]
impl DispatchSink for ChannelDispatch {
    async fn enqueue(&self, msg: Message, priority: u8, conn_id: u64) {
        if self
            .tx
            .send(DispatchItem::Message {
                msg,
                priority,
                conn_id,
            })
            .is_err()
        {
            debug!("dispatch receiver is gone, dropping message");
        }
    }

    async fn control(&self, event: ConnectionEvent) {
        if self.tx.send(DispatchItem::Event(event)).is_err() {
            debug!("dispatch receiver is gone, dropping event");
        }
    }

    async fn discard(&self, conn_id: u64) {
        let _ = self.tx.send(DispatchItem::Discarded(conn_id));
    }
}
