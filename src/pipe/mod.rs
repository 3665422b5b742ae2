//! The per-peer connection state machine.
//!
//! One `Pipe` per peer address: a socket, the handshake logic for both roles,
//! and the outgoing/sent/incoming sequence bookkeeping that makes delivery
//! exactly-once on lossless pipes. A reader task and a writer task share the
//! pipe through one async mutex plus a `Notify` used like a condition
//! variable: waiters register interest before releasing the mutex, so a
//! signal between unlock and sleep cannot be lost.

mod accept;
mod connect;
mod delayed;
mod reader;
mod writer;

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::auth::SessionSecurity;
use crate::connection::ConnectionState;
use crate::dispatch::ConnectionEvent;
use crate::message::{Message, PRIO_HIGHEST};
use crate::messenger::{Messenger, Policy};
use crate::peer_addr::{HostType, PeerAddr};
use crate::transport::SocketIo;
use crate::wire::feature;

use delayed::DelayedDelivery;

/// the randomized initial out-seq is capped to 31 bits so checksums over
///  fresh sessions are not trivially predictable
const SEQ_MASK: u64 = 0x7fff_ffff;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PipeState {
    /// inbound connection, handshake not finished
    Accepting,
    /// outbound handshake in progress (or scheduled)
    Connecting,
    Open,
    /// server-role pipe waiting for the peer to reconnect
    Standby,
    Closing,
    Closed,
    /// lost a simultaneous-connect race; the peer's accepting side drives
    Wait,
}

pub(crate) struct Pipe {
    /// messenger-internal key, stable across connection-id swaps
    pub(crate) id: u64,
    pub(crate) msgr: Arc<Messenger>,
    peer: StdMutex<(PeerAddr, HostType)>,
    pub(crate) core: Mutex<PipeCore>,
    pub(crate) cond: Notify,
}

pub(crate) struct PipeCore {
    pub sock: Option<SocketIo>,
    pub state: PipeState,
    pub policy: Policy,
    pub conn_id: u64,

    /// session epoch, negotiated with the peer; survives reconnects
    pub connect_seq: u64,
    /// the peer's messenger-wide sequence from its last accepted attempt
    pub peer_global_seq: u64,
    /// last assigned outbound message sequence
    pub out_seq: u64,
    /// highest inbound sequence received
    pub in_seq: u64,
    /// highest inbound sequence we have acked; never above in_seq
    pub in_seq_acked: u64,

    /// pending outgoing messages by priority; higher priorities drain first
    pub out_q: BTreeMap<u8, VecDeque<Message>>,
    /// transmitted but not yet acknowledged; spliced back into out_q on fault
    pub sent: VecDeque<Message>,

    pub backoff: Duration,
    pub keepalive: bool,
    pub close_on_empty: bool,

    pub connection: Arc<ConnectionState>,
    pub session_security: Option<SessionSecurity>,
    pub delayed: Option<Arc<DelayedDelivery>>,

    pub reader_running: bool,
    pub writer_running: bool,
    pub reader_join: Option<JoinHandle<()>>,
}

impl Pipe {
    pub(crate) fn new(
        msgr: &Arc<Messenger>,
        state: PipeState,
        policy: Policy,
        peer_addr: PeerAddr,
        peer_type: HostType,
        sock: Option<SocketIo>,
    ) -> Arc<Pipe> {
        let connection = Arc::new(ConnectionState::new(peer_addr, peer_type));
        let pipe = Arc::new(Pipe {
            id: msgr.next_pipe_id(),
            msgr: msgr.clone(),
            peer: StdMutex::new((peer_addr, peer_type)),
            core: Mutex::new(PipeCore {
                sock,
                state,
                policy,
                conn_id: msgr.next_conn_id(),
                connect_seq: 0,
                peer_global_seq: 0,
                out_seq: 0,
                in_seq: 0,
                in_seq_acked: 0,
                out_q: BTreeMap::new(),
                sent: VecDeque::new(),
                backoff: Duration::ZERO,
                keepalive: false,
                close_on_empty: false,
                connection,
                session_security: None,
                delayed: None,
                reader_running: false,
                writer_running: false,
                reader_join: None,
            }),
            cond: Notify::new(),
        });
        pipe.core
            .try_lock()
            .expect("new pipe is unshared")
            .connection
            .reset_pipe(Arc::downgrade(&pipe));
        pipe
    }

    pub(crate) fn peer_addr(&self) -> PeerAddr {
        self.peer.lock().unwrap().0
    }

    pub(crate) fn peer_type(&self) -> HostType {
        self.peer.lock().unwrap().1
    }

    pub(crate) fn set_peer(&self, addr: PeerAddr, host_type: HostType) {
        *self.peer.lock().unwrap() = (addr, host_type);
    }

    // ---- condition variable -------------------------------------------------

    /// Release the core mutex, sleep until signalled, re-acquire. Interest is
    ///  registered before the guard is dropped, so no signal can fall through
    ///  the crack.
    pub(crate) async fn wait<'a>(
        &'a self,
        guard: MutexGuard<'a, PipeCore>,
    ) -> MutexGuard<'a, PipeCore> {
        let notified = self.cond.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        notified.await;
        self.core.lock().await
    }

    /// Like `wait`, but also wakes after `timeout`.
    pub(crate) async fn wait_timeout<'a>(
        &'a self,
        guard: MutexGuard<'a, PipeCore>,
        timeout: Duration,
    ) -> MutexGuard<'a, PipeCore> {
        let notified = self.cond.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        drop(guard);
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep(timeout) => {}
        }
        self.core.lock().await
    }

    // ---- tasks --------------------------------------------------------------

    pub(crate) fn start_reader(self: &Arc<Self>, core: &mut PipeCore) {
        debug_assert!(!core.reader_running);
        core.reader_running = true;
        let pipe = self.clone();
        core.reader_join = Some(tokio::spawn(reader::run(pipe)));
    }

    pub(crate) fn start_writer(self: &Arc<Self>, core: &mut PipeCore) {
        debug_assert!(!core.writer_running);
        core.writer_running = true;
        let pipe = self.clone();
        tokio::spawn(writer::run(pipe));
    }

    /// Wake the reader and wait for its task to finish. Only called by the
    ///  writer before it reruns the connecting handshake; the reader leaves
    ///  its loop as soon as it observes the connecting state.
    pub(crate) async fn join_reader(self: &Arc<Self>) {
        let handle = {
            let mut core = self.core.lock().await;
            if !core.reader_running {
                return;
            }
            self.cond.notify_waiters();
            core.reader_join.take()
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Common tail of both task loops: clear the running flag, and once both
    ///  tasks are done hand the pipe to the messenger's reaper.
    pub(crate) async fn task_finished(self: &Arc<Self>, is_reader: bool) {
        let mut core = self.core.lock().await;
        if is_reader {
            core.reader_running = false;
        } else {
            core.writer_running = false;
        }
        let done = !core.reader_running && !core.writer_running;
        if done {
            if let Some(sock) = &core.sock {
                sock.shutdown();
            }
        }
        drop(core);
        if done {
            debug!("pipe to {:?} finished, queueing for reap", self.peer_addr());
            self.msgr.queue_reap(self.clone());
        }
    }

    // ---- queues and sequencing ---------------------------------------------

    pub(crate) fn queue_message(&self, core: &mut PipeCore, msg: Message) {
        core.out_q.entry(msg.priority).or_default().push_back(msg);
        self.cond.notify_waiters();
    }

    pub(crate) fn get_next_outgoing(&self, core: &mut PipeCore) -> Option<Message> {
        let prio = *core.out_q.keys().next_back()?;
        let queue = core.out_q.get_mut(&prio).expect("key just observed");
        let msg = queue.pop_front();
        if queue.is_empty() {
            core.out_q.remove(&prio);
        }
        msg
    }

    /// The peer has processed everything up to `seq`: drop it from the
    ///  resend list. Closes the pipe if that drained a close-on-empty pipe.
    pub(crate) fn handle_ack(&self, core: &mut PipeCore, seq: u64) {
        trace!("reader got ack seq {}", seq);
        while let Some(front) = core.sent.front() {
            if front.seq > seq {
                break;
            }
            let m = core.sent.pop_front().expect("front just observed");
            trace!("ack seq {} covers {:?}", seq, m);
        }
        if core.sent.is_empty() && core.close_on_empty {
            debug!("got last ack, queue empty, closing");
            self.stop_with(core);
        }
    }

    /// Splice unacknowledged messages back to the head of the queue, undoing
    ///  their sequence assignment; resending re-assigns the same numbers, so
    ///  the peer sees an identical sequence space and can discard replays.
    pub(crate) fn requeue_sent(&self, core: &mut PipeCore) {
        if core.sent.is_empty() {
            return;
        }
        while let Some(m) = core.sent.pop_back() {
            core.out_seq -= 1;
            debug!("requeue_sent {:?} for resend, out_seq now {}", m, core.out_seq);
            core.out_q.entry(PRIO_HIGHEST).or_default().push_front(m);
        }
    }

    /// After a reconnect the peer reported everything it had already
    ///  received; drop those from the requeued head instead of resending.
    pub(crate) fn discard_requeued_up_to(&self, core: &mut PipeCore, seq: u64) {
        debug!("discard_requeued_up_to {}", seq);
        let Some(rq) = core.out_q.get_mut(&PRIO_HIGHEST) else {
            return;
        };
        while let Some(front) = rq.front() {
            if front.seq == 0 || front.seq > seq {
                break;
            }
            debug!("  discarding {:?}, already acked", front);
            rq.pop_front();
            core.out_seq += 1;
        }
        if rq.is_empty() {
            core.out_q.remove(&PRIO_HIGHEST);
        }
    }

    pub(crate) fn discard_out_queue(&self, core: &mut PipeCore) {
        debug!("discarding out queue");
        core.sent.clear();
        core.out_q.clear();
    }

    pub(crate) fn is_queued(core: &PipeCore) -> bool {
        !core.out_q.is_empty() || core.keepalive
    }

    fn randomize_out_seq(&self, core: &mut PipeCore) {
        if core.connection.features() & feature::MSG_AUTH != 0 {
            core.out_seq = rand::thread_rng().gen::<u64>() & SEQ_MASK;
            debug!("randomize_out_seq {}", core.out_seq);
        } else {
            core.out_seq = 0;
        }
    }

    // ---- lifecycle ----------------------------------------------------------

    pub(crate) fn stop_with(&self, core: &mut PipeCore) {
        debug!("stop pipe to {:?}", self.peer_addr());
        core.state = PipeState::Closed;
        self.cond.notify_waiters();
        if let Some(sock) = &core.sock {
            sock.shutdown();
        }
    }

    /// The peer told us our session is stale: drop all queued traffic, restart
    ///  the sequence space and surface a remote-reset to the dispatch queue.
    pub(crate) async fn was_session_reset(self: &Arc<Self>, core: &mut PipeCore) {
        debug!("session reset by peer");
        self.msgr.dispatch.discard(core.conn_id).await;
        if let Some(d) = core.delayed.clone() {
            d.discard().await;
        }
        self.discard_out_queue(core);

        self.msgr
            .dispatch
            .control(ConnectionEvent::RemoteReset(core.connection.clone()))
            .await;

        self.randomize_out_seq(core);
        core.in_seq = 0;
        core.connect_seq = 0;
    }

    /// Transport fault. Lossy pipes die here; lossless ones flush delayed
    ///  messages, requeue unacked traffic and either go to standby (server
    ///  role) or schedule a reconnect with exponential backoff.
    pub(crate) async fn fault<'a>(
        self: &'a Arc<Self>,
        mut core: MutexGuard<'a, PipeCore>,
        onread: bool,
    ) -> MutexGuard<'a, PipeCore> {
        self.cond.notify_waiters();

        if onread && core.state == PipeState::Connecting {
            debug!("fault already connecting, reader shutting down");
            return core;
        }
        if matches!(core.state, PipeState::Closed | PipeState::Closing) {
            debug!("fault already closed|closing");
            return core;
        }

        if let Some(sock) = &core.sock {
            sock.shutdown();
        }

        if core.policy.lossy && core.state != PipeState::Connecting {
            debug!("fault on lossy channel, failing");
            self.stop_with(&mut core);
            let conn = core.connection.clone();
            let conn_id = core.conn_id;
            let delayed = core.delayed.clone();
            drop(core);

            self.msgr.inject_internal_delay().await;

            // unregister under the messenger lock; nobody hands out this pipe
            //  afterwards
            {
                let mut msgr_core = self.msgr.core.lock().await;
                msgr_core.unregister(self);
                conn.clear_pipe(self);
                drop(msgr_core);
            }

            self.msgr.dispatch.discard(conn_id).await;
            if let Some(d) = delayed {
                d.discard().await;
            }
            {
                let mut core = self.core.lock().await;
                self.discard_out_queue(&mut core);
            }
            self.msgr
                .dispatch
                .control(ConnectionEvent::Reset(conn))
                .await;
            return self.core.lock().await;
        }

        // queue delayed items immediately
        if let Some(d) = core.delayed.clone() {
            d.flush().await;
        }
        self.requeue_sent(&mut core);

        if core.policy.standby && !Pipe::is_queued(&core) {
            debug!("fault with nothing to send, going to standby");
            core.state = PipeState::Standby;
            return core;
        }

        if core.state != PipeState::Connecting {
            if core.policy.server {
                debug!("fault, server, going to standby");
                core.state = PipeState::Standby;
            } else {
                debug!("fault, initiating reconnect");
                core.connect_seq += 1;
                core.state = PipeState::Connecting;
            }
            core.backoff = Duration::ZERO;
        } else if core.backoff.is_zero() {
            debug!("fault");
            core.backoff = self.msgr.config.initial_backoff;
        } else {
            debug!("fault waiting {:?}", core.backoff);
            let delay = core.backoff;
            core = self.wait_timeout(core, delay).await;
            core.backoff = (core.backoff * 2).min(self.msgr.config.max_backoff);
            debug!("fault done waiting or woke up");
        }
        core
    }

    /// Start the delayed-delivery queue if this peer's host type is selected
    ///  by the injection config.
    pub(crate) async fn maybe_start_delayed(self: &Arc<Self>) {
        let type_filter = &self.msgr.config.inject_delay_type;
        if type_filter.is_empty() {
            return;
        }
        if !type_filter.contains(self.peer_type().name()) {
            return;
        }
        let mut core = self.core.lock().await;
        if core.delayed.is_none() {
            debug!("setting up a delayed-delivery queue on pipe to {:?}", self.peer_addr());
            core.delayed = Some(DelayedDelivery::spawn(
                self.msgr.dispatch.clone(),
                core.conn_id,
            ));
        }
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "pipe#{}({:?})", self.id, self.peer_addr())
    }
}
