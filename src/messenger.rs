use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use anyhow::bail;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, info, trace};

use crate::acceptor::Acceptor;
use crate::auth::Authenticator;
use crate::config::MessengerConfig;
use crate::dispatch::DispatchSink;
use crate::message::Message;
use crate::peer_addr::{HostType, PeerAddr};
use crate::pipe::{Pipe, PipeState};
use crate::throttle::Throttle;
use crate::transport::SocketIo;

/// Per-peer-type connection policy: who survives faults, who reconnects, and
///  which feature bits are on the table.
#[derive(Clone)]
pub struct Policy {
    /// faults are terminal and queued messages may be dropped
    pub lossy: bool,
    /// never initiates (re)connects
    pub server: bool,
    /// on fault, wait for the peer instead of reconnecting immediately
    pub standby: bool,
    /// detect peers that restarted mid-session and answer RESETSESSION
    pub resetcheck: bool,

    pub features_supported: u64,
    pub features_required: u64,

    /// byte budget for inbound messages from peers under this policy
    pub throttler_bytes: Option<Arc<Throttle>>,
    /// message-count budget, same scope
    pub throttler_messages: Option<Arc<Throttle>>,
}

impl Policy {
    fn base(lossy: bool, server: bool, standby: bool, resetcheck: bool) -> Policy {
        Policy {
            lossy,
            server,
            standby,
            resetcheck,
            features_supported: crate::wire::feature::ALL,
            features_required: 0,
            throttler_bytes: None,
            throttler_messages: None,
        }
    }

    /// server side of a lossless session (e.g. store-to-store traffic)
    pub fn stateful_server() -> Policy {
        Policy::base(false, true, true, true)
    }

    /// server side that drops dead clients on the floor
    pub fn stateless_server() -> Policy {
        Policy::base(true, true, false, false)
    }

    /// symmetric lossless peering; both sides reconnect
    pub fn lossless_peer() -> Policy {
        Policy::base(false, false, true, false)
    }

    pub fn lossy_client() -> Policy {
        Policy::base(true, false, false, false)
    }

    pub fn lossless_client() -> Policy {
        Policy::base(false, false, false, true)
    }
}

/// A point-in-time view of the pipe to one peer, for diagnostics and tests.
#[derive(Clone, Copy, Debug)]
pub struct PeerStats {
    pub state: PipeState,
    pub connect_seq: u64,
    pub peer_global_seq: u64,
    pub out_seq: u64,
    pub in_seq: u64,
    pub in_seq_acked: u64,
    pub out_queue_len: usize,
    pub sent_len: usize,
}

pub(crate) struct MessengerCore {
    pub stopped: bool,
    /// peer address -> the single authoritative pipe
    rank_pipe: FxHashMap<PeerAddr, Arc<Pipe>>,
    /// every live pipe (including accepting ones not yet in rank_pipe)
    pipes: FxHashMap<u64, Arc<Pipe>>,
}

impl MessengerCore {
    pub fn lookup(&self, addr: &PeerAddr) -> Option<Arc<Pipe>> {
        self.rank_pipe.get(addr).cloned()
    }

    pub fn register(&mut self, addr: PeerAddr, pipe: Arc<Pipe>) {
        debug!("register pipe for {:?}", addr);
        debug_assert!(self.lookup(&addr).is_none());
        self.rank_pipe.insert(addr, pipe);
    }

    /// remove the registry entry if it still points at `pipe`
    pub fn unregister(&mut self, pipe: &Arc<Pipe>) {
        let addr = pipe.peer_addr();
        if let Some(current) = self.rank_pipe.get(&addr) {
            if Arc::ptr_eq(current, pipe) {
                debug!("unregister pipe for {:?}", addr);
                self.rank_pipe.remove(&addr);
                return;
            }
        }
        trace!("unregister pipe for {:?} - not registered", addr);
    }
}

/// The process-wide messaging endpoint: owns the acceptor, the pipe registry
///  and the policy table, and hands outgoing messages to the right pipe
///  (creating one when the policy allows dialing out).
pub struct Messenger {
    pub(crate) config: Arc<MessengerConfig>,
    pub(crate) dispatch: Arc<dyn DispatchSink>,
    pub(crate) auth: Arc<dyn Authenticator>,
    host_type: HostType,
    nonce: u32,

    my_addr: StdMutex<PeerAddr>,
    need_addr: AtomicBool,

    global_seq: StdMutex<u64>,
    next_conn_id: AtomicU64,
    next_pipe_id: AtomicU64,

    pub(crate) dispatch_throttle: Arc<Throttle>,
    policies: StdMutex<PolicyTable>,

    pub(crate) core: Mutex<MessengerCore>,
    reap_tx: mpsc::UnboundedSender<Arc<Pipe>>,
    reaped: Notify,

    acceptor: StdMutex<Option<Arc<Acceptor>>>,
}

struct PolicyTable {
    default: Policy,
    by_type: FxHashMap<HostType, Policy>,
}

impl Messenger {
    /// Must be called from within a tokio runtime (the reaper task starts
    ///  immediately).
    pub fn new(
        config: Arc<MessengerConfig>,
        host_type: HostType,
        dispatch: Arc<dyn DispatchSink>,
        auth: Arc<dyn Authenticator>,
    ) -> Arc<Messenger> {
        let nonce = rand::thread_rng().gen();
        let blank = PeerAddr::new(
            if config.bind_ipv6 {
                "[::]:0".parse().expect("literal address")
            } else {
                "0.0.0.0:0".parse().expect("literal address")
            },
            nonce,
        );

        let dispatch_throttle = Throttle::new("msgr_dispatch", config.dispatch_throttle_bytes);
        let (reap_tx, reap_rx) = mpsc::unbounded_channel();

        let msgr = Arc::new(Messenger {
            config,
            dispatch,
            auth,
            host_type,
            nonce,
            my_addr: StdMutex::new(blank),
            need_addr: AtomicBool::new(true),
            global_seq: StdMutex::new(0),
            next_conn_id: AtomicU64::new(1),
            next_pipe_id: AtomicU64::new(1),
            dispatch_throttle,
            policies: StdMutex::new(PolicyTable {
                default: Policy::lossless_peer(),
                by_type: FxHashMap::default(),
            }),
            core: Mutex::new(MessengerCore {
                stopped: false,
                rank_pipe: FxHashMap::default(),
                pipes: FxHashMap::default(),
            }),
            reap_tx,
            reaped: Notify::new(),
            acceptor: StdMutex::new(None),
        });

        tokio::spawn(reaper(Arc::downgrade(&msgr), reap_rx));
        msgr
    }

    pub fn my_addr(&self) -> PeerAddr {
        *self.my_addr.lock().unwrap()
    }

    pub fn nonce(&self) -> u32 {
        self.nonce
    }

    pub fn host_type(&self) -> HostType {
        self.host_type
    }

    pub fn set_default_policy(&self, policy: Policy) {
        self.policies.lock().unwrap().default = policy;
    }

    pub fn set_policy(&self, host_type: HostType, policy: Policy) {
        self.policies.lock().unwrap().by_type.insert(host_type, policy);
    }

    pub(crate) fn policy_for(&self, host_type: HostType) -> Policy {
        let table = self.policies.lock().unwrap();
        table
            .by_type
            .get(&host_type)
            .unwrap_or(&table.default)
            .clone()
    }

    pub(crate) fn default_policy(&self) -> Policy {
        self.policies.lock().unwrap().default.clone()
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_pipe_id(&self) -> u64 {
        self.next_pipe_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Messenger-wide connection-attempt epoch; never returns the same value
    ///  twice, and never less than `at_least`.
    pub(crate) fn get_global_seq(&self, at_least: u64) -> u64 {
        let mut gseq = self.global_seq.lock().unwrap();
        if at_least > *gseq {
            *gseq = at_least;
        }
        *gseq += 1;
        *gseq
    }

    // ---- address bookkeeping ------------------------------------------------

    pub(crate) fn set_bound_addr(&self, bound: SocketAddr) {
        let mut my = self.my_addr.lock().unwrap();
        *my = PeerAddr::new(bound, self.nonce);
        self.need_addr
            .store(bound.ip().is_unspecified(), Ordering::Release);
        info!("messenger address is {:?}", *my);
    }

    /// A peer told us what our address looks like from outside; adopt the IP
    ///  if we were bound to a wildcard.
    pub(crate) fn learned_addr(&self, seen: SocketAddr) {
        if self
            .need_addr
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let mut my = self.my_addr.lock().unwrap();
            if my.addr.ip().is_unspecified() {
                my.addr = SocketAddr::new(seen.ip(), my.addr.port());
                info!("learned my addr: {:?}", *my);
            }
        }
    }

    pub(crate) fn unlearn_addr(&self) {
        self.need_addr.store(true, Ordering::Release);
    }

    // ---- lifecycle ----------------------------------------------------------

    /// Bind the listening endpoint. `addr: None` binds the preferred wildcard
    ///  with a port picked from the configured range.
    pub async fn bind(self: &Arc<Self>, addr: Option<SocketAddr>) -> anyhow::Result<()> {
        let acceptor = Arc::new(Acceptor::new(Arc::downgrade(self), self.config.clone()));
        acceptor.bind(addr, 0, 0).await?;
        *self.acceptor.lock().unwrap() = Some(acceptor);
        Ok(())
    }

    /// Start accepting connections (requires a prior `bind`).
    pub fn start(&self) -> anyhow::Result<()> {
        let acceptor = self.acceptor.lock().unwrap().clone();
        match acceptor {
            Some(acceptor) => acceptor.start(),
            None => bail!("messenger is not bound"),
        }
    }

    /// Tear down the listening socket and bind a fresh port, avoiding the old
    ///  one. Existing pipes are untouched.
    pub async fn rebind(&self, avoid_port: u16) -> anyhow::Result<()> {
        let acceptor = self.acceptor.lock().unwrap().clone();
        match acceptor {
            Some(acceptor) => acceptor.rebind(avoid_port).await,
            None => bail!("messenger is not bound"),
        }
    }

    /// Stop accepting, close every pipe and mark the messenger stopped. Use
    ///  `wait` afterwards to let the reaper drain.
    pub async fn shutdown(&self) {
        debug!("messenger shutting down");
        let acceptor = self.acceptor.lock().unwrap().take();
        if let Some(acceptor) = acceptor {
            acceptor.stop().await;
        }

        let pipes: Vec<Arc<Pipe>> = {
            let mut core = self.core.lock().await;
            core.stopped = true;
            core.pipes.values().cloned().collect()
        };
        for pipe in pipes {
            let mut pcore = pipe.core.lock().await;
            pipe.stop_with(&mut pcore);
        }
    }

    /// Wait until every pipe has been reaped.
    pub async fn wait(&self) {
        loop {
            let notified = self.reaped.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.core.lock().await.pipes.is_empty() {
                return;
            }
            notified.await;
        }
    }

    // ---- sending ------------------------------------------------------------

    /// Queue a message for a peer. Opens a pipe if none exists and the
    ///  destination policy allows dialing out; server policies drop the
    ///  message instead (the peer is expected to connect to us).
    pub async fn send_message(
        self: &Arc<Self>,
        msg: Message,
        dest: PeerAddr,
        dest_type: HostType,
    ) -> anyhow::Result<()> {
        let mut core = self.core.lock().await;
        if core.stopped {
            bail!("messenger is shut down");
        }
        debug!(to = ?dest, "submitting message");

        // a closed pipe may linger in the registry until the reaper gets to
        //  it; don't queue into the void
        let mut existing = core.lookup(&dest);
        if let Some(pipe) = &existing {
            if pipe.core.lock().await.state == PipeState::Closed {
                debug!("pipe to {:?} is closed, replacing", dest);
                core.unregister(pipe);
                existing = None;
            }
        }

        let pipe = match existing {
            Some(pipe) => pipe,
            None => {
                let policy = self.policy_for(dest_type);
                if policy.server {
                    debug!(
                        "not opening a connection to {:?} (server policy), dropping message",
                        dest
                    );
                    return Ok(());
                }
                self.connect_rank(&mut core, dest, dest_type, policy).await
            }
        };

        let mut pcore = pipe.core.lock().await;
        pipe.queue_message(&mut pcore, msg);
        Ok(())
    }

    /// Queue a message on the pipe behind a connection handle (the usual way
    ///  for a dispatch consumer to reply). Fails if the connection lost its
    ///  pipe to a lossy fault or teardown.
    pub async fn send_message_on(
        &self,
        msg: Message,
        conn: &crate::connection::ConnectionState,
    ) -> anyhow::Result<()> {
        match conn.pipe() {
            Some(pipe) => {
                let mut pcore = pipe.core.lock().await;
                pipe.queue_message(&mut pcore, msg);
                Ok(())
            }
            None => bail!("connection to {:?} has no pipe", conn.peer_addr()),
        }
    }

    /// Ask the pipe to a peer to emit a keepalive. Returns false if there is
    ///  no pipe.
    pub async fn send_keepalive(&self, dest: PeerAddr) -> bool {
        let core = self.core.lock().await;
        match core.lookup(&dest) {
            Some(pipe) => {
                let mut pcore = pipe.core.lock().await;
                pcore.keepalive = true;
                pipe.cond.notify_waiters();
                true
            }
            None => false,
        }
    }

    async fn connect_rank(
        self: &Arc<Self>,
        core: &mut MessengerCore,
        addr: PeerAddr,
        host_type: HostType,
        policy: Policy,
    ) -> Arc<Pipe> {
        debug!("connect_rank to {:?}", addr);
        let pipe = Pipe::new(self, PipeState::Connecting, policy, addr, host_type, None);
        {
            let mut pcore = pipe.core.lock().await;
            pipe.start_writer(&mut pcore);
        }
        core.pipes.insert(pipe.id, pipe.clone());
        core.register(addr, pipe.clone());
        pipe
    }

    /// The acceptor produced a connection: wrap it in an accepting-state pipe
    ///  whose reader runs the handshake.
    pub(crate) async fn add_accept_pipe(self: &Arc<Self>, stream: TcpStream) {
        let sock = SocketIo::new(stream, self.config.clone());
        let blank = PeerAddr::new(
            "0.0.0.0:0".parse().expect("literal address"),
            0,
        );
        let pipe = Pipe::new(
            self,
            PipeState::Accepting,
            self.default_policy(),
            blank,
            HostType::Unknown,
            Some(sock),
        );

        let mut core = self.core.lock().await;
        if core.stopped {
            debug!("dropping accepted connection, messenger is stopped");
            return;
        }
        core.pipes.insert(pipe.id, pipe.clone());
        drop(core);

        let mut pcore = pipe.core.lock().await;
        pipe.start_reader(&mut pcore);
    }

    // ---- administrative teardown -------------------------------------------

    /// Kill the pipe to one peer: stop it, drop its queues, discard whatever
    ///  it had waiting in the dispatch queue.
    pub async fn mark_down(&self, addr: PeerAddr) {
        let mut core = self.core.lock().await;
        if let Some(pipe) = core.rank_pipe.remove(&addr) {
            debug!("mark_down {:?}", addr);
            let mut pcore = pipe.core.lock().await;
            pipe.stop_with(&mut pcore);
            pipe.discard_out_queue(&mut pcore);
            let conn_id = pcore.conn_id;
            drop(pcore);
            drop(core);
            self.dispatch.discard(conn_id).await;
        } else {
            debug!("mark_down {:?} - no pipe", addr);
        }
    }

    /// Let the pipe drain its unacknowledged messages, then close it.
    pub async fn mark_down_on_empty(&self, addr: PeerAddr) -> bool {
        let core = self.core.lock().await;
        match core.lookup(&addr) {
            Some(pipe) => {
                let mut pcore = pipe.core.lock().await;
                pcore.close_on_empty = true;
                pipe.cond.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub async fn mark_down_all(&self) {
        let pipes: Vec<Arc<Pipe>> = {
            let mut core = self.core.lock().await;
            core.rank_pipe.drain().map(|(_, p)| p).collect()
        };
        for pipe in pipes {
            let mut pcore = pipe.core.lock().await;
            pipe.stop_with(&mut pcore);
            pipe.discard_out_queue(&mut pcore);
            let conn_id = pcore.conn_id;
            drop(pcore);
            self.dispatch.discard(conn_id).await;
        }
    }

    // ---- diagnostics --------------------------------------------------------

    /// Snapshot the pipe to a peer, if one is registered.
    pub async fn peer_stats(&self, addr: &PeerAddr) -> Option<PeerStats> {
        let core = self.core.lock().await;
        let pipe = core.lookup(addr)?;
        let pcore = pipe.core.lock().await;
        Some(PeerStats {
            state: pcore.state,
            connect_seq: pcore.connect_seq,
            peer_global_seq: pcore.peer_global_seq,
            out_seq: pcore.out_seq,
            in_seq: pcore.in_seq,
            in_seq_acked: pcore.in_seq_acked,
            out_queue_len: pcore.out_q.values().map(|q| q.len()).sum(),
            sent_len: pcore.sent.len(),
        })
    }

    /// Failure injection: half-shut the socket of the pipe to a peer, as if
    ///  the transport died. Returns false if there is no pipe.
    pub async fn inject_socket_fault(&self, addr: &PeerAddr) -> bool {
        let core = self.core.lock().await;
        match core.lookup(addr) {
            Some(pipe) => {
                let pcore = pipe.core.lock().await;
                match &pcore.sock {
                    Some(sock) => {
                        sock.shutdown();
                        true
                    }
                    None => false,
                }
            }
            None => false,
        }
    }

    pub(crate) fn queue_reap(&self, pipe: Arc<Pipe>) {
        let _ = self.reap_tx.send(pipe);
    }

    pub(crate) async fn inject_internal_delay(&self) {
        let delay = self.config.inject_internal_delays;
        if !delay.is_zero() {
            debug!("injecting internal delay of {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

/// Collects pipes whose reader and writer have both exited: drops registry
///  entries, breaks the connection back-pointer and releases the queues.
///  Holds the messenger weakly so dropping the messenger ends the task.
async fn reaper(
    msgr: std::sync::Weak<Messenger>,
    mut reap_rx: mpsc::UnboundedReceiver<Arc<Pipe>>,
) {
    while let Some(pipe) = reap_rx.recv().await {
        let Some(msgr) = msgr.upgrade() else {
            break;
        };
        debug!("reaping {:?}", pipe);
        let mut core = msgr.core.lock().await;
        core.pipes.remove(&pipe.id);
        core.unregister(&pipe);

        let mut pcore = pipe.core.lock().await;
        if let Some(delayed) = pcore.delayed.take() {
            delayed.stop();
        }
        pipe.discard_out_queue(&mut pcore);
        pcore.connection.clear_pipe(&pipe);
        if let Some(sock) = &pcore.sock {
            sock.shutdown();
        }
        drop(pcore);
        drop(core);

        msgr.reaped.notify_waiters();
    }
}
