use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use bytes::BytesMut;
use rustc_hash::FxHashMap;

use crate::peer_addr::{HostType, PeerAddr};
use crate::pipe::Pipe;

/// Connection-scoped state that outlives any single pipe: when a reconnect
///  replaces a pipe, the replacement takes over this handle, so the dispatch
///  consumer's view of "the connection" stays stable.
///
/// The pipe back-pointer is only ever (re)assigned under the messenger lock;
///  the rx-buffer map has its own small mutex because the reader touches it
///  without holding any pipe state.
pub struct ConnectionState {
    features: AtomicU64,
    peer: Mutex<(PeerAddr, HostType)>,
    pipe: Mutex<Weak<Pipe>>,
    rx_buffers: Mutex<FxHashMap<u64, RxBuffer>>,
}

struct RxBuffer {
    buf: BytesMut,
    #[allow(dead_code)]
    version: u32,
}

impl ConnectionState {
    pub(crate) fn new(peer_addr: PeerAddr, peer_type: HostType) -> ConnectionState {
        ConnectionState {
            features: AtomicU64::new(0),
            peer: Mutex::new((peer_addr, peer_type)),
            pipe: Mutex::new(Weak::new()),
            rx_buffers: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn features(&self) -> u64 {
        self.features.load(Ordering::Acquire)
    }

    pub fn has_feature(&self, bit: u64) -> bool {
        self.features() & bit != 0
    }

    pub(crate) fn set_features(&self, features: u64) {
        self.features.store(features, Ordering::Release);
    }

    pub fn peer_addr(&self) -> PeerAddr {
        self.peer.lock().unwrap().0
    }

    pub fn peer_type(&self) -> HostType {
        self.peer.lock().unwrap().1
    }

    pub(crate) fn set_peer(&self, addr: PeerAddr, host_type: HostType) {
        *self.peer.lock().unwrap() = (addr, host_type);
    }

    pub(crate) fn pipe(&self) -> Option<std::sync::Arc<Pipe>> {
        self.pipe.lock().unwrap().upgrade()
    }

    /// caller must hold the messenger lock
    pub(crate) fn reset_pipe(&self, pipe: Weak<Pipe>) {
        *self.pipe.lock().unwrap() = pipe;
    }

    /// caller must hold the messenger lock; only clears if the pointer still
    ///  refers to `dead`
    pub(crate) fn clear_pipe(&self, dead: &std::sync::Arc<Pipe>) {
        let mut guard = self.pipe.lock().unwrap();
        if let Some(current) = guard.upgrade() {
            if std::sync::Arc::ptr_eq(&current, dead) {
                *guard = Weak::new();
            }
        }
    }

    /// Post a receive buffer for the message with the given tid: its data
    ///  section will be read into this buffer instead of fresh allocations.
    ///  The buffer is consumed by the matching message (or by `revoke`).
    pub fn post_rx_buffer(&self, tid: u64, buf: BytesMut) {
        use std::collections::hash_map::Entry;
        match self.rx_buffers.lock().unwrap().entry(tid) {
            Entry::Occupied(mut e) => {
                let rx = e.get_mut();
                rx.version += 1;
                rx.buf = buf;
            }
            Entry::Vacant(e) => {
                e.insert(RxBuffer { buf, version: 0 });
            }
        }
    }

    pub fn revoke_rx_buffer(&self, tid: u64) {
        self.rx_buffers.lock().unwrap().remove(&tid);
    }

    pub(crate) fn take_rx_buffer(&self, tid: u64) -> Option<BytesMut> {
        self.rx_buffers
            .lock()
            .unwrap()
            .remove(&tid)
            .map(|rx| rx.buf)
    }
}

impl std::fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "connection({:?}, features {:#x})",
            self.peer_addr(),
            self.features()
        )
    }
}
