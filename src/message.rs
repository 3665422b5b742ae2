use bytes::Bytes;
use tokio::time::Instant;

use crate::throttle::Reservation;

pub const PRIO_LOW: u8 = 64;
pub const PRIO_DEFAULT: u8 = 127;
pub const PRIO_HIGH: u8 = 196;
/// requeued unacknowledged messages go to the front of this priority so they
///  are replayed before anything newer
pub const PRIO_HIGHEST: u8 = 255;

/// A framed application message: three independent payload sections plus the
///  routing/typing fields that end up in the wire header. The payload bytes
///  are opaque to the messenger; decoding them is the dispatch consumer's
///  business.
pub struct Message {
    pub msg_type: u16,
    pub priority: u8,
    pub version: u8,
    /// transaction id; a receiver may post an rx buffer keyed by this
    pub tid: u64,
    /// assigned by the writer just before transmission; zero until then
    pub seq: u64,

    pub front: Bytes,
    pub middle: Bytes,
    /// the bulk section, kept as segments so receive buffers can be laid out
    ///  on page boundaries and writes can stay scatter-gather
    pub data: Vec<Bytes>,
    /// alignment hint: offset of `data` within the object it was cut from
    pub data_off: u16,

    pub recv_stamp: Option<Instant>,

    /// throttle reservations held by an inbound message until the dispatch
    ///  consumer drops it; releasing is automatic
    pub(crate) reservations: Vec<Reservation>,
}

impl Message {
    pub fn new(msg_type: u16, priority: u8) -> Message {
        Message {
            msg_type,
            priority,
            version: 1,
            tid: 0,
            seq: 0,
            front: Bytes::new(),
            middle: Bytes::new(),
            data: Vec::new(),
            data_off: 0,
            recv_stamp: None,
            reservations: Vec::new(),
        }
    }

    pub fn with_front(mut self, front: impl Into<Bytes>) -> Message {
        self.front = front.into();
        self
    }

    pub fn with_middle(mut self, middle: impl Into<Bytes>) -> Message {
        self.middle = middle.into();
        self
    }

    pub fn with_data(mut self, data: impl Into<Bytes>, data_off: u16) -> Message {
        self.data = vec![data.into()];
        self.data_off = data_off;
        self
    }

    pub fn with_tid(mut self, tid: u64) -> Message {
        self.tid = tid;
        self
    }

    pub fn data_len(&self) -> usize {
        self.data.iter().map(|b| b.len()).sum()
    }

    /// header byte count: front + middle + data; this is also the amount
    ///  reserved from the byte throttlers on receive
    pub fn wire_payload_len(&self) -> u64 {
        (self.front.len() + self.middle.len() + self.data_len()) as u64
    }

    /// the data section as one contiguous buffer
    pub fn concat_data(&self) -> Bytes {
        match self.data.len() {
            0 => Bytes::new(),
            1 => self.data[0].clone(),
            _ => {
                let mut out = Vec::with_capacity(self.data_len());
                for segment in &self.data {
                    out.extend_from_slice(segment);
                }
                Bytes::from(out)
            }
        }
    }
}

/// Payload sections are refcounted, so cloning is cheap. Throttle
///  reservations are deliberately *not* cloned: only the instance handed to
///  the dispatch queue may release them.
impl Clone for Message {
    fn clone(&self) -> Self {
        Message {
            msg_type: self.msg_type,
            priority: self.priority,
            version: self.version,
            tid: self.tid,
            seq: self.seq,
            front: self.front.clone(),
            middle: self.middle.clone(),
            data: self.data.clone(),
            data_off: self.data_off,
            recv_stamp: self.recv_stamp,
            reservations: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "msg(type={} seq={} prio={} {}+{}+{})",
            self.msg_type,
            self.seq,
            self.priority,
            self.front.len(),
            self.middle.len(),
            self.data_len()
        )
    }
}
