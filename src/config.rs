use std::time::Duration;

/// Tuning and fault-injection knobs for a messenger instance. Shared as
/// `Arc<MessengerConfig>` between the acceptor, the pipes and the transport
/// layer; nothing here changes after startup.
#[derive(Debug)]
pub struct MessengerConfig {
    /// prefer an IPv6 listening socket when the bind address does not pin a family
    pub bind_ipv6: bool,
    pub bind_port_min: u16,
    pub bind_port_max: u16,

    pub tcp_nodelay: bool,
    /// receive buffer size for sockets; 0 leaves the OS default
    pub tcp_rcvbuf: u32,
    /// how long a reader may sit in a read before the pipe faults; zero means
    ///  "wait forever"
    pub tcp_read_timeout: Duration,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,

    /// skip the data-section checksum on outgoing messages (header, front and
    ///  middle checksums are always computed)
    pub nocrc: bool,
    /// upper bound on bytes sitting in the dispatch queue, across all pipes
    pub dispatch_throttle_bytes: u64,

    /// 1-in-N chance of half-shutting the socket on each I/O call; 0 disables
    pub inject_socket_failures: u32,
    /// sleep inserted at fault points to widen race windows; zero disables
    pub inject_internal_delays: Duration,
    /// peer host-type name (e.g. "store") whose pipes get a delayed-delivery
    ///  queue; empty disables
    pub inject_delay_type: String,
    /// probability in [0,1] that a received message is held back
    pub inject_delay_probability: f64,
    pub inject_delay_max: Duration,

    /// require signed messages from any peer that authenticated with the
    ///  session auth protocol
    pub auth_require_signatures: bool,
    /// like `auth_require_signatures`, for cluster-internal peers (stores, metas)
    pub auth_cluster_require_signatures: bool,
    /// like `auth_require_signatures`, for service peers (clients, admins)
    pub auth_service_require_signatures: bool,
}

impl MessengerConfig {
    pub fn new() -> MessengerConfig {
        MessengerConfig {
            bind_ipv6: false,
            bind_port_min: 7800,
            bind_port_max: 8300,
            tcp_nodelay: true,
            tcp_rcvbuf: 0,
            tcp_read_timeout: Duration::from_secs(900),
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(15),
            nocrc: false,
            dispatch_throttle_bytes: 100 << 20,
            inject_socket_failures: 0,
            inject_internal_delays: Duration::ZERO,
            inject_delay_type: String::new(),
            inject_delay_probability: 0.0,
            inject_delay_max: Duration::ZERO,
            auth_require_signatures: false,
            auth_cluster_require_signatures: false,
            auth_service_require_signatures: false,
        }
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        MessengerConfig::new()
    }
}
