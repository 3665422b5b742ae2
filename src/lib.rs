//! Point-to-point reliable messaging for a distributed storage system.
//!
//! Each peer address has at most one active *pipe*: a stream connection with
//! an authenticated handshake, ordered framed messages, and session resumption
//! across transport faults. The guarantees, roughly:
//!
//! * Messages queued on a lossless pipe are delivered to the peer's dispatch
//!   queue exactly once and in order, across any number of reconnects. The
//!   sender keeps transmitted messages until they are acknowledged and replays
//!   them with their original sequence numbers; the receiver drops anything it
//!   has already seen.
//! * A lossy pipe is cheaper: the first transport fault kills it and whatever
//!   it still had queued.
//! * Two nodes dialing each other at the same time converge on a single pipe;
//!   the race is settled by comparing the serialized peer addresses, so both
//!   sides pick the same winner.
//!
//! ## Handshake
//!
//! Both sides exchange a fixed banner and their declared addresses (the
//! accepting side also echoes the socket address it observed, so a peer bound
//! to a wildcard IP can learn its externally visible one). The connecting side
//! then sends `connect` records carrying its feature bits, global and session
//! sequence numbers and an optional authorizer blob; the accepting side
//! answers with one of the reply tags (`READY`, `RESETSESSION`, `WAIT`,
//! `RETRY_SESSION`, `RETRY_GLOBAL`, `BADPROTOVER`, `BADAUTHORIZER`,
//! `FEATURES`, `SEQ`) until the session is open or the attempt is rejected.
//! See `wire` for the exact record layouts.
//!
//! ## Tasks and locking
//!
//! A pipe owns two long-lived tokio tasks: the reader (frames in, acks the
//! peer's messages) and the writer (frames out, drives reconnects). All pipe
//! state sits behind one async mutex with a `Notify` standing in for the
//! condition variable; both tasks drop the mutex around every socket await.
//! The messenger-wide mutex guarding the pipe registry is always taken before
//! a pipe mutex, never after.

pub mod acceptor;
pub mod auth;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod message;
pub mod messenger;
pub mod peer_addr;
pub mod pipe;
pub mod throttle;
mod transport;
pub mod wire;

pub use auth::{Authenticator, Authorizer, NoneAuthenticator, SessionSecurity};
pub use config::MessengerConfig;
pub use connection::ConnectionState;
pub use dispatch::{ChannelDispatch, ConnectionEvent, DispatchSink};
pub use message::{Message, PRIO_DEFAULT, PRIO_HIGH, PRIO_HIGHEST, PRIO_LOW};
pub use messenger::{Messenger, PeerStats, Policy};
pub use peer_addr::{HostType, PeerAddr};
pub use pipe::PipeState;
pub use throttle::Throttle;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
