use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::BytesMut;
use tokio::net::TcpSocket;
use tracing::{debug, error, trace, warn};

use crate::auth::SessionSecurity;
use crate::dispatch::ConnectionEvent;
use crate::peer_addr::PeerAddr;
use crate::pipe::{Pipe, PipeState};
use crate::transport::SocketIo;
use crate::wire::{
    ConnectFrame, ConnectReply, Tag, BANNER, CONNECT_LOSSY, PROTOCOL_VERSION,
};

/// the connect attempt ended in a deliberate stop (wait state, negotiation
///  rejection, interrupted session); the writer must not treat it as a
///  transport fault
#[derive(Debug)]
struct Aborted;

impl std::fmt::Display for Aborted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "connect attempt aborted")
    }
}
impl std::error::Error for Aborted {}

/// The connecting role, run from the writer task. Transport errors fault the
///  pipe (which schedules the backoff retry); negotiation rejections stop it.
pub(super) async fn connect(pipe: &Arc<Pipe>) -> anyhow::Result<()> {
    let msgr = pipe.msgr.clone();

    let (cseq, gseq) = {
        let core = pipe.core.lock().await;
        debug!("connect {}", core.connect_seq);
        (core.connect_seq, msgr.get_global_seq(0))
    };

    // the reader must be parked before we replace the socket under it
    pipe.join_reader().await;

    match do_connect(pipe, cseq, gseq).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if e.downcast_ref::<Aborted>().is_none() {
                msgr.inject_internal_delay().await;
                let core = pipe.core.lock().await;
                if core.state == PipeState::Connecting {
                    let _ = pipe.fault(core, false).await;
                } else {
                    debug!(
                        "connect fault, but state = {:?} != connecting, stopping",
                        core.state
                    );
                }
            }
            Err(e)
        }
    }
}

async fn do_connect(pipe: &Arc<Pipe>, mut cseq: u64, mut gseq: u64) -> anyhow::Result<()> {
    let msgr = pipe.msgr.clone();
    let peer_addr = pipe.peer_addr();
    let peer_type = pipe.peer_type();

    // fresh socket; dropping the old one (if any) closes it
    let socket = if peer_addr.addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    if msgr.config.tcp_rcvbuf > 0 {
        if let Err(e) = socket.set_recv_buffer_size(msgr.config.tcp_rcvbuf) {
            warn!("couldn't set SO_RCVBUF: {}", e);
        }
    }

    debug!("connecting to {:?}", peer_addr);
    let stream = socket
        .connect(peer_addr.addr)
        .await
        .map_err(|e| anyhow!("connect error {:?}: {}", peer_addr, e))?;
    let sock = SocketIo::new(stream, msgr.config.clone());
    pipe.core.lock().await.sock = Some(sock.clone());

    // banner exchange: the accepting side speaks first
    let mut banner = [0u8; BANNER.len()];
    sock.read_exact(&mut banner).await?;
    if banner != BANNER {
        bail!("connect protocol error (bad banner) on peer {:?}", peer_addr);
    }
    sock.write_all_segments(&[BANNER]).await?;

    // the peer reports its declared address and what it sees of ours
    let mut addrs_raw = [0u8; 2 * PeerAddr::WIRE_LEN];
    sock.read_exact(&mut addrs_raw).await?;
    let addrs_buf = &mut &addrs_raw[..];
    let paddr = PeerAddr::try_deser(addrs_buf)?;
    let peer_addr_for_me = PeerAddr::try_deser(addrs_buf)?;
    debug!(
        "connect read peer addr {:?}, peer addr for me is {:?}",
        paddr, peer_addr_for_me
    );

    if paddr != peer_addr {
        if paddr.is_blank_ip()
            && peer_addr.port() == paddr.port()
            && peer_addr.nonce == paddr.nonce
        {
            debug!(
                "connect claims to be {:?} not {:?} - presumably the same node",
                paddr, peer_addr
            );
        } else {
            bail!(
                "connect claims to be {:?} not {:?} - wrong node",
                paddr,
                peer_addr
            );
        }
    }

    msgr.learned_addr(peer_addr_for_me.addr);

    let mut my_addr_buf = BytesMut::with_capacity(PeerAddr::WIRE_LEN);
    msgr.my_addr().ser(&mut my_addr_buf);
    sock.write_all_segments(&[&my_addr_buf]).await?;
    debug!("connect sent my addr {:?}", msgr.my_addr());

    let mut got_bad_auth = false;
    let mut force_new_auth = false;
    let last_tag: i32 = -1;

    loop {
        let authorizer = msgr.auth.get_authorizer(peer_type, force_new_auth).await;

        let (policy_features, policy_lossy, policy_required) = {
            let core = pipe.core.lock().await;
            (
                core.policy.features_supported,
                core.policy.lossy,
                core.policy.features_required,
            )
        };

        let frame = ConnectFrame {
            features: policy_features,
            global_seq: gseq,
            connect_seq: cseq,
            protocol_version: PROTOCOL_VERSION,
            authorizer_protocol: authorizer.as_ref().map(|a| a.protocol).unwrap_or(0),
            authorizer_len: authorizer.as_ref().map(|a| a.blob.len() as u32).unwrap_or(0),
            // fyi only; the accepting side decides
            flags: if policy_lossy { CONNECT_LOSSY } else { 0 },
            host_type: msgr.host_type().into(),
        };

        debug!(
            "connect sending gseq={} cseq={} proto={}",
            gseq, cseq, frame.protocol_version
        );
        let mut frame_buf = BytesMut::with_capacity(ConnectFrame::WIRE_LEN);
        frame.ser(&mut frame_buf);
        let authorizer_blob = authorizer
            .as_ref()
            .map(|a| a.blob.clone())
            .unwrap_or_default();
        sock.write_all_segments(&[&frame_buf, &authorizer_blob]).await?;

        trace!("connect wrote connect record, waiting for reply");
        let mut reply_raw = [0u8; ConnectReply::WIRE_LEN];
        sock.read_exact(&mut reply_raw).await?;
        let reply = ConnectReply::try_deser(&mut &reply_raw[..])?;
        debug!(
            "connect got reply tag {} connect_seq {} global_seq {} proto {} flags {}",
            reply.tag, reply.connect_seq, reply.global_seq, reply.protocol_version, reply.flags
        );

        let mut authorizer_reply = vec![0u8; reply.authorizer_len as usize];
        sock.read_exact(&mut authorizer_reply).await?;

        if let Some(authorizer) = &authorizer {
            if !msgr.auth.verify_reply(authorizer, &authorizer_reply).await {
                bail!("failed verifying authorize reply");
            }
        }

        msgr.inject_internal_delay().await;

        let mut core = pipe.core.lock().await;
        if core.state != PipeState::Connecting {
            debug!("connect interrupted, state = {:?}, stopping", core.state);
            return Err(Aborted.into());
        }

        match reply.tagged() {
            Ok(Tag::Features) => {
                error!(
                    "connect protocol feature mismatch, my {:#x} < peer {:#x} missing {:#x}",
                    frame.features,
                    reply.features,
                    reply.features & !policy_features
                );
                abort_attempt(pipe, &mut core);
                return Err(Aborted.into());
            }

            Ok(Tag::BadProtoVer) => {
                error!(
                    "connect protocol version mismatch, my {} != {}",
                    frame.protocol_version, reply.protocol_version
                );
                abort_attempt(pipe, &mut core);
                return Err(Aborted.into());
            }

            Ok(Tag::BadAuthorizer) => {
                warn!("connect got BADAUTHORIZER");
                if got_bad_auth {
                    abort_attempt(pipe, &mut core);
                    return Err(Aborted.into());
                }
                got_bad_auth = true;
                // retry once with a freshly issued authorizer
                force_new_auth = true;
                drop(core);
                continue;
            }

            Ok(Tag::ResetSession) => {
                warn!("connect got RESETSESSION");
                pipe.was_session_reset(&mut core).await;
                cseq = 0;
                drop(core);
                continue;
            }

            Ok(Tag::RetryGlobal) => {
                gseq = msgr.get_global_seq(reply.global_seq);
                debug!(
                    "connect got RETRY_GLOBAL {}, chose new gseq {}",
                    reply.global_seq, gseq
                );
                drop(core);
                continue;
            }

            Ok(Tag::RetrySession) => {
                debug_assert!(reply.connect_seq > cseq);
                debug!(
                    "connect got RETRY_SESSION {} -> {}",
                    cseq, reply.connect_seq
                );
                cseq = reply.connect_seq;
                core.connect_seq = reply.connect_seq;
                drop(core);
                continue;
            }

            Ok(Tag::Wait) => {
                debug!("connect got WAIT (connection race)");
                core.state = PipeState::Wait;
                return Err(Aborted.into());
            }

            Ok(tag @ (Tag::Ready | Tag::Seq)) => {
                let feat_missing = policy_required & !reply.features;
                if feat_missing != 0 {
                    warn!("missing required features {:#x}", feat_missing);
                    bail!("peer dropped required features {:#x}", feat_missing);
                }

                if tag == Tag::Seq {
                    debug!("got SEQ, reading acked_seq and writing in_seq");
                    drop(core);
                    let newly_acked_seq = sock.read_u64_le().await?;
                    core = pipe.core.lock().await;
                    pipe.handle_ack(&mut core, newly_acked_seq);
                    let in_seq = core.in_seq;
                    drop(core);
                    sock.write_u64_le(in_seq).await?;
                    core = pipe.core.lock().await;
                    if core.state != PipeState::Connecting {
                        debug!("connect interrupted during seq exchange, stopping");
                        return Err(Aborted.into());
                    }
                }

                core.peer_global_seq = reply.global_seq;
                core.policy.lossy = reply.flags & CONNECT_LOSSY != 0;
                core.state = PipeState::Open;
                core.connect_seq = cseq + 1;
                debug_assert_eq!(core.connect_seq, reply.connect_seq);
                core.backoff = Duration::ZERO;
                core.connection.set_features(reply.features & frame.features);
                debug!(
                    "connect success {}, lossy = {}, features {:#x}",
                    core.connect_seq,
                    core.policy.lossy,
                    core.connection.features()
                );

                core.session_security = authorizer.as_ref().and_then(|a| {
                    SessionSecurity::for_session(
                        a.protocol,
                        a.session_key,
                        core.connection.features(),
                    )
                });

                msgr.dispatch
                    .control(ConnectionEvent::Connected(core.connection.clone()))
                    .await;

                if !core.reader_running {
                    debug!("connect starting reader");
                    pipe.start_reader(&mut core);
                }
                drop(core);
                pipe.maybe_start_delayed().await;
                return Ok(());
            }

            _ => {
                error!("connect got bad tag {}", last_tag);
                bail!("protocol error: unexpected connect reply tag {}", reply.tag);
            }
        }
    }
}

/// A negotiation rejection: the session will not open, now or on retry. Close
///  the pipe and drop whatever was queued; a later send creates a fresh pipe
///  (and gets refused again, visibly, if nothing changed).
fn abort_attempt(pipe: &Arc<Pipe>, core: &mut super::PipeCore) {
    pipe.stop_with(core);
    pipe.discard_out_queue(core);
}
