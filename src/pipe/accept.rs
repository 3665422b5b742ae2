use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::auth::SessionSecurity;
use crate::dispatch::ConnectionEvent;
use crate::messenger::Policy;
use crate::peer_addr::{HostType, PeerAddr};
use crate::pipe::{Pipe, PipeState};
use crate::transport::SocketIo;
use crate::wire::{
    auth_proto, feature, ConnectFrame, ConnectReply, Tag, BANNER, CONNECT_LOSSY, PROTOCOL_VERSION,
};

/// do_accept bailed because the messenger is going down; the pipe just closes
#[derive(Debug)]
struct ShuttingDown;

impl std::fmt::Display for ShuttingDown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "messenger shutting down")
    }
}
impl std::error::Error for ShuttingDown {}

struct AcceptCtx {
    replaced: bool,
    registered: bool,
}

/// The accepting role: banner/address exchange, then the reply loop until the
///  session opens or the attempt dies. On failure the pipe either keeps the
///  session alive (something is queued, or we replaced an older pipe) or
///  closes for the reaper.
pub(super) async fn accept(pipe: &Arc<Pipe>) -> anyhow::Result<()> {
    let mut ctx = AcceptCtx {
        replaced: false,
        registered: false,
    };
    match do_accept(pipe, &mut ctx).await {
        Ok(()) => Ok(()),
        Err(e) => {
            if e.downcast_ref::<ShuttingDown>().is_some() {
                pipe.msgr.inject_internal_delay().await;
                let mut core = pipe.core.lock().await;
                pipe.stop_with(&mut core);
                return Err(e);
            }

            debug!("accept fault: {:#}", e);
            if ctx.registered {
                pipe.msgr.inject_internal_delay().await;
            }

            let mut core = pipe.core.lock().await;
            if core.state != PipeState::Closed {
                let queued = Pipe::is_queued(&core);
                debug!("accept fault: queued={} replaced={}", queued, ctx.replaced);
                if queued {
                    core.state = if core.policy.server {
                        PipeState::Standby
                    } else {
                        PipeState::Connecting
                    };
                } else if ctx.replaced {
                    core.state = PipeState::Standby;
                } else {
                    core.state = PipeState::Closed;
                }
                core = pipe.fault(core, false).await;
                if (queued || ctx.replaced) && !core.writer_running {
                    pipe.start_writer(&mut core);
                }
            }
            Err(e)
        }
    }
}

async fn do_accept(pipe: &Arc<Pipe>, ctx: &mut AcceptCtx) -> anyhow::Result<()> {
    let msgr = pipe.msgr.clone();
    debug!("accept");

    let sock: SocketIo = pipe
        .core
        .lock()
        .await
        .sock
        .clone()
        .ok_or_else(|| anyhow!("accepting pipe has no socket"))?;

    // announce ourselves: banner, our declared address, and the peer's
    //  observed socket address so it can learn its own IP
    sock.write_all_segments(&[BANNER]).await?;

    let observed = PeerAddr::new(sock.peer_addr()?, 0);
    let mut addr_buf = BytesMut::with_capacity(2 * PeerAddr::WIRE_LEN);
    msgr.my_addr().ser(&mut addr_buf);
    observed.ser(&mut addr_buf);
    sock.write_all_segments(&[&addr_buf]).await?;

    debug!("accept from {:?}", observed);

    // identify the peer
    let mut banner = [0u8; BANNER.len()];
    sock.read_exact(&mut banner).await?;
    if banner != BANNER {
        bail!("peer sent bad banner");
    }

    let mut peer_raw = [0u8; PeerAddr::WIRE_LEN];
    sock.read_exact(&mut peer_raw).await?;
    let mut peer_addr = PeerAddr::try_deser(&mut &peer_raw[..])?;
    debug!("accept peer addr is {:?}", peer_addr);
    if peer_addr.is_blank_ip() {
        // peer doesn't know its own ip; substitute what the socket sees,
        //  keeping its declared port and nonce
        peer_addr = peer_addr.with_ip_of(observed.addr);
        debug!(
            "accept peer addr is really {:?} (socket is {:?})",
            peer_addr, observed
        );
    }
    pipe.set_peer(peer_addr, HostType::Unknown);

    // captured by the replace path, consumed at open
    let mut reply_tag: Option<Tag> = None;
    let mut existing_seq: u64 = 0;

    loop {
        let mut connect_raw = [0u8; ConnectFrame::WIRE_LEN];
        sock.read_exact(&mut connect_raw).await?;
        let connect = ConnectFrame::try_deser(&mut &connect_raw[..])?;

        let mut authorizer = vec![0u8; connect.authorizer_len as usize];
        sock.read_exact(&mut authorizer).await?;

        debug!(
            "accept got peer connect_seq {} global_seq {}",
            connect.connect_seq, connect.global_seq
        );

        let peer_type = HostType::try_from(connect.host_type).unwrap_or(HostType::Unknown);
        let mut reply = ConnectReply::new(PROTOCOL_VERSION);
        let policy;

        {
            let msgr_core = msgr.core.lock().await;
            if msgr_core.stopped {
                return Err(ShuttingDown.into());
            }

            let mut p = msgr.policy_for(peer_type);
            debug!(
                "accept of host_type {:?}, policy.lossy={}",
                peer_type, p.lossy
            );

            if connect.protocol_version != PROTOCOL_VERSION {
                debug!(
                    "accept my proto {}, their proto {}",
                    PROTOCOL_VERSION, connect.protocol_version
                );
                reply.tag = Tag::BadProtoVer.into();
                drop(msgr_core);
                send_retry_reply(&sock, reply, &Bytes::new(), &connect, &p).await?;
                continue;
            }

            // a session-authenticated peer may be required to sign messages
            if connect.authorizer_protocol == auth_proto::SESSION {
                let config = &msgr.config;
                let required = if peer_type.is_cluster() {
                    config.auth_require_signatures || config.auth_cluster_require_signatures
                } else {
                    config.auth_require_signatures || config.auth_service_require_signatures
                };
                if required {
                    debug!("session auth in use, requiring MSG_AUTH feature bit");
                    p.features_required |= feature::MSG_AUTH;
                }
            }

            let feat_missing = p.features_required & !connect.features;
            if feat_missing != 0 {
                debug!("peer missing required features {:#x}", feat_missing);
                reply.tag = Tag::Features.into();
                drop(msgr_core);
                send_retry_reply(&sock, reply, &Bytes::new(), &connect, &p).await?;
                continue;
            }

            pipe.set_peer(peer_addr, peer_type);
            let mut core = pipe.core.lock().await;
            core.policy = p.clone();
            core.connection.set_peer(peer_addr, peer_type);
            drop(core);
            policy = p;
        }

        // check the authorizer without holding any lock
        let verdict = msgr
            .auth
            .verify_authorizer(peer_type, connect.authorizer_protocol, &authorizer)
            .await;
        let authorizer_reply = verdict.reply;
        if !verdict.valid {
            warn!("accept: got bad authorizer");
            reply.tag = Tag::BadAuthorizer.into();
            send_retry_reply(&sock, reply, &authorizer_reply, &connect, &policy).await?;
            continue;
        }
        let session_key = verdict.session_key;
        trace!("accept: authorizer valid, setting up session security");

        let mut msgr_core = msgr.core.lock().await;
        if msgr_core.stopped {
            return Err(ShuttingDown.into());
        }

        let mut retry_reply: Option<ConnectReply> = None;

        if let Some(existing) = msgr_core.lookup(&peer_addr) {
            let mut ex = existing.core.lock().await;
            let mut do_replace = false;

            if connect.global_seq < ex.peer_global_seq {
                debug!(
                    "accept existing {:?} gseq {} > {}, RETRY_GLOBAL",
                    existing, ex.peer_global_seq, connect.global_seq
                );
                reply.tag = Tag::RetryGlobal.into();
                reply.global_seq = ex.peer_global_seq;
                retry_reply = Some(reply);
            } else if ex.policy.lossy {
                debug!(
                    "accept replacing existing (lossy) channel (new one lossy={})",
                    policy.lossy
                );
                existing.was_session_reset(&mut ex).await;
                do_replace = true;
            } else {
                debug!(
                    "accept connect_seq {} vs existing {} state {:?}",
                    connect.connect_seq, ex.connect_seq, ex.state
                );

                if connect.connect_seq == 0 && ex.connect_seq > 0 {
                    debug!("accept peer reset, then tried to connect to us, replacing");
                    if policy.resetcheck {
                        existing.was_session_reset(&mut ex).await;
                    }
                    do_replace = true;
                } else if connect.connect_seq < ex.connect_seq {
                    // old attempt, or we sent READY but they didn't get it
                    debug!(
                        "accept existing cseq {} > {}, RETRY_SESSION",
                        ex.connect_seq, connect.connect_seq
                    );
                    reply.tag = Tag::RetrySession.into();
                    reply.connect_seq = ex.connect_seq + 1;
                    retry_reply = Some(reply);
                } else if connect.connect_seq == ex.connect_seq {
                    if ex.state == PipeState::Open || ex.state == PipeState::Standby {
                        // the previous session opened; the peer should bump
                        //  its cseq and retry - not a race to settle here
                        debug!("accept connection race, existing OPEN|STANDBY, RETRY_SESSION");
                        reply.tag = Tag::RetrySession.into();
                        reply.connect_seq = ex.connect_seq + 1;
                        retry_reply = Some(reply);
                    } else if peer_addr < msgr.my_addr() || ex.policy.server {
                        // incoming wins
                        debug!(
                            "accept connection race, cseq {}, replacing my attempt",
                            connect.connect_seq
                        );
                        debug_assert!(matches!(
                            ex.state,
                            PipeState::Connecting | PipeState::Wait
                        ));
                        do_replace = true;
                    } else {
                        // our existing outgoing attempt wins
                        debug!(
                            "accept connection race, cseq {}, sending WAIT",
                            connect.connect_seq
                        );
                        debug_assert!(peer_addr > msgr.my_addr());
                        debug_assert_eq!(ex.state, PipeState::Connecting);
                        // make sure our outgoing connection follows through
                        ex.keepalive = true;
                        existing.cond.notify_waiters();
                        reply.tag = Tag::Wait.into();
                        retry_reply = Some(reply);
                    }
                } else {
                    debug_assert!(connect.connect_seq > ex.connect_seq);
                    debug_assert!(connect.global_seq >= ex.peer_global_seq);
                    if policy.resetcheck && ex.connect_seq == 0 {
                        // we restarted and the peer is still talking to the
                        //  old incarnation
                        debug!(
                            "accept we reset (peer sent cseq {}), sending RESETSESSION",
                            connect.connect_seq
                        );
                        reply.tag = Tag::ResetSession.into();
                        retry_reply = Some(reply);
                    } else {
                        // reconnect
                        debug!(
                            "accept peer sent cseq {} > {}, replacing",
                            connect.connect_seq, ex.connect_seq
                        );
                        do_replace = true;
                    }
                }
            }

            if do_replace {
                if connect.features & feature::RECONNECT_SEQ != 0 {
                    reply_tag = Some(Tag::Seq);
                    existing_seq = ex.in_seq;
                }
                debug!("accept replacing {:?}", existing);
                existing.stop_with(&mut ex);
                msgr_core.unregister(&existing);
                ctx.replaced = true;

                if !ex.policy.lossy {
                    // adopt the existing connection handle; its consumer keeps
                    //  a stable view across the replacement
                    let ex_conn = ex.connection.clone();
                    ex_conn.reset_pipe(Arc::downgrade(pipe));

                    if let Some(d) = ex.delayed.clone() {
                        d.flush().await;
                    }

                    let mut core = pipe.core.lock().await;
                    core.connection = ex_conn;
                    std::mem::swap(&mut core.conn_id, &mut ex.conn_id);
                    core.in_seq = ex.in_seq;
                    core.in_seq_acked = ex.in_seq;

                    // steal the outgoing queue and sequence space
                    existing.requeue_sent(&mut ex);
                    core.out_seq = ex.out_seq;
                    debug!(
                        "accept re-queuing on out_seq {} in_seq {}",
                        core.out_seq, core.in_seq
                    );
                    for (prio, mut stolen) in std::mem::take(&mut ex.out_q) {
                        use std::collections::btree_map::Entry;
                        match core.out_q.entry(prio) {
                            Entry::Vacant(e) => {
                                e.insert(stolen);
                            }
                            Entry::Occupied(mut e) => {
                                // the existing pipe's messages go in front
                                let ours = e.get_mut();
                                stolen.append(ours);
                                std::mem::swap(ours, &mut stolen);
                            }
                        }
                    }
                }
            }
        } else if policy.resetcheck && connect.connect_seq > 0 {
            // we restarted and the peer is opening what it thinks is an
            //  established session
            debug!(
                "accept we reset (peer sent cseq {}), sending RESETSESSION",
                connect.connect_seq
            );
            reply.tag = Tag::ResetSession.into();
            retry_reply = Some(reply);
        } else {
            debug!("accept new session");
        }

        if let Some(reply) = retry_reply {
            drop(msgr_core);
            send_retry_reply(&sock, reply, &authorizer_reply, &connect, &policy).await?;
            continue;
        }

        // open
        let mut core = pipe.core.lock().await;
        core.connect_seq = connect.connect_seq + 1;
        core.peer_global_seq = connect.global_seq;
        core.state = PipeState::Open;
        debug!("accept success, connect_seq = {}, sending READY", core.connect_seq);

        let mut reply = ConnectReply::new(PROTOCOL_VERSION);
        reply.tag = reply_tag.unwrap_or(Tag::Ready).into();
        reply.features = policy.features_supported;
        reply.global_seq = msgr.get_global_seq(0);
        reply.connect_seq = core.connect_seq;
        reply.authorizer_len = authorizer_reply.len() as u32;
        if policy.lossy {
            reply.flags |= CONNECT_LOSSY;
        }

        core.connection.set_features(reply.features & connect.features);
        debug!("accept features {:#x}", core.connection.features());
        core.session_security = SessionSecurity::for_session(
            connect.authorizer_protocol,
            session_key,
            core.connection.features(),
        );

        let conn = core.connection.clone();
        msgr.dispatch
            .control(ConnectionEvent::Accepted(conn))
            .await;

        msgr_core.register(peer_addr, pipe.clone());
        ctx.registered = true;
        drop(core);
        drop(msgr_core);

        let mut reply_buf = BytesMut::with_capacity(ConnectReply::WIRE_LEN);
        reply.ser(&mut reply_buf);
        sock.write_all_segments(&[&reply_buf, &authorizer_reply]).await?;

        let mut newly_acked_seq = 0;
        if reply_tag == Some(Tag::Seq) {
            sock.write_u64_le(existing_seq).await?;
            newly_acked_seq = sock.read_u64_le().await?;
        }

        let mut core = pipe.core.lock().await;
        pipe.discard_requeued_up_to(&mut core, newly_acked_seq);
        if core.state != PipeState::Closed {
            debug!("accept starting writer, state {:?}", core.state);
            pipe.start_writer(&mut core);
        }
        drop(core);

        pipe.maybe_start_delayed().await;
        debug!("accept done");
        return Ok(());
    }
}

/// Fill in the negotiable fields of a non-final reply and send it (with the
///  authorizer reply, if any); the peer will send another connect record.
async fn send_retry_reply(
    sock: &SocketIo,
    mut reply: ConnectReply,
    authorizer_reply: &Bytes,
    connect: &ConnectFrame,
    policy: &Policy,
) -> anyhow::Result<()> {
    reply.features = (connect.features & policy.features_supported) | policy.features_required;
    reply.authorizer_len = authorizer_reply.len() as u32;

    let mut buf = BytesMut::with_capacity(ConnectReply::WIRE_LEN);
    reply.ser(&mut buf);
    sock.write_all_segments(&[&buf, authorizer_reply]).await
}
