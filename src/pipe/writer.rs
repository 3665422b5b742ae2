use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::auth::SessionSecurity;
use crate::message::Message;
use crate::pipe::{connect, Pipe, PipeState};
use crate::peer_addr::PeerAddr;
use crate::wire::{
    crc32c, crc32c_segments, feature, Footer, MsgHeader, Tag, FOOTER_COMPLETE, FOOTER_NODATACRC,
};

/// The writer task: drives reconnects, then drains keepalives, acks and the
///  outgoing queue while the pipe is open. Encoding happens under the pipe
///  mutex; the socket write does not.
pub(crate) async fn run(pipe: Arc<Pipe>) {
    let mut core = pipe.core.lock().await;
    while core.state != PipeState::Closed {
        trace!(
            "writer: state = {:?}, server={}",
            core.state,
            core.policy.server
        );

        // a standby client with queued traffic initiates a new session
        if Pipe::is_queued(&core) && core.state == PipeState::Standby && !core.policy.server {
            core.connect_seq += 1;
            core.state = PipeState::Connecting;
        }

        if core.state == PipeState::Connecting {
            debug_assert!(!core.policy.server);
            drop(core);
            if let Err(e) = connect::connect(&pipe).await {
                debug!("connect attempt failed: {:#}", e);
            }
            core = pipe.core.lock().await;
            continue;
        }

        if core.state == PipeState::Closing {
            debug!("writer writing CLOSE tag");
            let sock = core.sock.clone();
            core.state = PipeState::Closed;
            pipe.cond.notify_waiters();
            drop(core);
            if let Some(sock) = sock {
                // best effort; the pipe is closed either way
                let _ = sock.write_all_segments(&[&[Tag::Close.into()]]).await;
            }
            core = pipe.core.lock().await;
            continue;
        }

        if core.state == PipeState::Open
            && (Pipe::is_queued(&core) || core.in_seq > core.in_seq_acked)
        {
            let Some(sock) = core.sock.clone() else {
                core = pipe.fault(core, false).await;
                continue;
            };

            if core.keepalive {
                drop(core);
                let result = sock.write_all_segments(&[&[Tag::Keepalive.into()]]).await;
                core = pipe.core.lock().await;
                if let Err(e) = result {
                    debug!("writer couldn't write keepalive: {:#}", e);
                    core = pipe.fault(core, false).await;
                    continue;
                }
                core.keepalive = false;
            }

            if core.in_seq > core.in_seq_acked {
                let ack_seq = core.in_seq;
                trace!("writer acking {}", ack_seq);
                drop(core);
                let mut ack_frame = [0u8; 9];
                ack_frame[0] = Tag::Ack.into();
                ack_frame[1..].copy_from_slice(&ack_seq.to_le_bytes());
                let result = sock.write_all_segments(&[&ack_frame]).await;
                core = pipe.core.lock().await;
                if let Err(e) = result {
                    debug!("writer couldn't write ack: {:#}", e);
                    core = pipe.fault(core, false).await;
                    continue;
                }
                core.in_seq_acked = ack_seq;
            }

            if let Some(mut msg) = pipe.get_next_outgoing(&mut core) {
                core.out_seq += 1;
                msg.seq = core.out_seq;
                if !core.policy.lossy || core.close_on_empty {
                    core.sent.push_back(msg.clone());
                }

                trace!("writer encoding {:?}", msg);
                let features = core.connection.features();
                let segments = encode_message(
                    &msg,
                    features,
                    core.session_security.as_ref(),
                    pipe.msgr.host_type().into(),
                    pipe.msgr.nonce() as u64,
                    pipe.msgr.my_addr(),
                    pipe.msgr.config.nocrc,
                );
                drop(core);

                debug!("writer sending {:?}", msg);
                let refs: Vec<&[u8]> = segments.iter().map(|b| b.as_ref()).collect();
                let result = sock.write_all_segments(&refs).await;

                core = pipe.core.lock().await;
                if let Err(e) = result {
                    warn!("writer error sending {:?}: {:#}", msg, e);
                    core = pipe.fault(core, false).await;
                }
            }
            continue;
        }

        if core.sent.is_empty() && core.close_on_empty {
            debug!("writer out and sent queues empty, closing");
            pipe.stop_with(&mut core);
            continue;
        }

        trace!("writer sleeping");
        core = pipe.wait(core).await;
    }
    drop(core);

    pipe.task_finished(false).await;
    debug!("writer done");
}

/// Frame a message for the negotiated feature set: tag byte, header (legacy
///  variant embeds our address when `NOSRCADDR` was not negotiated), the
///  payload sections, and the footer (signed variant when `MSG_AUTH` was).
pub(super) fn encode_message(
    msg: &Message,
    features: u64,
    security: Option<&SessionSecurity>,
    src_type: u8,
    src_num: u64,
    my_addr: PeerAddr,
    nocrc: bool,
) -> Vec<Bytes> {
    let legacy = features & feature::NOSRCADDR == 0;
    let signed = features & feature::MSG_AUTH != 0;

    let header = MsgHeader {
        seq: msg.seq,
        tid: msg.tid,
        msg_type: msg.msg_type,
        priority: msg.priority,
        version: msg.version,
        front_len: msg.front.len() as u32,
        middle_len: msg.middle.len() as u32,
        data_len: msg.data_len() as u32,
        data_off: msg.data_off,
        src_type,
        src_num,
        src_addr: legacy.then_some(my_addr),
        reserved: 0,
    };

    let mut footer = Footer {
        front_crc: crc32c(&msg.front),
        middle_crc: crc32c(&msg.middle),
        data_crc: 0,
        sig: 0,
        flags: FOOTER_COMPLETE,
    };
    if nocrc {
        footer.flags |= FOOTER_NODATACRC;
    } else {
        footer.data_crc = crc32c_segments(msg.data.iter().map(|b| b.as_ref()));
    }
    if let Some(security) = security {
        footer.sig = security.sign(&header, &footer);
    }

    let mut header_buf = BytesMut::with_capacity(1 + MsgHeader::wire_len(legacy));
    header_buf.extend_from_slice(&[Tag::Msg.into()]);
    header.encode(legacy, &mut header_buf);

    let mut footer_buf = BytesMut::with_capacity(Footer::wire_len(signed));
    footer.encode(signed, &mut footer_buf);

    let mut segments = Vec::with_capacity(4 + msg.data.len());
    segments.push(header_buf.freeze());
    segments.push(msg.front.clone());
    segments.push(msg.middle.clone());
    segments.extend(msg.data.iter().cloned());
    segments.push(footer_buf.freeze());
    segments
}
