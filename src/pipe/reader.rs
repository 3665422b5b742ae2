use std::sync::Arc;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::connection::ConnectionState;
use crate::message::Message;
use crate::pipe::{accept, Pipe, PipeState};
use crate::throttle::{Reservation, Throttle};
use crate::transport::SocketIo;
use crate::wire::framing::aligned_chunk_sizes;
use crate::wire::{
    crc32c, crc32c_segments, feature, Footer, MsgHeader, Tag, FOOTER_COMPLETE, FOOTER_NODATACRC,
};

/// The reader task: runs the accepting handshake if this pipe was born from
///  the acceptor, then consumes frames until the pipe closes or hands off to
///  a reconnect. In non-reading states it parks on the pipe condition and
///  never touches the socket.
pub(crate) async fn run(pipe: Arc<Pipe>) {
    {
        let state = pipe.core.lock().await.state;
        if state == PipeState::Accepting {
            if let Err(e) = accept::accept(&pipe).await {
                debug!("accept failed: {:#}", e);
            }
        }
    }

    let mut core = pipe.core.lock().await;
    loop {
        match core.state {
            PipeState::Closed | PipeState::Connecting => break,
            PipeState::Standby | PipeState::Wait => {
                trace!("reader sleeping during standby|wait");
                core = pipe.wait(core).await;
                continue;
            }
            _ => {}
        }

        let Some(sock) = core.sock.clone() else {
            core = pipe.fault(core, true).await;
            continue;
        };
        let conn = core.connection.clone();
        let security = core.session_security.clone();
        let throttler_messages = core.policy.throttler_messages.clone();
        let throttler_bytes = core.policy.throttler_bytes.clone();
        drop(core);

        trace!("reader reading tag...");
        let mut tag_raw = [0u8; 1];
        if let Err(e) = sock.read_exact(&mut tag_raw).await {
            debug!("reader couldn't read tag: {:#}", e);
            core = pipe.core.lock().await;
            core = pipe.fault(core, true).await;
            continue;
        }

        match Tag::try_from(tag_raw[0]) {
            Ok(Tag::Keepalive) => {
                trace!("reader got KEEPALIVE");
                core = pipe.core.lock().await;
            }

            Ok(Tag::Ack) => {
                trace!("reader got ACK");
                let seq = sock.read_u64_le().await;
                core = pipe.core.lock().await;
                match seq {
                    Ok(seq) => {
                        if core.state != PipeState::Closed {
                            pipe.handle_ack(&mut core, seq);
                        }
                    }
                    Err(e) => {
                        debug!("reader couldn't read ack seq: {:#}", e);
                        core = pipe.fault(core, true).await;
                    }
                }
            }

            Ok(Tag::Msg) => {
                trace!("reader got MSG");
                let result = read_message(
                    &sock,
                    &conn,
                    security.as_ref(),
                    &throttler_messages,
                    &throttler_bytes,
                    &pipe.msgr.dispatch_throttle,
                )
                .await;

                core = pipe.core.lock().await;
                let msg = match result {
                    Err(e) => {
                        debug!("reader: {:#}", e);
                        core = pipe.fault(core, true).await;
                        continue;
                    }
                    // an aborted transmission; not a fault
                    Ok(None) => continue,
                    Ok(Some(msg)) => msg,
                };

                if matches!(core.state, PipeState::Closed | PipeState::Connecting) {
                    // reservations release on drop
                    continue;
                }

                // an idempotent redelivery after a reconnect; drop silently
                if msg.seq <= core.in_seq {
                    debug!(
                        "reader got old message seq {} <= {}, discarding",
                        msg.seq, core.in_seq
                    );
                    continue;
                }

                core.in_seq = msg.seq;
                // wake the writer so it can ack
                pipe.cond.notify_waiters();
                debug!("reader got message {:?}", msg);

                let priority = msg.priority;
                let conn_id = core.conn_id;
                let delayed = core.delayed.clone();
                drop(core);

                if let Some(delayed) = delayed {
                    let config = &pipe.msgr.config;
                    let mut release = msg.recv_stamp.unwrap_or_else(Instant::now);
                    let roll = rand::thread_rng().gen_range(0..10_000);
                    if (roll as f64) < config.inject_delay_probability * 10_000.0 {
                        let factor = rand::thread_rng().gen_range(0.0..1.0);
                        release += config.inject_delay_max.mul_f64(factor);
                        trace!("will delay delivery of {:?} until {:?}", msg, release);
                    }
                    delayed.queue(release, msg).await;
                } else {
                    pipe.msgr.dispatch.enqueue(msg, priority, conn_id).await;
                }
                core = pipe.core.lock().await;
            }

            Ok(Tag::Close) => {
                debug!("reader got CLOSE");
                core = pipe.core.lock().await;
                if core.state == PipeState::Closing {
                    core.state = PipeState::Closed;
                } else {
                    core.state = PipeState::Closing;
                }
                pipe.cond.notify_waiters();
                break;
            }

            other => {
                warn!("reader bad tag {} ({:?})", tag_raw[0], other.ok());
                core = pipe.core.lock().await;
                core = pipe.fault(core, true).await;
            }
        }
    }
    drop(core);

    pipe.task_finished(true).await;
    debug!("reader done");
}

/// Read one framed message off the socket. `Ok(None)` is an aborted send
///  (footer without the complete flag): discarded without fault. Throttle
///  reservations travel inside the returned message and release when it is
///  dropped, whichever exit path that happens on.
pub(super) async fn read_message(
    sock: &SocketIo,
    conn: &Arc<ConnectionState>,
    security: Option<&crate::auth::SessionSecurity>,
    throttler_messages: &Option<Arc<Throttle>>,
    throttler_bytes: &Option<Arc<Throttle>>,
    dispatch_throttle: &Arc<Throttle>,
) -> anyhow::Result<Option<Message>> {
    let legacy = !conn.has_feature(feature::NOSRCADDR);
    let signed = conn.has_feature(feature::MSG_AUTH);

    let mut header_raw = vec![0u8; MsgHeader::wire_len(legacy)];
    sock.read_exact(&mut header_raw).await?;
    let header = MsgHeader::try_parse(&header_raw, legacy)?;
    trace!(
        "reader got envelope type={} src={}/{} front={} middle={} data={} off={}",
        header.msg_type,
        header.src_type,
        header.src_num,
        header.front_len,
        header.middle_len,
        header.data_len,
        header.data_off
    );

    let recv_stamp = Instant::now();

    // the message reservation is held for the lifetime of the message; the
    //  byte reservations keep the dispatch backlog bounded
    let mut reservations: Vec<Reservation> = Vec::with_capacity(3);
    if let Some(throttle) = throttler_messages {
        trace!(
            "reader wants 1 message from policy throttler {}/{}",
            throttle.current(),
            throttle.max()
        );
        reservations.push(throttle.acquire(1).await);
    }

    let message_size =
        header.front_len as u64 + header.middle_len as u64 + header.data_len as u64;
    if message_size > 0 {
        if let Some(throttle) = throttler_bytes {
            trace!(
                "reader wants {} bytes from policy throttler {}/{}",
                message_size,
                throttle.current(),
                throttle.max()
            );
            reservations.push(throttle.acquire(message_size).await);
        }
        reservations.push(dispatch_throttle.acquire(message_size).await);
    }

    let mut front = BytesMut::zeroed(header.front_len as usize);
    sock.read_exact(&mut front).await?;

    let mut middle = BytesMut::zeroed(header.middle_len as usize);
    sock.read_exact(&mut middle).await?;

    let data_len = header.data_len as usize;
    let mut data: Vec<Bytes> = Vec::new();
    if data_len > 0 {
        if let Some(mut rx) = conn.take_rx_buffer(header.tid) {
            trace!("reader using posted rx buffer for tid {}", header.tid);
            rx.resize(data_len, 0);
            sock.read_exact(&mut rx).await?;
            data.push(rx.freeze());
        } else {
            for chunk_len in aligned_chunk_sizes(data_len, header.data_off as usize) {
                let mut chunk = BytesMut::zeroed(chunk_len);
                sock.read_exact(&mut chunk).await?;
                data.push(chunk.freeze());
            }
        }
    }

    let mut footer_raw = vec![0u8; Footer::wire_len(signed)];
    sock.read_exact(&mut footer_raw).await?;
    let footer = Footer::try_parse(&footer_raw, signed)?;

    if footer.flags & FOOTER_COMPLETE == 0 {
        debug!(
            "reader got {}+{}+{} byte message, aborted by sender - discarding",
            front.len(),
            middle.len(),
            data_len
        );
        return Ok(None);
    }

    let front_crc = crc32c(&front);
    if front_crc != footer.front_crc {
        bail!(
            "front crc mismatch: {:08x} != {:08x}",
            front_crc,
            footer.front_crc
        );
    }
    let middle_crc = crc32c(&middle);
    if middle_crc != footer.middle_crc {
        bail!(
            "middle crc mismatch: {:08x} != {:08x}",
            middle_crc,
            footer.middle_crc
        );
    }
    if footer.flags & FOOTER_NODATACRC == 0 {
        let data_crc = crc32c_segments(data.iter().map(|b| b.as_ref()));
        if data_crc != footer.data_crc {
            bail!(
                "data crc mismatch: {:08x} != {:08x}",
                data_crc,
                footer.data_crc
            );
        }
    }

    if let Some(security) = security {
        if !security.check(&header, &footer) {
            bail!("message signature check failed on seq {}", header.seq);
        }
    }

    Ok(Some(Message {
        msg_type: header.msg_type,
        priority: header.priority,
        version: header.version,
        tid: header.tid,
        seq: header.seq,
        front: front.freeze(),
        middle: middle.freeze(),
        data,
        data_off: header.data_off,
        recv_stamp: Some(recv_stamp),
        reservations,
    }))
}
