//! One `runloop` tick (§4.5): poll for readiness, read and classify
//! whatever frames are ready, enqueue events, then drain the queue.
//!
//! Mirrors the shape of `flux-network`'s `TcpConnector::poll_with` —
//! `Poll::poll` into a reusable `Events` buffer, walk the ready set, look
//! the token up in the connection table, and hand off to a per-event
//! handler — generalized from TCP streams to UDP datagrams framed by the
//! 8-byte header instead of a length prefix.

use std::{io, net::SocketAddr, time::Duration};

use mio::Events;

use crate::{
    event::Event,
    header::{CorrelationId, FrameHeader, HEADER_SIZE},
    payload::MAX_PAYLOAD_LEN,
    queue::{EventQueue, EventTarget, PendingEvent},
    registry::{ConnRegistry, Transport},
};

/// Receive buffer sized for the largest single datagram this runtime will
/// accept: header plus the maximum payload.
const RECV_BUF_LEN: usize = HEADER_SIZE + MAX_PAYLOAD_LEN;

pub(crate) fn tick(
    registry: &mut ConnRegistry,
    queue: &mut EventQueue,
    events: &mut Events,
    timeout: Option<Duration>,
) -> io::Result<()> {
    match registry.poll.poll(events, timeout) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
        Err(err) => {
            tracing::error!(error = %err, "poll failed; no connection is attributable");
            return Ok(());
        }
    }

    for event in events.iter() {
        let token = event.token();
        let Some(conn) = registry.token_to_conn(token) else { continue };
        if !event.is_readable() {
            continue;
        }

        loop {
            let mut buf = [0u8; RECV_BUF_LEN];

            // Each recv-path result is computed into an owned value with the
            // borrow of `conn` dropped *before* matching on it — a match
            // scrutinee written as `&conn.borrow().socket` would keep that
            // `Ref` alive for the whole match statement, and the fatal-error
            // arms below call `registry.tombstone`, which needs `borrow_mut`.
            let peek_result = peek_header(&conn.borrow().socket, &mut buf);
            let (sockaddr, header) = match peek_result {
                Ok(PeekOutcome::Frame(from, header)) => (from, header),
                Ok(PeekOutcome::NoData) => break,
                Ok(PeekOutcome::ShortDatagram) => {
                    // A datagram shorter than the 8-byte header is sitting at
                    // the head of the socket's queue. `peek_from` doesn't
                    // consume it, and mio's readiness is edge-triggered, so
                    // leaving it there would wedge this socket as readable
                    // forever without ever draining it — drain it now and
                    // report it, rather than silently treating it as
                    // "nothing ready" like the `WouldBlock` case below.
                    let conn_id = conn.borrow().id;
                    if let Err(err) = receive_full(&conn.borrow().socket, &mut buf) {
                        tracing::debug!(error = %err, "failed to drain short datagram");
                    }
                    queue.push(PendingEvent {
                        conn_id,
                        target: EventTarget::Conn(conn.clone()),
                        event: Event::Error,
                        payload: b"received a datagram shorter than the frame header".to_vec(),
                        correlation: None,
                    });
                    continue;
                }
                Err(err) if is_transient(&err) => {
                    tracing::debug!(error = %err, "transient recv error, will retry next tick");
                    break;
                }
                Err(err) => {
                    // A non-recoverable error on an established socket (e.g. an
                    // ICMP port-unreachable surfacing as `ConnectionRefused`)
                    // means the connection is gone, not merely idle — distinct
                    // from the graceful `close` frame path (§7).
                    let conn_id = conn.borrow().id;
                    queue.push(PendingEvent {
                        conn_id,
                        target: EventTarget::Conn(conn.clone()),
                        event: Event::ConnectionLost,
                        payload: err.to_string().into_bytes(),
                        correlation: None,
                    });
                    registry.tombstone(conn_id);
                    break;
                }
            };

            // Protocol violations abort in debug builds (`safe_panic!`); in
            // release they log and the packet is silently dropped — no
            // `error` event is delivered, matching §7's "no connection is
            // at fault" framing for this class of failure.
            let Some(header) = header else {
                msgbox_utils::safe_panic!("received frame with unrecognized message_type");
                let _ = receive_full(&conn.borrow().socket, &mut buf);
                break;
            };

            if header.num_packets > 1 {
                msgbox_utils::safe_panic!("multi-packet reassembly is not supported");
                let _ = receive_full(&conn.borrow().socket, &mut buf);
                break;
            }

            let recv_result = receive_full(&conn.borrow().socket, &mut buf);
            let datagram_len = match recv_result {
                Ok(n) => n,
                Err(err) => {
                    let conn_id = conn.borrow().id;
                    queue.push(PendingEvent {
                        conn_id,
                        target: EventTarget::Conn(conn.clone()),
                        event: Event::ConnectionLost,
                        payload: err.to_string().into_bytes(),
                        correlation: None,
                    });
                    registry.tombstone(conn_id);
                    break;
                }
            };
            let payload = buf[HEADER_SIZE..datagram_len].to_vec();

            handle_frame(registry, queue, &conn, sockaddr, header, payload);

            // Datagram sockets deliver one packet per readable wakeup per
            // `recv`; loop to drain any further packets already queued in
            // the OS buffer before the next `poll`.
        }
    }

    queue.drain(registry);
    registry.sweep();
    Ok(())
}

/// Signal-interruption and would-block are the only recoverable conditions
/// at this layer (§4.5 step 1); everything else means the socket itself is
/// no longer usable.
fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

/// Result of peeking a socket's next datagram without consuming it.
enum PeekOutcome {
    /// Nothing ready (`WouldBlock`).
    NoData,
    /// A datagram is ready but is shorter than the 8-byte header — not a
    /// protocol violation (there's no `message_type` to even look at), just
    /// a malformed frame that must still be drained.
    ShortDatagram,
    /// A full 8-byte header is ready to be read, from `from`. `None` in the
    /// second field means the header decoded to an unrecognized
    /// `message_type` — a protocol violation, handled by the caller.
    Frame(SocketAddr, Option<FrameHeader>),
}

fn peek_header(socket: &mio::net::UdpSocket, buf: &mut [u8]) -> io::Result<PeekOutcome> {
    match socket.peek_from(&mut buf[..HEADER_SIZE]) {
        Ok((n, from)) if n == HEADER_SIZE => {
            let header_bytes: [u8; HEADER_SIZE] = buf[..HEADER_SIZE].try_into().unwrap();
            Ok(PeekOutcome::Frame(from, FrameHeader::decode(&header_bytes)))
        }
        Ok(_) => Ok(PeekOutcome::ShortDatagram),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(PeekOutcome::NoData),
        Err(err) => Err(err),
    }
}

fn receive_full(socket: &mio::net::UdpSocket, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match socket.recv(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) => return Err(err),
        }
    }
}

fn handle_frame(
    registry: &mut ConnRegistry,
    queue: &mut EventQueue,
    conn: &std::rc::Rc<std::cell::RefCell<crate::registry::ConnSlot>>,
    from: SocketAddr,
    header: FrameHeader,
    payload: Vec<u8>,
) {
    use crate::header::MessageType;

    let SocketAddr::V4(from_v4) = from else {
        tracing::debug!("ignoring datagram from non-IPv4 peer");
        return;
    };
    let conn_id = conn.borrow().id;

    {
        let mut slot = conn.borrow_mut();
        slot.remote_ip = *from_v4.ip();
        slot.remote_port = from_v4.port();
    }

    match header.message_type {
        MessageType::Heartbeat => {
            registry.observe_peer(*from_v4.ip(), from_v4.port(), Transport::Datagram);
        }
        MessageType::Close => {
            queue.push(PendingEvent {
                conn_id,
                target: EventTarget::Conn(conn.clone()),
                event: Event::ConnectionClosed,
                payload: Vec::new(),
                correlation: None,
            });
            registry.tombstone(conn_id);
        }
        MessageType::OneWay | MessageType::Request | MessageType::Reply => {
            let first_seen =
                registry.observe_peer(*from_v4.ip(), from_v4.port(), Transport::Datagram);
            if first_seen {
                queue.push(PendingEvent {
                    conn_id,
                    target: EventTarget::Conn(conn.clone()),
                    event: Event::ConnectionReady,
                    payload: Vec::new(),
                    correlation: None,
                });
            }

            let (event, correlation) = match header.message_type {
                MessageType::OneWay => (Event::Message, None),
                MessageType::Request => {
                    let request_id = CorrelationId::from_reply_field(header.reply_id).as_request();
                    conn.borrow_mut().last_request_id = Some(request_id);
                    (Event::Request, Some(request_id))
                }
                MessageType::Reply => {
                    (Event::Reply, Some(CorrelationId::from_reply_field(header.reply_id).as_request()))
                }
                _ => unreachable!(),
            };

            queue.push(PendingEvent { conn_id, target: EventTarget::Conn(conn.clone()), event, payload, correlation });
        }
    }
}
