//! The public façade (§4.6), implemented against a borrowed
//! [`MsgBoxHandle`] rather than directly against `MsgBox`.
//!
//! `MsgBox::listen`/`connect`/`send`/... each just borrow a `MsgBoxHandle`
//! for the call and forward to it. The same handle is what a connection's
//! callback receives during [`crate::queue::EventQueue::drain`] — so a
//! callback reacting to e.g. `listening` can call `handle.connect(...)` to
//! register a second endpoint, exactly as `MsgBox::connect` would from
//! outside. Both paths only ever borrow the registry and queue for the
//! duration of one call, never across a callback invocation, which is what
//! makes the reentrant case sound: nothing is held borrowed while a
//! callback runs except the one `&mut MsgBoxHandle` it was handed.

use std::{
    cell::RefCell,
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    rc::Rc,
};

use mio::{net::UdpSocket, Interest};

use crate::{
    address::{Address, Host, Transport as AddressTransport},
    error::MsgBoxError,
    event::{Callback, Event},
    header::{CorrelationId, FrameHeader, MessageType, ReplyIdAllocator, SENTINEL_REPLY_ID},
    payload::{new_data_space, Payload},
    queue::{EventQueue, EventTarget, PendingEvent},
    registry::{ConnId, ConnRegistry, ConnSlot, Role, Transport as ConnTransport},
};

/// A borrowed view of a [`crate::MsgBox`]'s registry and deferred queue.
///
/// `MsgBox`'s own façade methods construct one of these per call
/// ([`crate::MsgBox::handle`]); a connection's callback receives one as its
/// first argument so it can reentrantly register, send on, or tear down
/// connections from inside its own invocation (§8 scenario 4, §9 "reentrant
/// registry mutation").
pub struct MsgBoxHandle<'a> {
    pub(crate) registry: &'a mut ConnRegistry,
    pub(crate) queue: &'a mut EventQueue,
}

impl<'a> MsgBoxHandle<'a> {
    pub(crate) fn new(registry: &'a mut ConnRegistry, queue: &'a mut EventQueue) -> Self {
        Self { registry, queue }
    }

    /// Parses `address`, binds a UDP socket, registers the connection, and
    /// enqueues `listening` on success. On failure — bad address grammar,
    /// an unsupported transport, or a bind error — enqueues `error`
    /// instead and leaves nothing registered.
    pub fn listen(&mut self, address: &str, callback: Callback) -> ConnId {
        let sockaddr = match parse_bindable_address(address) {
            Ok(sockaddr) => sockaddr,
            Err(err) => return self.enqueue_nascent_error(callback, err),
        };
        let socket = match UdpSocket::bind(sockaddr) {
            Ok(socket) => socket,
            Err(err) => return self.enqueue_nascent_error(callback, MsgBoxError::Io(err)),
        };
        self.finish_registration(sockaddr, Role::Listener, socket, callback, Event::Listening)
    }

    /// Parses `address`, creates and connects a UDP socket, registers the
    /// connection, and enqueues `connection_ready`. On failure, behaves as
    /// [`listen`](Self::listen).
    pub fn connect(&mut self, address: &str, callback: Callback) -> ConnId {
        let sockaddr = match parse_bindable_address(address) {
            Ok(sockaddr) => sockaddr,
            Err(err) => return self.enqueue_nascent_error(callback, err),
        };
        let ephemeral = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let socket = match UdpSocket::bind(ephemeral).and_then(|s| s.connect(sockaddr).map(|()| s)) {
            Ok(socket) => socket,
            Err(err) => return self.enqueue_nascent_error(callback, MsgBoxError::Io(err)),
        };
        self.finish_registration(sockaddr, Role::Initiator, socket, callback, Event::ConnectionReady)
    }

    fn finish_registration(
        &mut self,
        sockaddr: SocketAddr,
        role: Role,
        socket: UdpSocket,
        callback: Callback,
        ready_event: Event,
    ) -> ConnId {
        let SocketAddr::V4(v4) = sockaddr else {
            unreachable!("msgbox addresses are always IPv4");
        };
        let token = self.registry.allocate_token();
        let conn_id = self.registry.insert(
            token,
            ConnSlot {
                id: ConnId(token),
                transport: ConnTransport::Datagram,
                role,
                socket,
                remote_ip: *v4.ip(),
                remote_port: v4.port(),
                reply_ids: ReplyIdAllocator::new(),
                last_request_id: None,
                callback: Some(callback),
                pending_replies: HashMap::new(),
            },
        );

        let conn = self.registry.get(conn_id).expect("just inserted");
        if let Err(err) = self
            .registry
            .poll
            .registry()
            .register(&mut conn.borrow_mut().socket, token, Interest::READABLE)
        {
            // The slot never became reachable from the dispatcher's
            // readiness loop, so unwind it rather than leave a socket in
            // the registry that will never be polled.
            self.registry.remove_last();
            let callback = conn.borrow_mut().callback.take().expect("callback set above");
            return self.enqueue_nascent_error(callback, MsgBoxError::Io(err));
        }

        self.queue.push(PendingEvent {
            conn_id,
            target: EventTarget::Conn(conn),
            event: ready_event,
            payload: Vec::new(),
            correlation: None,
        });
        conn_id
    }

    /// Allocates a throwaway token purely so the failed `listen`/`connect`
    /// call can still hand the caller a `ConnId` and route the failure
    /// through the same deferred queue as every other event (§7) — no
    /// Connection is ever registered for it.
    fn enqueue_nascent_error(&mut self, callback: Callback, err: MsgBoxError) -> ConnId {
        let token = self.registry.allocate_token();
        let conn_id = ConnId(token);
        self.queue.push(PendingEvent {
            conn_id,
            target: EventTarget::Orphan(RefCell::new(Some(callback))),
            event: Event::Error,
            payload: err.to_string().into_bytes(),
            correlation: None,
        });
        conn_id
    }

    /// Writes the frame header into `payload`'s reserved prefix and sends
    /// it as a `one_way` message. Errors are reported through the
    /// connection's default callback as an `error` event on the next
    /// drain, not returned directly (§7).
    ///
    /// A `conn` that has already been torn down (`disconnect`/`unlisten`/a
    /// `close` frame) still delivers `Event::Error` to its connection's
    /// callback (§8 scenario 5: "subsequent sends on that Connection fail
    /// with `error`") — the registry keeps a torn-down slot's last known
    /// callback reachable via [`ConnRegistry::dead`] for exactly this.
    pub fn send(&mut self, conn: ConnId, mut payload: Payload) {
        let Some(slot) = self.registry.get(conn) else {
            self.enqueue_dead_error(conn, "send on a disconnected connection");
            return;
        };
        payload.write_header(&FrameHeader {
            message_type: MessageType::OneWay,
            num_packets: 1,
            packet_id: 0,
            reply_id: SENTINEL_REPLY_ID,
        });
        self.transmit(&slot, conn, payload);
    }

    /// Sends a `request` frame with a freshly allocated correlation id and
    /// stores `reply_callback` to be invoked when the matching `reply`
    /// frame arrives, distinct from the connection's default callback. A
    /// torn-down `conn` behaves as [`send`](Self::send): `Event::Error` on
    /// the connection's own callback, not on `reply_callback`, since no
    /// request was ever sent for it to correlate against.
    pub fn get(&mut self, conn: ConnId, mut payload: Payload, reply_callback: Callback) {
        let Some(slot) = self.registry.get(conn) else {
            self.enqueue_dead_error(conn, "get on a disconnected connection");
            return;
        };
        let correlation = slot.borrow_mut().reply_ids.next();
        payload.write_header(&FrameHeader {
            message_type: MessageType::Request,
            num_packets: 1,
            packet_id: 0,
            reply_id: correlation.as_request(),
        });
        slot.borrow_mut().pending_replies.insert(correlation.as_request(), reply_callback);
        self.transmit(&slot, conn, payload);
    }

    /// Answers the most recently received `request` frame on `conn` with a
    /// `reply` frame carrying its correlation id (§3 "last observed
    /// reply-id"). A torn-down `conn` behaves as [`send`](Self::send). A
    /// still-live `conn` with no outstanding request is a silent no-op —
    /// there is nothing to correlate against, which is a distinct case
    /// from teardown.
    pub fn reply(&mut self, conn: ConnId, mut payload: Payload) {
        let Some(slot) = self.registry.get(conn) else {
            self.enqueue_dead_error(conn, "reply on a disconnected connection");
            return;
        };
        let Some(request_id) = slot.borrow_mut().last_request_id.take() else {
            tracing::debug!("reply() called with no outstanding request on this connection");
            return;
        };
        payload.write_header(&FrameHeader {
            message_type: MessageType::Reply,
            num_packets: 1,
            packet_id: 0,
            reply_id: CorrelationId::from_reply_field(request_id).as_reply(),
        });
        self.transmit(&slot, conn, payload);
    }

    /// Delivers a terminal `Event::Error` to a torn-down connection's last
    /// known callback, if it's still reachable via [`ConnRegistry::dead`].
    /// A no-op for a `conn` that was never registered at all — there is no
    /// callback to report to.
    fn enqueue_dead_error(&mut self, conn: ConnId, message: &str) {
        let Some(slot) = self.registry.dead(conn) else {
            return;
        };
        self.queue.push(PendingEvent {
            conn_id: conn,
            target: EventTarget::Conn(slot),
            event: Event::Error,
            payload: message.as_bytes().to_vec(),
            correlation: None,
        });
    }

    fn transmit(&mut self, slot: &Rc<RefCell<ConnSlot>>, conn: ConnId, payload: Payload) {
        let result = {
            let slot_ref = slot.borrow();
            match slot_ref.role {
                Role::Listener => slot_ref.socket.send_to(payload.framed(), slot_ref.remote_addr()),
                Role::Initiator => slot_ref.socket.send(payload.framed()),
            }
        };
        if let Err(err) = result {
            tracing::warn!(error = %err, "send failed");
            self.queue.push(PendingEvent {
                conn_id: conn,
                target: EventTarget::Conn(slot.clone()),
                event: Event::Error,
                payload: err.to_string().into_bytes(),
                correlation: None,
            });
        }
    }

    /// Sends a zero-payload `close` frame, then tears the connection down
    /// synchronously (§9: `disconnect` removes the Connection from the
    /// registry's index immediately, rather than waiting on a peer ack
    /// that can't be trusted to arrive).
    pub fn disconnect(&mut self, conn: ConnId) {
        if let Some(slot) = self.registry.get(conn) {
            let mut close_frame = new_data_space(0);
            close_frame.write_header(&FrameHeader {
                message_type: MessageType::Close,
                num_packets: 1,
                packet_id: 0,
                reply_id: SENTINEL_REPLY_ID,
            });
            let slot_ref = slot.borrow();
            let result = match slot_ref.role {
                Role::Listener => slot_ref.socket.send_to(close_frame.framed(), slot_ref.remote_addr()),
                Role::Initiator => slot_ref.socket.send(close_frame.framed()),
            };
            if let Err(err) = result {
                tracing::debug!(error = %err, "close frame send failed, tearing down anyway");
            }
        }
        self.registry.tombstone(conn);
    }

    /// Tears down a listener connection without sending any frame. Any
    /// event already queued for it is still delivered on the next drain
    /// (§9: "does `unlisten` drain in-flight events").
    pub fn unlisten(&mut self, conn: ConnId) {
        self.registry.tombstone(conn);
    }
}

fn parse_bindable_address(address: &str) -> Result<SocketAddr, MsgBoxError> {
    let parsed: Address = address.parse()?;
    if parsed.transport == AddressTransport::Tcp {
        return Err(MsgBoxError::StreamTransportUnsupported);
    }
    let ip = match parsed.host {
        Host::Any => Ipv4Addr::UNSPECIFIED,
        Host::Ip(ip) => ip,
    };
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, parsed.port)))
}
