//! An event-driven runtime for exchanging small framed messages over UDP.
//!
//! A caller registers listeners ([`MsgBox::listen`]) and outbound
//! connections ([`MsgBox::connect`]) by address, supplies a callback for
//! each, and drives [`MsgBox::runloop`] repeatedly. The runtime delivers
//! [`Event`]s — `listening`, `connection_ready`, `message`, `request`,
//! `reply`, `error`, and so on — to the registered callback along with a
//! [`MsgBoxHandle`] and a payload slice.
//!
//! User callbacks run only from inside `runloop`, never synchronously
//! inside a public-API call (§7): every outcome, success or failure, is
//! funneled through the deferred queue.

mod address;
mod dispatcher;
mod error;
mod event;
mod handle;
mod header;
mod payload;
mod queue;
mod registry;

pub use address::{Address, AddressError, Host};
pub use error::MsgBoxError;
pub use event::{Callback, Event};
pub use handle::MsgBoxHandle;
pub use payload::{delete_data, new_data, new_data_space, Payload, MAX_PAYLOAD_LEN};
pub use registry::ConnId;

use std::{io, time::Duration};

use queue::EventQueue;
use registry::ConnRegistry;

/// Default capacity of the `mio::Events` buffer a tick polls into.
const DEFAULT_EVENTS_CAPACITY: usize = 128;

/// Per-instance configuration for a [`MsgBox`].
///
/// There is no environment- or file-driven configuration (§6); this is the
/// only knob surface, mirroring `flux-network`'s `TcpConnector::with_*`
/// builder methods.
#[derive(Debug, Clone)]
pub struct MsgBoxBuilder {
    events_capacity: usize,
}

impl Default for MsgBoxBuilder {
    fn default() -> Self {
        Self { events_capacity: DEFAULT_EVENTS_CAPACITY }
    }
}

impl MsgBoxBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the capacity of the readiness-event buffer each `runloop` tick
    /// polls into. Larger values amortize `poll` calls under high fan-out
    /// at the cost of more memory; the default is adequate for most uses.
    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> io::Result<MsgBox> {
        Ok(MsgBox {
            registry: ConnRegistry::new()?,
            queue: EventQueue::new(),
            events: mio::Events::with_capacity(self.events_capacity),
        })
    }
}

/// The runtime context: connection registry, deferred event queue, and the
/// reusable readiness-event buffer. Dropping it releases every registered
/// socket.
///
/// Single-owner, single-threaded by convention (§5): nothing here is
/// `Sync`, but nothing enforces it either — constructing more than one
/// `MsgBox` in a process (e.g. one per test) is fine, each with its own
/// independent state.
pub struct MsgBox {
    registry: ConnRegistry,
    queue: EventQueue,
    events: mio::Events,
}

impl MsgBox {
    pub fn new() -> io::Result<Self> {
        MsgBoxBuilder::new().build()
    }

    /// Borrows the registry and deferred queue together as a
    /// [`MsgBoxHandle`] — the same view a connection's callback receives
    /// when invoked from [`Self::runloop`]'s drain phase.
    pub fn handle(&mut self) -> MsgBoxHandle<'_> {
        MsgBoxHandle::new(&mut self.registry, &mut self.queue)
    }

    /// Parses `address`, binds a UDP socket, registers the connection, and
    /// enqueues `listening` on success. See [`MsgBoxHandle::listen`].
    pub fn listen(&mut self, address: &str, callback: event::Callback) -> ConnId {
        self.handle().listen(address, callback)
    }

    /// Parses `address`, creates and connects a UDP socket, registers the
    /// connection, and enqueues `connection_ready`. See
    /// [`MsgBoxHandle::connect`].
    pub fn connect(&mut self, address: &str, callback: event::Callback) -> ConnId {
        self.handle().connect(address, callback)
    }

    /// Sends `payload` as a `one_way` message on `conn`. See
    /// [`MsgBoxHandle::send`].
    pub fn send(&mut self, conn: ConnId, payload: Payload) {
        self.handle().send(conn, payload);
    }

    /// Sends a `request` and routes its eventual `reply` to
    /// `reply_callback`. See [`MsgBoxHandle::get`].
    pub fn get(&mut self, conn: ConnId, payload: Payload, reply_callback: event::Callback) {
        self.handle().get(conn, payload, reply_callback);
    }

    /// Answers the most recently received `request` on `conn`. See
    /// [`MsgBoxHandle::reply`].
    pub fn reply(&mut self, conn: ConnId, payload: Payload) {
        self.handle().reply(conn, payload);
    }

    /// Sends a `close` frame and tears `conn` down. See
    /// [`MsgBoxHandle::disconnect`].
    pub fn disconnect(&mut self, conn: ConnId) {
        self.handle().disconnect(conn);
    }

    /// Tears down a listener connection without sending a frame. See
    /// [`MsgBoxHandle::unlisten`].
    pub fn unlisten(&mut self, conn: ConnId) {
        self.handle().unlisten(conn);
    }

    /// Runs one dispatcher tick (§4.5): poll up to `timeout_ms`, read and
    /// classify ready frames, then drain the deferred queue. `timeout_ms
    /// == 0` polls without blocking, matching the usual `poll`/`epoll`
    /// convention for a zero timeout.
    pub fn runloop(&mut self, timeout_ms: u64) -> io::Result<()> {
        let timeout = Some(Duration::from_millis(timeout_ms));
        dispatcher::tick(&mut self.registry, &mut self.queue, &mut self.events, timeout)
    }
}
