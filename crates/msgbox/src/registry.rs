//! The connection registry (§3, §4.3): two index-aligned sequences — poll
//! tokens and connection slots — plus a peer-status map keyed on
//! `{ip, port, transport}`.
//!
//! Mid-tick removals tombstone a slot (`conns[i] = None`) rather than
//! shifting it, so the dispatcher's collect-phase iteration by index stays
//! valid; [`ConnRegistry::sweep`] compacts tombstones once, at the end of a
//! tick. This generalizes `flux-network`'s `ConnectionManager` (which keeps
//! `(Token, ConnectionVariant)` pairs in one `Vec` and uses `swap_remove`)
//! into the literal two-array shape `SPEC_FULL.md` describes, plus a reverse
//! `Token -> index` map so dispatch doesn't need a linear scan per event.

use std::{
    cell::RefCell,
    collections::HashMap,
    net::Ipv4Addr,
    rc::Rc,
    time::Instant,
};

use mio::{Poll, Token};

use crate::{event::Callback, header::ReplyIdAllocator};

/// Stable identifier for a registered connection. Wraps the `mio::Token`
/// assigned at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) Token);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Datagram,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Listener,
    Initiator,
}

/// `{ip, port, transport}`, treated as an opaque byte sequence for hashing
/// and equality — no field is individually meaningful to the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PeerKey {
    ip: u32,
    port: u16,
    transport: u8,
}

impl PeerKey {
    pub(crate) fn new(ip: Ipv4Addr, port: u16, transport: Transport) -> Self {
        Self { ip: u32::from(ip), port, transport: transport as u8 }
    }
}

pub(crate) struct PeerStatus {
    pub(crate) last_seen: f64,
}

/// A registered connection: socket, remote identity, reply-id counter, and
/// the callback supplied at `listen`/`connect` time.
pub(crate) struct ConnSlot {
    pub(crate) id: ConnId,
    pub(crate) transport: Transport,
    pub(crate) role: Role,
    pub(crate) socket: mio::net::UdpSocket,
    pub(crate) remote_ip: Ipv4Addr,
    pub(crate) remote_port: u16,
    pub(crate) reply_ids: ReplyIdAllocator,
    /// The correlation id of the most recently received `request` frame
    /// (§3 "last observed reply-id"), consumed by `MsgBox::reply`.
    pub(crate) last_request_id: Option<u16>,
    /// Taken out (and always put back) while the callback runs, so a
    /// reentrant call from inside the callback — e.g. `send` on this same
    /// connection — never hits an already-borrowed `RefCell`.
    pub(crate) callback: Option<Callback>,
    /// Correlation id -> dedicated callback for a `get` still awaiting its
    /// `reply`.
    pub(crate) pending_replies: HashMap<u16, Callback>,
}

impl ConnSlot {
    pub(crate) fn remote_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::from((self.remote_ip, self.remote_port))
    }
}

pub(crate) struct ConnRegistry {
    pub(crate) poll: Poll,
    tokens: Vec<Token>,
    conns: Vec<Option<Rc<RefCell<ConnSlot>>>>,
    index_of: HashMap<Token, usize>,
    peers: HashMap<PeerKey, PeerStatus>,
    /// Torn-down slots, kept around (keyed by their never-reused `Token`)
    /// purely so a `send`/`get`/`reply` against a stale `ConnId` still has
    /// a callback to deliver a terminal `Error` event to (§8 scenario 5).
    dead: HashMap<Token, Rc<RefCell<ConnSlot>>>,
    next_token: usize,
    epoch: Instant,
}

impl ConnRegistry {
    pub(crate) fn new() -> std::io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            tokens: Vec::new(),
            conns: Vec::new(),
            index_of: HashMap::new(),
            peers: HashMap::new(),
            dead: HashMap::new(),
            next_token: 0,
            epoch: Instant::now(),
        })
    }

    pub(crate) fn allocate_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Appends a connection, atomically extending both index-aligned
    /// sequences.
    pub(crate) fn insert(&mut self, token: Token, slot: ConnSlot) -> ConnId {
        let idx = self.conns.len();
        self.tokens.push(token);
        self.conns.push(Some(Rc::new(RefCell::new(slot))));
        self.index_of.insert(token, idx);
        ConnId(token)
    }

    /// Undoes the most recent [`insert`](Self::insert). Used by the
    /// bind/connect error-unwind path (§4.3): the slot is inserted before
    /// its socket is registered with `Poll` so the two index-aligned
    /// sequences only ever grow by whole pairs, and a poll-registration
    /// failure after that insert must unwind it rather than leave a
    /// dangling, never-readable slot in the registry.
    pub(crate) fn remove_last(&mut self) {
        if let Some(token) = self.tokens.pop() {
            self.conns.pop();
            self.index_of.remove(&token);
        }
    }

    pub(crate) fn get(&self, id: ConnId) -> Option<Rc<RefCell<ConnSlot>>> {
        let idx = *self.index_of.get(&id.0)?;
        self.conns[idx].clone()
    }

    pub(crate) fn token_to_conn(&self, token: Token) -> Option<Rc<RefCell<ConnSlot>>> {
        let idx = *self.index_of.get(&token)?;
        self.conns[idx].clone()
    }

    /// Tombstones a connection's slot. Returns the detached `Rc` so the
    /// caller can still enqueue a final event (e.g. `connection_closed`)
    /// against it — the connection (and its callback) stays alive for as
    /// long as that `Rc` does.
    ///
    /// Also evicts the connection's own observed remote from the
    /// peer-status map (§3: "destroyed on connection teardown or explicit
    /// eviction") and stashes the slot in `dead` so a post-teardown
    /// `send`/`get`/`reply` can still deliver a terminal `Error` event to
    /// its callback (§8 scenario 5).
    pub(crate) fn tombstone(&mut self, id: ConnId) -> Option<Rc<RefCell<ConnSlot>>> {
        let idx = *self.index_of.get(&id.0)?;
        self.index_of.remove(&id.0);
        let slot = self.conns[idx].take();
        if let Some(slot) = &slot {
            let (remote_ip, remote_port, transport) = {
                let mut s = slot.borrow_mut();
                let _ = self.poll.registry().deregister(&mut s.socket);
                (s.remote_ip, s.remote_port, s.transport)
            };
            self.evict_peer(remote_ip, remote_port, transport);
            self.dead.insert(id.0, slot.clone());
        }
        slot
    }

    /// Looks up a torn-down connection's last-known slot by id. Used only
    /// to deliver a terminal `Error` event to a connection's own callback
    /// after `send`/`get`/`reply` observes it's already gone — `get` above
    /// is for live connections and correctly returns `None` here.
    pub(crate) fn dead(&self, id: ConnId) -> Option<Rc<RefCell<ConnSlot>>> {
        self.dead.get(&id.0).cloned()
    }

    /// Compacts tombstoned slots. Must only run between ticks, never while
    /// the dispatcher is iterating `tokens`/`conns` by index.
    pub(crate) fn sweep(&mut self) {
        if !self.conns.iter().any(Option::is_none) {
            return;
        }
        let mut new_tokens = Vec::with_capacity(self.tokens.len());
        let mut new_conns = Vec::with_capacity(self.conns.len());
        for (token, conn) in self.tokens.drain(..).zip(self.conns.drain(..)) {
            if conn.is_some() {
                self.index_of.insert(token, new_conns.len());
                new_tokens.push(token);
                new_conns.push(conn);
            }
        }
        self.tokens = new_tokens;
        self.conns = new_conns;
    }

    pub(crate) fn now_secs(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Records an observation of `{ip, port, transport}`. Returns `true` the
    /// first time this peer is seen (§4.3 "first-seen behavior").
    pub(crate) fn observe_peer(&mut self, ip: Ipv4Addr, port: u16, transport: Transport) -> bool {
        let key = PeerKey::new(ip, port, transport);
        let now = self.now_secs();
        match self.peers.get_mut(&key) {
            Some(status) => {
                status.last_seen = now;
                false
            }
            None => {
                self.peers.insert(key, PeerStatus { last_seen: now });
                true
            }
        }
    }

    pub(crate) fn evict_peer(&mut self, ip: Ipv4Addr, port: u16, transport: Transport) {
        self.peers.remove(&PeerKey::new(ip, port, transport));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_then_subsequent() {
        let mut reg = ConnRegistry::new().unwrap();
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        assert!(reg.observe_peer(ip, 4040, Transport::Datagram));
        assert!(!reg.observe_peer(ip, 4040, Transport::Datagram));
    }

    #[test]
    fn distinct_ports_are_distinct_peers() {
        let mut reg = ConnRegistry::new().unwrap();
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        assert!(reg.observe_peer(ip, 4040, Transport::Datagram));
        assert!(reg.observe_peer(ip, 4041, Transport::Datagram));
    }

    fn dummy_slot(token: Token) -> ConnSlot {
        let socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        ConnSlot {
            id: ConnId(token),
            transport: Transport::Datagram,
            role: Role::Initiator,
            socket,
            remote_ip: Ipv4Addr::new(127, 0, 0, 1),
            remote_port: 0,
            reply_ids: ReplyIdAllocator::new(),
            last_request_id: None,
            callback: None,
            pending_replies: HashMap::new(),
        }
    }

    #[test]
    fn evicted_peer_is_seen_as_first_seen_again() {
        let mut reg = ConnRegistry::new().unwrap();
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        assert!(reg.observe_peer(ip, 4040, Transport::Datagram));
        reg.evict_peer(ip, 4040, Transport::Datagram);
        assert!(reg.observe_peer(ip, 4040, Transport::Datagram));
    }

    #[test]
    fn inserted_connection_is_retrievable_by_id() {
        let mut reg = ConnRegistry::new().unwrap();
        let token = reg.allocate_token();
        let id = reg.insert(token, dummy_slot(token));

        assert!(reg.get(id).is_some());
    }

    #[test]
    fn remove_last_undoes_most_recent_insert() {
        let mut reg = ConnRegistry::new().unwrap();
        let token_a = reg.allocate_token();
        reg.insert(token_a, dummy_slot(token_a));

        let token_b = reg.allocate_token();
        let id_b = reg.insert(token_b, dummy_slot(token_b));

        reg.remove_last();

        assert!(reg.get(id_b).is_none());
        assert!(reg.get(ConnId(token_a)).is_some());
    }

    #[test]
    fn tombstone_evicts_the_connections_own_observed_peer() {
        let mut reg = ConnRegistry::new().unwrap();
        let ip = Ipv4Addr::new(127, 0, 0, 1);
        let port = 4242;

        let token = reg.allocate_token();
        let mut slot = dummy_slot(token);
        slot.remote_ip = ip;
        slot.remote_port = port;
        let id = reg.insert(token, slot);

        assert!(reg.observe_peer(ip, port, Transport::Datagram));
        assert!(!reg.observe_peer(ip, port, Transport::Datagram));

        reg.tombstone(id);

        // §3 invariant (b): a torn-down connection's remote must no longer
        // be a peer-map key, so observing it again reports first-seen.
        assert!(reg.observe_peer(ip, port, Transport::Datagram));
    }

    #[test]
    fn tombstone_keeps_the_slot_reachable_as_dead() {
        let mut reg = ConnRegistry::new().unwrap();
        let token = reg.allocate_token();
        let id = reg.insert(token, dummy_slot(token));

        reg.tombstone(id);

        assert!(reg.get(id).is_none());
        assert!(reg.dead(id).is_some());
    }
}
