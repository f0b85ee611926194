//! The deferred event queue (§4.4, §5): callbacks never run synchronously
//! from inside `poll`. Every event observed during the I/O phase of a tick
//! is recorded here first and only invoked afterward, by
//! [`EventQueue::drain`].
//!
//! A tick's drain can itself enqueue more events — a callback calling
//! `send`/`connect`/`disconnect` on another connection, which synchronously
//! completes and enqueues its own event. To guarantee those run on the
//! *next* tick rather than being picked up by the drain that's already in
//! progress (the "strict generational separation" invariant), `drain` swaps
//! the live queue out for an empty one before iterating, so anything pushed
//! during the swap's iteration lands in the fresh queue instead.

use std::{cell::RefCell, rc::Rc};

use crate::{
    event::{Callback, Event},
    handle::MsgBoxHandle,
    registry::{ConnId, ConnRegistry, ConnSlot},
};

/// What a pending event invokes: either a registered connection's callback
/// (kept alive by its own `Rc`, per `ConnRegistry::tombstone`), or — for a
/// `listen`/`connect` call that failed before any connection was
/// registered — the one-shot callback handed to that call, with nothing
/// else to keep alive.
pub(crate) enum EventTarget {
    Conn(Rc<RefCell<ConnSlot>>),
    Orphan(RefCell<Option<Callback>>),
}

/// One queued callback invocation.
pub(crate) struct PendingEvent {
    pub(crate) conn_id: ConnId,
    pub(crate) target: EventTarget,
    pub(crate) event: Event,
    pub(crate) payload: Vec<u8>,
    /// Present only for `Event::Reply`, to route through
    /// `ConnSlot::pending_replies` instead of the connection's default
    /// callback.
    pub(crate) correlation: Option<u16>,
}

#[derive(Default)]
pub(crate) struct EventQueue {
    pending: Vec<PendingEvent>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, event: PendingEvent) {
        self.pending.push(event);
    }

    /// Swaps out the current generation and invokes each event's callback
    /// in order. Anything a callback enqueues via its `MsgBoxHandle` during
    /// this call lands in the (now-empty) `self.pending` and is left for the
    /// *next* `drain` call, never this one.
    ///
    /// `registry` is threaded through so each callback invocation can be
    /// handed a fresh [`MsgBoxHandle`] — borrowed only for that one call,
    /// never held across it, which is what lets a callback reentrantly call
    /// back into `registry`/`self` without conflicting with this borrow.
    pub(crate) fn drain(&mut self, registry: &mut ConnRegistry) {
        let generation = std::mem::take(&mut self.pending);
        for pending in generation {
            Self::dispatch_one(pending, self, registry);
        }
    }

    fn dispatch_one(pending: PendingEvent, queue: &mut EventQueue, registry: &mut ConnRegistry) {
        let PendingEvent { conn_id, target, event, payload, correlation } = pending;

        let conn = match target {
            EventTarget::Orphan(cb_cell) => {
                if let Some(mut cb) = cb_cell.into_inner() {
                    let mut handle = MsgBoxHandle::new(registry, queue);
                    cb(&mut handle, conn_id, event, &payload);
                }
                return;
            }
            EventTarget::Conn(conn) => conn,
        };

        if let Event::Reply = event {
            if let Some(id) = correlation {
                let reply_cb = conn.borrow_mut().pending_replies.remove(&id);
                if let Some(mut cb) = reply_cb {
                    let mut handle = MsgBoxHandle::new(registry, queue);
                    cb(&mut handle, conn_id, event, &payload);
                    return;
                }
            }
        }

        let cb = conn.borrow_mut().callback.take();
        if let Some(mut cb) = cb {
            let mut handle = MsgBoxHandle::new(registry, queue);
            cb(&mut handle, conn_id, event, &payload);
            conn.borrow_mut().callback = Some(cb);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{header::ReplyIdAllocator, registry::{Role, Transport}};
    use std::{cell::Cell, collections::HashMap, rc::Rc};

    fn dummy_slot(callback: crate::event::Callback, token: mio::Token) -> Rc<RefCell<ConnSlot>> {
        let socket = mio::net::UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        Rc::new(RefCell::new(ConnSlot {
            id: ConnId(token),
            transport: Transport::Datagram,
            role: Role::Initiator,
            socket,
            remote_ip: std::net::Ipv4Addr::new(127, 0, 0, 1),
            remote_port: 0,
            reply_ids: ReplyIdAllocator::new(),
            last_request_id: None,
            callback: Some(callback),
            pending_replies: HashMap::new(),
        }))
    }

    #[test]
    fn reentrant_push_during_drain_is_deferred_to_next_drain() {
        let seen = Rc::new(Cell::new(0u32));

        let mut queue = EventQueue::new();
        let token = mio::Token(0);

        let seen_inner = seen.clone();
        let slot = dummy_slot(
            Box::new(move |_handle, _id, _ev, _payload| {
                seen_inner.set(seen_inner.get() + 1);
            }),
            token,
        );

        let conn_id = ConnId(token);
        queue.push(PendingEvent {
            conn_id,
            target: EventTarget::Conn(slot.clone()),
            event: Event::Message,
            payload: vec![],
            correlation: None,
        });

        let mut registry = ConnRegistry::new().unwrap();
        queue.drain(&mut registry);
        assert_eq!(seen.get(), 1);

        // Nothing re-enqueued during that drain, so a second drain is a no-op.
        queue.drain(&mut registry);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn callback_can_be_taken_and_restored_without_panic() {
        let mut queue = EventQueue::new();
        let token = mio::Token(1);
        let slot = dummy_slot(Box::new(|_handle, _id, _ev, _payload| {}), token);
        let conn_id = ConnId(token);

        queue.push(PendingEvent {
            conn_id,
            target: EventTarget::Conn(slot.clone()),
            event: Event::ConnectionReady,
            payload: vec![],
            correlation: None,
        });
        let mut registry = ConnRegistry::new().unwrap();
        queue.drain(&mut registry);

        assert!(slot.borrow().callback.is_some());
    }

    #[test]
    fn orphan_target_invokes_one_shot_callback_without_a_connection() {
        let seen = Rc::new(Cell::new(false));
        let seen_inner = seen.clone();

        let mut queue = EventQueue::new();
        let conn_id = ConnId(mio::Token(99));
        queue.push(PendingEvent {
            conn_id,
            target: EventTarget::Orphan(RefCell::new(Some(Box::new(move |_handle, _id, ev, _payload| {
                assert_eq!(ev, Event::Error);
                seen_inner.set(true);
            })))),
            event: Event::Error,
            payload: b"bad address".to_vec(),
            correlation: None,
        });
        let mut registry = ConnRegistry::new().unwrap();
        queue.drain(&mut registry);

        assert!(seen.get());
    }

    #[test]
    fn callback_can_reentrantly_connect_via_its_handle() {
        let mut registry = ConnRegistry::new().unwrap();
        let mut queue = EventQueue::new();
        let token = mio::Token(2);
        let slot = dummy_slot(
            Box::new(|handle, _id, _ev, _payload| {
                handle.listen("udp://*:0", Box::new(|_handle, _id, _ev, _payload| {}));
            }),
            token,
        );
        let conn_id = ConnId(token);

        queue.push(PendingEvent {
            conn_id,
            target: EventTarget::Conn(slot),
            event: Event::Listening,
            payload: vec![],
            correlation: None,
        });
        // Draining must not panic: the reentrant `listen` only ever borrows
        // `registry`/`queue` for its own call, never across the callback.
        queue.drain(&mut registry);

        // The reentrant `listen`'s own `listening` event landed in the fresh
        // generation, left for the caller's next `drain`.
        queue.drain(&mut registry);
    }
}
