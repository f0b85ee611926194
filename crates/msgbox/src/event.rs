//! The event enumeration delivered to callbacks, and the callback type
//! itself.

use crate::{handle::MsgBoxHandle, registry::ConnId};

/// Tag delivered to a connection's callback alongside a payload slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Listening,
    ConnectionReady,
    ConnectionClosed,
    ConnectionLost,
    Message,
    Request,
    Reply,
    Error,
}

/// A connection's registered callback.
///
/// There is no separate `context` parameter: the closure's captures play
/// that role, which is the idiomatic Rust replacement for the `void*`
/// context the original ABI threads alongside each callback (see
/// `SPEC_FULL.md` §3). The leading [`MsgBoxHandle`] is how a callback
/// reentrantly drives the same runtime it was invoked from — e.g. a
/// `listening` callback calling `handle.connect(...)` to register a second
/// endpoint (§8 scenario 4, §9 "reentrant registry mutation").
pub type Callback = Box<dyn FnMut(&mut MsgBoxHandle, ConnId, Event, &[u8])>;
