//! Error taxonomy (§7): address errors, OS errors, and the internal
//! protocol-violation assertion class (handled via `msgbox_utils::safe_panic!`
//! rather than a `Result`, since a violation has no caller to report back to
//! synchronously — it's funneled through the deferred queue as an `error`
//! event on whichever connection produced it, or dropped silently if none
//! is attributable).

use thiserror::Error;

use crate::address::AddressError;

/// Failure surfaced as an `error` event on a nascent or live Connection.
#[derive(Error, Debug)]
pub enum MsgBoxError {
    #[error("bad address: {0}")]
    Address(#[from] AddressError),

    #[error("stream transport is not supported yet, use udp://")]
    StreamTransportUnsupported,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection is not registered")]
    UnknownConnection,
}
