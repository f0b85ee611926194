//! Header-prefixed owned payload buffers.
//!
//! Every `Payload` reserves [`crate::header::HEADER_SIZE`] bytes ahead of the
//! user-visible slice so `send` can stamp the frame header in place without
//! reallocating — the Rust equivalent of the `Data { length, pointer }`
//! ABI described in `SPEC_FULL.md` §6, backed by `Vec<u8>`/`Drop` instead of
//! manual pointer arithmetic.

use crate::header::{FrameHeader, HEADER_SIZE};

/// Maximum payload that fits in one datagram: a 32KiB receive buffer minus
/// the 8-byte header.
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024 - HEADER_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    buf: Vec<u8>,
}

impl Payload {
    fn with_reserved_prefix(payload_len: usize) -> Self {
        let mut buf = Vec::with_capacity(HEADER_SIZE + payload_len);
        buf.extend(std::iter::repeat_n(0u8, HEADER_SIZE));
        Self { buf }
    }

    /// Allocates a buffer holding exactly the bytes of `s`.
    pub fn new_data(s: &str) -> Self {
        let mut payload = Self::with_reserved_prefix(s.len());
        payload.buf.extend_from_slice(s.as_bytes());
        payload
    }

    /// Allocates an `n`-byte zeroed payload buffer, header prefix included.
    pub fn new_data_space(n: usize) -> Self {
        let mut payload = Self::with_reserved_prefix(n);
        payload.buf.resize(HEADER_SIZE + n, 0);
        payload
    }

    pub fn len(&self) -> usize {
        self.buf.len() - HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[HEADER_SIZE..]
    }

    /// Stamps `header` into the reserved prefix ahead of the payload.
    pub(crate) fn write_header(&mut self, header: &FrameHeader) {
        let mut raw = [0u8; HEADER_SIZE];
        header.encode(&mut raw);
        self.buf[..HEADER_SIZE].copy_from_slice(&raw);
    }

    /// Header bytes immediately preceding the payload — exposed only for the
    /// invariant test in `SPEC_FULL.md` §8 ("8 bytes immediately before the
    /// payload slice decode to a valid header").
    #[cfg(test)]
    pub(crate) fn header_prefix(&self) -> [u8; HEADER_SIZE] {
        self.buf[..HEADER_SIZE].try_into().unwrap()
    }

    /// Full wire representation: header followed by payload.
    pub(crate) fn framed(&self) -> &[u8] {
        &self.buf
    }
}

/// Allocates a buffer holding exactly the bytes of `s`.
pub fn new_data(s: &str) -> Payload {
    Payload::new_data(s)
}

/// Allocates an `n`-byte zeroed payload buffer.
pub fn new_data_space(n: usize) -> Payload {
    Payload::new_data_space(n)
}

/// Releases a payload buffer. Kept as an explicit function for API-shape
/// fidelity with the source ABI; in Rust this is just a move into `drop`.
pub fn delete_data(data: Payload) {
    drop(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{MessageType, SENTINEL_REPLY_ID};

    #[test]
    fn new_data_round_trips_as_utf8() {
        let data = new_data("hi");
        assert_eq!(std::str::from_utf8(data.payload()).unwrap(), "hi");
    }

    #[test]
    fn new_data_space_has_requested_length() {
        let data = new_data_space(128);
        assert_eq!(data.len(), 128);
        assert!(data.payload().iter().all(|&b| b == 0));
    }

    #[test]
    fn header_prefix_decodes_to_matching_type() {
        let mut data = new_data("hi");
        let header = FrameHeader {
            message_type: MessageType::OneWay,
            num_packets: 1,
            packet_id: 0,
            reply_id: SENTINEL_REPLY_ID,
        };
        data.write_header(&header);
        let decoded = FrameHeader::decode(&data.header_prefix()).unwrap();
        assert_eq!(decoded.message_type, MessageType::OneWay);
    }

    #[test]
    fn framed_is_header_then_payload() {
        let mut data = new_data("hi");
        data.write_header(&FrameHeader {
            message_type: MessageType::OneWay,
            num_packets: 1,
            packet_id: 0,
            reply_id: SENTINEL_REPLY_ID,
        });
        assert_eq!(data.framed().len(), HEADER_SIZE + 2);
        assert_eq!(&data.framed()[HEADER_SIZE..], b"hi");
    }
}
