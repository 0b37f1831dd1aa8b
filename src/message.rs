//! The wire frame: a fixed big-endian header followed by an opaque payload.
//!
//! ```text
//! u32 dst_id | u32 src_id | u32 handle | u32 reply_to | u32 length | payload[length]
//! ```
//!
//! Big-endian on the wire, unlike [`crate::value`]'s internal little-endian
//! encoding — the two are independent formats layered on top of each other
//! (header vs. payload), a fixed-header-plus-opaque-body split like a
//! length-prefixed framing scheme separating its header from a JSON/binary
//! payload body.

use crate::value::Value;

/// Size in bytes of the fixed header.
pub const HEADER_LEN: usize = 20;

/// Reserved handle constants (spec §4.3, §6).
pub mod handle {
    /// Fetch a module's source and dependency closure.
    pub const GET_MODULE: u32 = 100;
    /// Invoke a function in the peer's address space.
    pub const CALL_FUNCTION: u32 = 101;
    /// Forward a log record to the master's log hierarchy.
    pub const FORWARD_LOG: u32 = 102;
    /// Install a static route on an ancestor.
    pub const ADD_ROUTE: u32 = 103;
    /// Request a fresh peer id from the root.
    pub const ALLOCATE_ID: u32 = 104;
    /// Orderly shutdown, accepted only from `parent_id`.
    pub const SHUTDOWN: u32 = 105;

    /// First handle value available for user allocation (spec §3).
    pub const FIRST_USER_HANDLE: u32 = 1000;
}

/// `reply_to == NONE` means "no reply expected/owed".
pub const NO_REPLY: u32 = 0;

/// A single message: routing header plus an opaque, already-encoded
/// payload. The payload is kept as raw bytes at this layer — decoding into
/// a [`Value`] happens one level up, in [`crate::context`] — mirroring
/// spec §3's "fixed-layout header followed by an opaque payload".
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Destination peer id.
    pub dst_id: u32,
    /// Source peer id, filled in by the sender. Receivers MUST NOT trust
    /// this beyond using it as a return address (spec §3).
    pub src_id: u32,
    /// Local endpoint on the destination.
    pub handle: u32,
    /// Reply handle, or [`NO_REPLY`].
    pub reply_to: u32,
    /// The message body.
    pub payload: Vec<u8>,
}

impl Message {
    /// Build a message addressed to `dst_id`/`handle` with an already
    /// encoded payload.
    #[must_use]
    pub fn new(dst_id: u32, handle: u32, payload: Vec<u8>) -> Self {
        Self { dst_id, src_id: 0, handle, reply_to: NO_REPLY, payload }
    }

    /// Build a message carrying an encoded [`Value`].
    #[must_use]
    pub fn with_value(dst_id: u32, handle: u32, value: &Value) -> Self {
        Self::new(dst_id, handle, value.to_bytes())
    }

    /// Decode [`Self::payload`] as a [`Value`].
    pub fn decode_value(&self) -> crate::error::Result<Value> {
        Value::decode_exact(&self.payload)
    }

    /// Encode this message into wire bytes: header then payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.dst_id.to_be_bytes());
        out.extend_from_slice(&self.src_id.to_be_bytes());
        out.extend_from_slice(&self.handle.to_be_bytes());
        out.extend_from_slice(&self.reply_to.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse a complete header from the front of `buf`. Returns
    /// `(dst_id, src_id, handle, reply_to, length)`.
    fn parse_header(buf: &[u8]) -> (u32, u32, u32, u32, u32) {
        let dst_id = u32::from_be_bytes(buf[0..4].try_into().expect("4 bytes"));
        let src_id = u32::from_be_bytes(buf[4..8].try_into().expect("4 bytes"));
        let handle = u32::from_be_bytes(buf[8..12].try_into().expect("4 bytes"));
        let reply_to = u32::from_be_bytes(buf[12..16].try_into().expect("4 bytes"));
        let length = u32::from_be_bytes(buf[16..20].try_into().expect("4 bytes"));
        (dst_id, src_id, handle, reply_to, length)
    }
}

/// Maximum accepted payload length: guards against a corrupt length field
/// causing an unbounded allocation.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Incremental frame decoder: feed arbitrarily-sized chunks, get back
/// complete [`Message`]s. Buffers partial reads across calls rather than
/// assuming a full frame always arrives in one read.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: Vec<u8>,
}

impl MessageDecoder {
    /// Construct an empty decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder, returning every complete message that
    /// became available. Incomplete trailing data is buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> crate::error::Result<Vec<Message>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            if self.buf.len() < HEADER_LEN {
                break;
            }
            let (dst_id, src_id, handle, reply_to, length) = Message::parse_header(&self.buf);
            if length > MAX_PAYLOAD_LEN {
                return Err(crate::error::Error::Stream(format!(
                    "oversized payload: {length} bytes (max {MAX_PAYLOAD_LEN})"
                )));
            }
            let total = HEADER_LEN + length as usize;
            if self.buf.len() < total {
                break;
            }
            let payload = self.buf[HEADER_LEN..total].to_vec();
            out.push(Message { dst_id, src_id, handle, reply_to, payload });
            self.buf.drain(..total);
        }

        Ok(out)
    }

    /// Returns true if a partial frame is buffered awaiting more bytes.
    #[must_use]
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        Message { dst_id: 3, src_id: 0, handle: handle::CALL_FUNCTION, reply_to: 9, payload: b"hi".to_vec() }
    }

    #[test]
    fn header_is_big_endian() {
        let msg = Message { dst_id: 1, src_id: 2, handle: 3, reply_to: 4, payload: vec![] };
        let encoded = msg.encode();
        assert_eq!(&encoded[0..4], &1u32.to_be_bytes());
        assert_eq!(&encoded[4..8], &2u32.to_be_bytes());
        assert_eq!(&encoded[8..12], &3u32.to_be_bytes());
        assert_eq!(&encoded[12..16], &4u32.to_be_bytes());
        assert_eq!(&encoded[16..20], &0u32.to_be_bytes());
    }

    #[test]
    fn single_message_round_trips() {
        let msg = sample();
        let mut dec = MessageDecoder::new();
        let out = dec.feed(&msg.encode()).unwrap();
        assert_eq!(out, vec![msg]);
        assert!(!dec.has_partial());
    }

    #[test]
    fn byte_at_a_time_reassembly() {
        let msg = sample();
        let encoded = msg.encode();
        let mut dec = MessageDecoder::new();
        let mut collected = Vec::new();
        for b in &encoded {
            collected.extend(dec.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(collected, vec![msg]);
    }

    #[test]
    fn many_frames_in_one_feed_preserve_order() {
        let a = Message::new(1, 1000, b"a".to_vec());
        let b = Message::new(2, 1000, b"b".to_vec());
        let c = Message::new(3, 1000, b"c".to_vec());
        let mut bytes = Vec::new();
        bytes.extend(a.encode());
        bytes.extend(b.encode());
        bytes.extend(c.encode());

        let mut dec = MessageDecoder::new();
        let out = dec.feed(&bytes).unwrap();
        assert_eq!(out, vec![a, b, c]);
    }

    #[test]
    fn rejects_oversized_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_be_bytes());
        let mut dec = MessageDecoder::new();
        assert!(dec.feed(&buf).is_err());
    }

    #[test]
    fn arbitrary_chunk_sizes_preserve_message_count() {
        let msgs: Vec<Message> = (0..20)
            .map(|i| Message::new(i, handle::FIRST_USER_HANDLE + i, vec![i as u8; i as usize]))
            .collect();
        let mut bytes = Vec::new();
        for m in &msgs {
            bytes.extend(m.encode());
        }
        for chunk_size in [1usize, 3, 7, 64, 4096] {
            let mut dec = MessageDecoder::new();
            let mut collected = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                collected.extend(dec.feed(chunk).unwrap());
            }
            assert_eq!(collected, msgs, "chunk_size={chunk_size}");
        }
    }
}
