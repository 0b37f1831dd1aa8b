//! Closed tagged-variant serialization for message payloads.
//!
//! Rather than pickling an arbitrary object graph (a remote-code-execution
//! risk for anything that decodes untrusted bytes), every value that
//! crosses a `Stream` is one of a closed set of serializable shapes.
//! `Value` is that set: every argument/return value/log record/module
//! reply is one of these variants, nothing else.
//!
//! The wire shape per value is `[u8 tag][payload]`, a type byte nested
//! ahead of its payload. Integers are little-endian; this is an internal
//! format private to this crate, unlike the message header in
//! [`crate::message`] which pins a big-endian layout on the wire.

use crate::error::{Error, Result};

mod tag {
    pub const NULL: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const FLOAT: u8 = 0x03;
    pub const BYTES: u8 = 0x04;
    pub const TEXT: u8 = 0x05;
    pub const LIST: u8 = 0x06;
    pub const MAP: u8 = 0x07;
    pub const SET: u8 = 0x08;
    pub const CONTEXT: u8 = 0x09;
    pub const DEAD: u8 = 0x0a;
    pub const CALL_ERROR: u8 = 0x0b;
}

/// A single distinguished marker value that terminates a receiver or
/// signals that a peer's end of a channel has closed. Singleton-equal to
/// itself (spec §3 `_DEAD`, P1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dead;

/// A remote exception, packaged for delivery across the wire (spec §4.4,
/// §7). `message` is the `"{type}: {text}"` summary; `traceback` is the
/// formatted remote traceback, kept as opaque text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallError {
    /// Human-readable summary of the remote failure.
    pub message: String,
    /// Formatted traceback text, if the peer produced one.
    pub traceback: Option<String>,
}

impl CallError {
    /// Construct a [`CallError`] with no traceback.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), traceback: None }
    }
}

/// A remote peer handle, round-tripped as `(id, name)` (spec §4.4, P1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextRef {
    /// The peer's `context_id`.
    pub id: u32,
    /// The peer's human-readable name.
    pub name: String,
}

/// The closed set of values that may cross a [`crate::stream::Stream`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The null/none value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// UTF-8 text.
    Text(String),
    /// An ordered, possibly-heterogeneous list.
    List(Vec<Value>),
    /// An insertion-ordered key → value mapping. Keys are themselves
    /// `Value`s (mirroring Python's hashable-key dict semantics); in
    /// practice callers only ever use `Text` keys (`kwargs`).
    Map(Vec<(Value, Value)>),
    /// An unordered set, represented as a deduplicated ordered list on the
    /// wire (order is not part of the value's identity).
    Set(Vec<Value>),
    /// A remote peer reference.
    Context(ContextRef),
    /// The channel-closed sentinel.
    Dead,
    /// A packaged remote exception.
    CallError(CallError),
}

impl Value {
    /// Shorthand for building a `Text` value.
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    /// Encode this value into `out`, appending bytes.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null => out.push(tag::NULL),
            Value::Bool(b) => {
                out.push(tag::BOOL);
                out.push(u8::from(*b));
            }
            Value::Int(i) => {
                out.push(tag::INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Value::Float(f) => {
                out.push(tag::FLOAT);
                out.extend_from_slice(&f.to_le_bytes());
            }
            Value::Bytes(b) => {
                out.push(tag::BYTES);
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            Value::Text(s) => {
                out.push(tag::TEXT);
                let bytes = s.as_bytes();
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Value::List(items) => {
                out.push(tag::LIST);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode(out);
                }
            }
            Value::Map(entries) => {
                out.push(tag::MAP);
                out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
                for (k, v) in entries {
                    k.encode(out);
                    v.encode(out);
                }
            }
            Value::Set(items) => {
                out.push(tag::SET);
                out.extend_from_slice(&(items.len() as u32).to_le_bytes());
                for item in items {
                    item.encode(out);
                }
            }
            Value::Context(ctx) => {
                out.push(tag::CONTEXT);
                out.extend_from_slice(&ctx.id.to_le_bytes());
                let bytes = ctx.name.as_bytes();
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(bytes);
            }
            Value::Dead => out.push(tag::DEAD),
            Value::CallError(err) => {
                out.push(tag::CALL_ERROR);
                let msg = err.message.as_bytes();
                out.extend_from_slice(&(msg.len() as u32).to_le_bytes());
                out.extend_from_slice(msg);
                match &err.traceback {
                    None => out.push(0),
                    Some(tb) => {
                        out.push(1);
                        let tb_bytes = tb.as_bytes();
                        out.extend_from_slice(&(tb_bytes.len() as u32).to_le_bytes());
                        out.extend_from_slice(tb_bytes);
                    }
                }
            }
        }
    }

    /// Encode this value as a freshly allocated byte vector.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decode a single value from the front of `buf`, returning the value
    /// and the number of bytes consumed.
    ///
    /// Rejects any tag outside the closed set with
    /// [`Error::Security`] — this is the decoder-side half of Design
    /// Notes §9's "reject everything else at encode time" contract.
    pub fn decode(buf: &[u8]) -> Result<(Value, usize)> {
        let mut cur = Cursor { buf, pos: 0 };
        let value = cur.read_value()?;
        Ok((value, cur.pos))
    }

    /// Decode a value that must consume the entirety of `buf`.
    pub fn decode_exact(buf: &[u8]) -> Result<Value> {
        let (value, consumed) = Value::decode(buf)?;
        if consumed != buf.len() {
            return Err(Error::Stream(format!(
                "trailing bytes after value: {} of {}",
                consumed,
                buf.len()
            )));
        }
        Ok(value)
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(Error::Stream("truncated value".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().expect("exactly 4 bytes");
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    fn read_value(&mut self) -> Result<Value> {
        let t = self.read_u8()?;
        match t {
            tag::NULL => Ok(Value::Null),
            tag::BOOL => Ok(Value::Bool(self.read_u8()? != 0)),
            tag::INT => {
                let bytes: [u8; 8] = self.take(8)?.try_into().expect("exactly 8 bytes");
                Ok(Value::Int(i64::from_le_bytes(bytes)))
            }
            tag::FLOAT => {
                let bytes: [u8; 8] = self.take(8)?.try_into().expect("exactly 8 bytes");
                Ok(Value::Float(f64::from_le_bytes(bytes)))
            }
            tag::BYTES => Ok(Value::Bytes(self.read_len_prefixed()?.to_vec())),
            tag::TEXT => {
                let raw = self.read_len_prefixed()?;
                let s = std::str::from_utf8(raw)
                    .map_err(|e| Error::Stream(format!("invalid utf-8 text: {e}")))?;
                Ok(Value::Text(s.to_string()))
            }
            tag::LIST => {
                let n = self.read_u32()?;
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(self.read_value()?);
                }
                Ok(Value::List(items))
            }
            tag::MAP => {
                let n = self.read_u32()?;
                let mut entries = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let k = self.read_value()?;
                    let v = self.read_value()?;
                    entries.push((k, v));
                }
                Ok(Value::Map(entries))
            }
            tag::SET => {
                let n = self.read_u32()?;
                let mut items = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    items.push(self.read_value()?);
                }
                Ok(Value::Set(items))
            }
            tag::CONTEXT => {
                let id = self.read_u32()?;
                let raw = self.read_len_prefixed()?;
                let name = std::str::from_utf8(raw)
                    .map_err(|e| Error::Stream(format!("invalid utf-8 context name: {e}")))?
                    .to_string();
                Ok(Value::Context(ContextRef { id, name }))
            }
            tag::DEAD => Ok(Value::Dead),
            tag::CALL_ERROR => {
                let raw = self.read_len_prefixed()?;
                let message = std::str::from_utf8(raw)
                    .map_err(|e| Error::Stream(format!("invalid utf-8 error message: {e}")))?
                    .to_string();
                let has_tb = self.read_u8()?;
                let traceback = if has_tb != 0 {
                    let tb_raw = self.read_len_prefixed()?;
                    Some(
                        std::str::from_utf8(tb_raw)
                            .map_err(|e| Error::Stream(format!("invalid utf-8 traceback: {e}")))?
                            .to_string(),
                    )
                } else {
                    None
                };
                Ok(Value::CallError(CallError { message, traceback }))
            }
            other => Err(Error::Security(format!("disallowed value tag: 0x{other:02x}"))),
        }
    }
}
