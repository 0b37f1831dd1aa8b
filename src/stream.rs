//! A framed byte channel between two adjacent peers (spec §3, §4.1 — C1).
//!
//! `Stream` owns one read half and one write half (often the two ends of a
//! child process's stdio, or a socket split in two), an incremental
//! [`MessageDecoder`], and a FIFO of already-encoded outbound frames. The
//! [`crate::broker::Broker`] drives each half from its own pump task via
//! [`Stream::split`] — `StreamReader`/`StreamWriter` are what spec §4.1's
//! `on_receive`/`on_transmit` become once driven by tokio rather than a
//! manual readiness loop.

use std::collections::VecDeque;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{Message, MessageDecoder};

/// Bytes read or written per I/O call (spec §4.1).
pub const CHUNK_SIZE: usize = 16 * 1024;

/// One half of a byte-duplex: something we can read frames from.
pub type ReadHalf = Box<dyn AsyncRead + Unpin + Send>;
/// One half of a byte-duplex: something we can write frames to.
pub type WriteHalf = Box<dyn AsyncWrite + Unpin + Send>;

/// A framed peer-to-peer channel (spec §3 Stream, §4.1).
pub struct Stream {
    /// Human-readable name used in log output and diagnostics (e.g.
    /// `"local.4821"`), per spec §6 peer naming and Design Notes §F.2.
    pub name: String,
    reader: ReadHalf,
    writer: WriteHalf,
    decoder: MessageDecoder,
    outbound: VecDeque<Vec<u8>>,
    outbound_offset: usize,
    /// When false, the broker's shutdown drain does not wait on this
    /// stream merely being open (spec §4.2, §4.7 — the parent stream in a
    /// freshly bootstrapped peer is marked non-keep-alive).
    pub keep_alive: bool,
}

/// The receive half of a split [`Stream`].
pub struct StreamReader {
    /// Name of the owning stream, for diagnostics.
    pub name: String,
    reader: ReadHalf,
    decoder: MessageDecoder,
}

/// The transmit half of a split [`Stream`].
pub struct StreamWriter {
    /// Name of the owning stream, for diagnostics.
    pub name: String,
    writer: WriteHalf,
    outbound: VecDeque<Vec<u8>>,
    outbound_offset: usize,
}

impl Stream {
    /// Wrap a read half and write half into a new named stream.
    #[must_use]
    pub fn new(name: impl Into<String>, reader: ReadHalf, writer: WriteHalf) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            decoder: MessageDecoder::new(),
            outbound: VecDeque::new(),
            outbound_offset: 0,
            keep_alive: true,
        }
    }

    /// Split into an independently-driveable reader and writer. This is
    /// what lets the broker run one pump task per direction instead of
    /// serializing reads and writes on a single future.
    #[must_use]
    pub fn split(self) -> (StreamReader, StreamWriter) {
        (
            StreamReader { name: self.name.clone(), reader: self.reader, decoder: self.decoder },
            StreamWriter {
                name: self.name,
                writer: self.writer,
                outbound: self.outbound,
                outbound_offset: self.outbound_offset,
            },
        )
    }

    /// True if there is buffered output waiting to be flushed — the
    /// broker only polls for write-readiness while this holds (spec §4.1:
    /// "When the queue empties, the stream unsubscribes from write
    /// readiness").
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Queue a message for transmission; it is encoded immediately and
    /// appended to the FIFO.
    pub fn enqueue(&mut self, msg: &Message) {
        self.outbound.push_back(msg.encode());
    }

    /// Read up to [`CHUNK_SIZE`] bytes and parse as many complete messages
    /// as are now available. Returns `Ok(None)` on a zero-byte read
    /// (orderly disconnect).
    pub async fn read_messages(&mut self) -> crate::error::Result<Option<Vec<Message>>> {
        let mut buf = [0u8; CHUNK_SIZE];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let messages = self.decoder.feed(&buf[..n])?;
        Ok(Some(messages))
    }

    /// Write at most [`CHUNK_SIZE`] bytes of the head outbound frame. A
    /// short write leaves the remainder at the front of the queue for the
    /// next call (spec §4.1).
    pub async fn write_pending(&mut self) -> io::Result<()> {
        let Some(frame) = self.outbound.front() else { return Ok(()) };
        let remaining = &frame[self.outbound_offset..];
        let take = remaining.len().min(CHUNK_SIZE);
        let n = self.writer.write(&remaining[..take]).await?;
        self.outbound_offset += n;
        if self.outbound_offset >= frame.len() {
            self.outbound.pop_front();
            self.outbound_offset = 0;
        }
        Ok(())
    }

    /// Flush the underlying writer (used once the outbound queue drains,
    /// and on orderly shutdown).
    pub async fn flush(&mut self) -> io::Result<()> {
        self.writer.flush().await
    }
}

impl StreamReader {
    /// Read up to [`CHUNK_SIZE`] bytes and parse as many complete messages
    /// as are now available. `Ok(None)` signals orderly disconnect.
    pub async fn read_messages(&mut self) -> crate::error::Result<Option<Vec<Message>>> {
        let mut buf = [0u8; CHUNK_SIZE];
        let n = self.reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(self.decoder.feed(&buf[..n])?))
    }
}

impl StreamWriter {
    /// Queue a message for transmission.
    pub fn enqueue(&mut self, msg: &Message) {
        self.outbound.push_back(msg.encode());
    }

    /// True if frames remain queued.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Drain the outbound queue, one chunk at a time, until empty.
    pub async fn drain(&mut self) -> io::Result<()> {
        while self.has_pending_writes() {
            self.write_chunk().await?;
        }
        self.writer.flush().await
    }

    async fn write_chunk(&mut self) -> io::Result<()> {
        let Some(frame) = self.outbound.front() else { return Ok(()) };
        let remaining = &frame[self.outbound_offset..];
        let take = remaining.len().min(CHUNK_SIZE);
        let n = self.writer.write(&remaining[..take]).await?;
        self.outbound_offset += n;
        if self.outbound_offset >= frame.len() {
            self.outbound.pop_front();
            self.outbound_offset = 0;
        }
        Ok(())
    }

    /// Send a pre-shutdown control message and flush it immediately —
    /// used by `on_shutdown` (spec §4.2) to push a final `SHUTDOWN`
    /// message ahead of tearing the stream down.
    pub async fn send_now(&mut self, msg: &Message) -> io::Result<()> {
        self.enqueue(msg);
        self.drain().await
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("pending_frames", &self.outbound.len())
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn split(buf: tokio::io::DuplexStream) -> (ReadHalf, WriteHalf) {
        let (r, w) = tokio::io::split(buf);
        (Box::new(r), Box::new(w))
    }

    #[tokio::test]
    async fn round_trips_one_message() {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        let mut left = Stream::new("left", ar, aw);
        let mut right = Stream::new("right", br, bw);

        let msg = Message::new(7, 1000, b"hello".to_vec());
        left.enqueue(&msg);
        while left.has_pending_writes() {
            left.write_pending().await.unwrap();
        }
        left.flush().await.unwrap();

        let received = loop {
            if let Some(msgs) = right.read_messages().await.unwrap() {
                if !msgs.is_empty() {
                    break msgs;
                }
            }
        };
        assert_eq!(received, vec![msg]);
    }

    #[tokio::test]
    async fn zero_byte_read_signals_disconnect() {
        let (a, b) = duplex(64);
        let (ar, aw) = split(a);
        drop(b);
        let mut s = Stream::new("s", ar, aw);
        let result = s.read_messages().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn split_halves_round_trip_independently() {
        let (a, b) = duplex(8); // tiny buffer forces short writes
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        let left = Stream::new("left", ar, aw);
        let right = Stream::new("right", br, bw);
        let (_left_reader, mut left_writer) = left.split();
        let (mut right_reader, _right_writer) = right.split();

        let msg = Message::new(1, 1000, vec![0xAB; 100]);
        left_writer.enqueue(&msg);

        let write_task = tokio::spawn(async move { left_writer.drain().await });

        let mut received = Vec::new();
        while received.is_empty() {
            if let Some(msgs) = right_reader.read_messages().await.unwrap() {
                received.extend(msgs);
            }
        }
        write_task.await.unwrap().unwrap();
        assert_eq!(received, vec![msg]);
    }
}
