//! Log & stdio forwarding (spec §4.9 — C9).
//!
//! `FORWARD_LOG` carries `b"<logger>\0<levelno>\0<message>"`, raw bytes
//! rather than a `Value` (spec §6) — the same normative-raw-format class
//! as `ADD_ROUTE`. [`LogForwarder`] binds that handle on the master and
//! re-emits every record through the `log` crate, prefixed with the
//! originating peer's name so records stay attributable once several
//! peers share one master's log output. [`IoLogger`] is the peer-side
//! counterpart: it owns the read half of a socket pair that `stdout`/
//! `stderr` get redirected into, and turns every newline-terminated
//! fragment into a `FORWARD_LOG` message at `log::Level::Info`.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::context::{Context, Receiver};
use crate::message::handle;
use crate::router::Router;

/// Master-side `FORWARD_LOG` sink (spec §4.9 LogForwarder).
pub struct LogForwarder {
    receiver: Receiver,
}

impl LogForwarder {
    #[must_use]
    pub fn new(router: &Arc<Router>) -> Self {
        let receiver = Receiver::at(router, Some(handle::FORWARD_LOG), None, true);
        Self { receiver }
    }

    /// Serve forwarded log records until the receiver is torn down.
    pub async fn serve(&self, peer_name: impl Fn(u32) -> String) {
        loop {
            let Ok(msg) = self.receiver.get(None).await else { return };
            let Some((logger, levelno, message)) = decode_forward_log(&msg.payload) else {
                log::warn!("malformed FORWARD_LOG payload from peer {}", msg.src_id);
                continue;
            };
            let name = peer_name(msg.src_id);
            let level = level_from_levelno(levelno);
            log::log!(level, "[{name}] {logger}: {message}");
        }
    }
}

/// Encode a `(logger, levelno, message)` triple per spec §6.
pub(crate) fn encode_forward_log(logger: &str, levelno: u32, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(logger.len() + message.len() + 16);
    out.extend_from_slice(logger.as_bytes());
    out.push(0);
    out.extend_from_slice(levelno.to_string().as_bytes());
    out.push(0);
    out.extend_from_slice(message.as_bytes());
    out
}

pub(crate) fn decode_forward_log(payload: &[u8]) -> Option<(String, u32, String)> {
    let mut parts = payload.splitn(3, |&b| b == 0);
    let logger = parts.next()?;
    let levelno = parts.next()?;
    let message = parts.next()?;
    let levelno: u32 = std::str::from_utf8(levelno).ok()?.parse().ok()?;
    Some((
        String::from_utf8_lossy(logger).into_owned(),
        levelno,
        String::from_utf8_lossy(message).into_owned(),
    ))
}

fn level_from_levelno(levelno: u32) -> log::Level {
    match levelno {
        0..=10 => log::Level::Debug,
        11..=20 => log::Level::Info,
        21..=30 => log::Level::Warn,
        _ => log::Level::Error,
    }
}

/// Peer-side stdout/stderr capture (spec §4.9 IoLogger): reads
/// newline-terminated fragments from the read half of a socket pair and
/// forwards each as a `FORWARD_LOG` message at INFO level. Partial
/// trailing data (no newline yet) is buffered by the underlying
/// `BufReader` across calls.
pub struct IoLogger {
    logger_name: String,
}

impl IoLogger {
    #[must_use]
    pub fn new(logger_name: impl Into<String>) -> Self {
        Self { logger_name: logger_name.into() }
    }

    /// Drain `source` line by line, forwarding each to `parent` as
    /// `FORWARD_LOG`, until EOF.
    pub async fn run<R: AsyncRead + Unpin>(&self, source: R, parent: &Context) {
        let mut reader = BufReader::new(source).lines();
        loop {
            match reader.next_line().await {
                Ok(Some(line)) if !line.is_empty() => {
                    let payload = encode_forward_log(&self.logger_name, log::Level::Info as u32, &line);
                    parent.send_raw(handle::FORWARD_LOG, payload);
                }
                Ok(Some(_)) => {}
                Ok(None) => return,
                Err(e) => {
                    log::warn!("{}: read error: {e}", self.logger_name);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let payload = encode_forward_log("relaymux.io", 20, "hello world");
        let (logger, levelno, message) = decode_forward_log(&payload).unwrap();
        assert_eq!(logger, "relaymux.io");
        assert_eq!(levelno, 20);
        assert_eq!(message, "hello world");
    }

    #[test]
    fn rejects_payload_missing_separators() {
        assert!(decode_forward_log(b"no separators here").is_none());
    }

    #[tokio::test]
    async fn io_logger_forwards_each_line() {
        use std::time::Duration;

        use crate::broker::Broker;
        use crate::router::Router;

        let broker = Broker::spawn();
        let router = Router::new(1, broker.handle());
        let rx = Receiver::at(&router, Some(handle::FORWARD_LOG), None, true);
        let parent = Context::new(std::sync::Arc::clone(&router), 1, "parent");

        let data = b"first line\nsecond line\n".to_vec();
        let logger = IoLogger::new("peer.stdout");
        logger.run(std::io::Cursor::new(data), &parent).await;

        let first = rx.get(Some(Duration::from_millis(200))).await.unwrap();
        let (_, _, msg1) = decode_forward_log(&first.payload).unwrap();
        assert_eq!(msg1, "first line");
        let second = rx.get(Some(Duration::from_millis(200))).await.unwrap();
        let (_, _, msg2) = decode_forward_log(&second.payload).unwrap();
        assert_eq!(msg2, "second line");

        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }
}
