//! The bootstrap state machine (spec §4.6 — C6): bring a peer up starting
//! from nothing more than a shell session.
//!
//! Three transports ([`local`], [`ssh`], [`sudo`]) share one handshake
//! driver. Each builds and spawns a child process whose stdout carries two
//! sentinel lines, `EC0\n` then `EC1\n`; the differences between
//! transports are entirely in how the child is spawned and which
//! substrings in its pre-`EC0` output mean "send the password" or "auth
//! failed" (spec §4.6: "Transport-specific options... live only in the
//! transport, never in Router").
//!
//! ## Reinterpreting the payload for a compiled peer (spec §9, OQ-1/OQ-2)
//!
//! The original sends a *first-stage* loader on the command line, then a
//! freshly-interpreted copy of the whole multiplexer module over stdin, so
//! a remote host with nothing but a working interpreter ends up running
//! code it was never shipped. `relaymux` is a single statically-linked
//! binary; there's no interpreter to feed source into. Every peer in the
//! tree runs the *same* pre-installed binary, re-invoked with `--stage1`;
//! what crosses the stdin channel between `EC0` and `EC1` is reduced to
//! the small [`PeerConfig`] blob the peer needs to configure itself
//! (`context_id`, `parent_ids`, logging level) — still length-prefixed and
//! `flate2`-compressed exactly as spec §4.6 describes the wire shape, just
//! carrying configuration instead of source. `python_path` (spec §6's
//! normative config field name) is kept as the name of the local-transport
//! field but now means "path to the peer's own binary" (OQ-2) — the thing
//! a remote host needs pre-installed is `relaymux` itself, not a Python
//! interpreter.

pub mod local;
pub mod sudo;

pub mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Child;

use crate::error::{Error, Result};

/// Default per-sentinel deadline (spec §4.6, §6: "10 s").
pub const DEFAULT_BOOTSTRAP_DEADLINE: Duration = Duration::from_secs(10);

const SENTINEL_EC0: &str = "EC0";
const SENTINEL_EC1: &str = "EC1";

/// Progress through the handshake (spec §4.6 state diagram). Logged at
/// each transition for diagnosability; not otherwise inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Child process spawned, nothing read yet.
    Start,
    /// Command line (including the first-stage invocation) was written.
    WroteArgv,
    /// `EC0\n` observed.
    SawEc0,
    /// The peer-config preamble was written in response.
    WrotePreamble,
    /// `EC1\n` observed; framed traffic may begin.
    SawEc1,
    /// Handshake complete.
    Ready,
}


/// The configuration blob sent to a peer between `EC0` and `EC1` (spec
/// §4.6 payload item 3, reinterpreted per the module docs above).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// This peer's freshly allocated context id.
    pub context_id: u32,
    /// Ancestor chain, root first, used to validate `SHUTDOWN` senders
    /// and to build `parent_ids` (spec §4.7 step 4, §6 globals).
    pub parent_ids: Vec<u32>,
    /// Forwarded `RUST_LOG`-style directive for the peer's own logger.
    pub log_level: String,
    /// Enables extra diagnostic logging in the peer (spec §4.7 `debug`).
    pub debug: bool,
}

/// One way to bring up a peer: local fork, `ssh`, or `sudo` (spec §4.6).
/// Implementors own every transport-specific detail — identity files,
/// known-hosts policy, stored passwords — none of which the router or
/// broker ever sees.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The peer name this transport will produce (spec §6 peer naming:
    /// `local.<pid>`, `ssh.<hostname>[:port]`, `sudo.<username>`).
    fn peer_name(&self) -> String;

    /// Spawn the child process with stdin/stdout piped and stderr
    /// inherited (diagnostic noise from `ssh`/`sudo` itself is not part
    /// of the framed protocol and shouldn't be captured as if it were).
    async fn spawn(&self) -> Result<Child>;

    /// Inspect one line of output seen before `EC0`, writing a password
    /// to `stdin` if the line looks like a prompt for one. The default
    /// implementation never matches anything; `ssh`/`sudo` transports
    /// override this with their password/failure substring scans (spec
    /// §4.6). `Ok(())` means keep scanning; `Err` aborts the bootstrap.
    async fn scan_preamble_line(&mut self, line: &str, stdin: &mut tokio::process::ChildStdin) -> Result<()> {
        let _ = (line, stdin);
        Ok(())
    }
}

/// Drive one transport through the full handshake, returning the
/// now-`Ready` child with its stdio handles intact for
/// [`crate::external_context`]/[`crate::stream::Stream`] to take over.
pub async fn connect(
    transport: &mut dyn Transport,
    config: &PeerConfig,
    deadline: Duration,
) -> Result<Child> {
    let mut child = transport.spawn().await?;
    log::debug!("bootstrap[{}]: spawned", transport.peer_name());
    let _state = State::WroteArgv;

    let stdout = child.stdout.take().ok_or_else(|| Error::Bootstrap("child has no stdout".into()))?;
    let mut reader = BufReader::new(stdout);
    let mut stdin = child.stdin.take().ok_or_else(|| Error::Bootstrap("child has no stdin".into()))?;

    scan_until_sentinel(transport, &mut reader, &mut stdin, SENTINEL_EC0, deadline).await?;
    log::debug!("bootstrap[{}]: saw EC0", transport.peer_name());
    let _state = State::SawEc0;

    write_preamble(&mut stdin, config).await?;
    log::debug!("bootstrap[{}]: wrote preamble", transport.peer_name());
    let _state = State::WrotePreamble;

    scan_until_sentinel(transport, &mut reader, &mut stdin, SENTINEL_EC1, deadline).await?;
    log::debug!("bootstrap[{}]: saw EC1, ready", transport.peer_name());
    let _state = State::Ready;

    child.stdout = Some(reader.into_inner());
    child.stdin = Some(stdin);
    Ok(child)
}

async fn scan_until_sentinel(
    transport: &mut dyn Transport,
    reader: &mut BufReader<tokio::process::ChildStdout>,
    stdin: &mut tokio::process::ChildStdin,
    sentinel: &str,
    deadline: Duration,
) -> Result<()> {
    tokio::time::timeout(deadline, async {
        loop {
            let mut line = String::new();
            let n = reader
                .read_line(&mut line)
                .await
                .map_err(|e| Error::Bootstrap(format!("reading child stdout: {e}")))?;
            if n == 0 {
                return Err(Error::Bootstrap("child closed stdout before handshake completed".into()));
            }
            let trimmed = line.trim_end_matches('\n');
            if trimmed == sentinel {
                return Ok(());
            }
            transport.scan_preamble_line(trimmed, stdin).await?;
        }
    })
    .await
    .map_err(|_| Error::Timeout(deadline))?
}

async fn write_preamble(stdin: &mut tokio::process::ChildStdin, config: &PeerConfig) -> Result<()> {
    use std::io::Write as _;

    let json = serde_json::to_vec(config).map_err(|e| Error::Bootstrap(format!("encoding peer config: {e}")))?;
    let mut compressed = Vec::new();
    {
        let mut encoder = flate2::write::ZlibEncoder::new(&mut compressed, flate2::Compression::default());
        encoder.write_all(&json).map_err(|e| Error::Bootstrap(format!("compressing peer config: {e}")))?;
        encoder.finish().map_err(|e| Error::Bootstrap(format!("compressing peer config: {e}")))?;
    }

    stdin.write_all(format!("{}\n", compressed.len()).as_bytes()).await?;
    stdin.write_all(&compressed).await?;
    stdin.flush().await?;
    Ok(())
}
