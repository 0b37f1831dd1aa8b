//! `relaymux` CLI entry point.
//!
//! Two personalities live in one binary, selected by the hidden
//! `--stage1` flag (spec §4.6/§4.7, and the `bootstrap`/`external_context`
//! module docs for why one binary plays both roles): as a master, it
//! exposes `relaymux connect {local,ssh,sudo}` to bootstrap one peer and
//! exercise it; as a bootstrapped peer, it runs the `EC0`/`EC1` handshake
//! on its own stdio and hands off into [`relaymux::external_context::run`].

use std::io::{self, BufRead, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use relaymux::bootstrap::{self, local::LocalTransport, ssh::SshTransport, sudo::SudoTransport, PeerConfig, Transport};
use relaymux::broker::Broker;
use relaymux::config::Config;
use relaymux::context::Context as PeerContext;
use relaymux::router::Router;

/// Global allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser)]
#[command(name = "relaymux")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Connection multiplexer for a lazily-bootstrapped remote peer fabric")]
struct Cli {
    /// Increase log verbosity (-v, -vv); ignored with `--stage1`, which
    /// always logs at its own configured level.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Quiet down to warnings and errors only.
    #[arg(short, long, global = true)]
    quiet: bool,
    /// Internal: run as a bootstrapped peer instead of a master. Never
    /// passed by a human; the bootstrap transports append it themselves.
    #[arg(long, hide = true)]
    stage1: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap one peer over the given transport and call a built-in
    /// demo function (`os.getuid`) in it, printing the result.
    Connect {
        #[command(subcommand)]
        transport: ConnectTransport,
    },
}

#[derive(Subcommand)]
enum ConnectTransport {
    /// Fork a peer on this machine.
    Local {
        /// Path to the `relaymux` binary to run as the peer.
        #[arg(long)]
        python_path: std::path::PathBuf,
    },
    /// Bootstrap a peer over `ssh`.
    Ssh {
        hostname: String,
        /// Path to the `relaymux` binary on the remote host.
        #[arg(long)]
        python_path: std::path::PathBuf,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        identity_file: Option<std::path::PathBuf>,
        #[arg(long)]
        password: Option<String>,
        /// Pass `-o StrictHostKeyChecking=no`.
        #[arg(long)]
        insecure: bool,
    },
    /// Bootstrap a peer via `sudo -u <username>`.
    Sudo {
        username: String,
        /// Path to the `relaymux` binary, run as the target user.
        #[arg(long)]
        python_path: std::path::PathBuf,
        #[arg(long)]
        password: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.stage1 {
        return run_stage1();
    }

    let level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    match cli.command {
        Some(Commands::Connect { transport }) => runtime.block_on(run_connect(transport)),
        None => {
            println!("relaymux {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// The peer side of the `EC0`/`EC1` handshake (spec §4.6): print the
/// sentinels on stdout, read the compressed [`PeerConfig`] preamble from
/// stdin between them, then hand off to [`relaymux::external_context::run`].
/// Runs synchronously on the process's real stdio, strictly before
/// `external_context::run` repurposes fds 0/1/2 — see that module's docs.
fn run_stage1() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "EC0")?;
    out.flush()?;

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut len_line = String::new();
    input.read_line(&mut len_line).context("reading peer config length")?;
    let len: usize = len_line.trim().parse().context("parsing peer config length")?;
    let mut compressed = vec![0u8; len];
    input.read_exact(&mut compressed).context("reading peer config body")?;

    let mut json = Vec::new();
    flate2::read::ZlibDecoder::new(&compressed[..])
        .read_to_end(&mut json)
        .context("decompressing peer config")?;
    let config: PeerConfig = serde_json::from_slice(&json).context("parsing peer config json")?;

    writeln!(out, "EC1")?;
    out.flush()?;
    drop(out);
    drop(input);

    let runtime = tokio::runtime::Runtime::new().context("starting peer tokio runtime")?;
    runtime.block_on(relaymux::external_context::run(config))?;
    Ok(())
}

async fn run_connect(transport: ConnectTransport) -> Result<()> {
    let cfg = Config::load().unwrap_or_default();

    let mut transport: Box<dyn Transport> = match transport {
        ConnectTransport::Local { python_path } => Box::new(LocalTransport::new(python_path)),
        ConnectTransport::Ssh { hostname, python_path, username, port, identity_file, password, insecure } => {
            let mut t = SshTransport::new(hostname, python_path);
            t.username = username;
            t.port = port;
            t.identity_file = identity_file.or_else(|| cfg.identity_file.clone());
            t.password = password;
            t.check_host_keys = !insecure;
            Box::new(t)
        }
        ConnectTransport::Sudo { username, python_path, password } => {
            let mut t = SudoTransport::new(username, python_path);
            t.password = password;
            Box::new(t)
        }
    };

    let peer_name = transport.peer_name();
    let child_id = 1;
    let peer_config =
        PeerConfig { context_id: child_id, parent_ids: vec![0], log_level: cfg.log_level.clone(), debug: false };

    let mut child = bootstrap::connect(transport.as_mut(), &peer_config, cfg.bootstrap_deadline())
        .await
        .with_context(|| format!("bootstrapping {peer_name}"))?;

    let broker = Broker::spawn();
    let router = Router::new(0, broker.handle());

    let child_stdout = child.stdout.take().context("child has no stdout")?;
    let child_stdin = child.stdin.take().context("child has no stdin")?;
    let stream = relaymux::stream::Stream::new(peer_name.clone(), Box::new(child_stdout), Box::new(child_stdin));
    let (on_message, on_disconnect) = router.callbacks();
    let stream_id = broker.handle().register_stream(stream, true, on_message, on_disconnect);
    router.add_route(child_id, stream_id);

    let peer = PeerContext::new(Arc::clone(&router), child_id, peer_name.clone());
    let result = peer.call("os", None, "getuid", vec![], vec![], Some(Duration::from_secs(30))).await;
    match &result {
        Ok(value) => println!("{peer_name}: os.getuid() = {value:?}"),
        Err(e) => eprintln!("{peer_name}: call failed: {e}"),
    }

    peer.shutdown();
    let router_for_shutdown = Arc::clone(&router);
    broker.shutdown(cfg.shutdown_grace(), move |_| router_for_shutdown.broadcast_shutdown()).await;
    let _ = child.kill().await;
    result.map(|_| ()).map_err(Into::into)
}
