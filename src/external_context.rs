//! Peer-side bootstrap entry point (spec §4.7 — C7): what a freshly
//! spawned peer runs as its `main()`.
//!
//! The original executes the whole multiplexer module fresh off stdin and
//! dispatches to `ExternalContext.main(...)`. `relaymux` peers are one
//! pre-installed binary re-invoked with `--stage1` (see the `bootstrap`
//! module docs, spec §9 OQ-1/OQ-2); [`run`] is the Rust equivalent of that
//! `main()`, taking the [`crate::bootstrap::PeerConfig`] read from stdin
//! during the handshake instead of interpreting delivered source.
//!
//! ## Steps, matching spec §4.7 1-6
//!
//! 1. Install [`crate::broker::Broker`] and [`crate::router::Router`],
//!    register a `SHUTDOWN` handler that only accepts the immediate
//!    parent as sender.
//! 2. Preserve the original fd 0 (stdin) as fd 100 and the original fd 1
//!    (stdout) as fd 101 — see [`prepare_peer_fds`] — then build the
//!    `"parent"` `Stream` on those two descriptors, non-keep-alive.
//! 3. Wire up a [`crate::module::ModuleForwarder`] against the parent so
//!    deeper peers can chain `GET_MODULE` through this one, and a
//!    [`crate::module::ModuleLoader`] sharing the same `Importer` so this
//!    peer can evaluate modules fetched on its own behalf.
//! 4. `is_master=false`/`context_id`/`parent_ids` come straight from the
//!    `PeerConfig` the bootstrap handshake delivered.
//! 5. Redirect the *real* fd 1/fd 2 through socket pairs into
//!    [`crate::log_forward::IoLogger`] streams, and fd 0 to `/dev/null` —
//!    see [`capture_stdio`]. This happens *after* step 2 has already
//!    moved the framed stream off fds 0/1, so repurposing 1/2 here can't
//!    corrupt the framed protocol.
//! 6. Enter the dispatch loop on `CALL_FUNCTION` (see [`dispatch_loop`]).

use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::Arc;

use crate::bootstrap::PeerConfig;
use crate::broker::Broker;
use crate::context::{Context, Receiver};
use crate::error::Result;
use crate::log_forward::IoLogger;
use crate::message::{handle, Message};
use crate::module::{registry, ModuleForwarder, ModuleLoader};
use crate::router::Router;
use crate::stream::Stream;
use crate::value::{CallError, Value};

/// Run the peer side of the protocol forever (until `SHUTDOWN` or the
/// parent stream disconnects). Called from `main.rs` when invoked with
/// `--stage1`.
pub async fn run(config: PeerConfig) -> Result<()> {
    let parent_id = *config.parent_ids.last().unwrap_or(&0);

    let broker = Broker::spawn();
    let router = Router::new(config.context_id, broker.handle());

    register_shutdown_handler(&router, parent_id);

    let (parent_read, parent_write) = prepare_peer_fds()?;
    install_parent_stream(&broker, &router, parent_read, parent_write)?;

    let master = Context::new(Arc::clone(&router), 0, "master");
    let importer = Arc::new(crate::module::Importer::new(master.clone()));
    let forwarder = ModuleForwarder::new(Arc::clone(&router), Arc::clone(&importer));
    let forwarder_task = tokio::spawn(async move { forwarder.serve().await });
    let loader = ModuleLoader::new(importer);

    let (stdout_read, stderr_read) = capture_stdio()?;
    spawn_io_logger_tasks(stdout_read, stderr_read, master.clone());

    dispatch_loop(&router, &loader).await;

    forwarder_task.abort();
    Ok(())
}

fn register_shutdown_handler(router: &Arc<Router>, parent_id: u32) {
    let router_for_handler = Arc::clone(router);
    router.add_handler_at(
        handle::SHUTDOWN,
        None,
        true,
        Arc::new(move |ev| {
            if let crate::router::Event::Message(msg) = ev {
                if msg.src_id != parent_id {
                    log::warn!("SHUTDOWN from non-parent {} (expected {parent_id}), ignoring", msg.src_id);
                    return;
                }
                log::info!("shutdown requested by parent {parent_id}");
                router_for_handler.broadcast_shutdown();
                std::process::exit(0);
            }
        }),
    );
}

/// Preserve the original stdin/stdout before they're repurposed for
/// captured `print`/`eprintln` output: fd 0 becomes fd 100 (parent
/// read-side, spec §6), and fd 1 is duplicated onto fd 101. Spec §6 names
/// fd 101 the "core-source delivery pipe, closed after import" — since
/// this peer has no core source to receive (OQ-1), that descriptor is
/// repurposed here as the framed stream's write side instead.
fn prepare_peer_fds() -> io::Result<(RawFd, RawFd)> {
    // SAFETY: 0 and 100 are valid fd numbers for this process; dup2 either
    // succeeds or returns an error we propagate, never invoking UB.
    let rc = unsafe { libc::dup2(0, 100) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd 1 is this process's real stdout; dup() duplicates it
    // without touching its original slot.
    let parent_write = unsafe { libc::dup(1) };
    if parent_write < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((100, parent_write))
}

/// Redirect fd 1/fd 2 through a pair of `AF_UNIX` socket pairs so any
/// accidental `print`/`eprintln!` in delivered code is captured rather than
/// corrupting the framed stream now living on fd 100/101, and point fd 0
/// at `/dev/null` (spec §4.7 step 5, §6 fd table).
fn capture_stdio() -> io::Result<(RawFd, RawFd)> {
    let stdout_read = redirect_through_socketpair(1)?;
    let stderr_read = redirect_through_socketpair(2)?;

    let devnull = std::fs::File::open("/dev/null")?;
    // SAFETY: devnull.as_raw_fd() is a valid, open fd owned by this
    // process; dup2 onto 0 either succeeds or we propagate the error.
    let rc = unsafe { libc::dup2(devnull.as_raw_fd(), 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((stdout_read, stderr_read))
}

fn redirect_through_socketpair(target_fd: RawFd) -> io::Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` is a valid 2-element buffer for socketpair to fill.
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    let [read_end, write_end] = fds;
    // SAFETY: write_end is a just-created, valid fd; dup2 onto target_fd
    // either succeeds or we propagate the error, and the duplicate source
    // is closed right after regardless.
    let rc = unsafe { libc::dup2(write_end, target_fd) };
    // SAFETY: write_end was duplicated (or the attempt failed) and is no
    // longer needed under its original number either way.
    unsafe { libc::close(write_end) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(read_end)
}

fn install_parent_stream(broker: &crate::broker::BrokerHandle, router: &Arc<Router>, read_fd: RawFd, write_fd: RawFd) -> Result<()> {
    // SAFETY: read_fd/write_fd were produced by `prepare_peer_fds` and are
    // open, valid descriptors owned by this process.
    let reader = unsafe { std::fs::File::from_raw_fd(read_fd) };
    // SAFETY: see above.
    let writer = unsafe { std::fs::File::from_raw_fd(write_fd) };
    let stream = Stream::new(
        "parent",
        Box::new(tokio::fs::File::from_std(reader)),
        Box::new(tokio::fs::File::from_std(writer)),
    );

    let router_for_cb = Arc::clone(router);
    let (on_message, on_disconnect) = router_for_cb.callbacks();
    let stream_id = broker.register_stream(stream, false, on_message, on_disconnect);
    router.set_parent_stream(stream_id);
    Ok(())
}

fn spawn_io_logger_tasks(stdout_read: RawFd, stderr_read: RawFd, parent: Context) {
    // SAFETY: stdout_read/stderr_read were produced by `capture_stdio` and
    // are open, valid descriptors owned by this process.
    let stdout_file = unsafe { std::fs::File::from_raw_fd(stdout_read) };
    // SAFETY: see above.
    let stderr_file = unsafe { std::fs::File::from_raw_fd(stderr_read) };

    let stdout_parent = parent.clone();
    tokio::spawn(async move {
        IoLogger::new("stdout").run(tokio::fs::File::from_std(stdout_file), &stdout_parent).await;
    });
    tokio::spawn(async move {
        IoLogger::new("stderr").run(tokio::fs::File::from_std(stderr_file), &parent).await;
    });
}

/// Step 6: iterate `CALL_FUNCTION` requests forever, calling into the
/// compiled-in registry and replying with either the result or a
/// `CallError` (spec §4.7 step 6).
async fn dispatch_loop(router: &Arc<Router>, loader: &ModuleLoader) {
    let receiver = Receiver::at(router, Some(handle::CALL_FUNCTION), None, true);
    loop {
        let msg = match receiver.get(None).await {
            Ok(msg) => msg,
            Err(_) => return,
        };
        let reply = match msg.decode_value().ok().and_then(decode_call_envelope) {
            Some((module, class, func, args, kwargs)) => execute(loader, &module, class.as_deref(), &func, args, kwargs).await,
            None => Value::CallError(CallError::new("malformed CALL_FUNCTION payload")),
        };
        router.route(Message::with_value(msg.src_id, msg.reply_to, &reply));
    }
}

/// Native built-ins (`os`, `builtins`) resolve straight out of the
/// compiled-in registry; anything else is a served module, fetched and
/// evaluated through `loader` on first use (spec §8 S1/S2).
async fn execute(
    loader: &ModuleLoader,
    module: &str,
    class: Option<&str>,
    func: &str,
    args: Vec<Value>,
    kwargs: Vec<(Value, Value)>,
) -> Value {
    if let Some(f) = registry::lookup_function(module, class, func) {
        return match f(args, kwargs) {
            Ok(v) => v,
            Err(e) => Value::CallError(e),
        };
    }
    match loader.call(module, class, func, args, kwargs).await {
        Ok(v) => v,
        Err(e) => Value::CallError(e),
    }
}

fn decode_call_envelope(value: Value) -> Option<(String, Option<String>, String, Vec<Value>, Vec<(Value, Value)>)> {
    let Value::List(items) = value else { return None };
    let [module, class, func, args, kwargs]: [Value; 5] = items.try_into().ok()?;
    let Value::Text(module) = module else { return None };
    let class = match class {
        Value::Null => None,
        Value::Text(c) => Some(c),
        _ => return None,
    };
    let Value::Text(func) = func else { return None };
    let Value::List(args) = args else { return None };
    let Value::Map(kwargs) = kwargs else { return None };
    Some((module, class, func, args, kwargs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_call_envelope_round_trip() {
        let envelope = Value::List(vec![
            Value::text("os"),
            Value::Null,
            Value::text("getuid"),
            Value::List(vec![]),
            Value::Map(vec![]),
        ]);
        let (module, class, func, args, kwargs) = decode_call_envelope(envelope).unwrap();
        assert_eq!(module, "os");
        assert_eq!(class, None);
        assert_eq!(func, "getuid");
        assert!(args.is_empty());
        assert!(kwargs.is_empty());
    }

    async fn loader_with_served_master() -> (ModuleLoader, crate::broker::Broker) {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let responder = crate::module::ModuleResponder::new(Arc::clone(&router));
        tokio::spawn(async move { responder.serve().await });
        let master = Context::new(Arc::clone(&router), 0, "master");
        let importer = Arc::new(crate::module::Importer::new(master));
        (ModuleLoader::new(importer), broker)
    }

    #[tokio::test]
    async fn execute_reports_call_error_for_unknown_served_function() {
        let (loader, broker) = loader_with_served_master().await;
        let reply = execute(&loader, "pow", None, "not_a_real_function", vec![], vec![]).await;
        assert!(matches!(reply, Value::CallError(_)));
        broker.shutdown(std::time::Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn execute_calls_native_registered_function() {
        let (loader, broker) = loader_with_served_master().await;
        let reply = execute(&loader, "os", None, "getpid", vec![], vec![]).await;
        assert!(matches!(reply, Value::Int(_)));
        broker.shutdown(std::time::Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn execute_calls_served_module_function() {
        let (loader, broker) = loader_with_served_master().await;
        let reply = execute(&loader, "pow", None, "pow", vec![Value::Int(2), Value::Int(8)], vec![]).await;
        assert_eq!(reply, Value::Int(256));
        broker.shutdown(std::time::Duration::from_millis(100), |_| {}).await;
    }
}
