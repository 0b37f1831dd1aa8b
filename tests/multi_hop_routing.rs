//! Routes a `CALL_FUNCTION` request across two real streams joined by an
//! in-memory duplex pipe (spec §8 P4/P5/P6, and the S2/S4 "reply finds its
//! way back through an intermediate hop" shape) without forking a second
//! process — this exercises the broker/router/stream layer (C2-C5) on its
//! own, independent of process bootstrap.

use std::sync::Arc;
use std::time::Duration;

use relaymux::broker::Broker;
use relaymux::context::{Context, Receiver};
use relaymux::message::{handle, Message};
use relaymux::module::registry;
use relaymux::router::Router;
use relaymux::stream::Stream;
use relaymux::value::{CallError, Value};

/// Runs a minimal `CALL_FUNCTION` server loop against `router`, exactly
/// the dispatch shape `external_context::dispatch_loop` uses, reimplemented
/// here since that function is private to the peer entry point.
async fn serve_call_function(router: Arc<Router>) {
    let receiver = Receiver::at(&router, Some(handle::CALL_FUNCTION), None, true);
    loop {
        let Ok(msg) = receiver.get(None).await else { return };
        let reply = match msg.decode_value().ok().and_then(decode_envelope) {
            Some((module, class, func, args, kwargs)) => match registry::lookup_function(&module, class.as_deref(), &func) {
                Some(f) => match f(args, kwargs) {
                    Ok(v) => v,
                    Err(e) => Value::CallError(e),
                },
                None => Value::CallError(CallError::new("no such function")),
            },
            None => Value::CallError(CallError::new("malformed call envelope")),
        };
        router.route(Message::with_value(msg.src_id, msg.reply_to, &reply));
    }
}

fn decode_envelope(value: Value) -> Option<(String, Option<String>, String, Vec<Value>, Vec<(Value, Value)>)> {
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

#[tokio::test]
async fn call_function_round_trips_across_a_stream() {
    let master_broker = Broker::spawn();
    let master_router = Router::new(0, master_broker.handle());

    let mid_broker = Broker::spawn();
    let mid_router = Router::new(1, mid_broker.handle());

    let (master_side, mid_side) = tokio::io::duplex(1 << 16);
    let (master_r, master_w) = tokio::io::split(master_side);
    let (mid_r, mid_w) = tokio::io::split(mid_side);

    let master_stream = Stream::new("mid", Box::new(master_r), Box::new(master_w));
    let (on_message, on_disconnect) = master_router.callbacks();
    let stream_id = master_broker.handle().register_stream(master_stream, true, on_message, on_disconnect);
    master_router.add_route(1, stream_id);

    let mid_stream = Stream::new("master", Box::new(mid_r), Box::new(mid_w));
    let (on_message, on_disconnect) = mid_router.callbacks();
    let mid_stream_id = mid_broker.handle().register_stream(mid_stream, true, on_message, on_disconnect);
    mid_router.set_parent_stream(mid_stream_id);

    let server = tokio::spawn(serve_call_function(Arc::clone(&mid_router)));

    let peer = Context::new(Arc::clone(&master_router), 1, "mid");
    let first = peer.call("os", None, "getpid", vec![], vec![], Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(first, Value::Int(i64::from(std::process::id())));

    // Second call over the same stream, exercising FIFO/P5 rather than a
    // fresh handshake.
    let second = peer.call("builtins", None, "echo", vec![Value::Int(42)], vec![], Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(second, Value::Int(42));

    server.abort();
    mid_broker.shutdown(Duration::from_millis(200), |_| {}).await;
    master_broker.shutdown(Duration::from_millis(200), |_| {}).await;
}

#[tokio::test]
async fn unknown_function_surfaces_as_call_error() {
    let master_broker = Broker::spawn();
    let master_router = Router::new(0, master_broker.handle());
    let mid_broker = Broker::spawn();
    let mid_router = Router::new(1, mid_broker.handle());

    let (master_side, mid_side) = tokio::io::duplex(1 << 16);
    let (master_r, master_w) = tokio::io::split(master_side);
    let (mid_r, mid_w) = tokio::io::split(mid_side);

    let master_stream = Stream::new("mid", Box::new(master_r), Box::new(master_w));
    let (on_message, on_disconnect) = master_router.callbacks();
    let stream_id = master_broker.handle().register_stream(master_stream, true, on_message, on_disconnect);
    master_router.add_route(1, stream_id);

    let mid_stream = Stream::new("master", Box::new(mid_r), Box::new(mid_w));
    let (on_message, on_disconnect) = mid_router.callbacks();
    let mid_stream_id = mid_broker.handle().register_stream(mid_stream, true, on_message, on_disconnect);
    mid_router.set_parent_stream(mid_stream_id);

    let server = tokio::spawn(serve_call_function(Arc::clone(&mid_router)));

    let peer = Context::new(Arc::clone(&master_router), 1, "mid");
    let err = peer.call("os", None, "not_a_real_fn", vec![], vec![], Some(Duration::from_secs(5))).await.unwrap_err();
    assert!(matches!(err, relaymux::Error::Call { .. }));

    server.abort();
    mid_broker.shutdown(Duration::from_millis(200), |_| {}).await;
    master_broker.shutdown(Duration::from_millis(200), |_| {}).await;
}
