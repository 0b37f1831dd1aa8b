//! Message dispatch and the routing table (spec §4.3 — C3).
//!
//! `Router` owns two tables behind a single `std::sync::Mutex`: the
//! context-id → stream-id route table, and the handle → callback handler
//! table. Spec's narrative describes these as broker-thread-owned state
//! mutated only via `defer`; here they're guarded by an ordinary mutex
//! instead (see [`crate::broker`] module docs for why that's an explicit,
//! documented substitution rather than an oversight — Rust's aliasing
//! rules make the original's thread-confinement discipline unnecessary to
//! get the same "no data race" guarantee).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::BrokerHandle;
use crate::message::{handle, Message, NO_REPLY};

/// What a registered handler receives.
#[derive(Debug, Clone)]
pub enum Event {
    /// An inbound message addressed to this handler's handle.
    Message(Message),
    /// The owning context (or the whole router, for global handlers)
    /// disconnected; this fires at most once and the handler is then
    /// removed regardless of its `persist` flag (spec §4.3, §4.4 P3).
    Dead,
}

/// A registered handler callback.
pub type HandlerFn = Arc<dyn Fn(Event) + Send + Sync>;

struct HandlerEntry {
    callback: HandlerFn,
    persist: bool,
    /// If set, this handler is torn down (fired with `Event::Dead`) when
    /// this context id's route disappears — e.g. a `Receiver`'s handler
    /// tied to the context it expects replies from.
    owner_context_id: Option<u32>,
}

#[derive(Default)]
struct Tables {
    /// `context_id -> stream_id`: which stream to forward a message
    /// towards if its destination isn't us.
    routes: HashMap<u32, u32>,
    handlers: HashMap<u32, HandlerEntry>,
}

/// Routes messages between local handlers and adjacent streams (spec §3
/// Router, §4.3).
pub struct Router {
    tables: Mutex<Tables>,
    broker: BrokerHandle,
    local_id: u32,
    /// Stream towards the parent/root, used as the forwarding target for
    /// any destination with no more specific route (spec §4.3 "a message
    /// with unknown destination is forwarded to the parent stream").
    parent_stream: Mutex<Option<u32>>,
    next_handle: AtomicU32,
}

impl Router {
    /// Construct a router for the local context `local_id`, driven by
    /// `broker`.
    #[must_use]
    pub fn new(local_id: u32, broker: BrokerHandle) -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(Tables::default()),
            broker,
            local_id,
            parent_stream: Mutex::new(None),
            next_handle: AtomicU32::new(handle::FIRST_USER_HANDLE),
        })
    }

    /// This router's own context id.
    #[must_use]
    pub fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Record which stream carries traffic towards the parent/root, used
    /// as the last-resort forwarding target (spec §4.3, §4.7).
    pub fn set_parent_stream(&self, stream_id: u32) {
        *self.parent_stream.lock().expect("poisoned") = Some(stream_id);
    }

    /// Register a handler at a freshly allocated handle (spec §3
    /// `FIRST_USER_HANDLE` onward).
    pub fn add_handler(&self, owner_context_id: Option<u32>, persist: bool, callback: HandlerFn) -> u32 {
        let h = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.add_handler_at(h, owner_context_id, persist, callback);
        h
    }

    /// Register a handler at a specific, usually reserved, handle (spec
    /// §4.3's `GET_MODULE`/`CALL_FUNCTION`/etc.).
    pub fn add_handler_at(&self, h: u32, owner_context_id: Option<u32>, persist: bool, callback: HandlerFn) {
        self.tables
            .lock()
            .expect("poisoned")
            .handlers
            .insert(h, HandlerEntry { callback, persist, owner_context_id });
    }

    /// Remove a handler without firing it (e.g. `Sender::close` after the
    /// peer acknowledged).
    pub fn remove_handler(&self, h: u32) {
        self.tables.lock().expect("poisoned").handlers.remove(&h);
    }

    /// Install a static route: messages addressed to `target_id` go out
    /// via `via_stream` (spec §4.3 `add_route`).
    pub fn add_route(&self, target_id: u32, via_stream: u32) {
        self.tables.lock().expect("poisoned").routes.insert(target_id, via_stream);
    }

    /// Announce a newly reachable context to whatever lies beyond our own
    /// parent stream, so multi-hop ancestors learn the forwarding path
    /// (spec §4.3 `propagate_route`, §4.7 step 6, §6 `ADD_ROUTE` wire
    /// format). A no-op at the root, where there is no further ancestor to
    /// inform. By convention the master is always context id 0 — every
    /// `ADD_ROUTE` is addressed there, so plain `route()` forwarding walks
    /// it upward one hop at a time with no extra bookkeeping.
    pub fn propagate_route(&self, target_id: u32, via_id: u32) {
        let Some(parent) = *self.parent_stream.lock().expect("poisoned") else { return };
        let msg = Message::new(0, handle::ADD_ROUTE, encode_add_route(target_id, via_id));
        self.broker.send(parent, msg);
    }

    /// Route a message: dispatch locally if addressed to us, otherwise
    /// forward towards the best known next hop (spec §4.3). Thread-safe —
    /// callable from any thread, including from inside another handler.
    pub fn route(&self, msg: Message) {
        if msg.dst_id == self.local_id {
            self.dispatch_local(msg);
            return;
        }

        let target_stream = {
            let tables = self.tables.lock().expect("poisoned");
            tables.routes.get(&msg.dst_id).copied()
        };
        let target_stream = target_stream.or_else(|| *self.parent_stream.lock().expect("poisoned"));

        match target_stream {
            Some(stream_id) => {
                if !self.broker.send(stream_id, msg) {
                    log::warn!("route: stream {stream_id} gone, dropping frame for context {}", msg.dst_id);
                }
            }
            None => {
                log::warn!("route: no route to context {}, dropping frame", msg.dst_id);
            }
        }
    }

    /// Wired as the broker's per-stream inbound dispatch callback.
    /// Performs source verification ahead of normal routing: a claimed
    /// `src_id` whose registered route disagrees with the stream the
    /// frame actually arrived on is rejected outright, tightening the
    /// original's log-only policy into log-and-drop (spec §7 security
    /// hardening).
    pub fn handle_inbound(&self, stream_id: u32, msg: Message) {
        {
            let mut tables = self.tables.lock().expect("poisoned");
            match tables.routes.get(&msg.src_id) {
                Some(&registered) if registered != stream_id => {
                    log::warn!(
                        "dropping frame claiming src={} via stream {stream_id}, expected stream {registered}",
                        msg.src_id
                    );
                    return;
                }
                Some(_) => {}
                None if msg.src_id != 0 => {
                    let parent = *self.parent_stream.lock().expect("poisoned");
                    if parent == Some(stream_id) {
                        tables.routes.insert(msg.src_id, stream_id);
                    } else {
                        log::warn!(
                            "dropping frame claiming unknown src={} via non-parent stream {stream_id}",
                            msg.src_id
                        );
                        return;
                    }
                }
                None => {}
            }
        }

        // ADD_ROUTE carries a side effect at every hop it passes through,
        // independent of whether this hop is its final destination: each
        // ancestor learns "target_id is reachable via the stream this
        // announcement just arrived on" before the message continues its
        // walk towards the master (spec §4.3, §4.10).
        if msg.handle == handle::ADD_ROUTE {
            if let Some((target_id, _via_id)) = decode_add_route(&msg.payload) {
                self.add_route(target_id, stream_id);
            } else {
                log::warn!("malformed ADD_ROUTE payload from stream {stream_id}");
            }
        }

        self.route(msg);
    }

    /// Wired as the broker's per-stream disconnect callback (spec §4.3
    /// route-table cleanup on disconnect, Open Question resolved: every
    /// context whose route pointed at the dead stream is dropped and its
    /// owned handlers fire once with `Event::Dead`).
    pub fn handle_disconnect(&self, stream_id: u32) {
        let (dead_contexts, dead_handles) = {
            let mut tables = self.tables.lock().expect("poisoned");
            let dead_contexts: Vec<u32> = tables
                .routes
                .iter()
                .filter(|(_, &s)| s == stream_id)
                .map(|(&ctx, _)| ctx)
                .collect();
            for ctx in &dead_contexts {
                tables.routes.remove(ctx);
            }
            let dead_handles: Vec<(u32, HandlerFn)> = tables
                .handlers
                .iter()
                .filter(|(_, e)| e.owner_context_id.is_some_and(|c| dead_contexts.contains(&c)))
                .map(|(&h, e)| (h, Arc::clone(&e.callback)))
                .collect();
            for (h, _) in &dead_handles {
                tables.handlers.remove(h);
            }
            (dead_contexts, dead_handles)
        };
        for (_, callback) in dead_handles {
            callback(Event::Dead);
        }
        if *self.parent_stream.lock().expect("poisoned") == Some(stream_id) {
            log::warn!("parent stream {stream_id} disconnected");
        }
        let _ = dead_contexts;
    }

    fn dispatch_local(&self, msg: Message) {
        let handler = {
            let mut tables = self.tables.lock().expect("poisoned");
            match tables.handlers.get(&msg.handle) {
                Some(entry) => {
                    let cb = Arc::clone(&entry.callback);
                    if !entry.persist {
                        tables.handlers.remove(&msg.handle);
                    }
                    Some(cb)
                }
                None => None,
            }
        };
        match handler {
            Some(cb) => cb(Event::Message(msg)),
            None => log::warn!("no handler for handle {} (dst={})", msg.handle, msg.dst_id),
        }
    }

    /// Build the dispatch/disconnect closures to hand to
    /// [`crate::broker::BrokerHandle::register_stream`].
    #[must_use]
    pub fn callbacks(self: &Arc<Self>) -> (crate::broker::DispatchFn, crate::broker::DisconnectFn) {
        let on_message = {
            let router = Arc::clone(self);
            Arc::new(move |stream_id: u32, msg: Message| router.handle_inbound(stream_id, msg))
                as crate::broker::DispatchFn
        };
        let on_disconnect = {
            let router = Arc::clone(self);
            Arc::new(move |stream_id: u32| router.handle_disconnect(stream_id)) as crate::broker::DisconnectFn
        };
        (on_message, on_disconnect)
    }

    /// Send `SHUTDOWN` to every context we have a direct route for — used
    /// as the broker shutdown's `before_drain` hook (spec §4.2, §4.3).
    pub fn broadcast_shutdown(&self) {
        let targets: Vec<(u32, u32)> =
            self.tables.lock().expect("poisoned").routes.iter().map(|(&c, &s)| (c, s)).collect();
        for (ctx, stream) in targets {
            self.broker.send(stream, Message::new(ctx, handle::SHUTDOWN, Vec::new()));
        }
    }
}

/// `reply_to == NO_REPLY` means the sender doesn't expect an answer.
#[must_use]
pub fn is_reply_owed(msg: &Message) -> bool {
    msg.reply_to != NO_REPLY
}

/// `ADD_ROUTE`'s normative wire payload: decimal ASCII `"<target_id>\0<via_id>"`
/// (spec §6), not a [`crate::value::Value`] — this control message predates
/// (and sits alongside) the general argument-serialization path.
fn encode_add_route(target_id: u32, via_id: u32) -> Vec<u8> {
    let mut out = target_id.to_string().into_bytes();
    out.push(0);
    out.extend_from_slice(via_id.to_string().as_bytes());
    out
}

fn decode_add_route(payload: &[u8]) -> Option<(u32, u32)> {
    let text = std::str::from_utf8(payload).ok()?;
    let (a, b) = text.split_once('\0')?;
    Some((a.parse().ok()?, b.parse().ok()?))
}

#[cfg(test)]
mod add_route_tests {
    use super::*;

    #[test]
    fn round_trips() {
        let encoded = encode_add_route(42, 7);
        assert_eq!(encoded, b"42\07");
        assert_eq!(decode_add_route(&encoded), Some((42, 7)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::stream::Stream;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{duplex, split};

    fn make_stream(name: &str) -> (Stream, tokio::io::DuplexStream) {
        let (a, b) = duplex(8192);
        let (r, w) = split(a);
        (Stream::new(name, Box::new(r), Box::new(w)), b)
    }

    #[tokio::test]
    async fn dispatches_locally_addressed_messages() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let h = router.add_handler(
            None,
            true,
            Arc::new(move |ev| {
                if let Event::Message(_) = ev {
                    seen2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        router.route(Message::new(0, h, b"hi".to_vec()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn forwards_to_routed_stream() {
        let broker = Broker::spawn();
        let bh = broker.handle();
        let router = Router::new(0, bh.clone());
        let (stream, mut other_side) = make_stream("child");
        let (on_message, on_disconnect) = router.callbacks();
        let stream_id = bh.register_stream(stream, true, on_message, on_disconnect);
        router.add_route(42, stream_id);

        router.route(Message::new(42, 1000, b"payload".to_vec()));

        use tokio::io::AsyncReadExt;
        let expected = Message::new(42, 1000, b"payload".to_vec()).encode();
        let mut buf = vec![0u8; expected.len()];
        other_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, expected);
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn rejects_spoofed_source() {
        let broker = Broker::spawn();
        let bh = broker.handle();
        let router = Router::new(0, bh.clone());
        let (stream_a, _a_other) = make_stream("a");
        let (stream_b, _b_other) = make_stream("b");
        let (on_message, on_disconnect) = router.callbacks();
        let id_a = bh.register_stream(stream_a, true, Arc::clone(&on_message), Arc::clone(&on_disconnect));
        let id_b = bh.register_stream(stream_b, true, on_message, on_disconnect);
        router.add_route(7, id_a);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let h = router.add_handler(
            None,
            true,
            Arc::new(move |_| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Claims src_id=7, but arrives on stream b, not the registered
        // route (stream a). Must be dropped.
        router.handle_inbound(id_b, Message { dst_id: 0, src_id: 7, handle: h, reply_to: 0, payload: vec![] });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn rejects_unknown_source_claimed_from_non_parent_stream() {
        let broker = Broker::spawn();
        let bh = broker.handle();
        let router = Router::new(0, bh.clone());
        let (parent_stream, _parent_other) = make_stream("parent");
        let (child_stream, _child_other) = make_stream("child");
        let (on_message, on_disconnect) = router.callbacks();
        let parent_id = bh.register_stream(parent_stream, true, Arc::clone(&on_message), Arc::clone(&on_disconnect));
        let child_id = bh.register_stream(child_stream, true, on_message, on_disconnect);
        router.set_parent_stream(parent_id);

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let h = router.add_handler(
            None,
            true,
            Arc::new(move |_| {
                seen2.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // src_id=99 has never been seen before and arrives on a downstream
        // child stream, not the parent. Must not install a route for it.
        router.handle_inbound(child_id, Message { dst_id: 0, src_id: 99, handle: h, reply_to: 0, payload: vec![] });
        assert_eq!(seen.load(Ordering::SeqCst), 0);
        assert!(router.tables.lock().expect("poisoned").routes.get(&99).is_none());
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn disconnect_fires_dead_for_owned_handlers_and_drops_route() {
        let broker = Broker::spawn();
        let bh = broker.handle();
        let router = Router::new(0, bh.clone());
        let (stream, other_side) = make_stream("child");
        let (on_message, on_disconnect) = router.callbacks();
        let stream_id = bh.register_stream(stream, true, on_message, on_disconnect);
        router.add_route(99, stream_id);

        let got_dead = Arc::new(AtomicUsize::new(0));
        let got_dead2 = Arc::clone(&got_dead);
        router.add_handler(
            Some(99),
            true,
            Arc::new(move |ev| {
                if matches!(ev, Event::Dead) {
                    got_dead2.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        drop(other_side);
        for _ in 0..100 {
            if got_dead.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(got_dead.load(Ordering::SeqCst), 1);
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }
}
