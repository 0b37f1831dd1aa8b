//! `Sender`/`Receiver`/`Channel`/`Context` — the application-facing RPC
//! surface (spec §3, §4.4 — C4).
//!
//! A `Context` is a handle to a remote peer. `send`/`send_async`/`call`
//! build on the same primitive: allocate a reply handle via the
//! [`crate::router::Router`], hand the peer a message carrying that
//! handle as `reply_to`, and hand the caller back a [`Receiver`] wired to
//! that same handle.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::broker::is_broker_thread;
use crate::error::{Error, Result};
use crate::message::{handle, Message};
use crate::router::{Event, Router};
use crate::value::Value;

/// The transmitting half of a channel: wraps a destination context id and
/// handle (spec §3 Sender, §4.4).
#[derive(Clone)]
pub struct Sender {
    router: Arc<Router>,
    dst_id: u32,
    handle: u32,
}

impl Sender {
    #[must_use]
    fn new(router: Arc<Router>, dst_id: u32, handle: u32) -> Self {
        Self { router, dst_id, handle }
    }

    /// Enqueue `value` for delivery to the paired [`Receiver`].
    pub fn put(&self, value: &Value) {
        self.router.route(Message::with_value(self.dst_id, self.handle, value));
    }

    /// Signal that no further values will be sent (spec §4.4 P3: the
    /// paired `Receiver::get` then yields [`Error::Channel`]).
    pub fn close(&self) {
        self.router.route(Message::with_value(self.dst_id, self.handle, &Value::Dead));
    }
}

struct Inbox {
    queue: VecDeque<Message>,
    closed: bool,
}

/// The receiving half of a channel (spec §3 Receiver, §4.4).
pub struct Receiver {
    router: Arc<Router>,
    handle: u32,
    inbox: Arc<Mutex<Inbox>>,
    notify: Arc<Notify>,
}

impl Receiver {
    /// Allocate a fresh handle on `router` and register it as a receiver.
    /// `owner_context_id`, when set, ties this receiver's lifetime to that
    /// context: if the context's route disconnects, `get` observes
    /// [`Error::Channel`] instead of hanging forever (spec §4.3/§4.4
    /// interaction).
    #[must_use]
    pub fn new(router: &Arc<Router>, owner_context_id: Option<u32>, persist: bool) -> Self {
        Self::at(router, None, owner_context_id, persist)
    }

    /// Like [`Receiver::new`], but registers at a specific reserved
    /// handle (used by e.g. the module responder at `GET_MODULE`).
    #[must_use]
    pub fn at(
        router: &Arc<Router>,
        fixed_handle: Option<u32>,
        owner_context_id: Option<u32>,
        persist: bool,
    ) -> Self {
        let inbox = Arc::new(Mutex::new(Inbox { queue: VecDeque::new(), closed: false }));
        let notify = Arc::new(Notify::new());
        let inbox_cb = Arc::clone(&inbox);
        let notify_cb = Arc::clone(&notify);
        let callback = Arc::new(move |ev: Event| {
            let mut guard = inbox_cb.lock().expect("poisoned");
            match ev {
                Event::Message(msg) => {
                    let is_dead =
                        msg.decode_value().map(|v| matches!(v, Value::Dead)).unwrap_or(false);
                    if is_dead {
                        guard.closed = true;
                    } else {
                        guard.queue.push_back(msg);
                    }
                }
                Event::Dead => guard.closed = true,
            }
            drop(guard);
            notify_cb.notify_waiters();
        });

        let h = match fixed_handle {
            Some(h) => {
                router.add_handler_at(h, owner_context_id, persist, callback);
                h
            }
            None => router.add_handler(owner_context_id, persist, callback),
        };

        Self { router: Arc::clone(router), handle: h, inbox, notify }
    }

    /// This receiver's handle, for building `Sender`s that target it.
    #[must_use]
    pub fn handle(&self) -> u32 {
        self.handle
    }

    /// A wakeup future tied to this receiver's `Notify`, so a
    /// [`crate::select::Select`] can race several receivers at once
    /// without polling any of them.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Pop a message without waiting; `None` if the queue is empty.
    #[must_use]
    pub fn try_get(&self) -> Option<Message> {
        self.inbox.lock().expect("poisoned").queue.pop_front()
    }

    /// True once the paired `Sender` has closed and the queue has
    /// drained.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        let guard = self.inbox.lock().expect("poisoned");
        guard.closed && guard.queue.is_empty()
    }

    /// Wait for the next message, or [`Error::Timeout`]/[`Error::Channel`].
    ///
    /// `timeout: None` waits indefinitely. Spec calls for the original's
    /// ≥500ms poll granularity so a blocked wait stays interrupt-observable;
    /// `tokio::sync::Notify` plus `tokio::time::timeout` gets the same
    /// externally-visible behavior (promptly cancellable, bounded wait)
    /// without an explicit poll loop, so that's what's used here.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Message> {
        loop {
            if let Some(msg) = self.try_get() {
                return Ok(msg);
            }
            if self.inbox.lock().expect("poisoned").closed {
                return Err(Error::Channel);
            }
            let notified = self.notify.notified();
            match timeout {
                Some(d) => tokio::time::timeout(d, notified)
                    .await
                    .map_err(|_| Error::Timeout(d))?,
                None => notified.await,
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.router.remove_handler(self.handle);
    }
}

/// Build a connected `(Sender, Receiver)` pair addressed at `dst_id` on
/// the peer side, registered locally via `router` (spec §4.4 `channel`).
#[must_use]
pub fn channel(router: &Arc<Router>, dst_id: u32, owner_context_id: Option<u32>) -> (Sender, Receiver) {
    let receiver = Receiver::new(router, owner_context_id, true);
    let sender = Sender::new(Arc::clone(router), dst_id, receiver.handle());
    (sender, receiver)
}

/// A handle to a remote peer (spec §3 Context, §4.4).
#[derive(Clone)]
pub struct Context {
    router: Arc<Router>,
    id: u32,
    name: String,
}

impl Context {
    #[must_use]
    pub fn new(router: Arc<Router>, id: u32, name: impl Into<String>) -> Self {
        Self { router, id, name: name.into() }
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fire-and-forget send to a specific handle on this peer.
    pub fn send(&self, handle: u32, value: &Value) {
        self.router.route(Message::with_value(self.id, handle, value));
    }

    /// Send, returning a one-shot [`Receiver`] for the reply (spec §4.4
    /// `send_async`).
    #[must_use]
    pub fn send_async(&self, handle: u32, value: &Value) -> Receiver {
        let receiver = Receiver::new(&self.router, Some(self.id), false);
        let msg = Message {
            dst_id: self.id,
            src_id: self.router.local_id(),
            handle,
            reply_to: receiver.handle(),
            payload: value.to_bytes(),
        };
        self.router.route(msg);
        receiver
    }

    /// `send_async` followed by a blocking wait, translating the closed
    /// channel and remote-exception cases into [`Error`] (spec §4.4
    /// `send_await`).
    pub async fn send_await(&self, handle: u32, value: &Value, timeout: Option<Duration>) -> Result<Value> {
        let receiver = self.send_async(handle, value);
        let msg = receiver.get(timeout).await?;
        resolve_reply(msg.decode_value()?)
    }

    /// Invoke a function in the peer's address space, returning a
    /// `Receiver` for the eventual result (spec §4.4 `call_async`, §6
    /// `CALL_FUNCTION` request: `(module_name, class_name, func_name,
    /// args, kwargs)`). Must not be called from the broker thread:
    /// awaiting its reply there would block the very thread responsible
    /// for delivering it.
    pub fn call_async(
        &self,
        module: &str,
        class: Option<&str>,
        func: &str,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
    ) -> Result<Receiver> {
        if is_broker_thread() {
            return Err(Error::Stream("call_async invoked from the broker thread".into()));
        }
        let envelope = Value::List(vec![
            Value::text(module),
            class.map_or(Value::Null, Value::text),
            Value::text(func),
            Value::List(args),
            Value::Map(kwargs),
        ]);
        Ok(self.send_async(handle::CALL_FUNCTION, &envelope))
    }

    /// `call_async` followed by a blocking wait (spec §4.4 `call`).
    pub async fn call(
        &self,
        module: &str,
        class: Option<&str>,
        func: &str,
        args: Vec<Value>,
        kwargs: Vec<(Value, Value)>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let receiver = self.call_async(module, class, func, args, kwargs)?;
        let msg = receiver.get(timeout).await?;
        resolve_reply(msg.decode_value()?)
    }

    /// Fire-and-forget send of an already-encoded payload, bypassing the
    /// `Value` wire scheme entirely. Spec §6 pins a handful of handles
    /// (`GET_MODULE` request, `FORWARD_LOG`, `ADD_ROUTE`) to raw-bytes
    /// payloads rather than the general tagged-variant encoding.
    pub fn send_raw(&self, handle: u32, payload: Vec<u8>) {
        self.router.route(Message::new(self.id, handle, payload));
    }

    /// Like [`Self::send_raw`], returning a one-shot [`Receiver`] for the
    /// reply (used by the module importer's `GET_MODULE` requests, whose
    /// reply is still `Value`-encoded per spec §6).
    #[must_use]
    pub fn send_raw_async(&self, handle: u32, payload: Vec<u8>) -> Receiver {
        let receiver = Receiver::new(&self.router, Some(self.id), false);
        let msg = Message {
            dst_id: self.id,
            src_id: self.router.local_id(),
            handle,
            reply_to: receiver.handle(),
            payload,
        };
        self.router.route(msg);
        receiver
    }

    /// Send `SHUTDOWN` to this peer (spec §4.3/§4.7). Only meaningful
    /// from an ancestor — peers reject it unless it arrives from
    /// `parent_id` (spec §4.3).
    pub fn shutdown(&self) {
        self.router.route(Message::new(self.id, handle::SHUTDOWN, Vec::new()));
    }
}

fn resolve_reply(value: Value) -> Result<Value> {
    match value {
        Value::Dead => Err(Error::Channel),
        Value::CallError(e) => Err(Error::call(e.message, e.traceback)),
        other => Ok(other),
    }
}
