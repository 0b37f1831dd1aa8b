//! Waiting on the first-ready of several [`Receiver`]s (spec §3, §4.5 — C5).
//!
//! `Select::add` takes a `Receiver` by value: Rust's ownership rules mean
//! the same receiver object can never end up registered twice, or owned
//! by two `Select`s at once, or form a cycle with itself — the classes of
//! bug spec's "self-notify race avoidance", "duplicate-ownership
//! rejection" and "cycle detection when nesting" guard against in a
//! language without move semantics are structurally unrepresentable here.
//! What's left to implement deliberately is racing each receiver's
//! `Notify` without missing a wakeup that lands between the check and the
//! wait — the same pattern [`Receiver::get`] itself uses, generalized to
//! many receivers via `futures_util::future::select_all`.

use std::time::Duration;

use futures_util::future::select_all;

use crate::context::Receiver;
use crate::error::{Error, Result};
use crate::message::Message;

/// Waits across several receivers for the next available message (spec
/// §4.5 Select).
pub struct Select {
    entries: Vec<Receiver>,
    /// Once true (oneshot mode, after its first yield), further `get`
    /// calls fail with [`Error::Channel`] rather than waiting again.
    exhausted: bool,
    oneshot: bool,
}

impl Select {
    /// An empty, persistent select (yields repeatedly until every member
    /// closes).
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Vec::new(), exhausted: false, oneshot: false }
    }

    /// A select that becomes exhausted after its first successful `get`.
    #[must_use]
    pub fn oneshot() -> Self {
        Self { entries: Vec::new(), exhausted: false, oneshot: true }
    }

    /// Register `receiver`. Rejects a handle already present — the one
    /// remaining runtime-checkable case of spec's duplicate-ownership
    /// rule, since two distinct `Receiver` values are never expected to
    /// share a handle.
    pub fn add(&mut self, receiver: Receiver) -> Result<usize> {
        if self.entries.iter().any(|r| r.handle() == receiver.handle()) {
            return Err(Error::Stream(format!("handle {} already present in this select", receiver.handle())));
        }
        self.entries.push(receiver);
        Ok(self.entries.len() - 1)
    }

    /// Remove and return the receiver at `index`, taking it back out of
    /// the select.
    pub fn remove(&mut self, index: usize) -> Receiver {
        self.entries.remove(index)
    }

    /// Number of receivers currently registered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no receivers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait for the next message from any registered receiver, returning
    /// its index and the message. Errors with [`Error::Channel`] once
    /// every receiver has closed (or, in oneshot mode, after the first
    /// successful yield).
    pub async fn get(&mut self, timeout: Option<Duration>) -> Result<(usize, Message)> {
        if self.exhausted {
            return Err(Error::Channel);
        }
        if self.entries.is_empty() {
            return Err(Error::Channel);
        }

        loop {
            if let Some((i, msg)) = self.poll_once() {
                if self.oneshot {
                    self.exhausted = true;
                }
                return Ok((i, msg));
            }
            if self.entries.iter().all(Receiver::is_closed) {
                self.exhausted = true;
                return Err(Error::Channel);
            }

            let waiters: Vec<_> = self.entries.iter().map(|r| Box::pin(r.notified())).collect();
            let wait = select_all(waiters);
            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, wait).await.is_err() {
                        return Err(Error::Timeout(d));
                    }
                }
                None => {
                    wait.await;
                }
            }
        }
    }

    fn poll_once(&self) -> Option<(usize, Message)> {
        for (i, r) in self.entries.iter().enumerate() {
            if let Some(msg) = r.try_get() {
                return Some((i, msg));
            }
        }
        None
    }
}

impl Default for Select {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::context::channel;
    use crate::router::Router;
    use crate::value::Value;

    #[tokio::test]
    async fn returns_first_ready_receiver() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let (tx_a, rx_a) = channel(&router, 0, None);
        let (_tx_b, rx_b) = channel(&router, 0, None);

        let mut select = Select::new();
        let idx_a = select.add(rx_a).unwrap();
        let _idx_b = select.add(rx_b).unwrap();

        tx_a.put(&Value::Int(9));
        let (idx, msg) = select.get(Some(Duration::from_millis(200))).await.unwrap();
        assert_eq!(idx, idx_a);
        assert_eq!(msg.decode_value().unwrap(), Value::Int(9));
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn rejects_duplicate_handle() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let (_tx, rx) = channel(&router, 0, None);
        let h = rx.handle();
        let mut select = Select::new();
        select.add(rx).unwrap();
        // Two distinct `Receiver` values can only collide on handle if one
        // is deliberately registered at another's handle (e.g. a reserved
        // handle reused by mistake); that's the one case worth a runtime
        // check since move semantics otherwise rule duplicates out.
        let impostor = crate::context::Receiver::at(&router, Some(h), None, true);
        assert!(select.add(impostor).is_err());
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn oneshot_exhausts_after_first_message() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let (tx, rx) = channel(&router, 0, None);
        let mut select = Select::oneshot();
        select.add(rx).unwrap();

        tx.put(&Value::Int(1));
        select.get(Some(Duration::from_millis(200))).await.unwrap();
        let err = select.get(Some(Duration::from_millis(200))).await.unwrap_err();
        assert!(matches!(err, Error::Channel));
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn closes_when_all_members_close() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let (tx, rx) = channel(&router, 0, None);
        let mut select = Select::new();
        select.add(rx).unwrap();
        tx.close();
        let err = select.get(Some(Duration::from_millis(200))).await.unwrap_err();
        assert!(matches!(err, Error::Channel));
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }
}
