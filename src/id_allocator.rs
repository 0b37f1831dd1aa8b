//! Context id allocation (spec §4.10 — C10).
//!
//! The master hands out every context id in the tree so ids never
//! collide. [`IdAllocator`] owns the counter and, on each allocation,
//! publishes a route for the new id to whichever ancestor asked
//! (`Router::propagate_route`) before replying — so the id is routable by
//! every ancestor the moment its owner learns about it, not after some
//! later announcement. [`ChildIdAllocator`] is the asking side: every
//! non-root peer calls `allocate()`, which is just `send_await(ALLOCATE_ID)`
//! against context 0 (spec §4.10, and spec §4.3's "master context (id 0)"
//! framing — see the router module docs for why context 0 is reserved for
//! the root of the tree).

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::{Context, Receiver};
use crate::error::Result;
use crate::message::{handle, Message};
use crate::router::Router;
use crate::value::Value;

/// Master-side `ALLOCATE_ID` server. `next` starts above
/// [`crate::message::handle::FIRST_USER_HANDLE`]'s numeric space is
/// irrelevant here — context ids and handles are distinct namespaces; ids
/// start at 1 since 0 is reserved for the master itself.
pub struct IdAllocator {
    router: Arc<Router>,
    receiver: Receiver,
    next: AtomicU32,
}

impl IdAllocator {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        let receiver = Receiver::at(&router, Some(handle::ALLOCATE_ID), None, true);
        Self { router, receiver, next: AtomicU32::new(1) }
    }

    /// Serve `ALLOCATE_ID` requests until the receiver is torn down.
    pub async fn serve(&self) {
        loop {
            let Ok(msg) = self.receiver.get(None).await else { return };
            let allocated = self.next.fetch_add(1, Ordering::SeqCst);
            self.router.propagate_route(allocated, msg.src_id);
            self.router.route(Message::with_value(msg.src_id, msg.reply_to, &Value::Int(i64::from(allocated))));
        }
    }
}

/// Non-root peer's view of id allocation: ask the master for a fresh id.
pub struct ChildIdAllocator {
    master: Context,
}

impl ChildIdAllocator {
    #[must_use]
    pub fn new(router: &Arc<Router>) -> Self {
        Self { master: Context::new(Arc::clone(router), 0, "master") }
    }

    /// Request a fresh id from the root (spec §4.10 `allocate()`).
    pub async fn allocate(&self) -> Result<u32> {
        let reply = self.master.send_await(handle::ALLOCATE_ID, &Value::Null, Some(Duration::from_secs(10))).await?;
        match reply {
            Value::Int(n) if n >= 0 => Ok(n as u32),
            other => Err(crate::error::Error::Stream(format!("ALLOCATE_ID reply not a non-negative int: {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;

    #[tokio::test]
    async fn allocates_increasing_ids_and_propagates_routes() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let allocator = IdAllocator::new(Arc::clone(&router));
        let served = tokio::spawn(async move {
            allocator.serve().await;
        });

        let child = ChildIdAllocator::new(&router);
        let first = child.allocate().await.unwrap();
        let second = child.allocate().await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        served.abort();
        broker.shutdown(std::time::Duration::from_millis(100), |_| {}).await;
    }
}
