//! Intermediate-peer `GET_MODULE` relay (spec §4.8 ModuleForwarder): answer
//! from the local [`Importer`]'s cache when possible, otherwise forward to
//! the parent and relay the reply back to the original requester. Since
//! [`Importer::import`] already checks its own cache before asking the
//! parent, wiring a forwarder on top of it gets "cache-or-forward, then
//! memoize" for free — this turns repeated fetches for the same module
//! into a single round-trip per chain, amortised across however many
//! descendants ask for it (spec §4.8).

use std::sync::Arc;

use crate::context::Receiver;
use crate::message::{handle, Message};
use crate::router::Router;

use super::importer::{encode_get_module_reply, Importer};

pub struct ModuleForwarder {
    router: Arc<Router>,
    receiver: Receiver,
    importer: Arc<Importer>,
}

impl ModuleForwarder {
    #[must_use]
    pub fn new(router: Arc<Router>, importer: Arc<Importer>) -> Self {
        let receiver = Receiver::at(&router, Some(handle::GET_MODULE), None, true);
        Self { router, receiver, importer }
    }

    /// Serve requests until the receiver is torn down (broker shutdown).
    pub async fn serve(&self) {
        loop {
            let Ok(msg) = self.receiver.get(None).await else { return };
            let router = Arc::clone(&self.router);
            let importer = Arc::clone(&self.importer);
            let src_id = msg.src_id;
            let reply_to = msg.reply_to;
            let fullname = String::from_utf8_lossy(&msg.payload).into_owned();
            tokio::spawn(async move {
                let info = importer.import(&fullname).await.unwrap_or_else(|_| super::importer::missing_module_info());
                router.route(Message::with_value(src_id, reply_to, &encode_get_module_reply(&info)));
            });
        }
    }
}
