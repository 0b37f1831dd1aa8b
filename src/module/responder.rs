//! Master-side `GET_MODULE` answerer (spec §4.8 ModuleResponder).

use std::io::Write;
use std::sync::Arc;

use crate::context::Receiver;
use crate::message::{handle, Message};
use crate::router::Router;

use super::importer::{encode_get_module_reply, missing_module_info, ModuleInfo};
use super::library;

/// Answers every `GET_MODULE` request addressed to this peer out of
/// [`library`] (spec §4.8: "Locate the module... reply with
/// `(pkg_present, path, compressed_source, related)`"). This is the only
/// place in the crate allowed to call [`library::find`] — everywhere else
/// (`Importer`, `ModuleForwarder`, `ModuleLoader`) resolves a fullname over
/// the network even though the library is technically linked into every
/// peer binary, so the wire traffic the spec describes actually happens.
pub struct ModuleResponder {
    router: Arc<Router>,
    receiver: Receiver,
}

impl ModuleResponder {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        let receiver = Receiver::at(&router, Some(handle::GET_MODULE), None, true);
        Self { router, receiver }
    }

    /// Serve requests until the receiver is torn down (broker shutdown).
    pub async fn serve(&self) {
        loop {
            let Ok(msg) = self.receiver.get(None).await else { return };
            self.handle_request(&msg);
        }
    }

    fn handle_request(&self, msg: &Message) {
        let fullname = String::from_utf8_lossy(&msg.payload).into_owned();
        let info = library::find(&fullname).map(|m| build_module_info(&fullname, m)).unwrap_or_else(missing_module_info);
        self.router.route(Message::with_value(msg.src_id, msg.reply_to, &encode_get_module_reply(&info)));
    }
}

fn build_module_info(fullname: &str, served: &library::ModuleSource) -> ModuleInfo {
    let mut compressed_source = Vec::new();
    {
        let mut encoder = flate2::write::ZlibEncoder::new(&mut compressed_source, flate2::Compression::default());
        // Writing to an in-memory Vec through ZlibEncoder cannot fail.
        encoder.write_all(served.source.as_bytes()).expect("zlib encode to Vec");
        encoder.finish().expect("zlib encode to Vec");
    }

    ModuleInfo {
        pkg_present: served.is_package.then(Vec::new),
        path: format!("<served>/{fullname}"),
        compressed_source,
        related: related_closure(fullname, served.source),
    }
}

/// The declared `require(...)` calls in `source`, plus the immediate
/// parent package (if `fullname` is dotted) prepended even when the source
/// never calls `require` on it — mirroring how importing `pkg.b` always
/// implies `pkg` is already imported, independent of whether `pkg.b`'s own
/// code references it.
fn related_closure(fullname: &str, source: &str) -> Vec<String> {
    let mut related = library::scan_related(source);
    if let Some(dot) = fullname.rfind('.') {
        let parent = &fullname[..dot];
        if !related.iter().any(|r| r == parent) {
            related.insert(0, parent.to_string());
        }
    }
    related
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::broker::Broker;
    use crate::context::Context;

    #[tokio::test]
    async fn answers_served_module() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let responder = ModuleResponder::new(Arc::clone(&router));
        let served = tokio::spawn(async move {
            responder.serve().await;
        });

        let requester = Context::new(Arc::clone(&router), 0, "self");
        let reply = requester
            .send_raw_async(handle::GET_MODULE, b"pow".to_vec())
            .get(Some(Duration::from_millis(500)))
            .await
            .unwrap();
        let value = reply.decode_value().unwrap();
        let info = crate::module::importer::decode_get_module_reply(&value).unwrap();
        assert_eq!(info.path, "<served>/pow");
        assert!(!info.compressed_source.is_empty());

        served.abort();
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn answers_missing_module_with_null() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let responder = ModuleResponder::new(Arc::clone(&router));
        let served = tokio::spawn(async move {
            responder.serve().await;
        });

        let requester = Context::new(Arc::clone(&router), 0, "self");
        let reply = requester
            .send_raw_async(handle::GET_MODULE, b"non_existent_module".to_vec())
            .get(Some(Duration::from_millis(500)))
            .await
            .unwrap();
        let value = reply.decode_value().unwrap();
        let info = crate::module::importer::decode_get_module_reply(&value).unwrap();
        assert!(info.is_missing());

        served.abort();
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[test]
    fn pkg_submodule_always_depends_on_its_package() {
        let related = related_closure("pkg.a", library::find("pkg.a").unwrap().source);
        assert_eq!(related, vec!["pkg".to_string()]);
    }
}
