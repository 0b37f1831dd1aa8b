//! Peer-side import hook (spec §4.8 Importer).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use futures_util::future::BoxFuture;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::message::handle;
use crate::value::Value;

/// What a successful `GET_MODULE` round-trip resolves to (spec §6
/// `GET_MODULE` reply tuple). A peer never has this locally: every
/// non-native name is fetched from `upstream`, even when the fullname
/// happens to also be served out of the same statically-linked binary on
/// the master side (spec §1, "no code is pre-installed on remote hosts").
#[derive(Debug, Clone)]
pub struct ModuleInfo {
    /// `Some(submodules)` for a package, `None` for a plain module.
    pub pkg_present: Option<Vec<String>>,
    /// A display path identifying where the master served this from.
    pub path: String,
    /// Zlib-compressed Lua source text for this module (spec §6
    /// `compressed_source`), decompressed and evaluated by
    /// [`super::loader::ModuleLoader`].
    pub compressed_source: Vec<u8>,
    /// The dependency closure this module's source requires, computed by
    /// [`super::library::scan_related`] on the master side.
    pub related: Vec<String>,
}

impl ModuleInfo {
    pub(crate) fn missing() -> Self {
        Self { pkg_present: None, path: String::new(), compressed_source: Vec::new(), related: Vec::new() }
    }

    pub(crate) fn is_missing(&self) -> bool {
        self.path.is_empty() && self.compressed_source.is_empty()
    }
}

#[derive(Clone)]
enum CacheEntry {
    Found(ModuleInfo),
    Missing,
}

/// Resolves a module by asking `upstream` via `GET_MODULE` (spec §4.8).
/// Results are memoized either way, and a re-entrancy guard stops the same
/// fullname being fetched twice concurrently.
pub struct Importer {
    upstream: Context,
    cache: Mutex<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Importer {
    #[must_use]
    pub fn new(upstream: Context) -> Self {
        Self { upstream, cache: Mutex::new(HashMap::new()), in_flight: Mutex::new(HashSet::new()) }
    }

    /// Resolve `fullname`, consulting the cache before asking the parent.
    pub async fn import(&self, fullname: &str) -> Result<ModuleInfo> {
        if let Some(entry) = self.cache.lock().expect("poisoned").get(fullname).cloned() {
            return match entry {
                CacheEntry::Found(info) => Ok(info),
                CacheEntry::Missing => Err(Error::Import(fullname.to_string())),
            };
        }

        if !self.in_flight.lock().expect("poisoned").insert(fullname.to_string()) {
            return Err(Error::Import(format!("{fullname}: import already in flight")));
        }
        let result = self.fetch_remote(fullname).await;
        self.in_flight.lock().expect("poisoned").remove(fullname);

        let mut cache = self.cache.lock().expect("poisoned");
        match &result {
            Ok(info) => {
                cache.insert(fullname.to_string(), CacheEntry::Found(info.clone()));
            }
            Err(_) => {
                cache.insert(fullname.to_string(), CacheEntry::Missing);
            }
        }
        result
    }

    async fn fetch_remote(&self, fullname: &str) -> Result<ModuleInfo> {
        let receiver = self.upstream.send_raw_async(handle::GET_MODULE, fullname.as_bytes().to_vec());
        let msg = receiver.get(Some(Duration::from_secs(30))).await?;
        let info = decode_get_module_reply(&msg.decode_value()?)
            .ok_or_else(|| Error::Import(format!("{fullname}: malformed GET_MODULE reply")))?;
        if info.is_missing() {
            return Err(Error::Import(fullname.to_string()));
        }
        Ok(info)
    }

    /// Resolve `fullname` together with its full transitive `related`
    /// closure, in dependency-first order with duplicates removed (so a
    /// caller can feed the result straight into a cache that must see
    /// dependencies before dependents — spec §8 S2: "the peer must have
    /// requested `pkg`, `pkg.a`, and `pkg.b`").
    pub async fn import_chain(&self, fullname: &str) -> Result<Vec<(String, ModuleInfo)>> {
        let order = self.import_chain_inner(fullname).await?;
        let mut seen = HashSet::new();
        let mut deduped = Vec::new();
        for (name, info) in order {
            if seen.insert(name.clone()) {
                deduped.push((name, info));
            }
        }
        Ok(deduped)
    }

    fn import_chain_inner<'a>(&'a self, fullname: &'a str) -> BoxFuture<'a, Result<Vec<(String, ModuleInfo)>>> {
        Box::pin(async move {
            let info = self.import(fullname).await?;
            let mut order = Vec::new();
            for dep in info.related.clone() {
                order.extend(self.import_chain_inner(&dep).await?);
            }
            order.push((fullname.to_string(), info));
            Ok(order)
        })
    }
}

pub(crate) fn encode_get_module_reply(info: &ModuleInfo) -> Value {
    Value::List(vec![
        match &info.pkg_present {
            None => Value::Null,
            Some(names) => Value::List(names.iter().map(Value::text).collect()),
        },
        Value::text(&info.path),
        Value::Bytes(info.compressed_source.clone()),
        Value::List(info.related.iter().map(Value::text).collect()),
    ])
}

pub(crate) fn missing_module_info() -> ModuleInfo {
    ModuleInfo::missing()
}

pub(crate) fn decode_get_module_reply(value: &Value) -> Option<ModuleInfo> {
    let Value::List(items) = value else { return None };
    let [pkg_present, path, source, related] = items.as_slice() else { return None };
    let pkg_present = match pkg_present {
        Value::Null => None,
        Value::List(names) => Some(names.iter().filter_map(as_text).collect()),
        _ => return None,
    };
    let path = as_text(path)?;
    let Value::Bytes(source) = source else { return None };
    let Value::List(related_items) = related else { return None };
    let related = related_items.iter().filter_map(as_text).collect();
    Some(ModuleInfo { pkg_present, path, compressed_source: source.clone(), related })
}

fn as_text(v: &Value) -> Option<String> {
    match v {
        Value::Text(s) => Some(s.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::broker::Broker;
    use crate::router::Router;

    #[tokio::test]
    async fn fetches_and_caches_module_over_get_module() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let responder = super::super::responder::ModuleResponder::new(Arc::clone(&router));
        let served = tokio::spawn(async move { responder.serve().await });

        let upstream = Context::new(Arc::clone(&router), 0, "master");
        let importer = Importer::new(upstream);

        let info = importer.import("pow").await.unwrap();
        assert!(!info.compressed_source.is_empty());
        assert!(info.related.is_empty());

        // Second call must be served from the importer's own cache with no
        // further GET_MODULE round-trip (spec §8 S1).
        let again = importer.import("pow").await.unwrap();
        assert_eq!(again.path, info.path);

        served.abort();
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[tokio::test]
    async fn import_chain_orders_dependencies_before_dependents() {
        let broker = Broker::spawn();
        let router = Router::new(0, broker.handle());
        let responder = super::super::responder::ModuleResponder::new(Arc::clone(&router));
        let served = tokio::spawn(async move { responder.serve().await });

        let upstream = Context::new(Arc::clone(&router), 0, "master");
        let importer = Importer::new(upstream);

        let chain = importer.import_chain("pkg.b").await.unwrap();
        let names: Vec<&str> = chain.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"pkg"));
        assert!(names.contains(&"pkg.a"));
        let b_pos = names.iter().position(|n| *n == "pkg.b").unwrap();
        let a_pos = names.iter().position(|n| *n == "pkg.a").unwrap();
        assert!(a_pos < b_pos, "pkg.a must be loaded before pkg.b");

        served.abort();
        broker.shutdown(Duration::from_millis(100), |_| {}).await;
    }

    #[test]
    fn reply_round_trips_through_value() {
        let info = ModuleInfo {
            pkg_present: Some(vec!["sub".into()]),
            path: "<builtin>/pkg".into(),
            compressed_source: vec![1, 2, 3],
            related: vec!["os".into()],
        };
        let value = encode_get_module_reply(&info);
        let back = decode_get_module_reply(&value).unwrap();
        assert_eq!(back.path, info.path);
        assert_eq!(back.related, info.related);
    }

    #[test]
    fn missing_reply_round_trips_as_missing() {
        let info = missing_module_info();
        let value = encode_get_module_reply(&info);
        let back = decode_get_module_reply(&value).unwrap();
        assert!(back.is_missing());
    }
}
