//! On-demand module/source transfer (spec §4.8 — C8).
//!
//! Two tiers of functions are reachable through `CALL_FUNCTION`:
//!
//! - **Native built-ins** (`os`, `builtins`): interpreter primitives that
//!   ship with every peer binary the way `os` ships with every CPython
//!   install, resolved straight out of [`registry`] without ever touching
//!   `GET_MODULE`.
//! - **Served modules** (`pow`, `pkg`, `pkg.a`, `pkg.b`, ...): real Lua
//!   source text, authored once in [`library`] on the master side, that a
//!   peer fetches lazily and evaluates with [`loader::ModuleLoader`].
//!   [`importer::Importer`] runs on every peer, a
//!   [`responder::ModuleResponder`] answers at the root, and a
//!   [`forwarder::ModuleForwarder`] relays for everyone in between —
//!   caching each fullname after its first round-trip per chain.

pub mod forwarder;
pub mod importer;
pub mod library;
pub mod loader;
pub mod registry;
pub mod responder;

pub use forwarder::ModuleForwarder;
pub use importer::{Importer, ModuleInfo};
pub use loader::ModuleLoader;
pub use registry::{lookup_function, CallResult, NativeFn};
pub use responder::ModuleResponder;
