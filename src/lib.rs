//! `relaymux` — a connection multiplexer that bootstraps a tree of peer
//! processes over SSH/sudo/local transports and routes typed messages
//! between them.

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod context;
pub mod error;
pub mod external_context;
pub mod id_allocator;
pub mod log_forward;
pub mod message;
pub mod module;
pub mod router;
pub mod select;
pub mod stream;
pub mod value;

pub use bootstrap::{local::LocalTransport, ssh::SshTransport, sudo::SudoTransport, PeerConfig, Transport};
pub use broker::{Broker, BrokerHandle};
pub use config::Config;
pub use context::{channel, Context, Receiver, Sender};
pub use error::{Error, Result};
pub use router::Router;
pub use select::Select;
pub use value::{CallError, Value};
