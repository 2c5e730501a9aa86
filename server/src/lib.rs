//! # Sync server
//!
//! The server half of the engine: a mutation router with middleware,
//! authorization policies, lifecycle hooks and custom mutations; an
//! incremental query engine fed by the storage's commit stream; a batching
//! loader; and per-connection sessions speaking the wire envelope protocol.
//! Transport bindings (HTTP/WebSocket) are external collaborators that feed
//! [`session::ServerSession`]s.

pub mod context;
pub mod db;
pub mod error;
pub mod live;
pub mod loader;
mod mutate;
pub mod notify;
pub mod opt;
mod query;
pub mod route;
pub mod server;
pub mod session;

pub use context::{ContextProvider, RequestContext, TransportParams};
pub use error::{Error, ErrorKind};
pub use opt::Opt;
pub use server::SyncServer;
pub use session::ServerSession;
