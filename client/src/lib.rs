//! # Client session
//!
//! The client half of the engine: an in-memory relational store with a
//! synchronous query surface, an optimistic overlay that speculatively
//! applies mutations before the server confirms them (and rolls them back on
//! REJECT or timeout), request/reply correlation with a configurable
//! timeout, an offline queue whose custom-procedure envelopes replay on
//! reconnect, and an event stream describing all of it.

mod overlay;
mod proxy;
mod session;
mod store;
mod transport;

pub use proxy::OptimisticProxy;
pub use session::{
    ClientEvent, ClientSession, ConnectionOptions, OptimisticHandler, SessionBuilder,
};
pub use store::{ClientStore, OneQuery, QueryBuilder};
pub use transport::{InMemoryTransport, Transport, TransportEvent};
