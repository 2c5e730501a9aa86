// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

//! # Incremental query engine
//!
//! Maintains a graph of registered standing queries ([`QueryNode`]) and
//! observed objects ([`ObjectNode`]) and, for every committed mutation,
//! decides which queries must be notified and emits a minimal delta per
//! affected query — including synthetic inserts when a relation change
//! rewires a child query's membership.
//!
//! The graph uses arenas indexed by stable string keys (query hash, object
//! id); sets of hashes replace pointer graphs, and unsubscribing removes
//! edges in both directions.

mod engine;
mod graph;

pub use engine::{DataSource, DuplicateInsert, LiveEngine, QueryRegistration};
pub use graph::{Graph, ObjectNode, QueryNode, Subscriber};
