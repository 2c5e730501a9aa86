//! # Storage engine
//!
//! Dialect-neutral persistence for the sync engine. Every entity `R` is
//! backed by two physical tables: `R` holds the values and `R_meta` holds one
//! timestamp per field, which is what per-field last-writer-wins merging
//! compares against.
//!
//! Reads project a [materialized value](statelink_schema::MaterializedValue):
//! the meta shadow surfaces as a single JSON `_meta` column and every declared
//! include becomes a correlated JSON subquery. Writes run the LWW merge and
//! buffer a mutation envelope on the enclosing transaction; the buffer drains
//! to the registered [`MutationSink`](mutation::MutationSink) only on commit,
//! so no fan-out happens for aborted work.

pub mod conn;
mod engine;
mod init;
pub mod layout;
mod materialize;
pub mod mutation;
mod select;
mod sql_writer;
mod transaction;
mod write;

pub use conn::{DbConnection, Kind};
pub use engine::Store;
pub use mutation::{MutationOp, MutationSink, RecordMutation};
pub use transaction::StoreTxn;
pub use write::WriteOutcome;
