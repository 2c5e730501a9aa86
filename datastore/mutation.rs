use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use statelink_schema::{EntityName, MaterializedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationOp {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
}

/// A committed write as handed to the subscriber notifier: the mutation
/// envelope (accepted fields only) plus the post-commit shallow snapshot of
/// the row, which the incremental query engine diffs relations against.
#[derive(Debug, Clone)]
pub struct RecordMutation {
    /// Correlation id: the client's message id when the write originated in
    /// a request, a generated id otherwise.
    pub id: String,
    pub resource: EntityName,
    pub resource_id: String,
    pub op: MutationOp,
    /// Only fields whose meta timestamp is present, i.e. the fields the LWW
    /// merge accepted.
    pub payload: MaterializedValue,
    /// The full row after the write, in plain form.
    pub snapshot: JsonValue,
}

/// Receives mutations drained from a committed transaction. Buffered
/// mutations of a rolled-back transaction never reach the sink.
pub trait MutationSink: Send + Sync {
    fn publish(&self, mutation: RecordMutation);
}
