use crate::mutation::RecordMutation;
use anyhow::{ensure, Result};
use sqlx::{Any, Executor, Transaction};

/// A storage transaction plus its mutation bookkeeping.
///
/// Each nesting level owns a frame of buffered mutations. Nested levels map
/// onto SQL savepoints: a nested commit releases the savepoint and propagates
/// its frame into the parent, a nested rollback discards both. The outermost
/// frame is drained to the mutation sink by [`Store::commit`]
/// (crate::Store::commit), exactly once per buffered mutation.
pub struct StoreTxn {
    pub(crate) txn: Transaction<'static, Any>,
    frames: Vec<Vec<RecordMutation>>,
    savepoints: Vec<String>,
    savepoint_counter: usize,
}

impl StoreTxn {
    pub(crate) fn new(txn: Transaction<'static, Any>) -> Self {
        Self {
            txn,
            frames: vec![Vec::new()],
            savepoints: Vec::new(),
            savepoint_counter: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Opens a savepoint; subsequent mutations buffer into its frame until it
    /// commits or rolls back.
    pub async fn begin_nested(&mut self) -> Result<()> {
        let name = format!("sp{}", self.savepoint_counter);
        self.savepoint_counter += 1;
        self.txn.execute(&*format!("SAVEPOINT {name}")).await?;
        self.savepoints.push(name);
        self.frames.push(Vec::new());
        Ok(())
    }

    /// Releases the innermost savepoint and propagates its mutation frame
    /// into the enclosing one.
    pub async fn commit_nested(&mut self) -> Result<()> {
        ensure!(!self.savepoints.is_empty(), "no nested transaction to commit");
        let name = self.savepoints.pop().unwrap();
        self.txn.execute(&*format!("RELEASE SAVEPOINT {name}")).await?;
        let frame = self.frames.pop().expect("frame per savepoint");
        self.frames
            .last_mut()
            .expect("outer frame always present")
            .extend(frame);
        Ok(())
    }

    /// Rolls back to the innermost savepoint and discards its mutation frame
    /// so no fan-out occurs for the aborted work.
    pub async fn rollback_nested(&mut self) -> Result<()> {
        ensure!(
            !self.savepoints.is_empty(),
            "no nested transaction to roll back"
        );
        let name = self.savepoints.pop().unwrap();
        self.txn
            .execute(&*format!("ROLLBACK TO SAVEPOINT {name}"))
            .await?;
        self.txn.execute(&*format!("RELEASE SAVEPOINT {name}")).await?;
        self.frames.pop();
        Ok(())
    }

    pub(crate) fn push_mutation(&mut self, mutation: RecordMutation) {
        self.frames
            .last_mut()
            .expect("outer frame always present")
            .push(mutation);
    }

    /// Consumes the transaction handle for commit/rollback, yielding the
    /// outer mutation frame.
    pub(crate) fn into_parts(mut self) -> (Transaction<'static, Any>, Vec<RecordMutation>) {
        // An unterminated nested level at commit time keeps its buffered
        // mutations: the savepoints are implicitly released by COMMIT.
        let mut outer = Vec::new();
        for frame in self.frames.drain(..) {
            outer.extend(frame);
        }
        (self.txn, outer)
    }
}
