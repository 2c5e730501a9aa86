// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::live::LiveEngine;
use statelink_datastore::{MutationSink, RecordMutation};
use std::sync::Arc;

/// Bridges storage commits to the incremental query engine: the store's sink
/// enqueues, a single worker drains in commit order. One worker per engine
/// keeps per-subscriber delivery ordered by commit.
pub struct Notifier {
    tx: async_channel::Sender<RecordMutation>,
}

impl MutationSink for Notifier {
    fn publish(&self, mutation: RecordMutation) {
        if let Err(err) = self.tx.try_send(mutation) {
            log::error!("fan-out queue is gone, dropping mutation: {err}");
        }
    }
}

pub fn spawn_fanout(live: Arc<LiveEngine>) -> (Arc<Notifier>, tokio::task::JoinHandle<()>) {
    let (tx, rx) = async_channel::unbounded();
    let worker = tokio::spawn(async move {
        while let Ok(mutation) = rx.recv().await {
            if let Err(err) = live.handle_mutation(&mutation).await {
                log::error!("fan-out failed for mutation {}: {err:#}", mutation.id);
            }
        }
    });
    (Arc::new(Notifier { tx }), worker)
}
