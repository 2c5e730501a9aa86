// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use serde_json::{json, Value as JsonValue};
use statelink_datastore::Store;
use statelink_schema::{EntityName, Include, MaterializedValue, RawQuery, Sort, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// One member's view of a coalesced lookup: the shared shape plus the unique
/// key that tells its rows apart from the rest of the batch.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub resource: EntityName,
    pub common_where: Option<JsonValue>,
    /// Discriminating column and this member's value for it.
    pub unique: Option<(String, JsonValue)>,
    pub include: Include,
    pub sort: Option<Sort>,
    pub limit: Option<u64>,
    pub last_synced_at: Option<Timestamp>,
}

struct Member {
    unique_value: Option<JsonValue>,
    sort: Option<Sort>,
    limit: Option<u64>,
    tx: oneshot::Sender<Result<Vec<MaterializedValue>, String>>,
}

struct Batch {
    resource: EntityName,
    common_where: Option<JsonValue>,
    unique_column: Option<String>,
    include: Include,
    last_synced_at: Option<Timestamp>,
    members: Vec<Member>,
}

/// Coalesces concurrent single-key lookups into one predicate query per
/// scheduler tick. Batches key on `(resource, common predicate, include,
/// unique column, watermark)`; the unique keys collected across members merge
/// into one `$in` against the discriminating column, and results dispatch
/// back to each requester filtered by its key.
pub struct QueryLoader {
    store: Arc<Store>,
    pending: Mutex<HashMap<String, Batch>>,
}

impl QueryLoader {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// A general query run through the batcher: no unique key, so the member
    /// receives the whole cohort result.
    pub async fn load_query(self: &Arc<Self>, raw: RawQuery) -> Result<Vec<MaterializedValue>> {
        self.load(LoadRequest {
            resource: raw.resource,
            common_where: raw.where_,
            unique: None,
            include: raw.include,
            sort: raw.sort,
            limit: raw.limit,
            last_synced_at: raw.last_synced_at,
        })
        .await
    }

    /// A single-id lookup; same-tick lookups of the same shape coalesce into
    /// one `$in` query.
    pub async fn load_by_id(
        self: &Arc<Self>,
        resource: &EntityName,
        id: &str,
        include: Include,
    ) -> Result<Option<MaterializedValue>> {
        let rows = self
            .load(LoadRequest {
                resource: resource.clone(),
                common_where: None,
                unique: Some(("id".to_owned(), json!(id))),
                include,
                sort: None,
                limit: None,
                last_synced_at: None,
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn load(self: &Arc<Self>, req: LoadRequest) -> Result<Vec<MaterializedValue>> {
        let key = batch_key(&req);
        let (tx, rx) = oneshot::channel();
        let first_member = {
            let mut pending = self.pending.lock();
            let batch = pending.entry(key.clone()).or_insert_with(|| Batch {
                resource: req.resource.clone(),
                common_where: req.common_where.clone(),
                unique_column: req.unique.as_ref().map(|(col, _)| col.clone()),
                include: req.include.clone(),
                last_synced_at: req.last_synced_at.clone(),
                members: Vec::new(),
            });
            batch.members.push(Member {
                unique_value: req.unique.map(|(_, value)| value),
                sort: req.sort,
                limit: req.limit,
                tx,
            });
            batch.members.len() == 1
        };
        if first_member {
            let loader = self.clone();
            tokio::spawn(async move {
                // One suspension per batch cycle: everything enqueued during
                // this tick drains together.
                tokio::task::yield_now().await;
                loader.drain(&key).await;
            });
        }
        match rx.await {
            Ok(Ok(rows)) => Ok(rows),
            Ok(Err(message)) => Err(anyhow!(message)),
            Err(_) => bail!("batched query was dropped before completion"),
        }
    }

    async fn drain(&self, key: &str) {
        let batch = match self.pending.lock().remove(key) {
            Some(batch) => batch,
            None => return,
        };

        let mut where_ = batch.common_where.clone();
        if let Some(column) = &batch.unique_column {
            let mut values: Vec<JsonValue> = Vec::new();
            for member in &batch.members {
                if let Some(value) = &member.unique_value {
                    if !values.contains(value) {
                        values.push(value.clone());
                    }
                }
            }
            if !values.is_empty() {
                let in_clause = json!({ column.clone(): { "$in": values } });
                where_ = Some(match where_ {
                    Some(existing) => json!({"$and": [existing, in_clause]}),
                    None => in_clause,
                });
            }
        }

        // Sort and limit survive only when exactly one member asked for
        // them; a mixed cohort accepts merge semantics instead.
        let requesters: Vec<&Member> = batch
            .members
            .iter()
            .filter(|m| m.sort.is_some() || m.limit.is_some())
            .collect();
        let (sort, limit) = match requesters.as_slice() {
            [only] => (only.sort.clone(), only.limit),
            _ => (None, None),
        };

        let raw = RawQuery {
            resource: batch.resource.clone(),
            where_,
            include: batch.include.clone(),
            limit,
            sort,
            last_synced_at: batch.last_synced_at.clone(),
        };
        match self.store.get(&raw).await {
            Ok(rows) => {
                for member in batch.members {
                    let subset = match (&batch.unique_column, &member.unique_value) {
                        (Some(column), Some(value)) => rows
                            .iter()
                            .filter(|row| row_column_matches(row, column, value))
                            .cloned()
                            .collect(),
                        _ => rows.clone(),
                    };
                    let _ = member.tx.send(Ok(subset));
                }
            }
            Err(err) => {
                // A failing batch rejects every requester.
                let message = format!("{err:#}");
                for member in batch.members {
                    let _ = member.tx.send(Err(message.clone()));
                }
            }
        }
    }
}

fn row_column_matches(row: &MaterializedValue, column: &str, value: &JsonValue) -> bool {
    row.get(column)
        .and_then(|field| field.value.as_scalar())
        .map(|scalar| scalar == value)
        .unwrap_or(false)
}

fn batch_key(req: &LoadRequest) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        req.resource,
        req.common_where
            .as_ref()
            .map(|w| w.to_string())
            .unwrap_or_default(),
        serde_json::to_string(&req.include).unwrap_or_default(),
        req.unique
            .as_ref()
            .map(|(col, _)| col.as_str())
            .unwrap_or(""),
        req.last_synced_at
            .as_ref()
            .map(|t| t.as_str())
            .unwrap_or(""),
    )
}
