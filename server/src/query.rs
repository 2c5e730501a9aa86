// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::context::RequestContext;
use crate::error::{Result, ResultExt};
use crate::forbidden;
use crate::route::{Authorized, QueryRequest};
use crate::server::SyncServer;
use serde_json::{json, Value as JsonValue};
use statelink_schema::RawQuery;

impl SyncServer {
    /// Folds the route's `read` authorization into the request's `where`.
    /// A boolean verdict gates the whole query; a predicate AND-merges.
    pub fn merged_query(&self, ctx: &RequestContext, raw: &RawQuery) -> Result<RawQuery> {
        let route = self.router.route(&raw.resource)?;
        let mut merged = raw.clone();
        if let Some(policy) = &route.read {
            match policy.as_ref()(ctx, None)? {
                Authorized::Allow => {}
                Authorized::Deny => forbidden!("Not authorized"),
                Authorized::Where(where_json) => {
                    merged.where_ = Some(match merged.where_.take() {
                        Some(existing) => json!({"$and": [existing, where_json]}),
                        None => where_json,
                    });
                }
            }
        }
        Ok(merged)
    }

    /// One-shot read: authorization-merged query through the batching
    /// loader, returning the rows plus the standing-query hash the session
    /// uses for subscriptions.
    pub(crate) async fn handle_query(&self, req: QueryRequest) -> Result<JsonValue> {
        let merged = self.merged_query(&req.ctx, &req.raw)?;
        let hash = merged.hash(self.store.schema()).err_bad_request()?;
        let rows = self.loader.load_query(merged).await.err_internal()?;
        Ok(json!({"data": rows, "queryHash": hash}))
    }
}
