// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::context::RequestContext;
use crate::db::Db;
use crate::error::{Error, Result, ResultExt};
use crate::route::{Authorized, MutateRequest, Policy, Validated};
use crate::server::SyncServer;
use crate::{bad_request, conflict, forbidden, not_found};
use itertools::Itertools;
use serde_json::{json, Value as JsonValue};
use statelink_datastore::StoreTxn;
use statelink_proto::GENERIC_INSERT;
use statelink_schema::{EntityName, Include, MaterializedValue, Predicate};

impl SyncServer {
    /// The generic INSERT/UPDATE algorithm: precondition checks, per-field
    /// LWW merge, pre/post authorization (a failed post-check rolls the
    /// transaction back), lifecycle hooks, then commit and fan-out.
    pub(crate) async fn handle_generic(&self, req: MutateRequest) -> Result<JsonValue> {
        let resource = req.resource.clone();
        let route = self.router.route(&resource)?;
        let id = match &req.resource_id {
            Some(id) => id.clone(),
            None => bad_request!("missing resourceId"),
        };
        let payload = match &req.payload {
            Some(payload) => payload.clone(),
            None => bad_request!("missing input"),
        };
        let is_insert = req.procedure == GENERIC_INSERT;

        let target = self
            .store
            .find_by_id(&resource, &id, Include::default())
            .await
            .err_internal()?;
        if is_insert && target.is_some() {
            conflict!("Resource already exists");
        }
        if !is_insert && target.is_none() {
            not_found!("Resource not found");
        }

        let mut txn = self.store.begin().await.err_internal()?;
        let committed = self
            .generic_in_txn(&route, &req, &resource, &id, &payload, is_insert, target, &mut txn)
            .await;
        match committed {
            Ok((value, accepted)) => {
                self.store.commit(txn).await.err_internal()?;
                Ok(json!({"data": value, "acceptedValues": accepted}))
            }
            Err(err) => {
                self.store.rollback(txn).await.ok();
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn generic_in_txn(
        &self,
        route: &crate::route::Route,
        req: &MutateRequest,
        resource: &EntityName,
        id: &str,
        payload: &MaterializedValue,
        is_insert: bool,
        target: Option<MaterializedValue>,
        txn: &mut StoreTxn,
    ) -> Result<(MaterializedValue, Vec<String>)> {
        if merge_preview(payload, target.as_ref()).is_empty() {
            // Every field lost the LWW race; nothing to write.
            bad_request!("Mutation rejected");
        }

        let db = Db::new(self.store.clone());
        if is_insert {
            if let Some(hook) = &route.before_insert {
                hook.as_ref()(&req.ctx, &db, &payload.infer_plain()).await?;
            }
        } else {
            let current = target.as_ref().expect("update target present");
            if let Some(policy) = &route.update_pre_mutation {
                self.enforce_policy(
                    policy,
                    &req.ctx,
                    resource,
                    id,
                    Some(&current.infer_plain()),
                    Some(&mut *txn),
                )
                .await?;
            }
            if let Some(hook) = &route.before_update {
                hook.as_ref()(&req.ctx, &db, &current.infer_plain()).await?;
            }
        }

        // The emitted envelope carries the client's message id so replies
        // and live deltas correlate.
        let mutation_id = Some(req.ctx.message_id.clone());
        let outcome = if is_insert {
            self.store
                .insert_in(txn, resource, id, payload, mutation_id)
                .await
                .err_internal()?
        } else {
            self.store
                .update_in(txn, resource, id, payload, mutation_id)
                .await
                .err_internal()?
        };
        if outcome.accepted.is_empty() && !is_insert {
            bad_request!("Mutation rejected");
        }

        let result_plain = outcome.value.infer_plain();
        if is_insert {
            if let Some(policy) = &route.insert {
                self.enforce_policy(policy, &req.ctx, resource, id, Some(&result_plain), Some(&mut *txn))
                    .await?;
            }
            if let Some(hook) = &route.after_insert {
                hook.as_ref()(&req.ctx, &db, &result_plain).await?;
            }
        } else {
            if let Some(policy) = &route.update_post_mutation {
                self.enforce_policy(policy, &req.ctx, resource, id, Some(&result_plain), Some(&mut *txn))
                    .await?;
            }
            if let Some(hook) = &route.after_update {
                hook.as_ref()(&req.ctx, &db, &result_plain).await?;
            }
        }

        Ok((outcome.value, outcome.accepted))
    }

    /// Schema-declared custom mutation: validate the input (joining
    /// path-qualified issues into the REJECT message), then hand the
    /// validated request and a db facade to the handler.
    pub(crate) async fn handle_custom(&self, req: MutateRequest) -> Result<JsonValue> {
        let route = self.router.route(&req.resource)?;
        let custom = match route.custom.get(&req.procedure) {
            Some(custom) => custom,
            None => bad_request!("unknown procedure `{}`", req.procedure),
        };
        let input = req.input.clone().unwrap_or(JsonValue::Null);
        let validated = match custom.validator.validate(&input) {
            Validated::Value(value) => value,
            Validated::Issues(issues) => {
                bad_request!("{}", issues.iter().map(|i| i.qualified()).join(", "))
            }
        };

        let db = Db::new(self.store.clone());
        let mut request = req.clone();
        request.input = Some(validated);
        let data = custom.handler.as_ref()(request, db).await?;
        Ok(json!({"data": data}))
    }

    /// Resolves a policy verdict. A returned predicate implies an include
    /// (its relational descents), a re-fetch of the record with it, and a
    /// match requirement.
    pub(crate) async fn enforce_policy(
        &self,
        policy: &Policy,
        ctx: &RequestContext,
        resource: &EntityName,
        id: &str,
        record: Option<&JsonValue>,
        txn: Option<&mut StoreTxn>,
    ) -> Result<()> {
        match policy.as_ref()(ctx, record)? {
            Authorized::Allow => Ok(()),
            Authorized::Deny => forbidden!("Not authorized"),
            Authorized::Where(where_json) => {
                let predicate = Predicate::parse(self.store.schema(), resource, &where_json)
                    .map_err(Error::internal)?;
                let include = predicate.required_include();
                let fetched = match txn {
                    Some(txn) => {
                        self.store
                            .find_by_id_in(txn, resource, id, include)
                            .await
                    }
                    None => self.store.find_by_id(resource, id, include).await,
                }
                .err_internal()?;
                let authorized = fetched
                    .map(|value| {
                        predicate.matches(self.store.schema(), resource, &value.infer_plain())
                    })
                    .unwrap_or(false);
                if authorized {
                    Ok(())
                } else {
                    forbidden!("Not authorized")
                }
            }
        }
    }
}

/// The per-field LWW preview: which payload fields would win against the
/// current target. Fields without a timestamp carry no LWW position and are
/// never written.
pub(crate) fn merge_preview(
    payload: &MaterializedValue,
    target: Option<&MaterializedValue>,
) -> Vec<String> {
    let mut accepted = Vec::new();
    for (name, field) in payload.iter() {
        if name == "id" {
            continue;
        }
        let timestamp = match field.timestamp() {
            Some(timestamp) => timestamp,
            None => continue,
        };
        let wins = match target.and_then(|t| t.timestamp_of(name)) {
            Some(stored) => timestamp > stored,
            None => true,
        };
        if wins {
            accepted.push(name.clone());
        }
    }
    accepted
}
