// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::context::{RequestContext, TransportParams};
use crate::error::{Error, Result, ResultExt};
use crate::live::{QueryRegistration, Subscriber};
use crate::route::{MutateRequest, QueryRequest, RouteRequest};
use crate::server::SyncServer;
use serde_json::Value as JsonValue;
use statelink_proto::{ClientMessage, ServerMessage};
use statelink_schema::{
    EntityName, Include, MaterializedNode, MaterializedValue, QueryHash, RawQuery,
};
use std::collections::HashMap;
use std::sync::Arc;

/// One connected client on the server side: decodes envelopes, runs them
/// through the router, answers REPLY/REJECT, and holds the standing
/// subscriptions whose deltas stream through its outbound channel.
pub struct ServerSession {
    id: u64,
    server: Arc<SyncServer>,
    ctx_data: JsonValue,
    outbound: async_channel::Sender<ServerMessage>,
    registrations: async_lock::Mutex<HashMap<QueryHash, Vec<QueryRegistration>>>,
}

impl ServerSession {
    /// Opens a session for a fresh transport; the returned receiver carries
    /// every server→client message (replies, rejects, live deltas).
    pub fn open(
        server: Arc<SyncServer>,
        params: &TransportParams,
    ) -> (Arc<ServerSession>, async_channel::Receiver<ServerMessage>) {
        let (outbound, rx) = async_channel::unbounded();
        let ctx_data = server.context_provider.as_ref()(params);
        let session = Arc::new(ServerSession {
            id: server.next_session_id(),
            server,
            ctx_data,
            outbound,
            registrations: async_lock::Mutex::new(HashMap::new()),
        });
        (session, rx)
    }

    pub fn session_id(&self) -> u64 {
        self.id
    }

    /// Processes one inbound envelope and answers it. Never returns an error:
    /// failures become REJECT messages.
    pub async fn handle_message(self: &Arc<Self>, msg: ClientMessage) {
        let id = msg.id().to_owned();
        let resource = match &msg {
            ClientMessage::Mutate { resource, .. } | ClientMessage::Subscribe { resource, .. } => {
                Some(resource.clone())
            }
            ClientMessage::Query { query, .. } => Some(query.resource.clone()),
            ClientMessage::Unsubscribe { .. } => None,
        };
        match self.process(msg).await {
            Ok(data) => self.send(ServerMessage::Reply { id, data }),
            Err(err) => {
                log::debug!("request {id} rejected: {err}");
                self.send(err.to_reject(&id, resource));
            }
        }
    }

    async fn process(self: &Arc<Self>, msg: ClientMessage) -> Result<JsonValue> {
        match msg {
            ClientMessage::Query { id, query } => {
                let ctx = RequestContext::new(&id, self.ctx_data.clone());
                self.server
                    .dispatch(RouteRequest::Query(QueryRequest { ctx, raw: query }))
                    .await
            }
            ClientMessage::Subscribe {
                id,
                resource: _,
                query_hash,
                query,
            } => self.subscribe(&id, query_hash, query).await,
            ClientMessage::Unsubscribe { id: _, query_hash } => {
                self.unsubscribe(&query_hash).await;
                Ok(JsonValue::Null)
            }
            ClientMessage::Mutate {
                id,
                resource,
                resource_id,
                procedure,
                payload,
                input,
            } => {
                let ctx = RequestContext::new(&id, self.ctx_data.clone());
                self.server
                    .dispatch(RouteRequest::Mutate(MutateRequest {
                        ctx,
                        resource,
                        resource_id,
                        procedure,
                        payload,
                        input,
                    }))
                    .await
            }
        }
    }

    /// Begins a standing query: answer with the initial rows, register the
    /// query (and one child query per included relation) with the live
    /// engine, and seed the engine with the loaded results.
    async fn subscribe(
        self: &Arc<Self>,
        message_id: &str,
        client_hash: QueryHash,
        query: RawQuery,
    ) -> Result<JsonValue> {
        let ctx = RequestContext::new(message_id, self.ctx_data.clone());
        let response = self
            .server
            .dispatch(RouteRequest::Query(QueryRequest {
                ctx: ctx.clone(),
                raw: query.clone(),
            }))
            .await?;
        let rows: Vec<MaterializedValue> =
            serde_json::from_value(response["data"].clone()).err_internal()?;

        let merged = self.server.merged_query(&ctx, &query)?;
        let subscriber: Arc<dyn Subscriber> = self.clone();
        let registration = self
            .server
            .live
            .register_query(merged.clone(), subscriber.clone(), None)
            .await
            .map_err(Error::internal)?;
        let hash = registration.hash.clone();
        self.server.live.load_query_results(&hash, &rows).await;

        let mut registrations = vec![registration];
        self.register_children(
            &subscriber,
            &hash,
            &merged.resource,
            &merged.include,
            &rows,
            &mut registrations,
        )
        .await?;

        self.registrations
            .lock()
            .await
            .insert(client_hash, registrations);
        Ok(response)
    }

    /// Registers one child query per included relation, seeded with the
    /// related rows already materialized in the parent results. Relation
    /// rewiring keeps these memberships current from here on.
    fn register_children<'a>(
        self: &'a Arc<Self>,
        subscriber: &'a Arc<dyn Subscriber>,
        parent_hash: &'a QueryHash,
        resource: &'a EntityName,
        include: &'a Include,
        rows: &'a [MaterializedValue],
        registrations: &'a mut Vec<QueryRegistration>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for (relation_name, nested) in include.iter() {
                let relation = match self.server.schema().relation(resource, relation_name) {
                    Some(relation) => relation.clone(),
                    None => continue,
                };
                let mut related: Vec<MaterializedValue> = Vec::new();
                for row in rows {
                    match row.get(relation_name).map(|f| &f.value) {
                        Some(MaterializedNode::Record(record)) => related.push(record.clone()),
                        Some(MaterializedNode::Records(records)) => {
                            related.extend(records.iter().cloned())
                        }
                        _ => {}
                    }
                }

                let child_raw = RawQuery {
                    resource: relation.target().clone(),
                    where_: None,
                    include: nested.clone(),
                    limit: None,
                    sort: None,
                    last_synced_at: None,
                };
                let registration = self
                    .server
                    .live
                    .register_query(
                        child_raw,
                        subscriber.clone(),
                        Some((parent_hash.clone(), relation_name.clone())),
                    )
                    .await
                    .map_err(Error::internal)?;
                let child_hash = registration.hash.clone();
                self.server
                    .live
                    .load_query_results(&child_hash, &related)
                    .await;
                registrations.push(registration);

                self.register_children(
                    subscriber,
                    &child_hash,
                    relation.target(),
                    &nested,
                    &related,
                    registrations,
                )
                .await?;
            }
            Ok(())
        })
    }

    async fn unsubscribe(&self, client_hash: &QueryHash) {
        let registrations = self.registrations.lock().await.remove(client_hash);
        if let Some(registrations) = registrations {
            for registration in registrations {
                registration.unsubscribe().await;
            }
        }
    }

    /// Detaches every standing subscription; called when the transport goes
    /// away. In-flight deltas that already left the engine may still land in
    /// the (now unread) channel.
    pub async fn close(&self) {
        let registrations: Vec<_> = self.registrations.lock().await.drain().collect();
        for (_, batch) in registrations {
            for registration in batch {
                registration.unsubscribe().await;
            }
        }
        self.outbound.close();
    }

    fn send(&self, msg: ServerMessage) {
        if let Err(err) = self.outbound.try_send(msg) {
            log::debug!("session {}: outbound channel closed: {err}", self.id);
        }
    }
}

impl Subscriber for ServerSession {
    fn subscriber_id(&self) -> u64 {
        self.id
    }

    fn notify(&self, delta: &ServerMessage) -> anyhow::Result<()> {
        self.outbound
            .try_send(delta.clone())
            .map_err(|err| anyhow::anyhow!("session {} outbound closed: {err}", self.id))
    }
}
