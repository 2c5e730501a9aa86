// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use super::graph::{Graph, QueryNode, Subscriber};
use anyhow::{bail, Result};
use futures::future::{join_all, BoxFuture};
use serde_json::Value as JsonValue;
use statelink_datastore::{MutationOp, RecordMutation};
use statelink_proto::{MutationKind, ServerMessage};
use statelink_schema::{
    EntityName, Include, MaterializedValue, Predicate, QueryHash, RawQuery, Relation, Schema,
};
use std::collections::HashSet;
use std::sync::Arc;

/// What to do when an INSERT arrives for an id the engine already tracks.
/// The source behavior is to drop silently; erroring is available for setups
/// that want raced duplicate inserts surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateInsert {
    Drop,
    Error,
}

impl Default for DuplicateInsert {
    fn default() -> Self {
        DuplicateInsert::Drop
    }
}

/// Where the engine fetches full objects for deep predicate checks and
/// child-query rewiring.
pub trait DataSource: Send + Sync {
    fn fetch_by_id<'a>(
        &'a self,
        resource: &'a EntityName,
        id: &'a str,
        include: Include,
    ) -> BoxFuture<'a, Result<Option<MaterializedValue>>>;
}

/// The incremental query engine. The graph is guarded by one async lock,
/// mutated by the fan-out worker and the registration paths; subscribers only
/// ever see immutable delivered envelopes.
pub struct LiveEngine {
    schema: Arc<Schema>,
    source: Arc<dyn DataSource>,
    graph: async_lock::Mutex<Graph>,
    duplicate_insert: DuplicateInsert,
}

/// Handle returned by [`LiveEngine::register_query`]. Calling
/// [`unsubscribe`](QueryRegistration::unsubscribe) detaches the subscriber
/// and prunes the query node once nothing observes it.
pub struct QueryRegistration {
    engine: Arc<LiveEngine>,
    pub hash: QueryHash,
    subscriber_id: u64,
}

impl QueryRegistration {
    pub async fn unsubscribe(self) {
        let mut graph = self.engine.graph.lock().await;
        let now_empty = match graph.queries.get_mut(&self.hash) {
            Some(node) => {
                node.subscribers
                    .retain(|s| s.subscriber_id() != self.subscriber_id);
                node.subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            graph.prune_query(&self.hash);
        }
    }
}

/// A synthetic or pass-through delta bound for one query's subscribers.
type Delivery = (Vec<Arc<dyn Subscriber>>, ServerMessage);

impl LiveEngine {
    pub fn new(
        schema: Arc<Schema>,
        source: Arc<dyn DataSource>,
        duplicate_insert: DuplicateInsert,
    ) -> Arc<LiveEngine> {
        Arc::new(LiveEngine {
            schema,
            source,
            graph: async_lock::Mutex::new(Graph::default()),
            duplicate_insert,
        })
    }

    /// Registers a standing query for `subscriber`. `parent` ties a child
    /// query under a relation of its parent, which is what relational
    /// rewiring traverses.
    pub async fn register_query(
        self: &Arc<Self>,
        raw: RawQuery,
        subscriber: Arc<dyn Subscriber>,
        parent: Option<(QueryHash, String)>,
    ) -> Result<QueryRegistration> {
        let base_hash = raw.hash(&self.schema)?;
        // A child query's identity includes the parent edge: the same raw
        // query can stand alone and as an include child at the same time,
        // with independent membership.
        let hash = match &parent {
            Some((parent_hash, relation)) => QueryHash(format!(
                "{}:{relation}:{}",
                parent_hash.as_str(),
                base_hash.as_str()
            )),
            None => base_hash,
        };
        let predicate = raw.parse_where(&self.schema)?;
        let resource = raw.resource.clone();
        let subscriber_id = subscriber.subscriber_id();

        let mut graph = self.graph.lock().await;
        let node = graph.queries.entry(hash.clone()).or_insert_with(|| QueryNode {
            hash: hash.clone(),
            raw,
            resource: resource.clone(),
            predicate,
            matching_ids: HashSet::new(),
            subscribers: Vec::new(),
            parents: HashSet::new(),
            parent_relation: None,
            children_by_relation: Default::default(),
        });
        if !node
            .subscribers
            .iter()
            .any(|s| s.subscriber_id() == subscriber_id)
        {
            node.subscribers.push(subscriber);
        }
        if let Some((parent_hash, relation)) = &parent {
            node.parents.insert(parent_hash.clone());
            node.parent_relation = Some(relation.clone());
        }
        graph
            .by_resource
            .entry(resource)
            .or_default()
            .insert(hash.clone());
        if let Some((parent_hash, relation)) = parent {
            if let Some(parent_node) = graph.queries.get_mut(&parent_hash) {
                parent_node
                    .children_by_relation
                    .entry(relation)
                    .or_default()
                    .insert(hash.clone());
            }
        }
        Ok(QueryRegistration {
            engine: self.clone(),
            hash,
            subscriber_id,
        })
    }

    /// Seeds a standing query with its initial result rows: membership plus
    /// both directions of every relation edge the rows carry.
    pub async fn load_query_results(&self, hash: &QueryHash, rows: &[MaterializedValue]) {
        let mut graph = self.graph.lock().await;
        let resource = match graph.queries.get(hash) {
            Some(query) => query.resource.clone(),
            None => return,
        };
        for row in rows {
            let id = match row.id() {
                Some(id) => id.to_owned(),
                None => continue,
            };
            if let Some(query) = graph.queries.get_mut(hash) {
                query.matching_ids.insert(id.clone());
            }
            let plain = row.infer_plain();
            self.track_object(&mut graph, &resource, &id, &plain);
            graph
                .object_mut(&resource, &id)
                .matched_queries
                .insert(hash.clone());
        }
    }

    /// The current membership of a query; test and introspection surface.
    pub async fn matching_ids(&self, hash: &QueryHash) -> HashSet<String> {
        let graph = self.graph.lock().await;
        graph
            .queries
            .get(hash)
            .map(|q| q.matching_ids.clone())
            .unwrap_or_default()
    }

    /// Processes one committed mutation: decides which standing queries are
    /// affected and delivers one minimal delta per affected query.
    pub async fn handle_mutation(&self, mutation: &RecordMutation) -> Result<()> {
        match mutation.op {
            MutationOp::Insert => self.handle_insert(mutation).await,
            MutationOp::Update => self.handle_update(mutation).await,
        }
    }

    async fn handle_insert(&self, mutation: &RecordMutation) -> Result<()> {
        let resource = &mutation.resource;
        let id = &mutation.resource_id;
        let plain = &mutation.snapshot;

        let mut graph = self.graph.lock().await;
        if let Some(object) = graph.object(resource, id) {
            // A placeholder created by an earlier relation edge is fine; an
            // object already matched anywhere is a true duplicate.
            if !object.matched_queries.is_empty() || !object.outgoing.is_empty() {
                match self.duplicate_insert {
                    DuplicateInsert::Drop => {
                        log::debug!("dropping insert for already-tracked object {resource}/{id}");
                        return Ok(());
                    }
                    DuplicateInsert::Error => bail!("object `{resource}/{id}` is already tracked"),
                }
            }
        }

        // Shallow checks run synchronously; deep checks fetch concurrently
        // below and are then gathered.
        let mut matched: Vec<QueryHash> = Vec::new();
        let mut deep: Vec<(QueryHash, Predicate, Include)> = Vec::new();
        for query in graph.queries_on(resource) {
            if is_child_query(query) {
                // Child-query membership is driven by rewiring, never by
                // bare inserts.
                continue;
            }
            match &query.predicate {
                None => matched.push(query.hash.clone()),
                Some(predicate) if predicate.is_shallow() => {
                    if predicate.matches(&self.schema, resource, plain) {
                        matched.push(query.hash.clone());
                    }
                }
                Some(predicate) => deep.push((
                    query.hash.clone(),
                    predicate.clone(),
                    predicate.required_include(),
                )),
            }
        }
        if !deep.is_empty() {
            let checks = deep.into_iter().map(|(hash, predicate, include)| {
                let source = self.source.clone();
                let schema = self.schema.clone();
                async move {
                    let verdict = match source.fetch_by_id(resource, id, include).await {
                        Ok(Some(value)) => {
                            predicate.matches(&schema, resource, &value.infer_plain())
                        }
                        Ok(None) => false,
                        Err(err) => {
                            log::warn!("deep check fetch failed for {resource}/{id}: {err:#}");
                            false
                        }
                    };
                    (hash, verdict)
                }
            });
            let verdicts = join_all(checks).await;
            matched.extend(
                verdicts
                    .into_iter()
                    .filter(|(_, verdict)| *verdict)
                    .map(|(hash, _)| hash),
            );
        }

        self.track_object(&mut graph, resource, id, plain);

        let mut insert_deliveries: Vec<Vec<Arc<dyn Subscriber>>> = Vec::new();
        for hash in matched {
            if let Some(query) = graph.queries.get_mut(&hash) {
                query.matching_ids.insert(id.clone());
                insert_deliveries.push(query.subscribers.clone());
            }
            graph.object_mut(resource, id).matched_queries.insert(hash);
        }

        // A new row can also move related rows in or out of standing queries
        // on other resources (a fresh post makes its author match
        // `users where posts.title == ...`).
        let candidates = self.propagation_candidates(&graph, resource, id, plain, &[]);
        let (synthetic, notify) = self.propagate(&mut graph, mutation, candidates).await;

        let mut notify_deliveries: Vec<Vec<Arc<dyn Subscriber>>> = Vec::new();
        let mut seen: HashSet<QueryHash> = HashSet::new();
        for hash in notify {
            if seen.insert(hash.clone()) {
                if let Some(query) = graph.queries.get(&hash) {
                    notify_deliveries.push(query.subscribers.clone());
                }
            }
        }
        drop(graph);

        let delta = ServerMessage::Mutate {
            id: mutation.id.clone(),
            resource: resource.clone(),
            resource_id: id.clone(),
            procedure: MutationKind::Insert,
            payload: mutation.payload.clone(),
        };
        for subscribers in insert_deliveries {
            deliver(&subscribers, &delta);
        }
        for (subscribers, synthetic_delta) in &synthetic {
            deliver(subscribers, synthetic_delta);
        }
        for subscribers in notify_deliveries {
            deliver(&subscribers, &delta);
        }
        Ok(())
    }

    async fn handle_update(&self, mutation: &RecordMutation) -> Result<()> {
        let resource = &mutation.resource;
        let id = &mutation.resource_id;
        let plain = &mutation.snapshot;

        let mut graph = self.graph.lock().await;
        if graph.object(resource, id).is_none() {
            log::warn!("refusing update for untracked object {resource}/{id}");
            return Ok(());
        }

        // Diff each relational column against the recorded outgoing edge.
        // The payload value wins when the field is present (an explicit null
        // clears the relation); otherwise the snapshot value stands.
        let mut relation_changes: Vec<(Arc<Relation>, Option<String>, Option<String>)> = Vec::new();
        {
            let node = graph.object(resource, id).unwrap();
            for relation in self.schema.relations_of(resource) {
                let col = match relation.local_column() {
                    Some(col) => col,
                    None => continue,
                };
                let new = match mutation.payload.get(col) {
                    Some(field) => field
                        .value
                        .as_scalar()
                        .and_then(|v| v.as_str())
                        .map(str::to_owned),
                    None => plain.get(col).and_then(|v| v.as_str()).map(str::to_owned),
                };
                let old = node.outgoing.get(&relation.name).cloned();
                if old != new {
                    relation_changes.push((relation.clone(), old, new));
                }
            }
        }

        // Same-resource predicate re-evaluation.
        struct Candidate {
            hash: QueryHash,
            matched_before: bool,
            verdict: Option<bool>,
            deep: Option<(Predicate, Include)>,
        }
        let mut candidates: Vec<Candidate> = Vec::new();
        for query in graph.queries_on(resource) {
            let matched_before = query.matching_ids.contains(id);
            let (verdict, deep) = if is_child_query(query) {
                // Membership of child queries is maintained by rewiring;
                // their members still observe the row's changes.
                (Some(matched_before), None)
            } else {
                match &query.predicate {
                    None => (Some(true), None),
                    Some(predicate) if predicate.is_shallow() => {
                        (Some(predicate.matches(&self.schema, resource, plain)), None)
                    }
                    Some(predicate) => {
                        (None, Some((predicate.clone(), predicate.required_include())))
                    }
                }
            };
            candidates.push(Candidate {
                hash: query.hash.clone(),
                matched_before,
                verdict,
                deep,
            });
        }
        for candidate in &mut candidates {
            if let Some((predicate, include)) = candidate.deep.take() {
                let verdict = match self.source.fetch_by_id(resource, id, include).await {
                    Ok(Some(value)) => {
                        predicate.matches(&self.schema, resource, &value.infer_plain())
                    }
                    Ok(None) => false,
                    Err(err) => {
                        log::warn!("deep check fetch failed for {resource}/{id}: {err:#}");
                        candidate.matched_before
                    }
                };
                candidate.verdict = Some(verdict);
            }
        }

        let mut notify: Vec<QueryHash> = Vec::new();
        for candidate in candidates {
            let matches_now = candidate.verdict.unwrap_or(false);
            match (matches_now, candidate.matched_before) {
                (true, false) => {
                    if let Some(query) = graph.queries.get_mut(&candidate.hash) {
                        query.matching_ids.insert(id.clone());
                    }
                    graph
                        .object_mut(resource, id)
                        .matched_queries
                        .insert(candidate.hash.clone());
                    notify.push(candidate.hash);
                }
                (false, true) => {
                    if let Some(query) = graph.queries.get_mut(&candidate.hash) {
                        query.matching_ids.remove(id);
                    }
                    if let Some(object) = graph.objects.get_mut(&(resource.clone(), id.clone())) {
                        object.matched_queries.remove(&candidate.hash);
                    }
                    notify.push(candidate.hash);
                }
                // The row changed while staying a member.
                (true, true) => notify.push(candidate.hash),
                (false, false) => {}
            }
        }

        // Apply the relation diffs to both sides of the edge maps.
        for (relation, _old, new) in &relation_changes {
            graph.set_outgoing(
                resource,
                relation.target(),
                &relation.name,
                id,
                new.as_deref(),
            );
        }

        // Child-query rewiring: a changed relation moves the old target out
        // of each child query keyed on it and synthesizes an INSERT for the
        // new target.
        let mut synthetic: Vec<Delivery> = Vec::new();
        for (relation, old, new) in &relation_changes {
            let child_hashes: Vec<QueryHash> = graph
                .queries_on(resource)
                .flat_map(|query| {
                    query
                        .children_by_relation
                        .get(&relation.name)
                        .into_iter()
                        .flatten()
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .collect();
            for child_hash in child_hashes {
                if let Some(old_id) = old {
                    if let Some(child) = graph.queries.get_mut(&child_hash) {
                        child.matching_ids.remove(old_id);
                    }
                    if let Some(object) = graph
                        .objects
                        .get_mut(&(relation.target().clone(), old_id.clone()))
                    {
                        object.matched_queries.remove(&child_hash);
                    }
                }
                if let Some(new_id) = new {
                    let (child_resource, child_include, subscribers) =
                        match graph.queries.get(&child_hash) {
                            Some(child) => (
                                child.resource.clone(),
                                child.raw.include.clone(),
                                child.subscribers.clone(),
                            ),
                            None => continue,
                        };
                    match self
                        .source
                        .fetch_by_id(&child_resource, new_id, child_include)
                        .await
                    {
                        Ok(Some(value)) => {
                            if let Some(child) = graph.queries.get_mut(&child_hash) {
                                child.matching_ids.insert(new_id.clone());
                            }
                            let child_plain = value.infer_plain();
                            self.track_object(&mut graph, &child_resource, new_id, &child_plain);
                            graph
                                .object_mut(&child_resource, new_id)
                                .matched_queries
                                .insert(child_hash.clone());
                            synthetic.push((
                                subscribers,
                                ServerMessage::Mutate {
                                    id: mutation.id.clone(),
                                    resource: child_resource,
                                    resource_id: new_id.clone(),
                                    procedure: MutationKind::Insert,
                                    payload: value,
                                },
                            ));
                        }
                        Ok(None) => {}
                        Err(err) => {
                            log::warn!("rewire fetch for {child_hash} failed: {err:#}")
                        }
                    }
                }
            }
        }

        // Relational propagation: rows of other resources whose standing
        // queries descend through a relation into this row are re-evaluated.
        let candidates =
            self.propagation_candidates(&graph, resource, id, plain, &relation_changes);
        let (propagated, extra_notify) = self.propagate(&mut graph, mutation, candidates).await;
        synthetic.extend(propagated);
        notify.extend(extra_notify);

        let mut update_deliveries: Vec<Vec<Arc<dyn Subscriber>>> = Vec::new();
        let mut seen: HashSet<QueryHash> = HashSet::new();
        for hash in notify {
            if seen.insert(hash.clone()) {
                if let Some(query) = graph.queries.get(&hash) {
                    update_deliveries.push(query.subscribers.clone());
                }
            }
        }
        drop(graph);

        for (subscribers, delta) in &synthetic {
            deliver(subscribers, delta);
        }
        let delta = ServerMessage::Mutate {
            id: mutation.id.clone(),
            resource: resource.clone(),
            resource_id: id.clone(),
            procedure: MutationKind::Update,
            payload: mutation.payload.clone(),
        };
        for subscribers in update_deliveries {
            deliver(&subscribers, &delta);
        }
        Ok(())
    }

    /// Rows of other resources whose standing queries may change because this
    /// row changed: one hop through `one` relations pointing here (via the
    /// incoming edges) and through `many` relations targeting this resource
    /// (via the row's own foreign keys, old and new).
    fn propagation_candidates(
        &self,
        graph: &Graph,
        resource: &EntityName,
        id: &str,
        snapshot: &JsonValue,
        relation_changes: &[(Arc<Relation>, Option<String>, Option<String>)],
    ) -> Vec<(String, EntityName, Vec<String>)> {
        let mut out: Vec<(String, EntityName, Vec<String>)> = Vec::new();

        if let Some(node) = graph.object(resource, id) {
            for (relation_name, sources) in &node.incoming {
                for (owner, relations) in &self.schema.relations {
                    if let Some(declared) = relations.get(relation_name) {
                        if declared.local_column().is_some() && declared.target() == resource {
                            out.push((
                                relation_name.clone(),
                                owner.clone(),
                                sources.iter().cloned().collect(),
                            ));
                        }
                    }
                }
            }
        }

        for (owner, relations) in &self.schema.relations {
            for declared in relations.values() {
                let foreign = match declared.foreign_column() {
                    Some(foreign) => foreign,
                    None => continue,
                };
                if declared.target() != resource {
                    continue;
                }
                let mut ids: HashSet<String> = HashSet::new();
                if let Some(current) = snapshot.get(foreign).and_then(|v| v.as_str()) {
                    ids.insert(current.to_owned());
                }
                for (changed, old, _new) in relation_changes {
                    if changed.local_column() == Some(foreign) {
                        if let Some(old) = old {
                            ids.insert(old.clone());
                        }
                    }
                }
                if !ids.is_empty() {
                    out.push((
                        declared.name.clone(),
                        owner.clone(),
                        ids.into_iter().collect(),
                    ));
                }
            }
        }
        out
    }

    /// Re-evaluates candidate related rows against the standing queries that
    /// descend through the candidate relation. Entering rows produce a
    /// synthetic INSERT (the full fetched row); leaving and still-matching
    /// rows put their query on the notify list for the original envelope.
    async fn propagate(
        &self,
        graph: &mut Graph,
        mutation: &RecordMutation,
        candidates: Vec<(String, EntityName, Vec<String>)>,
    ) -> (Vec<Delivery>, Vec<QueryHash>) {
        let mut synthetic: Vec<Delivery> = Vec::new();
        let mut notify: Vec<QueryHash> = Vec::new();
        let mut processed: HashSet<(QueryHash, String)> = HashSet::new();

        for (relation_name, source_resource, source_ids) in candidates {
            let interested: Vec<(QueryHash, Predicate, Include)> = graph
                .queries
                .values()
                .filter(|query| query.resource == source_resource)
                .filter(|query| {
                    matches!(&query.predicate, Some(p) if p.references_relation(&relation_name))
                })
                .map(|query| {
                    let predicate = query.predicate.clone().expect("filtered on predicate");
                    let mut include = query.raw.include.clone();
                    include.merge(&predicate.required_include());
                    (query.hash.clone(), predicate, include)
                })
                .collect();
            for (hash, predicate, include) in interested {
                for source_id in &source_ids {
                    if !processed.insert((hash.clone(), source_id.clone())) {
                        continue;
                    }
                    let fetched = match self
                        .source
                        .fetch_by_id(&source_resource, source_id, include.clone())
                        .await
                    {
                        Ok(fetched) => fetched,
                        Err(err) => {
                            log::warn!(
                                "propagation fetch failed for {source_resource}/{source_id}: {err:#}"
                            );
                            continue;
                        }
                    };
                    let matches_now = fetched
                        .as_ref()
                        .map(|value| {
                            predicate.matches(&self.schema, &source_resource, &value.infer_plain())
                        })
                        .unwrap_or(false);
                    let matched_before = graph
                        .queries
                        .get(&hash)
                        .map(|query| query.matching_ids.contains(source_id))
                        .unwrap_or(false);
                    match (matches_now, matched_before) {
                        (true, false) => {
                            if let Some(query) = graph.queries.get_mut(&hash) {
                                query.matching_ids.insert(source_id.clone());
                            }
                            graph
                                .object_mut(&source_resource, source_id)
                                .matched_queries
                                .insert(hash.clone());
                            // The related row also enters any child queries
                            // keyed on the relation it was reached through.
                            seed_children(
                                graph,
                                &hash,
                                &relation_name,
                                &mutation.resource,
                                &mutation.resource_id,
                            );
                            let value = fetched.expect("matched implies fetched");
                            let subscribers = graph
                                .queries
                                .get(&hash)
                                .map(|query| query.subscribers.clone())
                                .unwrap_or_default();
                            synthetic.push((
                                subscribers,
                                ServerMessage::Mutate {
                                    id: mutation.id.clone(),
                                    resource: source_resource.clone(),
                                    resource_id: source_id.clone(),
                                    procedure: MutationKind::Insert,
                                    payload: value,
                                },
                            ));
                        }
                        (false, true) => {
                            if let Some(query) = graph.queries.get_mut(&hash) {
                                query.matching_ids.remove(source_id);
                            }
                            if let Some(object) = graph
                                .objects
                                .get_mut(&(source_resource.clone(), source_id.clone()))
                            {
                                object.matched_queries.remove(&hash);
                            }
                            notify.push(hash.clone());
                        }
                        // Still a member, but a row it relates to changed.
                        (true, true) => notify.push(hash.clone()),
                        (false, false) => {}
                    }
                }
            }
        }
        (synthetic, notify)
    }

    /// Ensures an object node exists and wires both sides of every `one`
    /// relation edge the row carries.
    fn track_object(&self, graph: &mut Graph, resource: &EntityName, id: &str, plain: &JsonValue) {
        graph.object_mut(resource, id);
        for relation in self.schema.relations_of(resource) {
            let col = match relation.local_column() {
                Some(col) => col,
                None => continue,
            };
            let target = plain.get(col).and_then(|v| v.as_str()).map(str::to_owned);
            graph.set_outgoing(
                resource,
                relation.target(),
                &relation.name,
                id,
                target.as_deref(),
            );
        }
    }
}

fn is_child_query(query: &QueryNode) -> bool {
    query.parent_relation.is_some() || !query.parents.is_empty()
}

fn seed_children(
    graph: &mut Graph,
    parent_hash: &QueryHash,
    relation: &str,
    target_resource: &EntityName,
    target_id: &str,
) {
    let children: Vec<QueryHash> = graph
        .queries
        .get(parent_hash)
        .and_then(|parent| parent.children_by_relation.get(relation))
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default();
    for child_hash in children {
        if let Some(child) = graph.queries.get_mut(&child_hash) {
            child.matching_ids.insert(target_id.to_owned());
        }
        graph
            .object_mut(target_resource, target_id)
            .matched_queries
            .insert(child_hash);
    }
}

/// A subscriber error must not stall the engine: log and move on.
fn deliver(subscribers: &[Arc<dyn Subscriber>], delta: &ServerMessage) {
    for subscriber in subscribers {
        if let Err(err) = subscriber.notify(delta) {
            log::error!(
                "subscriber {} failed to take a delta: {err:#}",
                subscriber.subscriber_id()
            );
        }
    }
}
