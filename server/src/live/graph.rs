// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use statelink_proto::ServerMessage;
use statelink_schema::{EntityName, Predicate, QueryHash, RawQuery};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Receives deltas for the standing queries it subscribed to. Notifications
/// for one subscriber arrive in the order their triggering mutations
/// committed; a failing subscriber is logged and skipped, never retried.
pub trait Subscriber: Send + Sync {
    fn subscriber_id(&self) -> u64;
    fn notify(&self, delta: &ServerMessage) -> anyhow::Result<()>;
}

/// A registered standing query.
pub struct QueryNode {
    pub hash: QueryHash,
    pub raw: RawQuery,
    pub resource: EntityName,
    /// Parsed once at registration; `None` means the query matches
    /// unconditionally.
    pub predicate: Option<Predicate>,
    pub matching_ids: HashSet<String>,
    pub subscribers: Vec<Arc<dyn Subscriber>>,
    pub parents: HashSet<QueryHash>,
    pub parent_relation: Option<String>,
    pub children_by_relation: HashMap<String, HashSet<QueryHash>>,
}

/// Just enough metadata about one observed row to re-evaluate predicates and
/// rewire relational joins: which queries it matches and both directions of
/// its relation edges.
#[derive(Debug, Default)]
pub struct ObjectNode {
    pub id: String,
    pub resource: EntityName,
    pub matched_queries: HashSet<QueryHash>,
    /// relation name → target id, for `one` relations owned by this row.
    pub outgoing: HashMap<String, String>,
    /// relation name → ids of rows pointing at this one through that
    /// relation.
    pub incoming: HashMap<String, HashSet<String>>,
}

pub type ObjectKey = (EntityName, String);

#[derive(Default)]
pub struct Graph {
    pub queries: HashMap<QueryHash, QueryNode>,
    pub by_resource: HashMap<EntityName, HashSet<QueryHash>>,
    pub objects: HashMap<ObjectKey, ObjectNode>,
}

impl Graph {
    pub fn object_mut(&mut self, resource: &EntityName, id: &str) -> &mut ObjectNode {
        self.objects
            .entry((resource.clone(), id.to_owned()))
            .or_insert_with(|| ObjectNode {
                id: id.to_owned(),
                resource: resource.clone(),
                ..Default::default()
            })
    }

    pub fn object(&self, resource: &EntityName, id: &str) -> Option<&ObjectNode> {
        self.objects.get(&(resource.clone(), id.to_owned()))
    }

    pub fn queries_on<'a>(&'a self, resource: &EntityName) -> impl Iterator<Item = &'a QueryNode> {
        self.by_resource
            .get(resource)
            .into_iter()
            .flatten()
            .filter_map(|hash| self.queries.get(hash))
    }

    /// Points `source` (a row of `source_resource`) at `new_target` through
    /// `relation`, maintaining both sides of the edge. Returns the previous
    /// target.
    pub fn set_outgoing(
        &mut self,
        source_resource: &EntityName,
        target_resource: &EntityName,
        relation: &str,
        source_id: &str,
        new_target: Option<&str>,
    ) -> Option<String> {
        let old = {
            let node = self.object_mut(source_resource, source_id);
            match new_target {
                Some(target) => node.outgoing.insert(relation.to_owned(), target.to_owned()),
                None => node.outgoing.remove(relation),
            }
        };
        if old.as_deref() == new_target {
            return old;
        }
        if let Some(old_target) = &old {
            if let Some(target_node) = self
                .objects
                .get_mut(&(target_resource.clone(), old_target.clone()))
            {
                if let Some(sources) = target_node.incoming.get_mut(relation) {
                    sources.remove(source_id);
                }
            }
        }
        if let Some(new_target) = new_target {
            self.object_mut(target_resource, new_target)
                .incoming
                .entry(relation.to_owned())
                .or_default()
                .insert(source_id.to_owned());
        }
        old
    }

    /// Drops a query node, severing parent and child edges in both directions
    /// and clearing the membership marks on its objects.
    pub fn prune_query(&mut self, hash: &QueryHash) {
        let node = match self.queries.remove(hash) {
            Some(node) => node,
            None => return,
        };
        if let Some(set) = self.by_resource.get_mut(&node.resource) {
            set.remove(hash);
            if set.is_empty() {
                self.by_resource.remove(&node.resource);
            }
        }
        for parent in &node.parents {
            if let Some(parent_node) = self.queries.get_mut(parent) {
                for children in parent_node.children_by_relation.values_mut() {
                    children.remove(hash);
                }
            }
        }
        for children in node.children_by_relation.values() {
            for child in children {
                if let Some(child_node) = self.queries.get_mut(child) {
                    child_node.parents.remove(hash);
                }
            }
        }
        for id in &node.matching_ids {
            if let Some(object) = self.objects.get_mut(&(node.resource.clone(), id.clone())) {
                object.matched_queries.remove(hash);
            }
        }
    }
}
