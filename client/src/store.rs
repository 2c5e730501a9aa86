use crate::overlay::InverseOp;
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use statelink_schema::{
    EntityName, Include, MaterializedValue, Predicate, Schema, Timestamp,
};
use std::collections::HashMap;
use std::sync::Arc;

pub(crate) type Key = (EntityName, String);

pub(crate) struct StoreInner {
    /// What the server has confirmed, merged per field by timestamp.
    pub canonical: HashMap<Key, MaterializedValue>,
    /// Speculative record states shadowing the canonical ones.
    pub overlay: HashMap<Key, MaterializedValue>,
    /// Inverse operations per in-flight mutation id; applying them in
    /// reverse undoes that mutation's overlay contribution.
    pub inverses: HashMap<String, Vec<InverseOp>>,
}

/// The client's in-memory relational store: the canonical layer fed by
/// server replies and live deltas, plus the optimistic overlay. Reads always
/// see the overlay where it shadows.
pub struct ClientStore {
    schema: Arc<Schema>,
    pub(crate) inner: Mutex<StoreInner>,
}

impl ClientStore {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            inner: Mutex::new(StoreInner {
                canonical: HashMap::new(),
                overlay: HashMap::new(),
                inverses: HashMap::new(),
            }),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Applies a confirmed record (REPLY data or a live delta) to the
    /// canonical layer, merging per field by timestamp so a stale delta
    /// never clobbers a newer field.
    pub fn apply_canonical(&self, resource: &EntityName, id: &str, payload: &MaterializedValue) {
        let mut inner = self.inner.lock();
        let entry = inner
            .canonical
            .entry((resource.clone(), id.to_owned()))
            .or_default();
        for (name, field) in payload.iter() {
            if name == "id" {
                entry.set(name, field.clone());
                continue;
            }
            let newer = match (field.timestamp(), entry.timestamp_of(name)) {
                (Some(incoming), Some(stored)) => incoming > stored,
                _ => true,
            };
            if newer {
                entry.set(name, field.clone());
            }
        }
    }

    /// The record as reads see it: overlay first, canonical otherwise.
    pub fn effective(&self, resource: &EntityName, id: &str) -> Option<MaterializedValue> {
        let inner = self.inner.lock();
        let key = (resource.clone(), id.to_owned());
        inner
            .overlay
            .get(&key)
            .or_else(|| inner.canonical.get(&key))
            .cloned()
    }

    pub fn ids_of(&self, resource: &EntityName) -> Vec<String> {
        let inner = self.inner.lock();
        let mut ids: Vec<String> = Vec::new();
        for (entity, id) in inner.canonical.keys().chain(inner.overlay.keys()) {
            if entity == resource && !ids.iter().any(|existing| existing == id) {
                ids.push(id.clone());
            }
        }
        ids
    }

    /// Assembles the plain form of a record together with its included
    /// relations, resolved against the effective store state.
    pub fn assemble(
        &self,
        resource: &EntityName,
        id: &str,
        include: &Include,
    ) -> Option<JsonValue> {
        let record = self.effective(resource, id)?;
        let mut plain = record.infer_plain();
        for (relation_name, nested) in include.iter() {
            let relation = match self.schema.relation(resource, relation_name) {
                Some(relation) => relation.clone(),
                None => continue,
            };
            let value = if let Some(local) = relation.local_column() {
                match plain.get(local).and_then(|v| v.as_str()) {
                    Some(target_id) => self
                        .assemble(relation.target(), target_id, &nested)
                        .unwrap_or(JsonValue::Null),
                    None => JsonValue::Null,
                }
            } else {
                let foreign = relation.foreign_column().expect("relation is one or many");
                let mut related = Vec::new();
                for target_id in self.ids_of(relation.target()) {
                    let points_here = self
                        .effective(relation.target(), &target_id)
                        .map(|r| {
                            r.get(foreign)
                                .and_then(|f| f.value.as_scalar())
                                .and_then(|v| v.as_str())
                            == Some(id)
                        })
                        .unwrap_or(false);
                    if points_here {
                        if let Some(assembled) =
                            self.assemble(relation.target(), &target_id, &nested)
                        {
                            related.push(assembled);
                        }
                    }
                }
                JsonValue::Array(related)
            };
            if let JsonValue::Object(fields) = &mut plain {
                fields.insert(relation_name.clone(), value);
            }
        }
        Some(plain)
    }
}

/// Synchronous query surface over the local store.
pub struct QueryBuilder<'a> {
    store: &'a ClientStore,
    resource: EntityName,
    where_: Option<JsonValue>,
    include: Include,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(store: &'a ClientStore, resource: &str) -> Self {
        Self {
            store,
            resource: EntityName::from(resource),
            where_: None,
            include: Include::default(),
        }
    }

    pub fn where_(mut self, where_: JsonValue) -> Self {
        self.where_ = Some(where_);
        self
    }

    pub fn include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }

    pub fn one(self, id: &str) -> OneQuery<'a> {
        OneQuery {
            store: self.store,
            resource: self.resource,
            include: self.include,
            id: id.to_owned(),
        }
    }

    pub fn get(self) -> Result<Vec<JsonValue>> {
        let predicate = match &self.where_ {
            Some(raw) => Some(Predicate::parse(
                self.store.schema(),
                &self.resource,
                raw,
            )?),
            None => None,
        };
        let mut needed = self.include.clone();
        if let Some(predicate) = &predicate {
            needed.merge(&predicate.required_include());
        }
        let mut out = Vec::new();
        for id in self.store.ids_of(&self.resource) {
            let assembled = match self.store.assemble(&self.resource, &id, &needed) {
                Some(assembled) => assembled,
                None => continue,
            };
            let matches = predicate
                .as_ref()
                .map(|p| p.matches(self.store.schema(), &self.resource, &assembled))
                .unwrap_or(true);
            if matches {
                // Project with the requested include only.
                if let Some(projected) = self.store.assemble(&self.resource, &id, &self.include) {
                    out.push(projected);
                }
            }
        }
        Ok(out)
    }
}

pub struct OneQuery<'a> {
    store: &'a ClientStore,
    resource: EntityName,
    include: Include,
    id: String,
}

impl OneQuery<'_> {
    pub fn get(&self) -> Option<JsonValue> {
        self.store.assemble(&self.resource, &self.id, &self.include)
    }
}

/// Stamps a plain record into a materialized payload at one instant; what
/// the generic mutators and the optimistic proxy write with.
pub fn stamp(record: &JsonValue) -> (MaterializedValue, Timestamp) {
    let now = Timestamp::now();
    (MaterializedValue::from_plain(record, &now), now)
}
