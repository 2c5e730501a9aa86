use crate::store::{ClientStore, Key};
use statelink_schema::{EntityName, MaterializedValue};

/// One inverse step of an optimistic mutation. Rolling a mutation back means
/// applying its inverse log in reverse order.
#[derive(Debug, Clone)]
pub(crate) enum InverseOp {
    /// Undo a speculative insert: the key had no overlay state before.
    Remove(Key),
    /// Undo a speculative update: restore the previous overlay state, or
    /// clear the shadow if the overlay had none.
    Restore(Key, Option<MaterializedValue>),
}

impl ClientStore {
    /// Speculatively inserts a record under `mutation_id`.
    pub fn apply_optimistic_insert(
        &self,
        mutation_id: &str,
        resource: &EntityName,
        id: &str,
        value: MaterializedValue,
    ) {
        let mut inner = self.inner.lock();
        let key = (resource.clone(), id.to_owned());
        inner
            .inverses
            .entry(mutation_id.to_owned())
            .or_default()
            .push(InverseOp::Remove(key.clone()));
        inner.overlay.insert(key, value);
    }

    /// Speculatively overwrites fields of a record under `mutation_id`; the
    /// base is the current effective state of the record.
    pub fn apply_optimistic_update(
        &self,
        mutation_id: &str,
        resource: &EntityName,
        id: &str,
        fields: &MaterializedValue,
    ) {
        let mut inner = self.inner.lock();
        let key = (resource.clone(), id.to_owned());
        let previous = inner.overlay.get(&key).cloned();
        let mut next = previous
            .clone()
            .or_else(|| inner.canonical.get(&key).cloned())
            .unwrap_or_default();
        for (name, field) in fields.iter() {
            next.set(name, field.clone());
        }
        inner
            .inverses
            .entry(mutation_id.to_owned())
            .or_default()
            .push(InverseOp::Restore(key.clone(), previous));
        inner.overlay.insert(key, next);
    }

    /// Undoes everything `mutation_id` applied, in reverse order. Returns
    /// whether there was anything to undo.
    pub fn rollback(&self, mutation_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let inverses = match inner.inverses.remove(mutation_id) {
            Some(inverses) => inverses,
            None => return false,
        };
        let had_any = !inverses.is_empty();
        for inverse in inverses.into_iter().rev() {
            match inverse {
                InverseOp::Remove(key) => {
                    inner.overlay.remove(&key);
                }
                InverseOp::Restore(key, Some(previous)) => {
                    inner.overlay.insert(key, previous);
                }
                InverseOp::Restore(key, None) => {
                    inner.overlay.remove(&key);
                }
            }
        }
        had_any
    }

    /// Confirms `mutation_id`: its overlay contribution is discarded (the
    /// canonical layer is authoritative from here on), except where another
    /// in-flight mutation still shadows the same record.
    pub fn confirm(&self, mutation_id: &str) {
        let mut inner = self.inner.lock();
        let confirmed = match inner.inverses.remove(mutation_id) {
            Some(confirmed) => confirmed,
            None => return,
        };
        for inverse in confirmed {
            let key = match inverse {
                InverseOp::Remove(key) | InverseOp::Restore(key, _) => key,
            };
            let still_shadowed = inner.inverses.values().flatten().any(|other| match other {
                InverseOp::Remove(other_key) | InverseOp::Restore(other_key, _) => *other_key == key,
            });
            if !still_shadowed {
                inner.overlay.remove(&key);
            }
        }
    }

    /// True iff `mutation_id` still contributes to the overlay.
    pub fn has_overlay(&self, mutation_id: &str) -> bool {
        self.inner.lock().inverses.contains_key(mutation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use statelink_schema::{Entity, EntityField, FieldType, Schema, Timestamp};
    use std::sync::Arc;

    fn store() -> ClientStore {
        let schema = Schema::new(vec![Entity::new(
            "posts",
            vec![
                EntityField::new("id", FieldType::Id),
                EntityField::new("title", FieldType::String).nullable(),
            ],
        )])
        .unwrap();
        ClientStore::new(Arc::new(schema))
    }

    fn stamped(fields: serde_json::Value) -> MaterializedValue {
        MaterializedValue::from_plain(&fields, &Timestamp::from("1"))
    }

    #[test]
    fn test_rollback_removes_speculative_insert() {
        let store = store();
        let posts = EntityName::from("posts");
        store.apply_optimistic_insert("m1", &posts, "p1", stamped(json!({"id": "p1", "title": "T"})));
        assert!(store.effective(&posts, "p1").is_some());

        assert!(store.rollback("m1"));
        assert!(store.effective(&posts, "p1").is_none());
        assert!(!store.has_overlay("m1"));
    }

    #[test]
    fn test_rollback_restores_previous_update_state() {
        let store = store();
        let posts = EntityName::from("posts");
        store.apply_canonical(&posts, "p1", &stamped(json!({"id": "p1", "title": "old"})));
        store.apply_optimistic_update("m1", &posts, "p1", &stamped(json!({"title": "new"})));
        assert_eq!(
            store.effective(&posts, "p1").unwrap().infer_plain()["title"],
            json!("new")
        );

        store.rollback("m1");
        assert_eq!(
            store.effective(&posts, "p1").unwrap().infer_plain()["title"],
            json!("old")
        );
    }

    #[test]
    fn test_confirm_clears_overlay_contribution() {
        let store = store();
        let posts = EntityName::from("posts");
        store.apply_optimistic_insert("m1", &posts, "p1", stamped(json!({"id": "p1", "title": "T"})));
        store.apply_canonical(&posts, "p1", &stamped(json!({"id": "p1", "title": "T"})));

        store.confirm("m1");
        assert!(!store.has_overlay("m1"));
        // The record survives through the canonical layer.
        assert!(store.effective(&posts, "p1").is_some());
    }

    #[test]
    fn test_overlapping_mutations_keep_shared_shadow() {
        let store = store();
        let posts = EntityName::from("posts");
        store.apply_optimistic_insert("m1", &posts, "p1", stamped(json!({"id": "p1", "title": "a"})));
        store.apply_optimistic_update("m2", &posts, "p1", &stamped(json!({"title": "b"})));

        store.confirm("m1");
        // m2 still shadows the record.
        assert_eq!(
            store.effective(&posts, "p1").unwrap().infer_plain()["title"],
            json!("b")
        );
        store.rollback("m2");
    }
}
