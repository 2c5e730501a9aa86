use crate::store::{ClientStore, QueryBuilder};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use statelink_schema::EntityName;

/// What a custom-mutation handler recorded through the proxy. The log is
/// applied to the overlay only after the handler returns successfully; its
/// inverses become the rollback.
#[derive(Debug, Clone)]
pub(crate) enum ProxyOp {
    Insert {
        resource: EntityName,
        id: String,
        record: JsonValue,
    },
    Update {
        resource: EntityName,
        id: String,
        record: JsonValue,
    },
}

/// The storage surface handed to optimistic custom-mutation handlers:
/// synchronous reads against the current optimistic overlay, and writes that
/// collect into an operation log instead of mutating anything. A handler
/// that returns an error leaves no trace.
pub struct OptimisticProxy<'a> {
    store: &'a ClientStore,
    ops: Mutex<Vec<ProxyOp>>,
}

impl<'a> OptimisticProxy<'a> {
    pub(crate) fn new(store: &'a ClientStore) -> Self {
        Self {
            store,
            ops: Mutex::new(Vec::new()),
        }
    }

    /// One record by id, with the overlay applied.
    pub fn one(&self, resource: &str, id: &str) -> Option<JsonValue> {
        self.store
            .assemble(&EntityName::from(resource), id, &Default::default())
    }

    /// Filtered read; `get`/`include` live on the returned builder.
    pub fn where_(&self, resource: &str, where_: JsonValue) -> QueryBuilder<'a> {
        QueryBuilder::new(self.store, resource).where_(where_)
    }

    pub fn query(&self, resource: &str) -> QueryBuilder<'a> {
        QueryBuilder::new(self.store, resource)
    }

    pub fn insert(&self, resource: &str, id: &str, record: JsonValue) {
        self.ops.lock().push(ProxyOp::Insert {
            resource: EntityName::from(resource),
            id: id.to_owned(),
            record,
        });
    }

    pub fn update(&self, resource: &str, id: &str, record: JsonValue) {
        self.ops.lock().push(ProxyOp::Update {
            resource: EntityName::from(resource),
            id: id.to_owned(),
            record,
        });
    }

    pub(crate) fn into_ops(self) -> Vec<ProxyOp> {
        self.ops.into_inner()
    }
}
