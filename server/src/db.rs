// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::error::{Error, Result, ResultExt};
use serde_json::Value as JsonValue;
use statelink_datastore::Store;
use statelink_schema::{
    EntityName, Include, MaterializedValue, RawQuery, Sort, Timestamp,
};
use std::sync::Arc;

/// Collection-typed facade over the store, handed to lifecycle hooks and
/// custom mutation handlers. Writes stamp the current instant and run in
/// their own transactions, so their mutations fan out on their own commits.
#[derive(Clone)]
pub struct Db {
    store: Arc<Store>,
}

impl Db {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn collection(&self, resource: &str) -> Collection {
        Collection {
            store: self.store.clone(),
            resource: EntityName::from(resource),
        }
    }
}

pub struct Collection {
    store: Arc<Store>,
    resource: EntityName,
}

impl Collection {
    pub async fn find_by_id(&self, id: &str) -> Result<Option<MaterializedValue>> {
        self.store
            .find_by_id(&self.resource, id, Include::default())
            .await
            .map_err(Error::internal)
    }

    pub async fn get(
        &self,
        where_: Option<JsonValue>,
        include: Include,
        limit: Option<u64>,
        sort: Option<Sort>,
    ) -> Result<Vec<MaterializedValue>> {
        let mut raw = RawQuery::resource(self.resource.as_str()).with_include(include);
        raw.where_ = where_;
        raw.limit = limit;
        raw.sort = sort;
        self.store.get(&raw).await.err_internal()
    }

    /// Inserts a plain record, stamping every field with the current instant.
    pub async fn insert(&self, id: &str, record: JsonValue) -> Result<MaterializedValue> {
        let payload = MaterializedValue::from_plain(&record, &Timestamp::now());
        let outcome = self
            .store
            .insert(&self.resource, id, &payload, None)
            .await
            .err_internal()?;
        Ok(outcome.value)
    }

    /// Updates a plain record, stamping every field with the current instant.
    pub async fn update(&self, id: &str, record: JsonValue) -> Result<MaterializedValue> {
        let payload = MaterializedValue::from_plain(&record, &Timestamp::now());
        let outcome = self
            .store
            .update(&self.resource, id, &payload, None)
            .await
            .err_internal()?;
        Ok(outcome.value)
    }
}
