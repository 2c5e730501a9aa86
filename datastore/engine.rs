// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::conn::{DbConnection, Kind};
use crate::layout::Layout;
use crate::mutation::{MutationOp, MutationSink};
use crate::select::{self, SelectPlan};
use crate::transaction::StoreTxn;
use crate::write::{self, WriteOutcome};
use crate::{init, materialize};
use anyhow::Result;
use statelink_schema::{
    query::validate_include, EntityName, Include, MaterializedValue, RawQuery, Schema,
};
use std::sync::{Arc, RwLock};

/// The storage engine facade.
///
/// Owns the connection pool and the layout derived from the schema. All
/// writes go through a [`StoreTxn`]; `insert`/`update` open and commit one
/// when the caller has no transaction of its own. Committed mutations drain
/// to the registered sink in commit order.
pub struct Store {
    conn: DbConnection,
    layout: Layout,
    sink: RwLock<Option<Arc<dyn MutationSink>>>,
}

impl Store {
    pub fn new(conn: DbConnection, schema: Arc<Schema>) -> Store {
        Store {
            layout: Layout::of(schema),
            conn,
            sink: RwLock::new(None),
        }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.layout.schema
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn kind(&self) -> Kind {
        self.conn.kind()
    }

    /// Registers the subscriber notifier fed on every commit.
    pub fn set_sink(&self, sink: Arc<dyn MutationSink>) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub async fn init(&self) -> Result<()> {
        init::init(&self.conn, &self.layout).await
    }

    pub async fn begin(&self) -> Result<StoreTxn> {
        Ok(StoreTxn::new(self.conn.pool.begin().await?))
    }

    /// Commits and fans the buffered mutations out to the sink, exactly once
    /// per mutation, only after the transaction is durable.
    pub async fn commit(&self, txn: StoreTxn) -> Result<()> {
        let (txn, mutations) = txn.into_parts();
        txn.commit().await?;
        let sink = self.sink.read().unwrap().clone();
        if let Some(sink) = sink {
            for mutation in mutations {
                sink.publish(mutation);
            }
        }
        Ok(())
    }

    /// Rolls back; buffered mutations are discarded so no fan-out occurs.
    pub async fn rollback(&self, txn: StoreTxn) -> Result<()> {
        let (txn, _discarded) = txn.into_parts();
        txn.rollback().await?;
        Ok(())
    }

    fn plan(&self, raw: &RawQuery) -> Result<SelectPlan> {
        validate_include(&self.layout.schema, &raw.resource, &raw.include)?;
        let predicate = raw.parse_where(&self.layout.schema)?;
        select::build_select(&self.layout, self.kind(), raw, predicate.as_ref())
    }

    /// Runs a query against the pool, projecting materialized values.
    pub async fn get(&self, raw: &RawQuery) -> Result<Vec<MaterializedValue>> {
        let plan = self.plan(raw)?;
        let mut query = sqlx::query(&plan.sql);
        for param in &plan.params {
            query = write::bind_param(query, param);
        }
        let rows = query.fetch_all(&self.conn.pool).await?;
        materialize::decode_rows(&self.layout, &plan, &rows)
    }

    /// Same as [`Store::get`], inside an open transaction.
    pub async fn get_in(
        &self,
        txn: &mut StoreTxn,
        raw: &RawQuery,
    ) -> Result<Vec<MaterializedValue>> {
        let plan = self.plan(raw)?;
        let mut query = sqlx::query(&plan.sql);
        for param in &plan.params {
            query = write::bind_param(query, param);
        }
        let rows = query.fetch_all(&mut txn.txn).await?;
        materialize::decode_rows(&self.layout, &plan, &rows)
    }

    pub async fn find_by_id(
        &self,
        resource: &EntityName,
        id: &str,
        include: Include,
    ) -> Result<Option<MaterializedValue>> {
        let raw = RawQuery::by_id(resource, id, include);
        Ok(self.get(&raw).await?.into_iter().next())
    }

    pub async fn find_by_id_in(
        &self,
        txn: &mut StoreTxn,
        resource: &EntityName,
        id: &str,
        include: Include,
    ) -> Result<Option<MaterializedValue>> {
        let raw = RawQuery::by_id(resource, id, include);
        Ok(self.get_in(txn, &raw).await?.into_iter().next())
    }

    pub async fn insert_in(
        &self,
        txn: &mut StoreTxn,
        resource: &EntityName,
        id: &str,
        payload: &MaterializedValue,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome> {
        write::write_row(
            &self.layout,
            self.kind(),
            txn,
            MutationOp::Insert,
            resource,
            id,
            payload,
            mutation_id,
        )
        .await
    }

    pub async fn update_in(
        &self,
        txn: &mut StoreTxn,
        resource: &EntityName,
        id: &str,
        payload: &MaterializedValue,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome> {
        write::write_row(
            &self.layout,
            self.kind(),
            txn,
            MutationOp::Update,
            resource,
            id,
            payload,
            mutation_id,
        )
        .await
    }

    /// Single-statement insert in its own transaction.
    pub async fn insert(
        &self,
        resource: &EntityName,
        id: &str,
        payload: &MaterializedValue,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome> {
        let mut txn = self.begin().await?;
        match self
            .insert_in(&mut txn, resource, id, payload, mutation_id)
            .await
        {
            Ok(outcome) => {
                self.commit(txn).await?;
                Ok(outcome)
            }
            Err(err) => {
                self.rollback(txn).await.ok();
                Err(err)
            }
        }
    }

    /// Single-statement update in its own transaction.
    pub async fn update(
        &self,
        resource: &EntityName,
        id: &str,
        payload: &MaterializedValue,
        mutation_id: Option<String>,
    ) -> Result<WriteOutcome> {
        let mut txn = self.begin().await?;
        match self
            .update_in(&mut txn, resource, id, payload, mutation_id)
            .await
        {
            Ok(outcome) => {
                self.commit(txn).await?;
                Ok(outcome)
            }
            Err(err) => {
                self.rollback(txn).await.ok();
                Err(err)
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::mutation::RecordMutation;
    use serde_json::json;
    use statelink_schema::{Entity, EntityField, FieldType, Relation, Timestamp};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    pub fn test_schema() -> Arc<Schema> {
        let mut schema = Schema::new(vec![
            Entity::new(
                "users",
                vec![
                    EntityField::new("id", FieldType::Id),
                    EntityField::new("name", FieldType::String).nullable(),
                    EntityField::new("age", FieldType::Number).nullable(),
                ],
            ),
            Entity::new(
                "posts",
                vec![
                    EntityField::new("id", FieldType::Id),
                    EntityField::new("title", FieldType::String).nullable(),
                    EntityField::new("authorId", FieldType::Ref("users".into())).nullable(),
                ],
            ),
            Entity::new(
                "metrics",
                vec![
                    EntityField::new("id", FieldType::Id),
                    EntityField::new("flag", FieldType::Boolean).nullable(),
                    EntityField::new("score", FieldType::Number).nullable(),
                    EntityField::new("payload", FieldType::Json).nullable(),
                    EntityField::new("at", FieldType::Date).nullable(),
                    EntityField::new("level", FieldType::Enum("severity".into())).nullable(),
                ],
            ),
        ])
        .unwrap();
        schema.add_enum(statelink_schema::EnumType {
            name: "severity".into(),
            variants: vec!["low".into(), "high".into()],
        });
        schema
            .add_relation("posts", Relation::one("author", "users", "authorId"))
            .unwrap();
        schema
            .add_relation("users", Relation::many("posts", "posts", "authorId"))
            .unwrap();
        Arc::new(schema)
    }

    #[derive(Default)]
    pub struct CollectingSink {
        pub mutations: Mutex<Vec<RecordMutation>>,
    }

    impl MutationSink for CollectingSink {
        fn publish(&self, mutation: RecordMutation) {
            self.mutations.lock().unwrap().push(mutation);
        }
    }

    pub async fn setup_store() -> (Arc<Store>, Arc<CollectingSink>, NamedTempFile) {
        let db_file = NamedTempFile::new().unwrap();
        let db_uri = format!("sqlite://{}?mode=rwc", db_file.path().to_string_lossy());
        let conn = DbConnection::connect(&db_uri, 1).await.unwrap();
        let store = Arc::new(Store::new(conn, test_schema()));
        store.init().await.unwrap();
        let sink = Arc::new(CollectingSink::default());
        store.set_sink(sink.clone());
        (store, sink, db_file)
    }

    pub fn payload(fields: serde_json::Value, ts: &str) -> MaterializedValue {
        MaterializedValue::from_plain(&fields, &Timestamp::from(ts))
    }

    #[tokio::test]
    async fn test_insert_projects_meta() {
        let (store, _sink, _db) = setup_store().await;
        store
            .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "A"}), "2"), None)
            .await
            .unwrap();

        let row = store
            .find_by_id(&"users".into(), "u1", Include::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.id(), Some("u1"));
        assert_eq!(row.infer_plain()["name"], json!("A"));
        assert_eq!(row.timestamp_of("name"), Some(&Timestamp::from("2")));
        // Never-written fields carry no meta.
        assert_eq!(row.timestamp_of("age"), None);
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected_per_field() {
        let (store, sink, _db) = setup_store().await;
        store
            .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "A"}), "2"), None)
            .await
            .unwrap();

        let outcome = store
            .update(&"users".into(), "u1", &payload(json!({"name": "B"}), "1"), None)
            .await
            .unwrap();
        assert!(outcome.accepted.is_empty());

        let row = store
            .find_by_id(&"users".into(), "u1", Include::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.infer_plain()["name"], json!("A"));
        assert_eq!(row.timestamp_of("name"), Some(&Timestamp::from("2")));
        // The losing write produced no fan-out.
        assert_eq!(sink.mutations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_newer_field_wins_and_meta_advances() {
        let (store, sink, _db) = setup_store().await;
        store
            .insert(
                &"users".into(),
                "u1",
                &payload(json!({"id": "u1", "name": "A", "age": 30}), "2"),
                None,
            )
            .await
            .unwrap();

        let outcome = store
            .update(
                &"users".into(),
                "u1",
                &payload(json!({"name": "B", "age": 31}), "3"),
                None,
            )
            .await
            .unwrap();
        // Payload field order follows the JSON object's (sorted) key order.
        assert_eq!(outcome.accepted, vec!["age".to_owned(), "name".to_owned()]);

        let row = store
            .find_by_id(&"users".into(), "u1", Include::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.infer_plain()["name"], json!("B"));
        assert_eq!(row.timestamp_of("name"), Some(&Timestamp::from("3")));

        let mutations = sink.mutations.lock().unwrap();
        assert_eq!(mutations.len(), 2);
        // The update envelope carries only accepted fields plus the id.
        let update = &mutations[1];
        assert!(update.payload.get("name").is_some());
        assert!(update.payload.get("id").is_some());
        assert_eq!(update.snapshot["name"], json!("B"));
    }

    #[tokio::test]
    async fn test_include_one_and_many() {
        let (store, _sink, _db) = setup_store().await;
        store
            .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "John"}), "1"), None)
            .await
            .unwrap();
        for (id, title) in [("p1", "first"), ("p2", "second")] {
            store
                .insert(
                    &"posts".into(),
                    id,
                    &payload(json!({"id": id, "title": title, "authorId": "u1"}), "1"),
                    None,
                )
                .await
                .unwrap();
        }
        store
            .insert(
                &"posts".into(),
                "p3",
                &payload(json!({"id": "p3", "title": "orphan", "authorId": null}), "1"),
                None,
            )
            .await
            .unwrap();

        let posts = store
            .get(&RawQuery::resource("posts")
                .with_include(Include::leaf("author"))
                .with_sort("id", true))
            .await
            .unwrap();
        assert_eq!(posts.len(), 3);
        let author = posts[0].get("author").unwrap();
        match &author.value {
            statelink_schema::MaterializedNode::Record(record) => {
                assert_eq!(record.infer_plain()["name"], json!("John"));
            }
            other => panic!("expected a record, got {other:?}"),
        }
        // Null foreign key materializes as a null relation.
        assert_eq!(
            posts[2].get("author").unwrap().value,
            statelink_schema::MaterializedNode::Scalar(json!(null))
        );

        let users = store
            .get(&RawQuery::resource("users").with_include(Include::leaf("posts")))
            .await
            .unwrap();
        match &users[0].get("posts").unwrap().value {
            statelink_schema::MaterializedNode::Records(records) => {
                assert_eq!(records.len(), 2);
            }
            other => panic!("expected records, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_relational_where_descends() {
        let (store, _sink, _db) = setup_store().await;
        store
            .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "John"}), "1"), None)
            .await
            .unwrap();
        store
            .insert(&"users".into(), "u2", &payload(json!({"id": "u2", "name": "Jane"}), "1"), None)
            .await
            .unwrap();
        store
            .insert(
                &"posts".into(),
                "p1",
                &payload(json!({"id": "p1", "title": "a", "authorId": "u1"}), "1"),
                None,
            )
            .await
            .unwrap();
        store
            .insert(
                &"posts".into(),
                "p2",
                &payload(json!({"id": "p2", "title": "b", "authorId": "u2"}), "1"),
                None,
            )
            .await
            .unwrap();

        let johns = store
            .get(&RawQuery::resource("posts").with_where(json!({"author": {"name": "John"}})))
            .await
            .unwrap();
        assert_eq!(johns.len(), 1);
        assert_eq!(johns[0].id(), Some("p1"));

        let authors = store
            .get(&RawQuery::resource("users").with_where(json!({"posts": {"title": "b"}})))
            .await
            .unwrap();
        assert_eq!(authors.len(), 1);
        assert_eq!(authors[0].id(), Some("u2"));
    }

    #[tokio::test]
    async fn test_rollback_discards_buffered_mutations() {
        let (store, sink, _db) = setup_store().await;
        let mut txn = store.begin().await.unwrap();
        store
            .insert_in(
                &mut txn,
                &"users".into(),
                "u1",
                &payload(json!({"id": "u1", "name": "A"}), "1"),
                None,
            )
            .await
            .unwrap();
        store.rollback(txn).await.unwrap();

        assert!(sink.mutations.lock().unwrap().is_empty());
        assert!(store
            .find_by_id(&"users".into(), "u1", Include::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_nested_rollback_keeps_outer_work() {
        let (store, sink, _db) = setup_store().await;
        let mut txn = store.begin().await.unwrap();
        store
            .insert_in(
                &mut txn,
                &"users".into(),
                "u1",
                &payload(json!({"id": "u1", "name": "A"}), "1"),
                None,
            )
            .await
            .unwrap();

        txn.begin_nested().await.unwrap();
        store
            .insert_in(
                &mut txn,
                &"users".into(),
                "u2",
                &payload(json!({"id": "u2", "name": "B"}), "1"),
                None,
            )
            .await
            .unwrap();
        txn.rollback_nested().await.unwrap();

        store.commit(txn).await.unwrap();

        let mutations = sink.mutations.lock().unwrap();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].resource_id, "u1");
        drop(mutations);

        assert!(store
            .find_by_id(&"users".into(), "u2", Include::default())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_nested_commit_propagates_into_outer_stack() {
        let (store, sink, _db) = setup_store().await;
        let mut txn = store.begin().await.unwrap();
        txn.begin_nested().await.unwrap();
        store
            .insert_in(
                &mut txn,
                &"users".into(),
                "u1",
                &payload(json!({"id": "u1", "name": "A"}), "1"),
                None,
            )
            .await
            .unwrap();
        txn.commit_nested().await.unwrap();
        // Nothing published until the outer transaction commits.
        assert!(sink.mutations.lock().unwrap().is_empty());

        store.commit(txn).await.unwrap();
        assert_eq!(sink.mutations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_last_synced_at_watermark() {
        let (store, _sink, _db) = setup_store().await;
        store
            .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "A"}), "1"), None)
            .await
            .unwrap();
        store
            .insert(&"users".into(), "u2", &payload(json!({"id": "u2", "name": "B"}), "3"), None)
            .await
            .unwrap();

        let mut raw = RawQuery::resource("users");
        raw.last_synced_at = Some("2".into());
        let fresh = store.get(&raw).await.unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].id(), Some("u2"));
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let (store, _sink, _db) = setup_store().await;
        // A second init against the same database must be a no-op.
        store.init().await.unwrap();
    }

    #[tokio::test]
    async fn test_typed_columns_round_trip() {
        let (store, _sink, _db) = setup_store().await;
        store
            .insert(
                &"metrics".into(),
                "m1",
                &payload(
                    json!({
                        "id": "m1",
                        "flag": true,
                        "score": 12.5,
                        "payload": {"nested": [1, 2, 3]},
                        "at": "2024-06-01T00:00:00Z",
                        "level": "high",
                    }),
                    "1",
                ),
                None,
            )
            .await
            .unwrap();

        let row = store
            .find_by_id(&"metrics".into(), "m1", Include::default())
            .await
            .unwrap()
            .unwrap();
        let plain = row.infer_plain();
        assert_eq!(plain["flag"], json!(true));
        assert_eq!(plain["score"], json!(12.5));
        assert_eq!(plain["payload"], json!({"nested": [1, 2, 3]}));
        assert_eq!(plain["at"], json!("2024-06-01T00:00:00Z"));
        assert_eq!(plain["level"], json!("high"));
    }

    #[tokio::test]
    async fn test_scalar_operators_compile_and_filter() {
        let (store, _sink, _db) = setup_store().await;
        for (id, flag, score, level) in [
            ("m1", true, 1.0, "low"),
            ("m2", false, 5.0, "high"),
            ("m3", true, 9.0, "high"),
        ] {
            store
                .insert(
                    &"metrics".into(),
                    id,
                    &payload(
                        json!({"id": id, "flag": flag, "score": score, "level": level}),
                        "1",
                    ),
                    None,
                )
                .await
                .unwrap();
        }

        let flagged = store
            .get(&RawQuery::resource("metrics").with_where(json!({"flag": true})))
            .await
            .unwrap();
        assert_eq!(flagged.len(), 2);

        let hot = store
            .get(&RawQuery::resource("metrics").with_where(json!({"score": {"$gt": 4}})))
            .await
            .unwrap();
        assert_eq!(hot.len(), 2);

        let either = store
            .get(
                &RawQuery::resource("metrics")
                    .with_where(json!({"$or": [{"score": {"$lt": 2}}, {"level": {"$in": ["high"]}}]}))
                    .with_sort("id", true),
            )
            .await
            .unwrap();
        assert_eq!(either.len(), 3);

        let none = store
            .get(&RawQuery::resource("metrics").with_where(json!({"level": {"$in": []}})))
            .await
            .unwrap();
        assert!(none.is_empty());

        let not_high = store
            .get(&RawQuery::resource("metrics")
                .with_where(json!({"level": {"$not": {"$eq": "high"}}})))
            .await
            .unwrap();
        assert_eq!(not_high.len(), 1);
        assert_eq!(not_high[0].id(), Some("m1"));
    }
}
