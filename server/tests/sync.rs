use futures::future::BoxFuture;
use serde_json::{json, Value as JsonValue};
use statelink_datastore::{DbConnection, Store};
use statelink_proto::{ClientMessage, ServerMessage, GENERIC_INSERT, GENERIC_UPDATE};
use statelink_schema::{
    Entity, EntityField, FieldType, MaterializedValue, QueryHash, RawQuery, Relation, Schema,
    Timestamp,
};
use statelink_server::live::DuplicateInsert;
use statelink_server::route::{
    Authorized, CustomMutation, FnValidator, Route, Router, Validated, ValidationIssue,
};
use statelink_server::{RequestContext, ServerSession, SyncServer, TransportParams};
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn test_schema() -> Arc<Schema> {
    let mut schema = Schema::new(vec![
        Entity::new(
            "users",
            vec![
                EntityField::new("id", FieldType::Id),
                EntityField::new("name", FieldType::String).nullable(),
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
    ])
    .unwrap();
    schema
        .add_relation("posts", Relation::one("author", "users", "authorId"))
        .unwrap();
    schema
        .add_relation("users", Relation::many("posts", "posts", "authorId"))
        .unwrap();
    Arc::new(schema)
}

fn payload(fields: JsonValue, ts: &str) -> MaterializedValue {
    MaterializedValue::from_plain(&fields, &Timestamp::from(ts))
}

async fn setup(router: Router) -> (Arc<SyncServer>, NamedTempFile) {
    let db_file = NamedTempFile::new().unwrap();
    let db_uri = format!("sqlite://{}?mode=rwc", db_file.path().to_string_lossy());
    let conn = DbConnection::connect(&db_uri, 5).await.unwrap();
    let store = Arc::new(Store::new(conn, test_schema()));
    store.init().await.unwrap();
    let provider = Arc::new(|params: &TransportParams| {
        json!({ "userId": params.query.get("userId").cloned().unwrap_or_default() })
    });
    let server = SyncServer::new(store, router, provider, DuplicateInsert::Drop);
    (server, db_file)
}

fn default_router() -> Router {
    let mut router = Router::new();
    router.add_route("users", Route::new());
    router.add_route("posts", Route::new());
    router
}

fn open_session(
    server: &Arc<SyncServer>,
    user: &str,
) -> (Arc<ServerSession>, async_channel::Receiver<ServerMessage>) {
    let mut params = TransportParams::default();
    params.query.insert("userId".to_owned(), user.to_owned());
    ServerSession::open(server.clone(), &params)
}

async fn recv(rx: &async_channel::Receiver<ServerMessage>) -> ServerMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a server message")
        .expect("channel closed")
}

async fn recv_nothing(rx: &async_channel::Receiver<ServerMessage>) {
    let outcome = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(outcome.is_err(), "expected silence, got {outcome:?}");
}

fn insert_msg(id: &str, resource: &str, resource_id: &str, fields: JsonValue, ts: &str) -> ClientMessage {
    ClientMessage::Mutate {
        id: id.to_owned(),
        resource: resource.into(),
        resource_id: Some(resource_id.to_owned()),
        procedure: GENERIC_INSERT.to_owned(),
        payload: Some(payload(fields, ts)),
        input: None,
    }
}

fn update_msg(id: &str, resource: &str, resource_id: &str, fields: JsonValue, ts: &str) -> ClientMessage {
    ClientMessage::Mutate {
        id: id.to_owned(),
        resource: resource.into(),
        resource_id: Some(resource_id.to_owned()),
        procedure: GENERIC_UPDATE.to_owned(),
        payload: Some(payload(fields, ts)),
        input: None,
    }
}

#[tokio::test]
async fn test_generic_insert_and_stale_update() {
    let (server, _db) = setup(default_router()).await;
    let (session, rx) = open_session(&server, "u1");

    session
        .handle_message(insert_msg("m1", "users", "u1", json!({"id": "u1", "name": "A"}), "2"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reply { id, data } => {
            assert_eq!(id, "m1");
            assert_eq!(data["acceptedValues"], json!(["name"]));
        }
        other => panic!("expected REPLY, got {other:?}"),
    }

    // Every field of this update loses the LWW race: the mutation rejects,
    // nothing is stored, nothing fans out.
    session
        .handle_message(update_msg("m2", "users", "u1", json!({"name": "B"}), "1"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reject { id, message, .. } => {
            assert_eq!(id, "m2");
            assert_eq!(message, "Mutation rejected");
        }
        other => panic!("expected REJECT, got {other:?}"),
    }

    let row = server
        .store
        .find_by_id(&"users".into(), "u1", Default::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.infer_plain()["name"], json!("A"));
    assert_eq!(row.timestamp_of("name"), Some(&Timestamp::from("2")));
}

#[tokio::test]
async fn test_insert_preconditions() {
    let (server, _db) = setup(default_router()).await;
    let (session, rx) = open_session(&server, "u1");

    session
        .handle_message(insert_msg("m1", "users", "u1", json!({"id": "u1", "name": "A"}), "1"))
        .await;
    recv(&rx).await;

    session
        .handle_message(insert_msg("m2", "users", "u1", json!({"id": "u1", "name": "B"}), "2"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reject { message, .. } => assert_eq!(message, "Resource already exists"),
        other => panic!("expected REJECT, got {other:?}"),
    }

    session
        .handle_message(update_msg("m3", "users", "ghost", json!({"name": "B"}), "2"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reject { message, .. } => assert_eq!(message, "Resource not found"),
        other => panic!("expected REJECT, got {other:?}"),
    }
}

#[tokio::test]
async fn test_read_authorization_scopes_queries_and_subscriptions() {
    let mut router = Router::new();
    router.add_route(
        "users",
        Route::new().with_read(Arc::new(|ctx: &RequestContext, _record: Option<&JsonValue>| {
            Ok(Authorized::Where(json!({"id": ctx.get("userId")})))
        })),
    );
    router.add_route("posts", Route::new());
    let (server, _db) = setup(router).await;

    // Two rows, written before anyone subscribes.
    server
        .store
        .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "A"}), "1"), None)
        .await
        .unwrap();
    server
        .store
        .insert(&"users".into(), "u2", &payload(json!({"id": "u2", "name": "B"}), "1"), None)
        .await
        .unwrap();

    let (alice, alice_rx) = open_session(&server, "u1");
    let (bob, bob_rx) = open_session(&server, "u2");

    alice
        .handle_message(ClientMessage::Query {
            id: "q1".to_owned(),
            query: RawQuery::resource("users"),
        })
        .await;
    match recv(&alice_rx).await {
        ServerMessage::Reply { data, .. } => {
            let rows = data["data"].as_array().unwrap().clone();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["id"]["value"], json!("u1"));
        }
        other => panic!("expected REPLY, got {other:?}"),
    }

    bob.handle_message(ClientMessage::Query {
        id: "q2".to_owned(),
        query: RawQuery::resource("users"),
    })
    .await;
    match recv(&bob_rx).await {
        ServerMessage::Reply { data, .. } => {
            let rows = data["data"].as_array().unwrap().clone();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["id"]["value"], json!("u2"));
        }
        other => panic!("expected REPLY, got {other:?}"),
    }
}

#[tokio::test]
async fn test_subscription_delivers_only_authorized_deltas() {
    let mut router = Router::new();
    router.add_route(
        "users",
        Route::new().with_read(Arc::new(|ctx: &RequestContext, _record: Option<&JsonValue>| {
            Ok(Authorized::Where(json!({"id": ctx.get("userId")})))
        })),
    );
    router.add_route("posts", Route::new());
    let (server, _db) = setup(router).await;

    let (alice, alice_rx) = open_session(&server, "u1");
    alice
        .handle_message(ClientMessage::Subscribe {
            id: "s1".to_owned(),
            resource: "users".into(),
            query_hash: QueryHash("client-hash".to_owned()),
            query: RawQuery::resource("users"),
        })
        .await;
    match recv(&alice_rx).await {
        ServerMessage::Reply { data, .. } => assert_eq!(data["data"], json!([])),
        other => panic!("expected REPLY, got {other:?}"),
    }

    // Another session writes both rows; only Alice's own row streams to her.
    let (writer, writer_rx) = open_session(&server, "u2");
    writer
        .handle_message(insert_msg("m1", "users", "u2", json!({"id": "u2", "name": "B"}), "1"))
        .await;
    recv(&writer_rx).await;
    writer
        .handle_message(insert_msg("m2", "users", "u1", json!({"id": "u1", "name": "A"}), "1"))
        .await;
    recv(&writer_rx).await;

    match recv(&alice_rx).await {
        ServerMessage::Mutate { resource_id, .. } => assert_eq!(resource_id, "u1"),
        other => panic!("expected a live delta, got {other:?}"),
    }
    recv_nothing(&alice_rx).await;
}

#[tokio::test]
async fn test_unsubscribe_stops_the_stream() {
    let (server, _db) = setup(default_router()).await;
    let (alice, alice_rx) = open_session(&server, "u1");
    alice
        .handle_message(ClientMessage::Subscribe {
            id: "s1".to_owned(),
            resource: "users".into(),
            query_hash: QueryHash("client-hash".to_owned()),
            query: RawQuery::resource("users"),
        })
        .await;
    recv(&alice_rx).await;

    alice
        .handle_message(ClientMessage::Unsubscribe {
            id: "s2".to_owned(),
            query_hash: QueryHash("client-hash".to_owned()),
        })
        .await;
    recv(&alice_rx).await;

    server
        .store
        .insert(&"users".into(), "u9", &payload(json!({"id": "u9", "name": "Z"}), "1"), None)
        .await
        .unwrap();
    recv_nothing(&alice_rx).await;
}

fn create_post_route() -> Route {
    let validator = Arc::new(FnValidator(|input: &JsonValue| {
        let title_ok = input
            .get("title")
            .and_then(|t| t.as_str())
            .map(|t| !t.is_empty())
            .unwrap_or(false);
        if !title_ok {
            return Validated::Issues(vec![ValidationIssue::new(&["title"], "must not be empty")]);
        }
        if input.get("id").and_then(|v| v.as_str()).is_none() {
            return Validated::Issues(vec![ValidationIssue::new(&["id"], "is required")]);
        }
        Validated::Value(input.clone())
    }));
    let handler = Arc::new(
        |req: statelink_server::route::MutateRequest, db: statelink_server::db::Db| {
            let fut: BoxFuture<'static, statelink_server::error::Result<JsonValue>> =
                Box::pin(async move {
                    let input = req.input.clone().expect("validated input present");
                    let id = input["id"].as_str().expect("validated").to_owned();
                    db.collection("posts").insert(&id, input).await?;
                    Ok(json!({ "id": id }))
                });
            fut
        },
    );
    Route::new().with_custom("createPost", CustomMutation { validator, handler })
}

#[tokio::test]
async fn test_custom_mutation_validation_rejects_with_paths() {
    let mut router = Router::new();
    router.add_route("users", Route::new());
    router.add_route("posts", create_post_route());
    let (server, _db) = setup(router).await;
    let (session, rx) = open_session(&server, "u1");

    session
        .handle_message(ClientMessage::Mutate {
            id: "m1".to_owned(),
            resource: "posts".into(),
            resource_id: None,
            procedure: "createPost".to_owned(),
            payload: None,
            input: Some(json!({"id": "p1", "title": ""})),
        })
        .await;
    match recv(&rx).await {
        ServerMessage::Reject { message, .. } => {
            assert_eq!(message, "title: must not be empty");
        }
        other => panic!("expected REJECT, got {other:?}"),
    }
}

#[tokio::test]
async fn test_custom_mutation_writes_and_fans_out() {
    let mut router = Router::new();
    router.add_route("users", Route::new());
    router.add_route("posts", create_post_route());
    let (server, _db) = setup(router).await;

    let (watcher, watcher_rx) = open_session(&server, "u1");
    watcher
        .handle_message(ClientMessage::Subscribe {
            id: "s1".to_owned(),
            resource: "posts".into(),
            query_hash: QueryHash("posts-all".to_owned()),
            query: RawQuery::resource("posts"),
        })
        .await;
    recv(&watcher_rx).await;

    let (writer, writer_rx) = open_session(&server, "u1");
    writer
        .handle_message(ClientMessage::Mutate {
            id: "m1".to_owned(),
            resource: "posts".into(),
            resource_id: None,
            procedure: "createPost".to_owned(),
            payload: None,
            input: Some(json!({"id": "p1", "title": "hello"})),
        })
        .await;
    match recv(&writer_rx).await {
        ServerMessage::Reply { data, .. } => assert_eq!(data["data"]["id"], json!("p1")),
        other => panic!("expected REPLY, got {other:?}"),
    }

    match recv(&watcher_rx).await {
        ServerMessage::Mutate {
            resource,
            resource_id,
            ..
        } => {
            assert_eq!(resource.as_str(), "posts");
            assert_eq!(resource_id, "p1");
        }
        other => panic!("expected a live delta, got {other:?}"),
    }
}

#[tokio::test]
async fn test_update_pre_mutation_policy() {
    let mut router = Router::new();
    router.add_route(
        "users",
        Route::new().with_update_pre_mutation(Arc::new(
            |ctx: &RequestContext, _record: Option<&JsonValue>| {
                Ok(Authorized::Where(json!({"id": ctx.get("userId")})))
            },
        )),
    );
    router.add_route("posts", Route::new());
    let (server, _db) = setup(router).await;

    for (id, name) in [("u1", "A"), ("u2", "B")] {
        server
            .store
            .insert(&"users".into(), id, &payload(json!({"id": id, "name": name}), "1"), None)
            .await
            .unwrap();
    }

    let (alice, rx) = open_session(&server, "u1");
    alice
        .handle_message(update_msg("m1", "users", "u2", json!({"name": "X"}), "2"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reject { message, .. } => assert_eq!(message, "Not authorized"),
        other => panic!("expected REJECT, got {other:?}"),
    }

    alice
        .handle_message(update_msg("m2", "users", "u1", json!({"name": "X"}), "2"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reply { data, .. } => {
            assert_eq!(data["acceptedValues"], json!(["name"]));
        }
        other => panic!("expected REPLY, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failed_post_mutation_check_rolls_back() {
    let mut router = Router::new();
    router.add_route(
        "users",
        Route::new().with_update_post_mutation(Arc::new(
            |_ctx: &RequestContext, record: Option<&JsonValue>| {
                let allowed = record
                    .map(|r| r["name"] != "forbidden")
                    .unwrap_or(true);
                Ok(Authorized::from(allowed))
            },
        )),
    );
    router.add_route("posts", Route::new());
    let (server, _db) = setup(router).await;

    let (session, rx) = open_session(&server, "u1");
    session
        .handle_message(insert_msg("m1", "users", "u1", json!({"id": "u1", "name": "A"}), "1"))
        .await;
    recv(&rx).await;

    // The post-image fails the check: the whole write must roll back.
    session
        .handle_message(update_msg("m2", "users", "u1", json!({"name": "forbidden"}), "2"))
        .await;
    match recv(&rx).await {
        ServerMessage::Reject { message, .. } => assert_eq!(message, "Not authorized"),
        other => panic!("expected REJECT, got {other:?}"),
    }

    let row = server
        .store
        .find_by_id(&"users".into(), "u1", Default::default())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.infer_plain()["name"], json!("A"));
    assert_eq!(row.timestamp_of("name"), Some(&Timestamp::from("1")));
}

#[tokio::test]
async fn test_relational_subscription_rewires_end_to_end() {
    let (server, _db) = setup(default_router()).await;
    let (watcher, watcher_rx) = open_session(&server, "u1");

    // A standing query whose predicate descends through a relation, with the
    // relation included in the projection.
    watcher
        .handle_message(ClientMessage::Subscribe {
            id: "s1".to_owned(),
            resource: "posts".into(),
            query_hash: QueryHash("johns-posts".to_owned()),
            query: RawQuery::resource("posts")
                .with_where(json!({"author": {"name": "John"}}))
                .with_include(serde_json::from_value(json!({"author": true})).unwrap()),
        })
        .await;
    match recv(&watcher_rx).await {
        ServerMessage::Reply { data, .. } => assert_eq!(data["data"], json!([])),
        other => panic!("expected REPLY, got {other:?}"),
    }

    let (writer, writer_rx) = open_session(&server, "u1");
    writer
        .handle_message(insert_msg("m1", "users", "u1", json!({"id": "u1", "name": "Jane"}), "1"))
        .await;
    recv(&writer_rx).await;
    writer
        .handle_message(insert_msg(
            "m2",
            "posts",
            "p1",
            json!({"id": "p1", "title": "T", "authorId": "u1"}),
            "1",
        ))
        .await;
    recv(&writer_rx).await;
    // Jane is not John: the standing query stays silent.
    recv_nothing(&watcher_rx).await;

    // The rename flips p1 into the query; the watcher sees one synthetic
    // INSERT carrying the post with its author included.
    writer
        .handle_message(update_msg("m3", "users", "u1", json!({"name": "John"}), "2"))
        .await;
    recv(&writer_rx).await;

    match recv(&watcher_rx).await {
        ServerMessage::Mutate {
            resource,
            resource_id,
            payload,
            ..
        } => {
            assert_eq!(resource.as_str(), "posts");
            assert_eq!(resource_id, "p1");
            let plain = payload.infer_plain();
            assert_eq!(plain["author"]["name"], json!("John"));
        }
        other => panic!("expected a MUTATE delta, got {other:?}"),
    }
    recv_nothing(&watcher_rx).await;
}

#[tokio::test]
async fn test_last_synced_at_delta_read() {
    let (server, _db) = setup(default_router()).await;
    server
        .store
        .insert(&"users".into(), "u1", &payload(json!({"id": "u1", "name": "A"}), "1"), None)
        .await
        .unwrap();
    server
        .store
        .insert(&"users".into(), "u2", &payload(json!({"id": "u2", "name": "B"}), "3"), None)
        .await
        .unwrap();

    let (session, rx) = open_session(&server, "u1");
    let mut query = RawQuery::resource("users");
    query.last_synced_at = Some("2".into());
    session
        .handle_message(ClientMessage::Query {
            id: "q1".to_owned(),
            query,
        })
        .await;
    match recv(&rx).await {
        ServerMessage::Reply { data, .. } => {
            let rows = data["data"].as_array().unwrap().clone();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0]["id"]["value"], json!("u2"));
        }
        other => panic!("expected REPLY, got {other:?}"),
    }
}

struct BlockNamedWriters;

impl statelink_server::route::Middleware for BlockNamedWriters {
    fn handle(
        &self,
        req: statelink_server::route::RouteRequest,
        next: statelink_server::route::Next,
    ) -> BoxFuture<'static, statelink_server::error::Result<JsonValue>> {
        Box::pin(async move {
            if let statelink_server::route::RouteRequest::Mutate(mutate) = &req {
                if mutate.ctx.get("userId") == "blocked" {
                    return Err(statelink_server::Error::forbidden(anyhow::anyhow!(
                        "Not authorized"
                    )));
                }
            }
            next(req).await
        })
    }
}

#[tokio::test]
async fn test_middleware_gates_the_chain() {
    let mut router = Router::new();
    router.add_route(
        "users",
        Route::new().with_middleware(Arc::new(BlockNamedWriters)),
    );
    router.add_route("posts", Route::new());
    let (server, _db) = setup(router).await;

    let (blocked, blocked_rx) = open_session(&server, "blocked");
    blocked
        .handle_message(insert_msg("m1", "users", "u1", json!({"id": "u1", "name": "A"}), "1"))
        .await;
    match recv(&blocked_rx).await {
        ServerMessage::Reject { message, .. } => assert_eq!(message, "Not authorized"),
        other => panic!("expected REJECT, got {other:?}"),
    }

    let (allowed, allowed_rx) = open_session(&server, "u1");
    allowed
        .handle_message(insert_msg("m2", "users", "u1", json!({"id": "u1", "name": "A"}), "1"))
        .await;
    match recv(&allowed_rx).await {
        ServerMessage::Reply { .. } => {}
        other => panic!("expected REPLY, got {other:?}"),
    }
}

#[tokio::test]
async fn test_loader_coalesces_same_tick_lookups() {
    let (server, _db) = setup(default_router()).await;
    for (id, name) in [("u1", "A"), ("u2", "B")] {
        server
            .store
            .insert(&"users".into(), id, &payload(json!({"id": id, "name": name}), "1"), None)
            .await
            .unwrap();
    }

    let users: statelink_schema::EntityName = "users".into();
    let (a, b, missing) = futures::join!(
        server.loader.load_by_id(&users, "u1", Default::default()),
        server.loader.load_by_id(&users, "u2", Default::default()),
        server.loader.load_by_id(&users, "nope", Default::default()),
    );
    assert_eq!(a.unwrap().unwrap().id(), Some("u1"));
    assert_eq!(b.unwrap().unwrap().id(), Some("u2"));
    assert!(missing.unwrap().is_none());
}
