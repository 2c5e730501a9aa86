use serde_json::{json, Value as JsonValue};
use statelink_client::{
    ClientEvent, ClientSession, ConnectionOptions, InMemoryTransport, SessionBuilder,
    TransportEvent,
};
use statelink_proto::{ClientMessage, MutationKind, ServerMessage, GENERIC_INSERT};
use statelink_schema::{
    Entity, EntityField, FieldType, MaterializedValue, RawQuery, Relation, Schema, Timestamp,
};
use std::sync::Arc;
use std::time::Duration;

fn schema() -> Arc<Schema> {
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

fn create_post_builder(
    transport: Arc<InMemoryTransport>,
) -> (Arc<ClientSession>, async_channel::Receiver<ClientEvent>) {
    SessionBuilder::new(schema(), transport)
        .optimistic(
            "posts",
            "createPost",
            Arc::new(|proxy: &statelink_client::OptimisticProxy, input: &JsonValue| {
                let id = input["id"].as_str().expect("id required");
                proxy.insert("posts", id, input.clone());
                Ok(())
            }),
        )
        .build()
}

async fn connect(session: &Arc<ClientSession>) {
    session.connect_requested();
    session.process(TransportEvent::Opened).await;
}

fn drain_events(rx: &async_channel::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn test_optimistic_custom_mutation_rolls_back_on_reject() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, events) = create_post_builder(transport);
    connect(&session).await;

    // Fake server: reject whatever arrives.
    let responder = session.clone();
    tokio::spawn(async move {
        let msg = wire.recv().await.unwrap();
        responder
            .process(TransportEvent::Message(ServerMessage::Reject {
                id: msg.id().to_owned(),
                resource: None,
                message: "Not authorized".to_owned(),
            }))
            .await;
    });

    let result = session
        .mutate("posts", "createPost", json!({"id": "p1", "title": "T"}))
        .await;
    assert_eq!(result.unwrap_err().to_string(), "Not authorized");

    // The speculative record is gone and the undo was announced.
    assert!(session.query("posts").one("p1").get().is_none());
    let events = drain_events(&events);
    assert!(events.contains(&ClientEvent::OptimisticMutationApplied));
    assert!(events.contains(&ClientEvent::OptimisticMutationUndone));
    assert!(events.contains(&ClientEvent::RejectReceived));
}

#[tokio::test]
async fn test_offline_custom_mutation_queues_and_replays_once() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, _events) = create_post_builder(transport.clone());
    connect(&session).await;

    transport.set_connected(false);
    session.process(TransportEvent::Closed).await;

    // Offline with an optimistic handler: applies locally and resolves
    // immediately with nothing.
    let result = session
        .mutate("posts", "createPost", json!({"id": "p2", "title": "T"}))
        .await
        .unwrap();
    assert!(result.is_none());
    assert_eq!(session.queued_len(), 1);
    assert_eq!(
        session.query("posts").one("p2").get().unwrap()["title"],
        json!("T")
    );

    transport.set_connected(true);
    session.process(TransportEvent::Opened).await;

    // Exactly one replayed envelope: the custom procedure, never the
    // generic INSERT it synthesized locally.
    let mut replayed = Vec::new();
    while let Ok(msg) = wire.try_recv() {
        replayed.push(msg);
    }
    assert_eq!(replayed.len(), 1);
    assert!(replayed[0].is_custom_mutation());
    match &replayed[0] {
        ClientMessage::Mutate { procedure, .. } => assert_eq!(procedure, "createPost"),
        other => panic!("expected MUTATE, got {other:?}"),
    }
    assert!(!replayed
        .iter()
        .any(|msg| matches!(msg, ClientMessage::Mutate { procedure, .. } if procedure == GENERIC_INSERT)));
    assert_eq!(session.queued_len(), 0);

    // The late reply still correlates and clears the overlay contribution.
    let replay_id = replayed[0].id().to_owned();
    session
        .process(TransportEvent::Message(ServerMessage::Reply {
            id: replay_id.clone(),
            data: json!({"data": {"id": "p2"}}),
        }))
        .await;
    assert!(!session.store().has_overlay(&replay_id));
}

#[tokio::test]
async fn test_offline_mutation_without_handler_fails_synchronously() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, _events) = create_post_builder(transport.clone());
    connect(&session).await;
    transport.set_connected(false);
    session.process(TransportEvent::Closed).await;

    let custom = session
        .mutate("posts", "archivePost", json!({"id": "p1"}))
        .await;
    assert_eq!(custom.unwrap_err().to_string(), "WebSocket not connected");

    // Generic mutations never queue offline, and nothing speculative leaks.
    let generic = session
        .insert("posts", "p9", json!({"id": "p9", "title": "X"}))
        .await;
    assert_eq!(generic.unwrap_err().to_string(), "WebSocket not connected");
    assert!(session.query("posts").one("p9").get().is_none());
    assert!(wire.try_recv().is_err());
}

#[tokio::test]
async fn test_generic_insert_confirms_into_canonical_store() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, events) = create_post_builder(transport);
    connect(&session).await;

    let responder = session.clone();
    tokio::spawn(async move {
        let msg = wire.recv().await.unwrap();
        let (id, payload) = match &msg {
            ClientMessage::Mutate { id, payload, .. } => (id.clone(), payload.clone().unwrap()),
            other => panic!("expected MUTATE, got {other:?}"),
        };
        responder
            .process(TransportEvent::Message(ServerMessage::Reply {
                id,
                data: json!({"data": payload, "acceptedValues": ["name"]}),
            }))
            .await;
    });

    let reply = session
        .insert("users", "u1", json!({"id": "u1", "name": "A"}))
        .await
        .unwrap();
    assert_eq!(reply["acceptedValues"], json!(["name"]));

    // Confirmed: the record now lives in the canonical layer.
    assert_eq!(
        session.query("users").one("u1").get().unwrap()["name"],
        json!("A")
    );
    let events = drain_events(&events);
    assert!(events.contains(&ClientEvent::MutationSent { optimistic: true }));
    assert!(events.contains(&ClientEvent::ReplyReceived));
}

#[tokio::test]
async fn test_reply_timeout_rejects_and_rolls_back() {
    let (transport, _wire) = InMemoryTransport::pair();
    let (session, events) = SessionBuilder::new(schema(), transport)
        .options(ConnectionOptions {
            reply_timeout: Duration::from_millis(50),
            ..Default::default()
        })
        .build();
    connect(&session).await;

    let result = session
        .insert("users", "u1", json!({"id": "u1", "name": "A"}))
        .await;
    assert_eq!(result.unwrap_err().to_string(), "Reply timeout");
    assert!(session.query("users").one("u1").get().is_none());
    assert!(drain_events(&events).contains(&ClientEvent::OptimisticMutationUndone));
}

#[tokio::test]
async fn test_throwing_optimistic_handler_suppresses_send() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, events) = SessionBuilder::new(schema(), transport)
        .optimistic(
            "posts",
            "createPost",
            Arc::new(|_proxy: &statelink_client::OptimisticProxy, _input: &JsonValue| {
                anyhow::bail!("handler exploded")
            }),
        )
        .build();
    connect(&session).await;

    let result = session
        .mutate("posts", "createPost", json!({"id": "p1", "title": "T"}))
        .await;
    assert!(result.is_err());
    assert!(wire.try_recv().is_err());
    assert!(!drain_events(&events).contains(&ClientEvent::OptimisticMutationApplied));
}

#[tokio::test]
async fn test_connected_custom_mutation_without_handler_is_not_optimistic() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, events) = SessionBuilder::new(schema(), transport).build();
    connect(&session).await;

    let responder = session.clone();
    tokio::spawn(async move {
        let msg = wire.recv().await.unwrap();
        responder
            .process(TransportEvent::Message(ServerMessage::Reply {
                id: msg.id().to_owned(),
                data: json!({"data": {"archived": true}}),
            }))
            .await;
    });

    let reply = session
        .mutate("posts", "archivePost", json!({"id": "p1"}))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply["data"]["archived"], json!(true));

    // Nothing speculative happened; the send was announced as such.
    let events = drain_events(&events);
    assert!(events.contains(&ClientEvent::MutationSent { optimistic: false }));
    assert!(!events.contains(&ClientEvent::OptimisticMutationApplied));
}

#[tokio::test]
async fn test_live_deltas_apply_per_field_lww() {
    let (transport, _wire) = InMemoryTransport::pair();
    let (session, _events) = create_post_builder(transport);
    connect(&session).await;

    let newer = MaterializedValue::from_plain(
        &json!({"id": "u1", "name": "new"}),
        &Timestamp::from("5"),
    );
    let stale = MaterializedValue::from_plain(
        &json!({"id": "u1", "name": "stale"}),
        &Timestamp::from("3"),
    );
    for payload in [newer, stale] {
        session
            .process(TransportEvent::Message(ServerMessage::Mutate {
                id: "srv-1".to_owned(),
                resource: "users".into(),
                resource_id: "u1".to_owned(),
                procedure: MutationKind::Update,
                payload,
            }))
            .await;
    }

    assert_eq!(
        session.query("users").one("u1").get().unwrap()["name"],
        json!("new")
    );
}

#[tokio::test]
async fn test_subscribe_seeds_canonical_store() {
    let (transport, wire) = InMemoryTransport::pair();
    let (session, _events) = create_post_builder(transport);
    connect(&session).await;

    let responder = session.clone();
    tokio::spawn(async move {
        let msg = wire.recv().await.unwrap();
        let rows: JsonValue = json!([
            MaterializedValue::from_plain(&json!({"id": "u1", "name": "A"}), &Timestamp::from("1"))
        ]);
        responder
            .process(TransportEvent::Message(ServerMessage::Reply {
                id: msg.id().to_owned(),
                data: json!({"data": rows, "queryHash": "h"}),
            }))
            .await;
    });

    session.subscribe(RawQuery::resource("users")).await.unwrap();
    assert_eq!(
        session.query("users").one("u1").get().unwrap()["name"],
        json!("A")
    );
}
