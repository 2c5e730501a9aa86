use crate::proxy::{OptimisticProxy, ProxyOp};
use crate::store::{stamp, ClientStore, QueryBuilder};
use crate::transport::{Transport, TransportEvent};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use statelink_proto::{
    ClientMessage, ConnectionState, ServerMessage, SessionEvent, GENERIC_INSERT, GENERIC_UPDATE,
};
use statelink_schema::{EntityName, MaterializedValue, QueryHash, RawQuery, Schema};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// Recognized connection options.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub auto_connect: bool,
    pub auto_reconnect: bool,
    pub reply_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_connect: true,
            auto_reconnect: true,
            reply_timeout: Duration::from_millis(5000),
        }
    }
}

/// Everything the session reports to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    MutationSent { optimistic: bool },
    OptimisticMutationApplied,
    OptimisticMutationUndone,
    ReplyReceived,
    RejectReceived,
}

/// A registered optimistic handler for a custom mutation, run against the
/// storage proxy before (or without) the wire.
pub type OptimisticHandler =
    Arc<dyn for<'a> Fn(&OptimisticProxy<'a>, &JsonValue) -> Result<()> + Send + Sync>;

enum PendingKind {
    Generic {
        resource: EntityName,
        resource_id: String,
    },
    Custom,
    Read {
        resource: EntityName,
    },
}

struct Pending {
    /// Absent for offline-queued mutations: those resolved at queue time and
    /// only need overlay reconciliation when the reply finally lands.
    resolve: Option<oneshot::Sender<Result<JsonValue, String>>>,
    kind: PendingKind,
    timer: Option<tokio::task::JoinHandle<()>>,
}

pub struct SessionBuilder {
    schema: Arc<Schema>,
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    optimistic: HashMap<String, OptimisticHandler>,
}

impl SessionBuilder {
    pub fn new(schema: Arc<Schema>, transport: Arc<dyn Transport>) -> Self {
        Self {
            schema,
            transport,
            options: ConnectionOptions::default(),
            optimistic: HashMap::new(),
        }
    }

    pub fn options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Registers the optimistic handler for `resource` × `procedure`.
    pub fn optimistic(mut self, resource: &str, procedure: &str, handler: OptimisticHandler) -> Self {
        self.optimistic.insert(handler_key(resource, procedure), handler);
        self
    }

    pub fn build(self) -> (Arc<ClientSession>, async_channel::Receiver<ClientEvent>) {
        let (events, events_rx) = async_channel::unbounded();
        let session = Arc::new(ClientSession {
            store: ClientStore::new(self.schema.clone()),
            schema: self.schema,
            transport: self.transport,
            options: self.options,
            state: Mutex::new(ConnectionState::Disconnected),
            pending: Mutex::new(HashMap::new()),
            offline: Mutex::new(Vec::new()),
            optimistic: self.optimistic,
            events,
        });
        (session, events_rx)
    }
}

fn handler_key(resource: &str, procedure: &str) -> String {
    format!("{resource}::{procedure}")
}

/// The client session: local store plus optimistic overlay, request
/// correlation with reply timeout, offline queueing with custom-envelope
/// replay, and the event stream.
pub struct ClientSession {
    schema: Arc<Schema>,
    transport: Arc<dyn Transport>,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    store: ClientStore,
    pending: Mutex<HashMap<String, Pending>>,
    offline: Mutex<Vec<ClientMessage>>,
    optimistic: HashMap<String, OptimisticHandler>,
    events: async_channel::Sender<ClientEvent>,
}

impl ClientSession {
    pub fn store(&self) -> &ClientStore {
        &self.store
    }

    /// The synchronous query-builder surface over the local store.
    pub fn query(&self, resource: &str) -> QueryBuilder<'_> {
        QueryBuilder::new(&self.store, resource)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn connect_requested(&self) {
        self.set_state(SessionEvent::ConnectRequested);
    }

    pub fn close(&self) {
        self.set_state(SessionEvent::ClosedByUser);
    }

    /// Feeds one transport event into the session. The receive loop is the
    /// only caller, so the pending table serializes through it and the send
    /// path alone.
    pub async fn process(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Opened => self.on_open(),
            TransportEvent::Closed => self.set_state(SessionEvent::TransportClosed),
            TransportEvent::Message(msg) => self.on_message(msg),
        }
    }

    fn set_state(&self, event: SessionEvent) {
        let mut state = self.state.lock();
        let next = state.transition(event);
        if next != *state {
            *state = next;
            drop(state);
            self.emit(ClientEvent::ConnectionChanged(next));
        }
    }

    /// Transport came (back) up: replay the queued custom-procedure
    /// envelopes. Generic envelopes never queue, so nothing else goes out.
    fn on_open(self: &Arc<Self>) {
        self.set_state(SessionEvent::TransportOpened);
        let queued: Vec<ClientMessage> = self.offline.lock().drain(..).collect();
        for msg in queued {
            let mid = msg.id().to_owned();
            match self.transport.send(&msg) {
                Ok(()) => {
                    self.emit(ClientEvent::MutationSent { optimistic: true });
                    let timer = self.arm_timer(&mid);
                    if let Some(pending) = self.pending.lock().get_mut(&mid) {
                        pending.timer = Some(timer);
                    }
                }
                Err(err) => {
                    log::warn!("replay of {mid} failed, requeueing: {err}");
                    self.offline.lock().push(msg);
                }
            }
        }
    }

    fn on_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::Reply { id, data } => {
                let pending = self.pending.lock().remove(&id);
                if let Some(pending) = pending {
                    if let Some(timer) = pending.timer {
                        timer.abort();
                    }
                    match &pending.kind {
                        PendingKind::Generic {
                            resource,
                            resource_id,
                        } => {
                            if let Ok(value) =
                                serde_json::from_value::<MaterializedValue>(data["data"].clone())
                            {
                                self.store.apply_canonical(resource, resource_id, &value);
                            }
                        }
                        PendingKind::Read { resource } => {
                            if let Ok(rows) = serde_json::from_value::<Vec<MaterializedValue>>(
                                data["data"].clone(),
                            ) {
                                for row in &rows {
                                    if let Some(row_id) = row.id() {
                                        self.store.apply_canonical(resource, row_id, row);
                                    }
                                }
                            }
                        }
                        PendingKind::Custom => {}
                    }
                    // The overlay contribution for this mutation ends here.
                    self.store.confirm(&id);
                    if let Some(resolve) = pending.resolve {
                        resolve.send(Ok(data)).ok();
                    }
                } else {
                    self.store.confirm(&id);
                }
                self.emit(ClientEvent::ReplyReceived);
            }
            ServerMessage::Reject { id, message, .. } => {
                let pending = self.pending.lock().remove(&id);
                if self.store.rollback(&id) {
                    self.emit(ClientEvent::OptimisticMutationUndone);
                }
                if let Some(pending) = pending {
                    if let Some(timer) = pending.timer {
                        timer.abort();
                    }
                    if let Some(resolve) = pending.resolve {
                        resolve.send(Err(message)).ok();
                    }
                }
                self.emit(ClientEvent::RejectReceived);
            }
            ServerMessage::Mutate {
                resource,
                resource_id,
                payload,
                ..
            } => {
                // A live delta for one of our standing queries.
                self.store.apply_canonical(&resource, &resource_id, &payload);
            }
        }
    }

    fn expire(&self, id: &str) {
        let pending = self.pending.lock().remove(id);
        if let Some(pending) = pending {
            if self.store.rollback(id) {
                self.emit(ClientEvent::OptimisticMutationUndone);
            }
            if let Some(resolve) = pending.resolve {
                resolve.send(Err("Reply timeout".to_owned())).ok();
            }
        }
    }

    fn arm_timer(self: &Arc<Self>, id: &str) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let id = id.to_owned();
        let timeout = self.options.reply_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(session) = weak.upgrade() {
                session.expire(&id);
            }
        })
    }

    fn register_pending(
        self: &Arc<Self>,
        id: &str,
        kind: PendingKind,
    ) -> oneshot::Receiver<Result<JsonValue, String>> {
        let (tx, rx) = oneshot::channel();
        let timer = self.arm_timer(id);
        self.pending.lock().insert(
            id.to_owned(),
            Pending {
                resolve: Some(tx),
                kind,
                timer: Some(timer),
            },
        );
        rx
    }

    async fn await_reply(
        &self,
        rx: oneshot::Receiver<Result<JsonValue, String>>,
    ) -> Result<JsonValue> {
        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(message)) => bail!(message),
            Err(_) => bail!("session dropped before the reply arrived"),
        }
    }

    /// Generic insert: stamps the record at the current instant, applies the
    /// synthesized optimistic delta, sends, and awaits the reply.
    pub async fn insert(self: &Arc<Self>, resource: &str, id: &str, record: JsonValue) -> Result<JsonValue> {
        self.generic(GENERIC_INSERT, resource, id, record).await
    }

    /// Generic update; same pipeline as [`insert`](ClientSession::insert).
    pub async fn update(self: &Arc<Self>, resource: &str, id: &str, record: JsonValue) -> Result<JsonValue> {
        self.generic(GENERIC_UPDATE, resource, id, record).await
    }

    async fn generic(
        self: &Arc<Self>,
        procedure: &str,
        resource: &str,
        id: &str,
        record: JsonValue,
    ) -> Result<JsonValue> {
        // Generic mutations never queue: offline they fail synchronously,
        // before any optimistic application.
        if !self.state().is_connected() {
            bail!("WebSocket not connected");
        }
        let resource_name = EntityName::from(resource);
        let mid = uuid::Uuid::new_v4().to_string();
        let (payload, _stamped_at) = stamp(&record);

        if procedure == GENERIC_INSERT {
            self.store
                .apply_optimistic_insert(&mid, &resource_name, id, payload.clone());
        } else {
            self.store
                .apply_optimistic_update(&mid, &resource_name, id, &payload);
        }
        self.emit(ClientEvent::OptimisticMutationApplied);

        let msg = ClientMessage::Mutate {
            id: mid.clone(),
            resource: resource_name.clone(),
            resource_id: Some(id.to_owned()),
            procedure: procedure.to_owned(),
            payload: Some(payload),
            input: None,
        };
        let rx = self.register_pending(
            &mid,
            PendingKind::Generic {
                resource: resource_name,
                resource_id: id.to_owned(),
            },
        );
        if let Err(err) = self.transport.send(&msg) {
            if let Some(pending) = self.pending.lock().remove(&mid) {
                if let Some(timer) = pending.timer {
                    timer.abort();
                }
            }
            if self.store.rollback(&mid) {
                self.emit(ClientEvent::OptimisticMutationUndone);
            }
            return Err(err);
        }
        self.emit(ClientEvent::MutationSent { optimistic: true });
        self.await_reply(rx).await
    }

    /// A schema-scoped custom mutation. With a registered optimistic handler
    /// the collected operations apply locally first; offline, the envelope
    /// queues for replay and the call resolves with `None`.
    pub async fn mutate(
        self: &Arc<Self>,
        resource: &str,
        procedure: &str,
        input: JsonValue,
    ) -> Result<Option<JsonValue>> {
        let handler = self.optimistic.get(&handler_key(resource, procedure)).cloned();
        let mid = uuid::Uuid::new_v4().to_string();

        if let Some(handler) = &handler {
            let proxy = OptimisticProxy::new(&self.store);
            // A throwing handler records nothing and suppresses the send.
            handler.as_ref()(&proxy, &input)?;
            for op in proxy.into_ops() {
                match op {
                    ProxyOp::Insert { resource, id, record } => {
                        let (payload, _) = stamp(&record);
                        self.store
                            .apply_optimistic_insert(&mid, &resource, &id, payload);
                    }
                    ProxyOp::Update { resource, id, record } => {
                        let (payload, _) = stamp(&record);
                        self.store
                            .apply_optimistic_update(&mid, &resource, &id, &payload);
                    }
                }
                self.emit(ClientEvent::OptimisticMutationApplied);
            }
        }

        let msg = ClientMessage::Mutate {
            id: mid.clone(),
            resource: EntityName::from(resource),
            resource_id: None,
            procedure: procedure.to_owned(),
            payload: None,
            input: Some(input),
        };

        if self.state().is_connected() {
            let rx = self.register_pending(&mid, PendingKind::Custom);
            if let Err(err) = self.transport.send(&msg) {
                if let Some(pending) = self.pending.lock().remove(&mid) {
                    if let Some(timer) = pending.timer {
                        timer.abort();
                    }
                }
                if self.store.rollback(&mid) {
                    self.emit(ClientEvent::OptimisticMutationUndone);
                }
                return Err(err);
            }
            self.emit(ClientEvent::MutationSent {
                optimistic: handler.is_some(),
            });
            self.await_reply(rx).await.map(Some)
        } else if handler.is_some() {
            // Offline with an optimistic handler: keep the overlay, queue
            // the envelope for replay, resolve immediately.
            self.pending.lock().insert(
                mid,
                Pending {
                    resolve: None,
                    kind: PendingKind::Custom,
                    timer: None,
                },
            );
            self.offline.lock().push(msg);
            Ok(None)
        } else {
            bail!("WebSocket not connected")
        }
    }

    /// One-shot remote read; confirmed rows merge into the canonical store.
    pub async fn remote_query(self: &Arc<Self>, raw: RawQuery) -> Result<Vec<MaterializedValue>> {
        if !self.state().is_connected() {
            bail!("WebSocket not connected");
        }
        let mid = uuid::Uuid::new_v4().to_string();
        let resource = raw.resource.clone();
        let msg = ClientMessage::Query {
            id: mid.clone(),
            query: raw,
        };
        let rx = self.register_pending(&mid, PendingKind::Read { resource });
        self.transport.send(&msg)?;
        let data = self.await_reply(rx).await?;
        Ok(serde_json::from_value(data["data"].clone())?)
    }

    /// Begins a standing query and returns its hash; live deltas apply to
    /// the canonical store as they stream in.
    pub async fn subscribe(self: &Arc<Self>, raw: RawQuery) -> Result<QueryHash> {
        if !self.state().is_connected() {
            bail!("WebSocket not connected");
        }
        let hash = raw.hash(&self.schema)?;
        let mid = uuid::Uuid::new_v4().to_string();
        let resource = raw.resource.clone();
        let msg = ClientMessage::Subscribe {
            id: mid.clone(),
            resource: resource.clone(),
            query_hash: hash.clone(),
            query: raw,
        };
        let rx = self.register_pending(&mid, PendingKind::Read { resource });
        self.transport.send(&msg)?;
        self.await_reply(rx).await?;
        Ok(hash)
    }

    pub async fn unsubscribe(self: &Arc<Self>, hash: &QueryHash) -> Result<()> {
        let mid = uuid::Uuid::new_v4().to_string();
        let msg = ClientMessage::Unsubscribe {
            id: mid.clone(),
            query_hash: hash.clone(),
        };
        let rx = self.register_pending(&mid, PendingKind::Custom);
        self.transport.send(&msg)?;
        self.await_reply(rx).await?;
        Ok(())
    }

    /// The number of envelopes waiting for a reconnect; test surface.
    pub fn queued_len(&self) -> usize {
        self.offline.lock().len()
    }

    fn emit(&self, event: ClientEvent) {
        self.events.try_send(event).ok();
    }
}
