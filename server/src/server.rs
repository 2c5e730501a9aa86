// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::context::{ContextProvider, TransportParams};
use crate::error::Result;
use crate::live::{DataSource, DuplicateInsert, LiveEngine};
use crate::loader::QueryLoader;
use crate::notify;
use crate::opt::Opt;
use crate::route::{Route, RouteRequest, Router};
use anyhow::Context;
use futures::future::BoxFuture;
use serde_json::{json, Value as JsonValue};
use statelink_datastore::{DbConnection, Store};
use statelink_schema::{EntityName, Include, MaterializedValue, Schema};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The assembled server core: storage, router, batching loader, and the
/// incremental query engine fed by the storage's commit stream through a
/// single fan-out worker.
pub struct SyncServer {
    pub store: Arc<Store>,
    pub router: Router,
    pub live: Arc<LiveEngine>,
    pub loader: Arc<QueryLoader>,
    pub context_provider: ContextProvider,
    next_session: AtomicU64,
    _fanout: tokio::task::JoinHandle<()>,
}

/// The live engine reads full objects straight from the store.
struct StoreSource(Arc<Store>);

impl DataSource for StoreSource {
    fn fetch_by_id<'a>(
        &'a self,
        resource: &'a EntityName,
        id: &'a str,
        include: Include,
    ) -> BoxFuture<'a, anyhow::Result<Option<MaterializedValue>>> {
        Box::pin(async move { self.0.find_by_id(resource, id, include).await })
    }
}

impl SyncServer {
    /// Must be called inside a tokio runtime; spawns the fan-out worker and
    /// registers it as the store's mutation sink.
    pub fn new(
        store: Arc<Store>,
        router: Router,
        context_provider: ContextProvider,
        duplicate_insert: DuplicateInsert,
    ) -> Arc<SyncServer> {
        let live = LiveEngine::new(
            store.schema().clone(),
            Arc::new(StoreSource(store.clone())),
            duplicate_insert,
        );
        let (notifier, fanout) = notify::spawn_fanout(live.clone());
        store.set_sink(notifier);
        let loader = QueryLoader::new(store.clone());
        Arc::new(SyncServer {
            store,
            router,
            live,
            loader,
            context_provider,
            next_session: AtomicU64::new(1),
            _fanout: fanout,
        })
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.store.schema()
    }

    /// Runs a request through the resource's middleware chain down to the
    /// built-in dispatcher.
    pub async fn dispatch(self: &Arc<Self>, req: RouteRequest) -> Result<JsonValue> {
        let resource = match &req {
            RouteRequest::Query(query) => query.raw.resource.clone(),
            RouteRequest::Mutate(mutate) => mutate.resource.clone(),
        };
        let route = self.router.route(&resource)?;
        let server = self.clone();
        let terminal: crate::route::Next =
            Box::new(move |req| Box::pin(async move { server.terminal(req).await }));
        crate::route::run_chain(&route.middlewares, terminal, req).await
    }

    async fn terminal(self: Arc<Self>, req: RouteRequest) -> Result<JsonValue> {
        match req {
            RouteRequest::Query(query) => self.handle_query(query).await,
            RouteRequest::Mutate(mutate) if mutate.is_generic() => {
                self.handle_generic(mutate).await
            }
            RouteRequest::Mutate(mutate) => self.handle_custom(mutate).await,
        }
    }
}

/// Wires the whole engine from config and parks until a shutdown signal.
/// Transport bindings are external: embedders accept connections and feed
/// [`ServerSession`](crate::session::ServerSession)s.
pub async fn run(opt: Opt) -> anyhow::Result<()> {
    let schema_text = tokio::fs::read_to_string(&opt.schema_path)
        .await
        .with_context(|| format!("failed to read schema from {:?}", opt.schema_path))?;
    let schema: Schema = serde_json::from_str(&schema_text).context("invalid schema file")?;

    let conn = DbConnection::connect(&opt.db_uri, opt.nr_connections).await?;
    let store = Arc::new(Store::new(conn, Arc::new(schema)));
    store.init().await?;

    let mut router = Router::new();
    for entity in store.schema().entities.keys() {
        router.add_route(entity.as_str(), Route::new());
    }

    let _server = SyncServer::new(
        store,
        router,
        Arc::new(|_params: &TransportParams| json!({})),
        opt.duplicate_insert_mode()?,
    );
    log::info!("statelinkd is ready - db: {}", opt.db_uri);

    let (signal_tx, signal_rx) = statelink_utils::make_signal_channel();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => { log::debug!("Got SIGTERM"); },
            _ = sigint.recv() => { log::debug!("Got SIGINT"); },
        };
        signal_tx.send(()).await.ok();
    });
    signal_rx.recv().await.ok();
    log::info!("shutting down");
    Ok(())
}
