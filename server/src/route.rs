// SPDX-FileCopyrightText: © 2024 Statelink <dev@statelink.dev>

use crate::context::RequestContext;
use crate::db::Db;
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use statelink_proto::{GENERIC_INSERT, GENERIC_UPDATE};
use statelink_schema::{EntityName, MaterializedValue, RawQuery};
use std::collections::HashMap;
use std::sync::Arc;

/// A request travelling down a route's middleware chain.
#[derive(Debug, Clone)]
pub enum RouteRequest {
    Query(QueryRequest),
    Mutate(MutateRequest),
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub ctx: RequestContext,
    pub raw: RawQuery,
}

#[derive(Debug, Clone)]
pub struct MutateRequest {
    pub ctx: RequestContext,
    pub resource: EntityName,
    pub resource_id: Option<String>,
    pub procedure: String,
    pub payload: Option<MaterializedValue>,
    pub input: Option<JsonValue>,
}

impl MutateRequest {
    pub fn is_generic(&self) -> bool {
        self.procedure == GENERIC_INSERT || self.procedure == GENERIC_UPDATE
    }
}

impl RouteRequest {
    pub fn ctx(&self) -> &RequestContext {
        match self {
            RouteRequest::Query(req) => &req.ctx,
            RouteRequest::Mutate(req) => &req.ctx,
        }
    }
}

/// The rest of the chain, handed to each middleware.
pub type Next = Box<dyn FnOnce(RouteRequest) -> BoxFuture<'static, Result<JsonValue>> + Send>;

/// Middlewares compose right to left: each receives the request plus the
/// remainder of the chain and returns whatever the remainder returns.
pub trait Middleware: Send + Sync {
    fn handle(&self, req: RouteRequest, next: Next) -> BoxFuture<'static, Result<JsonValue>>;
}

/// Runs `req` through `middlewares` down to the `terminal` dispatcher.
pub async fn run_chain(
    middlewares: &[Arc<dyn Middleware>],
    terminal: Next,
    req: RouteRequest,
) -> Result<JsonValue> {
    let mut next = terminal;
    for middleware in middlewares.iter().rev().cloned() {
        let inner = next;
        next = Box::new(move |req| middleware.handle(req, inner));
    }
    next(req).await
}

/// What an authorization policy decided.
#[derive(Debug, Clone)]
pub enum Authorized {
    Allow,
    Deny,
    /// Authorized only where this predicate (wire `where` grammar) matches.
    Where(JsonValue),
}

impl From<bool> for Authorized {
    fn from(allowed: bool) -> Self {
        if allowed {
            Authorized::Allow
        } else {
            Authorized::Deny
        }
    }
}

/// An authorization policy. The second argument is the inferred plain record
/// the decision concerns: the pre-image for `update.preMutation`, the
/// post-image for `insert` and `update.postMutation`, absent for `read`.
pub type Policy =
    Arc<dyn Fn(&RequestContext, Option<&JsonValue>) -> Result<Authorized> + Send + Sync>;

/// A lifecycle hook. Hooks may suspend; they receive the db facade and the
/// record (or input) the mutation concerns.
pub type Hook = Arc<
    dyn for<'a> Fn(&'a RequestContext, &'a Db, &'a JsonValue) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// The outcome of validating a custom mutation's input.
pub enum Validated {
    Value(JsonValue),
    Issues(Vec<ValidationIssue>),
}

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub path: Vec<String>,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: &[&str], message: &str) -> Self {
        Self {
            path: path.iter().map(|p| p.to_string()).collect(),
            message: message.to_owned(),
        }
    }

    pub fn qualified(&self) -> String {
        if self.path.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", self.path.join("."), self.message)
        }
    }
}

/// Standard-Schema-style validator contract: any object exposing
/// `validate(input) -> {value} | {issues}`. Validators are opaque; nothing
/// here binds to a particular schema library.
pub trait InputValidator: Send + Sync {
    fn validate(&self, input: &JsonValue) -> Validated;
}

/// A validator from a plain function, enough for handler-defined checks.
pub struct FnValidator<F>(pub F);

impl<F> InputValidator for FnValidator<F>
where
    F: Fn(&JsonValue) -> Validated + Send + Sync,
{
    fn validate(&self, input: &JsonValue) -> Validated {
        (self.0)(input)
    }
}

/// A schema-declared custom mutation: an input validator plus a handler
/// invoked with the validated request and the db facade.
pub struct CustomMutation {
    pub validator: Arc<dyn InputValidator>,
    pub handler: Arc<
        dyn Fn(MutateRequest, Db) -> BoxFuture<'static, Result<JsonValue>> + Send + Sync,
    >,
}

/// Per-resource routing state: middleware chain, authorization policies,
/// lifecycle hooks, and custom mutations.
#[derive(Default)]
pub struct Route {
    pub middlewares: Vec<Arc<dyn Middleware>>,
    pub read: Option<Policy>,
    pub insert: Option<Policy>,
    pub update_pre_mutation: Option<Policy>,
    pub update_post_mutation: Option<Policy>,
    pub before_insert: Option<Hook>,
    pub after_insert: Option<Hook>,
    pub before_update: Option<Hook>,
    pub after_update: Option<Hook>,
    pub custom: HashMap<String, CustomMutation>,
}

impl Route {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn with_read(mut self, policy: Policy) -> Self {
        self.read = Some(policy);
        self
    }

    pub fn with_insert(mut self, policy: Policy) -> Self {
        self.insert = Some(policy);
        self
    }

    pub fn with_update_pre_mutation(mut self, policy: Policy) -> Self {
        self.update_pre_mutation = Some(policy);
        self
    }

    pub fn with_update_post_mutation(mut self, policy: Policy) -> Self {
        self.update_post_mutation = Some(policy);
        self
    }

    pub fn with_custom(mut self, procedure: &str, mutation: CustomMutation) -> Self {
        self.custom.insert(procedure.to_owned(), mutation);
        self
    }
}

/// Maps resources onto their routes.
#[derive(Default)]
pub struct Router {
    routes: HashMap<EntityName, Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, resource: &str, route: Route) {
        self.routes
            .insert(EntityName::from(resource), Arc::new(route));
    }

    pub fn route(&self, resource: &EntityName) -> Result<Arc<Route>> {
        self.routes.get(resource).cloned().ok_or_else(|| {
            Error::bad_request(anyhow::anyhow!("no route for resource `{resource}`"))
        })
    }
}
