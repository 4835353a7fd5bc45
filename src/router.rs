//! Radix-tree request router.
//!
//! One tree per HTTP method. O(path-length) lookup. Middleware wraps the whole
//! router, so it sees every request, matched or not.

use std::collections::HashMap;
use std::sync::Arc;

use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;

use crate::error::{ErrorHandler, HttpError, default_error_handler};
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler};
use crate::request::Request;
use crate::server::{App, DEFAULT_BODY_LIMIT};
use crate::writer::ResponseWriter;

type Layer = Box<dyn Fn(BoxedHandler) -> BoxedHandler + Send + Sync>;

/// The application router.
///
/// Build it once at startup and pass it to [`Server::serve`](crate::Server::serve),
/// or turn it into an [`App`] with [`Router::build`].
pub struct Router {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
    layers: Vec<Layer>,
    error_handler: ErrorHandler,
    body_limit: usize,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            layers: Vec::new(),
            error_handler: default_error_handler,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Register a handler for a method + path pair. Returns `self` for chaining.
    ///
    /// Path parameters use `{name}` syntax and are read with `req.param("name")`.
    ///
    /// # Panics
    ///
    /// Panics if `path` is not a valid route or conflicts with an existing one.
    pub fn on(mut self, method: Method, path: &str, handler: impl Handler) -> Self {
        self.routes
            .entry(method)
            .or_default()
            .insert(path, handler.into_boxed_handler())
            .unwrap_or_else(|e| panic!("invalid route `{path}`: {e}"));
        self
    }

    pub fn get(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn patch(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::PATCH, path, handler)
    }

    pub fn delete(self, path: &str, handler: impl Handler) -> Self {
        self.on(Method::DELETE, path, handler)
    }

    /// Wraps every request in `layer`. The first layer added runs outermost.
    ///
    /// See [`middleware`](crate::middleware) for the built-in layers.
    pub fn layer<L>(mut self, layer: L) -> Self
    where
        L: Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static,
    {
        self.layers.push(Box::new(layer));
        self
    }

    /// Replaces the policy used to write handler errors to the client.
    pub fn error_handler(mut self, handler: ErrorHandler) -> Self {
        self.error_handler = handler;
        self
    }

    /// Largest request body accepted, in bytes.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Freezes the routing table and applies the middleware stack.
    pub fn build(self) -> App {
        let Router { routes, layers, error_handler, body_limit } = self;
        let endpoint: BoxedHandler = Arc::new(Endpoint { routes, error_handler });
        let handler = layers.iter().rev().fold(endpoint, |next, layer| layer(next));
        App::new(handler, error_handler, body_limit)
    }
}

impl Default for Router {
    fn default() -> Self { Self::new() }
}

/// The innermost handler: route lookup plus the error policy.
struct Endpoint {
    routes: HashMap<Method, MatchitRouter<BoxedHandler>>,
    error_handler: ErrorHandler,
}

impl Endpoint {
    fn lookup(&self, method: &Method, path: &str) -> Option<(BoxedHandler, HashMap<String, String>)> {
        let tree = self.routes.get(method)?;
        let matched = tree.at(path).ok()?;
        let handler = Arc::clone(matched.value);
        let params = matched.params.iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect();
        Some((handler, params))
    }
}

impl ErasedHandler for Endpoint {
    fn call(&self, w: ResponseWriter, mut req: Request) -> BoxFuture {
        let error_handler = self.error_handler;
        let Some((handler, params)) = self.lookup(req.method(), req.path()) else {
            error_handler(&w, &HttpError::new(StatusCode::NOT_FOUND, "404 page not found"));
            return Box::pin(async { Ok(()) });
        };
        req.params = params;

        Box::pin(async move {
            if let Err(err) = handler.call(w.clone(), req).await {
                error_handler(&w, &err);
            }
            Ok(())
        })
    }
}
