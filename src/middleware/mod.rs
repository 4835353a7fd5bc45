//! Middleware layer.
//!
//! A middleware is any `Fn(BoxedHandler) -> BoxedHandler`: it receives the
//! rest of the chain and returns a handler that runs around it. Register one
//! with [`Router::layer`](crate::Router::layer); the first one registered
//! sees the request first.
//!
//! Most middleware is easiest to write with [`from_fn`]:
//!
//! ```rust
//! use toolkit::middleware::{self, Next};
//! use toolkit::{HttpError, Request, ResponseWriter, Router};
//!
//! async fn powered_by(w: ResponseWriter, req: Request, next: Next) -> Result<(), HttpError> {
//!     w.set_header(
//!         http::header::SERVER,
//!         http::HeaderValue::from_static("toolkit"),
//!     );
//!     next.run(w, req).await
//! }
//!
//! let app = Router::new().layer(middleware::from_fn(powered_by));
//! ```
//!
//! Built-in layers:
//! - [`request_logger`]: request span, context logger, one summary event
//! - [`recoverer`]: turns handler panics into `500`
//! - [`attach`]: stores a value in every request's context

mod logger;
mod recover;

use std::future::Future;
use std::sync::Arc;

use crate::context::Key;
use crate::error::HttpError;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::request::Request;
use crate::writer::ResponseWriter;

pub use logger::request_logger;
pub use recover::{AbortHandler, recoverer};

/// The remainder of the middleware chain.
pub struct Next(BoxedHandler);

impl Next {
    pub async fn run(self, w: ResponseWriter, req: Request) -> Result<(), HttpError> {
        self.0.call(w, req).await
    }
}

/// Builds a middleware from an async function.
pub fn from_fn<F, Fut>(f: F) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static
where
    F: Fn(ResponseWriter, Request, Next) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HttpError>> + Send + 'static,
{
    move |next: BoxedHandler| -> BoxedHandler { Arc::new(FromFn { f: f.clone(), next }) }
}

struct FromFn<F> {
    f: F,
    next: BoxedHandler,
}

impl<F, Fut> ErasedHandler for FromFn<F>
where
    F: Fn(ResponseWriter, Request, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HttpError>> + Send + 'static,
{
    fn call(&self, w: ResponseWriter, req: Request) -> BoxFuture {
        Box::pin((self.f)(w, req, Next(Arc::clone(&self.next))))
    }
}

/// Attaches a clone of `value` under `key` to every request.
pub fn attach<T>(key: Key<T>, value: T) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static
where
    T: Clone + Send + Sync + 'static,
{
    from_fn(move |w, mut req: Request, next: Next| {
        req.attach(key, value.clone());
        next.run(w, req)
    })
}
