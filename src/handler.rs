//! Handler trait and type erasure.
//!
//! # How async handlers are stored
//!
//! The router needs to hold handlers of *different* types in a single
//! `HashMap<Method, Tree>`. Rust collections can only hold one concrete type,
//! so handlers are stored as trait objects (`dyn ErasedHandler`) behind a
//! common interface.
//!
//! The chain from user code to vtable call is:
//!
//! ```text
//! async fn hello(w: ResponseWriter, req: Request) -> Result<(), E>  ← user writes this
//!        ↓ router.get("/", hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                       ← heap-allocated wrapper
//!        ↓  stored as BoxedHandler = Arc<dyn ErasedHandler>
//! handler.call(w, req)  at request time            ← one vtable dispatch
//!        ↓
//! Box::pin(async { hello(w, req).await.map_err(Into::into) })  ← BoxFuture
//! ```
//!
//! Middleware wraps one `BoxedHandler` in another, so the same erased shape
//! serves routes, middleware and the router itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::HttpError;
use crate::request::Request;
use crate::writer::ResponseWriter;

// ── Internal types ────────────────────────────────────────────────────────────

/// A heap-allocated, type-erased handler future.
///
/// `Send + 'static` lets tokio run it on any worker thread.
pub type BoxFuture = Pin<Box<dyn Future<Output = Result<(), HttpError>> + Send + 'static>>;

/// Internal dispatch interface.
///
/// `#[doc(hidden)] pub` rather than `pub(crate)` because it appears in the
/// return type of the public `Handler` trait's `into_boxed_handler` method.
#[doc(hidden)]
pub trait ErasedHandler {
    fn call(&self, w: ResponseWriter, req: Request) -> BoxFuture;
}

/// A type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` with the signature:
///
/// ```text
/// async fn name(w: ResponseWriter, req: Request) -> Result<(), E>
///     where E: Into<HttpError>
/// ```
///
/// The trait is **sealed** (via the private `Sealed` supertrait): only the
/// blanket impl below can satisfy it.
pub trait Handler: private::Sealed + Send + Sync + 'static {
    #[doc(hidden)]
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

// ── Blanket implementations ───────────────────────────────────────────────────

impl<F, Fut, E> private::Sealed for F
where
    F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<HttpError> + 'static,
{
}

impl<F, Fut, E> Handler for F
where
    F: Fn(ResponseWriter, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<HttpError> + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

// ── Concrete wrapper ──────────────────────────────────────────────────────────

/// Newtype wrapper that holds a concrete handler `F` and implements
/// [`ErasedHandler`], bridging the typed world to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, E> ErasedHandler for FnHandler<F>
where
    F: Fn(ResponseWriter, Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<HttpError> + 'static,
{
    fn call(&self, w: ResponseWriter, req: Request) -> BoxFuture {
        let fut = (self.0)(w, req);
        Box::pin(async move { fut.await.map_err(Into::into) })
    }
}
