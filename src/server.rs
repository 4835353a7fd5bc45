//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown and Kubernetes
//!
//! When Kubernetes terminates a pod it sends **SIGTERM** and waits
//! `terminationGracePeriodSeconds` (default 30 s) before sending SIGKILL.
//!
//! The server reacts by:
//! 1. Immediately stopping `listener.accept()`, so no new connections are made.
//! 2. Letting every in-flight connection task run to completion.
//! 3. Returning from [`Server::serve`], which lets `main` exit cleanly.
//!
//! # One task per request
//!
//! Each request runs its handler chain on its own tokio task. The hyper
//! service future only waits for the response *head*: a handler that flushes
//! early lets hyper start sending while the handler keeps writing.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::config::{self, ConfigError};
use crate::error::{Error, ErrorHandler, HttpError};
use crate::handler::BoxedHandler;
use crate::request::Request;
use crate::router::Router;
use crate::writer::{Body, ResponseWriter, Sink};

/// Request bodies larger than this are refused with 413 unless the router
/// sets its own limit.
pub const DEFAULT_BODY_LIMIT: usize = 32 << 20;

/// Server settings read from the environment.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// `HTTP_ADDR`, default `0.0.0.0:3000`.
    pub addr: String,
    /// `HTTP_MAX_BODY` in bytes, default [`DEFAULT_BODY_LIMIT`]. Pass it to
    /// [`Router::body_limit`].
    pub max_body: usize,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            addr: config::var_or("HTTP_ADDR", "0.0.0.0:3000"),
            max_body: config::parse_or("HTTP_MAX_BODY", DEFAULT_BODY_LIMIT)?,
        })
    }
}

enum Bind {
    Addr(String),
    Listener(TcpListener),
}

/// The HTTP server.
pub struct Server {
    bind: Bind,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// ```rust,no_run
    /// use toolkit::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: impl Into<String>) -> Self {
        Self { bind: Bind::Addr(addr.into()) }
    }

    /// Serves on an already-bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { bind: Bind::Listener(listener) }
    }

    /// Starts accepting connections and dispatching them through `router`.
    ///
    /// Returns only after a full graceful shutdown (SIGTERM or Ctrl-C,
    /// followed by all in-flight requests completing).
    pub async fn serve(self, router: Router) -> Result<(), Error> {
        self.serve_with_shutdown(router, shutdown_signal()).await
    }

    /// Like [`serve`](Server::serve), stopping when `signal` resolves.
    pub async fn serve_with_shutdown<S>(self, router: Router, signal: S) -> Result<(), Error>
    where
        S: Future<Output = ()>,
    {
        let listener = match self.bind {
            Bind::Addr(addr) => TcpListener::bind(addr).await?,
            Bind::Listener(listener) => listener,
        };
        let local_addr = listener.local_addr()?;
        let app = router.build();

        info!(addr = %local_addr, "listening");

        // JoinSet tracks every spawned connection task so we can wait for
        // them all to finish during graceful shutdown.
        let mut tasks = tokio::task::JoinSet::new();

        tokio::pin!(signal);

        loop {
            tokio::select! {
                // Check shutdown first so a SIGTERM immediately stops
                // accepting new connections, even if more are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let app = app.clone();
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // Called once per request on the connection.
                        let svc = service_fn(move |req| {
                            let app = app.clone();
                            async move { app.call(req).await }
                        });

                        // `auto::Builder` handles both HTTP/1.1 and HTTP/2.
                        // Upgrades stay enabled so handlers can take over
                        // the connection through `Request::upgrade`.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection_with_upgrades(io, svc)
                            .await
                        {
                            debug!(peer = %remote_addr, "connection closed: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        while tasks.join_next().await.is_some() {}

        info!("server stopped");
        Ok(())
    }
}

// ── App ───────────────────────────────────────────────────────────────────────

/// Returned by [`App::call`] when a handler aborted the response before
/// producing a head. The server drops the connection.
#[derive(Debug, thiserror::Error)]
#[error("handler aborted the response")]
pub struct Aborted;

/// A built [`Router`] with its middleware stack, ready to handle requests.
#[derive(Clone)]
pub struct App {
    handler: BoxedHandler,
    error_handler: ErrorHandler,
    body_limit: usize,
}

impl App {
    pub(crate) fn new(handler: BoxedHandler, error_handler: ErrorHandler, body_limit: usize) -> Self {
        Self { handler, error_handler, body_limit }
    }

    /// Handles one request and resolves with the response head.
    ///
    /// The body may still be streaming when this returns. A request body
    /// over the router's limit is answered with 413 before any handler runs.
    pub async fn call<B>(&self, req: http::Request<B>) -> Result<http::Response<Body>, Aborted>
    where
        B: hyper::body::Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();
        let (sink, head) = Sink::channel();
        let w = ResponseWriter::new(sink);

        match Limited::new(body, self.body_limit).collect().await {
            Ok(collected) => {
                let req = Request::new(parts, collected.to_bytes());
                let handler = Arc::clone(&self.handler);
                let error_handler = self.error_handler;
                tokio::spawn(async move {
                    if let Err(err) = handler.call(w.clone(), req).await {
                        error_handler(&w, &err);
                    }
                    w.finish().await;
                });
            }
            Err(e) => {
                let status = if e.is::<LengthLimitError>() {
                    StatusCode::PAYLOAD_TOO_LARGE
                } else {
                    StatusCode::BAD_REQUEST
                };
                (self.error_handler)(&w, &HttpError::new(status, e.to_string()));
                w.finish().await;
            }
        }

        head.await.map_err(|_| Aborted)
    }
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first shutdown signal the process receives.
///
/// On Unix this listens for both **SIGTERM** and **SIGINT** (Ctrl-C).
/// On Windows only Ctrl-C is available.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c   => {}
        () = sigterm  => {}
    }
}

