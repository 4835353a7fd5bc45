//! # toolkit
//!
//! Request-scoped plumbing for hyper services.
//!
//! Every request carries a [`Context`](context::Context): an immutable chain
//! of typed values that middleware attaches and handlers read. Around it sit
//! the pieces most services end up writing anyway:
//!
//! - [`db`]: a SQL facade over a pool or an open transaction, reachable
//!   from the request context
//! - [`ResponseWriter`]: handlers write into it; it remembers the status
//!   and byte count for the request log
//! - [`Router`] and [`Server`]: `matchit` routing, HTTP/1.1 and HTTP/2 via
//!   hyper, graceful shutdown on SIGTERM / Ctrl-C
//! - [`decode`] and [`response`]: JSON, form and multipart bodies in, JSON
//!   and text out
//! - [`template`]: handlebars pages with shared includes and layouts
//! - [`logging`] and [`middleware`]: `tracing` setup, request logging and
//!   panic recovery
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use toolkit::db::{self, Conn, Params};
//! use toolkit::{HttpError, Request, ResponseWriter, Router, Server, ServerConfig};
//! use toolkit::{decode, logging, middleware, response};
//!
//! #[derive(Deserialize)]
//! struct NewUser { name: String }
//!
//! #[derive(Serialize, sqlx::FromRow)]
//! struct User { id: i64, name: String }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     logging::init(&logging::Config::from_env()?)?;
//!     let conn = Conn::connect(&db::Config::from_env()?).await?;
//!
//!     let app = Router::new()
//!         .layer(middleware::request_logger())
//!         .layer(middleware::recoverer())
//!         .layer(db::middleware(conn))
//!         .get("/users/{id}", get_user)
//!         .post("/users", create_user);
//!
//!     Server::bind(ServerConfig::from_env()?.addr).serve(app).await?;
//!     Ok(())
//! }
//!
//! async fn get_user(w: ResponseWriter, req: Request) -> Result<(), HttpError> {
//!     let id: i64 = req.param("id").unwrap_or_default().parse()?;
//!     let user: User = db::get(req.context(), "SELECT id, name FROM users WHERE id = $1", Params::new().bind(id)).await?;
//!     Ok(response::render_json(&w, &user)?)
//! }
//!
//! async fn create_user(w: ResponseWriter, req: Request) -> Result<(), HttpError> {
//!     let input: NewUser = decode(&req)?;
//!     db::exec(req.context(), "INSERT INTO users (name) VALUES ($1)", Params::new().bind(input.name)).await?;
//!     response::write_status(&w, http::StatusCode::CREATED, None);
//!     Ok(())
//! }
//! ```

mod config;
mod decode;
mod error;
mod handler;
mod request;
mod router;
mod server;
mod writer;

pub mod context;
pub mod db;
pub mod logging;
pub mod middleware;
pub mod response;
pub mod template;

pub use config::ConfigError;
pub use decode::decode;
pub use error::{Error, ErrorHandler, HttpError, default_error_handler};
pub use handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler};
pub use request::Request;
pub use response::ContentType;
pub use router::Router;
pub use server::{Aborted, App, DEFAULT_BODY_LIMIT, Server, ServerConfig};
pub use writer::{Body, ResponseWriter, Sink};
