//! Data access facade over a SQL connection pool.
//!
//! [`Conn`] wraps a pool and [`Tx`] an open transaction; both implement
//! [`Querier`], so code that only runs queries can take either:
//!
//! ```rust,no_run
//! use toolkit::db::{self, Conn, Params, Querier};
//!
//! #[derive(sqlx::FromRow)]
//! struct User { id: i64, name: String }
//!
//! async fn rename<Q: Querier>(q: &mut Q, id: i64, name: &str) -> Result<User, db::Error> {
//!     q.exec("UPDATE users SET name = $1 WHERE id = $2", Params::new().bind(name).bind(id)).await?;
//!     q.get("SELECT id, name FROM users WHERE id = $1", Params::new().bind(id)).await
//! }
//!
//! # async fn run() -> Result<(), db::Error> {
//! let conn = Conn::open("sqlite::memory:").await?;
//! conn.transaction(|tx| Box::pin(async move { rename(tx, 1, "ada").await.map(drop) })).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The driver is picked from the URL scheme (`sqlite:`, `postgres:`).
//! Driver errors are passed through unchanged as [`Error::Sqlx`]; in
//! particular [`Querier::get`] on an empty result is
//! `Error::Sqlx(sqlx::Error::RowNotFound)`.

mod conn;
mod context;
mod rows;
mod tx;

use async_trait::async_trait;
use sqlx::any::{AnyArguments, AnyQueryResult, AnyRow};
use sqlx::error::BoxDynError;
use sqlx::{Any, Arguments, Encode, FromRow, Type};
use thiserror::Error;

use crate::config::{self, ConfigError};

pub use conn::Conn;
pub use context::{
    Handle, QUERIER, SharedTx, conn, exec, get, middleware, querier, query, select, transaction, with_conn, with_tx,
};
pub use rows::Rows;
pub use tx::Tx;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("querier missing from context")]
    NoQuerier,

    #[error("transaction has already been committed or rolled back")]
    TxDone,

    #[error("failed to encode query parameter: {0}")]
    Bind(#[source] BoxDynError),
}

/// Pool settings.
#[derive(Clone, Debug)]
pub struct Config {
    pub url: String,
    pub max_connections: u32,
}

impl Config {
    /// Reads `DATABASE_URL` (required) and `DATABASE_MAX_CONNECTIONS`
    /// (default 10).
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            url: config::required("DATABASE_URL")?,
            max_connections: config::parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
        })
    }
}

// ── Params ────────────────────────────────────────────────────────────────────

/// Positional bind parameters for one query.
///
/// An encode failure is kept and reported as [`Error::Bind`] when the query
/// runs; later binds are ignored.
#[derive(Default)]
pub struct Params<'q> {
    args: AnyArguments<'q>,
    error: Option<BoxDynError>,
}

impl<'q> Params<'q> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind<T>(mut self, value: T) -> Self
    where
        T: 'q + Encode<'q, Any> + Type<Any>,
    {
        if self.error.is_none() {
            if let Err(e) = self.args.add(value) {
                self.error = Some(e);
            }
        }
        self
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn into_arguments(self) -> Result<AnyArguments<'q>, Error> {
        match self.error {
            Some(e) => Err(Error::Bind(e)),
            None => Ok(self.args),
        }
    }
}

// ── Querier ───────────────────────────────────────────────────────────────────

/// Query operations shared by [`Conn`] and [`Tx`].
#[async_trait]
pub trait Querier: Send {
    /// Runs a statement that returns no rows (`INSERT`, `UPDATE`, ...).
    async fn exec<'q>(&mut self, query: &'q str, params: Params<'q>) -> Result<AnyQueryResult, Error>;

    /// Fetches exactly one row. Zero rows is `sqlx::Error::RowNotFound`.
    async fn get<'q, T>(&mut self, query: &'q str, params: Params<'q>) -> Result<T, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin;

    /// Fetches every row into memory.
    async fn select<'q, T>(&mut self, query: &'q str, params: Params<'q>) -> Result<Vec<T>, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin;

    /// Opens a cursor over the result set. Rows are fetched as the cursor is
    /// advanced; the cursor borrows the querier until it is dropped.
    fn query<'a>(&'a mut self, query: &'a str, params: Params<'a>) -> Result<Rows<'a>, Error>;
}
