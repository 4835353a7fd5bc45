//! Request-context access to the database.
//!
//! [`middleware`] attaches a [`Conn`] to every request; handlers then query
//! through the context without threading the pool through by hand. Inside
//! [`transaction`] the same helpers run on the open transaction instead.

use std::sync::Arc;

use futures::future::BoxFuture;
use sqlx::FromRow;
use sqlx::any::{AnyQueryResult, AnyRow};
use tokio::sync::Mutex;
use tracing::debug;

use super::{Conn, Error, Params, Querier, Rows, Tx};
use crate::context::{Context, Key};
use crate::handler::BoxedHandler;

/// A transaction shared between the contexts derived inside it.
pub type SharedTx = Arc<Mutex<Tx>>;

/// Whatever the context helpers query through.
#[derive(Clone, Debug)]
pub enum Handle {
    Conn(Conn),
    Tx(SharedTx),
}

pub static QUERIER: Key<Handle> = Key::new("querier");

pub fn with_conn(ctx: &Context, conn: Conn) -> Context {
    ctx.with_value(QUERIER, Handle::Conn(conn))
}

/// Derives a context whose helpers run inside `tx`.
pub fn with_tx(ctx: &Context, tx: &SharedTx) -> Context {
    ctx.with_value(QUERIER, Handle::Tx(Arc::clone(tx)))
}

pub fn querier(ctx: &Context) -> Option<&Handle> {
    ctx.value(QUERIER)
}

/// The pool attached to `ctx`. `None` inside a transaction.
pub fn conn(ctx: &Context) -> Option<&Conn> {
    match querier(ctx)? {
        Handle::Conn(conn) => Some(conn),
        Handle::Tx(_) => None,
    }
}

fn require(ctx: &Context) -> Result<&Handle, Error> {
    querier(ctx).ok_or(Error::NoQuerier)
}

pub async fn exec<'q>(ctx: &Context, query: &'q str, params: Params<'q>) -> Result<AnyQueryResult, Error> {
    match require(ctx)? {
        Handle::Conn(conn) => conn.exec(query, params).await,
        Handle::Tx(tx) => tx.lock().await.exec(query, params).await,
    }
}

pub async fn get<'q, T>(ctx: &Context, query: &'q str, params: Params<'q>) -> Result<T, Error>
where
    T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
{
    match require(ctx)? {
        Handle::Conn(conn) => conn.get(query, params).await,
        Handle::Tx(tx) => tx.lock().await.get(query, params).await,
    }
}

pub async fn select<'q, T>(ctx: &Context, query: &'q str, params: Params<'q>) -> Result<Vec<T>, Error>
where
    T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
{
    match require(ctx)? {
        Handle::Conn(conn) => conn.select(query, params).await,
        Handle::Tx(tx) => tx.lock().await.select(query, params).await,
    }
}

/// Opens a cursor through the context's querier.
///
/// On a pool rows stream as the cursor advances. Inside a transaction the
/// result set is read up front, so the transaction is free again as soon as
/// this returns.
pub async fn query<'a>(ctx: &'a Context, query: &'a str, params: Params<'a>) -> Result<Rows<'a>, Error> {
    match require(ctx)? {
        Handle::Conn(conn) => conn.query(query, params),
        Handle::Tx(tx) => {
            let mut tx = tx.lock().await;
            let mut cursor = tx.query(query, params)?;
            let mut rows = Vec::new();
            while let Some(row) = cursor.next_row().await? {
                rows.push(row);
            }
            Ok(Rows::buffered(rows))
        }
    }
}

/// Runs `f` with a context whose helpers share one transaction.
///
/// Commits when `f` returns `Ok` and rolls back when it returns `Err` or
/// panics. Called inside another `transaction`, `f` joins the enclosing one.
pub async fn transaction<T, E, F>(ctx: &Context, f: F) -> Result<T, E>
where
    E: From<Error>,
    F: for<'c> FnOnce(&'c Context) -> BoxFuture<'c, Result<T, E>>,
{
    let conn = match require(ctx)? {
        Handle::Conn(conn) => conn,
        Handle::Tx(_) => return f(ctx).await,
    };

    let tx: SharedTx = Arc::new(Mutex::new(conn.begin().await?));
    let result = {
        let inner = with_tx(ctx, &tx);
        f(&inner).await
    };

    let mut tx = tx.lock().await;
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                debug!(error = %rollback, "rollback after failed transaction");
            }
            Err(err)
        }
    }
}

/// Attaches `conn` to every request under [`QUERIER`].
pub fn middleware(conn: Conn) -> impl Fn(BoxedHandler) -> BoxedHandler + Send + Sync + 'static {
    crate::middleware::attach(QUERIER, Handle::Conn(conn))
}
