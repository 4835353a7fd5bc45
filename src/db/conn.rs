use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlx::any::{AnyPoolOptions, AnyQueryResult, AnyRow};
use sqlx::{AnyPool, FromRow};
use tracing::debug;

use super::{Config, Error, Params, Querier, Rows, Tx};

/// A connection pool.
///
/// Cloning is cheap and clones share the pool. Queries run on any idle
/// connection; use [`Conn::begin`] or [`Conn::transaction`] to pin a series of
/// statements to one connection.
#[derive(Clone, Debug)]
pub struct Conn {
    pool: AnyPool,
}

impl Conn {
    /// Connects with default pool settings.
    pub async fn open(url: &str) -> Result<Self, Error> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new().connect(url).await?;
        Ok(Self { pool })
    }

    pub async fn connect(config: &Config) -> Result<Self, Error> {
        sqlx::any::install_default_drivers();
        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        debug!(max_connections = config.max_connections, "database pool ready");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Starts a transaction. Prefer [`Conn::transaction`] unless the
    /// transaction has to outlive a single call.
    pub async fn begin(&self) -> Result<Tx, Error> {
        Ok(Tx::new(self.pool.begin().await?))
    }

    /// Runs `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`. A
    /// rollback failure is dropped in favour of the callback's own error. If
    /// `f` panics the transaction is dropped, which also rolls it back.
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<Error>,
        F: for<'t> FnOnce(&'t mut Tx) -> BoxFuture<'t, Result<T, E>>,
    {
        let mut tx = self.begin().await?;
        match f(&mut tx).await {
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

    pub async fn exec<'q>(&self, query: &'q str, params: Params<'q>) -> Result<AnyQueryResult, Error> {
        let args = params.into_arguments()?;
        Ok(sqlx::query_with(query, args).execute(&self.pool).await?)
    }

    pub async fn get<'q, T>(&self, query: &'q str, params: Params<'q>) -> Result<T, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let args = params.into_arguments()?;
        Ok(sqlx::query_as_with(query, args).fetch_one(&self.pool).await?)
    }

    pub async fn select<'q, T>(&self, query: &'q str, params: Params<'q>) -> Result<Vec<T>, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let args = params.into_arguments()?;
        Ok(sqlx::query_as_with(query, args).fetch_all(&self.pool).await?)
    }

    pub fn query<'a>(&'a self, query: &'a str, params: Params<'a>) -> Result<Rows<'a>, Error> {
        let args = params.into_arguments()?;
        Ok(Rows::new(sqlx::query_with(query, args).fetch(&self.pool)))
    }
}

#[async_trait]
impl Querier for Conn {
    async fn exec<'q>(&mut self, query: &'q str, params: Params<'q>) -> Result<AnyQueryResult, Error> {
        Conn::exec(self, query, params).await
    }

    async fn get<'q, T>(&mut self, query: &'q str, params: Params<'q>) -> Result<T, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        Conn::get(self, query, params).await
    }

    async fn select<'q, T>(&mut self, query: &'q str, params: Params<'q>) -> Result<Vec<T>, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        Conn::select(self, query, params).await
    }

    fn query<'a>(&'a mut self, query: &'a str, params: Params<'a>) -> Result<Rows<'a>, Error> {
        Conn::query(self, query, params)
    }
}
