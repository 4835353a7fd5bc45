use async_trait::async_trait;
use sqlx::any::{AnyQueryResult, AnyRow};
use sqlx::{Any, AnyConnection, FromRow, Transaction};

use super::{Error, Params, Querier, Rows};

/// An open transaction.
///
/// The first [`commit`](Tx::commit) or [`rollback`](Tx::rollback) ends it.
/// Every call after that returns [`Error::TxDone`] without reaching the
/// database. Dropping a `Tx` that is still open rolls it back.
pub struct Tx {
    inner: Option<Transaction<'static, Any>>,
}

impl Tx {
    pub(crate) fn new(inner: Transaction<'static, Any>) -> Self {
        Self { inner: Some(inner) }
    }

    pub fn is_done(&self) -> bool {
        self.inner.is_none()
    }

    pub async fn commit(&mut self) -> Result<(), Error> {
        let tx = self.inner.take().ok_or(Error::TxDone)?;
        Ok(tx.commit().await?)
    }

    pub async fn rollback(&mut self) -> Result<(), Error> {
        let tx = self.inner.take().ok_or(Error::TxDone)?;
        Ok(tx.rollback().await?)
    }

    fn conn(&mut self) -> Result<&mut AnyConnection, Error> {
        self.inner.as_deref_mut().ok_or(Error::TxDone)
    }
}

impl std::fmt::Debug for Tx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tx").field("done", &self.is_done()).finish()
    }
}

#[async_trait]
impl Querier for Tx {
    async fn exec<'q>(&mut self, query: &'q str, params: Params<'q>) -> Result<AnyQueryResult, Error> {
        let args = params.into_arguments()?;
        Ok(sqlx::query_with(query, args).execute(self.conn()?).await?)
    }

    async fn get<'q, T>(&mut self, query: &'q str, params: Params<'q>) -> Result<T, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let args = params.into_arguments()?;
        Ok(sqlx::query_as_with(query, args).fetch_one(self.conn()?).await?)
    }

    async fn select<'q, T>(&mut self, query: &'q str, params: Params<'q>) -> Result<Vec<T>, Error>
    where
        T: for<'r> FromRow<'r, AnyRow> + Send + Unpin,
    {
        let args = params.into_arguments()?;
        Ok(sqlx::query_as_with(query, args).fetch_all(self.conn()?).await?)
    }

    fn query<'a>(&'a mut self, query: &'a str, params: Params<'a>) -> Result<Rows<'a>, Error> {
        let args = params.into_arguments()?;
        let conn = self.conn()?;
        Ok(Rows::new(sqlx::query_with(query, args).fetch(conn)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::{Item, memory};

    async fn count(conn: &crate::db::Conn) -> i64 {
        let (n,): (i64,) = conn.get("SELECT COUNT(*) FROM items", Params::new()).await.unwrap();
        n
    }

    #[tokio::test]
    async fn commit_then_everything_is_tx_done() {
        let conn = memory().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO items (id, name) VALUES (1, 'one')", Params::new()).await.unwrap();
        let item: Item = tx.get("SELECT id, name FROM items", Params::new()).await.unwrap();
        assert_eq!(item.name, "one");

        tx.commit().await.unwrap();
        assert!(tx.is_done());
        assert!(matches!(tx.commit().await, Err(Error::TxDone)));
        assert!(matches!(tx.rollback().await, Err(Error::TxDone)));
        assert!(matches!(tx.exec("DELETE FROM items", Params::new()).await, Err(Error::TxDone)));
        assert!(matches!(tx.query("SELECT id FROM items", Params::new()), Err(Error::TxDone)));

        assert_eq!(count(&conn).await, 1);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let conn = memory().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO items (id, name) VALUES (1, 'one')", Params::new()).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(matches!(tx.commit().await, Err(Error::TxDone)));
        assert_eq!(count(&conn).await, 0);
    }

    #[tokio::test]
    async fn drop_rolls_back() {
        let conn = memory().await;
        {
            let mut tx = conn.begin().await.unwrap();
            tx.exec("INSERT INTO items (id, name) VALUES (1, 'one')", Params::new()).await.unwrap();
        }
        assert_eq!(count(&conn).await, 0);
    }

    #[tokio::test]
    async fn select_inside_transaction_sees_its_writes() {
        let conn = memory().await;
        let mut tx = conn.begin().await.unwrap();
        for (id, name) in [(1_i64, "a"), (2, "b")] {
            tx.exec("INSERT INTO items (id, name) VALUES ($1, $2)", Params::new().bind(id).bind(name))
                .await
                .unwrap();
        }
        let items: Vec<Item> = tx.select("SELECT id, name FROM items ORDER BY id", Params::new()).await.unwrap();
        assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), [1, 2]);
        tx.rollback().await.unwrap();
    }
}
