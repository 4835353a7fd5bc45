use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use sqlx::FromRow;
use sqlx::any::AnyRow;

use super::Error;

/// A cursor over a result set, fetched one row at a time.
///
/// Dropping it releases the underlying statement.
pub struct Rows<'a> {
    stream: BoxStream<'a, Result<AnyRow, sqlx::Error>>,
}

impl<'a> Rows<'a> {
    pub(crate) fn new(stream: BoxStream<'a, Result<AnyRow, sqlx::Error>>) -> Self {
        Self { stream }
    }

    /// A cursor over rows that were already fetched.
    pub(crate) fn buffered(rows: Vec<AnyRow>) -> Self {
        Self::new(stream::iter(rows.into_iter().map(Ok)).boxed())
    }

    /// Decodes the next row into `T`. `Ok(None)` once the result set is
    /// exhausted.
    pub async fn next<T>(&mut self) -> Result<Option<T>, Error>
    where
        T: for<'r> FromRow<'r, AnyRow>,
    {
        match self.next_row().await? {
            Some(row) => Ok(Some(T::from_row(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn next_row(&mut self) -> Result<Option<AnyRow>, Error> {
        Ok(self.stream.try_next().await?)
    }
}

#[cfg(test)]
mod tests {
    use sqlx::Row;

    use super::*;
    use crate::db::testing::{Item, memory};
    use crate::db::{Params, Querier};

    #[tokio::test]
    async fn iterates_rows_in_order() {
        let conn = memory().await;
        conn.exec("INSERT INTO items (id, name) VALUES (1, 'a'), (2, 'b'), (3, 'c')", Params::new())
            .await
            .unwrap();

        let mut rows = conn.query("SELECT id, name FROM items ORDER BY id", Params::new()).unwrap();
        let mut names = Vec::new();
        while let Some(item) = rows.next::<Item>().await.unwrap() {
            names.push(item.name);
        }
        assert_eq!(names, ["a", "b", "c"]);
        assert!(rows.next::<Item>().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn raw_rows_from_a_transaction() {
        let conn = memory().await;
        let mut tx = conn.begin().await.unwrap();
        tx.exec("INSERT INTO items (id, name) VALUES (5, 'five')", Params::new()).await.unwrap();

        {
            let mut rows = tx.query("SELECT id, name FROM items", Params::new()).unwrap();
            let row = rows.next_row().await.unwrap().unwrap();
            assert_eq!(row.try_get::<i64, _>("id").unwrap(), 5);
            assert_eq!(row.try_get::<String, _>("name").unwrap(), "five");
        }

        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn dropping_a_cursor_early_frees_the_connection() {
        let conn = memory().await;
        conn.exec("INSERT INTO items (id, name) VALUES (1, 'a'), (2, 'b')", Params::new())
            .await
            .unwrap();

        let mut rows = conn.query("SELECT id, name FROM items", Params::new()).unwrap();
        assert!(rows.next::<Item>().await.unwrap().is_some());
        drop(rows);

        // The pool has a single connection; this would hang if it were still held.
        let items: Vec<Item> = conn.select("SELECT id, name FROM items", Params::new()).await.unwrap();
        assert_eq!(items.len(), 2);
    }
}
