//! Connection Broker: serializes all writes through a single worker task.
//!
//! Reads go straight through the pool's own WAL-backed reader connections;
//! writes are submitted as boxed closures to a bounded channel drained by
//! one spawned task holding a dedicated write connection, so at most one
//! write is ever in flight regardless of how many callers submit work.

use sqlx::sqlite::SqlitePool;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("connection broker not initialized")]
    NotInitialized,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("operation timed out")]
    OperationTimeout,
}

type WriteJob = Box<dyn FnOnce(&SqlitePool) -> BoxedFuture + Send>;
type BoxedFuture = std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>;

/// Single-writer handle. Clone freely — all clones share the same worker.
#[derive(Clone)]
pub struct ConnectionBroker {
    pool: SqlitePool,
    tx: mpsc::Sender<WriteJob>,
}

impl ConnectionBroker {
    /// Lazily start the writer worker for `pool`. Idempotent: callers may
    /// hold multiple clones of the returned broker.
    pub fn new(pool: SqlitePool) -> Self {
        let (tx, mut rx) = mpsc::channel::<WriteJob>(256);
        let worker_pool = pool.clone();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job(&worker_pool).await;
            }
        });

        Self { pool, tx }
    }

    /// Run a read-only operation directly against the pool's concurrent readers.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Submit a write operation to the single writer task and await its result.
    ///
    /// The operation runs strictly after every previously submitted write
    /// has completed; scheduled-but-not-yet-started operations may be
    /// dropped by dropping the returned future before it resolves, but an
    /// operation already running on the worker cannot be interrupted
    /// mid-statement.
    pub async fn execute<F, T>(&self, op: F) -> Result<T, BrokerError>
    where
        F: for<'a> FnOnce(&'a SqlitePool) -> std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();

        let job: WriteJob = Box::new(move |pool: &SqlitePool| {
            let fut = op(pool);
            Box::pin(async move {
                let value = fut.await;
                let _ = result_tx.send(value);
            })
        });

        self.tx
            .send(job)
            .await
            .map_err(|_| BrokerError::NotInitialized)?;

        result_rx.await.map_err(|_| BrokerError::OperationTimeout)
    }

    /// Run `op` inside a `BEGIN`/`COMMIT` transaction on the writer
    /// connection; any error rolls the transaction back and propagates.
    pub async fn transaction<F, T>(&self, op: F) -> Result<T, sqlx::Error>
    where
        F: for<'c> FnOnce(
                &'c mut sqlx::Transaction<'_, sqlx::Sqlite>,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<T, sqlx::Error>> + Send + 'c>,
            > + Send
            + 'static,
        T: Send + 'static,
    {
        self.execute(move |pool| {
            Box::pin(async move {
                let mut tx = pool.begin().await?;
                match op(&mut tx).await {
                    Ok(value) => {
                        tx.commit().await?;
                        Ok(value)
                    }
                    Err(e) => {
                        let _ = tx.rollback().await;
                        Err(e)
                    }
                }
            })
        })
        .await
        .map_err(|_| sqlx::Error::PoolClosed)?
    }

    /// Drain pending operations and release the pool.
    pub async fn close(self) {
        drop(self.tx);
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    async fn test_pool() -> SqlitePool {
        SqlitePool::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn serializes_writes_and_allows_reads() {
        let pool = test_pool().await;
        sqlx::query("CREATE TABLE t (v INTEGER)")
            .execute(&pool)
            .await
            .unwrap();

        let broker = ConnectionBroker::new(pool);

        for i in 0..10 {
            broker
                .execute(move |pool| {
                    Box::pin(async move {
                        sqlx::query("INSERT INTO t (v) VALUES (?)")
                            .bind(i)
                            .execute(pool)
                            .await
                            .unwrap();
                    })
                })
                .await
                .unwrap();
        }

        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM t")
            .fetch_one(broker.pool())
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let pool = test_pool().await;
        sqlx::query("CREATE TABLE t (v INTEGER UNIQUE)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO t (v) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();

        let broker = ConnectionBroker::new(pool);

        let result = broker
            .transaction(|tx| {
                Box::pin(async move {
                    sqlx::query("INSERT INTO t (v) VALUES (2)")
                        .execute(&mut **tx)
                        .await?;
                    sqlx::query("INSERT INTO t (v) VALUES (1)")
                        .execute(&mut **tx)
                        .await?;
                    Ok(())
                })
            })
            .await;

        assert!(result.is_err());

        let count: i64 = sqlx::query("SELECT COUNT(*) AS c FROM t")
            .fetch_one(broker.pool())
            .await
            .unwrap()
            .get("c");
        assert_eq!(count, 1);
    }
}
