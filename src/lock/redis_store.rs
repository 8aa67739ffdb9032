//! Redis-backed lock store shared by every control-plane process.

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::OnceCell;

use super::{LockError, LockStore};
use crate::backend::BackendFuture;

/// Lock store using `SET NX PX` on a Redis server.
///
/// The connection is opened on first use and multiplexed afterwards.
#[derive(Debug)]
pub struct RedisLockStore {
    client: redis::Client,
    connection: OnceCell<MultiplexedConnection>,
}

impl RedisLockStore {
    /// Creates a store for the server at `url` (e.g. `redis://127.0.0.1/`).
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Store`] when the URL is invalid.
    pub fn open(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url).map_err(store_error)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, LockError> {
        self.connection
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(store_error)
            })
            .await
            .cloned()
    }
}

impl LockStore for RedisLockStore {
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> BackendFuture<'a, bool, LockError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("PX")
                .arg(millis)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            Ok(reply.is_some())
        })
    }

    fn replace<'a>(&'a self, key: &'a str, value: &'a str) -> BackendFuture<'a, bool, LockError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("XX")
                .arg("KEEPTTL")
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            Ok(reply.is_some())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BackendFuture<'a, Option<String>, LockError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let value: Option<String> = conn.get(key).await.map_err(store_error)?;
            Ok(value)
        })
    }

    fn remove<'a>(&'a self, key: &'a str) -> BackendFuture<'a, bool, LockError> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let removed: i64 = conn.del(key).await.map_err(store_error)?;
            Ok(removed > 0)
        })
    }
}

fn store_error(err: redis::RedisError) -> LockError {
    LockError::Store {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_urls() {
        let err = RedisLockStore::open("not a url").expect_err("invalid url");
        assert!(matches!(err, LockError::Store { .. }), "{err:?}");
    }
}
