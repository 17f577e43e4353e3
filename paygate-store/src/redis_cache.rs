//! Redis implementation of the [`Cache`] port.
//!
//! Daily counters use `INCRBYFLOAT` with decimal string rendering so the
//! values survive as exact decimals; rotation pointers are plain strings
//! with a TTL. A key's TTL is set right after its first write -- two
//! workers racing on that step both set the same TTL, which is fine.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use paygate_common::{Error, error::PayResult};
use paygate_core::cache::Cache;
use redis::{AsyncCommands, aio::ConnectionManager};
use rust_decimal::Decimal;

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl RedisCache {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn redis_err(err: redis::RedisError) -> Error {
    Error::internal(anyhow::Error::new(err).context("redis error"))
}

fn parse_decimal(raw: &str) -> PayResult<Decimal> {
    Decimal::from_str(raw).map_err(|_| {
        Error::internal(anyhow::anyhow!("non-decimal counter value: {raw}"))
    })
}

#[async_trait]
impl Cache for RedisCache {
    async fn incr_decimal(
        &self,
        key: &str,
        by: Decimal,
        ttl: Duration,
    ) -> PayResult<Decimal> {
        let mut conn = self.conn.clone();
        let raw: String = redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(by.to_string())
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        let value = parse_decimal(&raw)?;
        if value == by {
            // First write created the key; arm its TTL.
            let _: () = conn
                .expire(key, ttl.as_secs() as i64)
                .await
                .map_err(redis_err)?;
        }
        Ok(value)
    }

    async fn get_decimal(&self, key: &str) -> PayResult<Option<Decimal>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> =
            conn.get(key).await.map_err(redis_err)?;
        raw.as_deref().map(parse_decimal).transpose()
    }

    async fn get_i64(&self, key: &str) -> PayResult<Option<i64>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(redis_err)
    }

    async fn set_i64(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> PayResult<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs())
            .await
            .map_err(redis_err)?;
        Ok(())
    }
}
