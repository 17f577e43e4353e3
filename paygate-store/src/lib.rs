//! Production persistence: Postgres behind the [`paygate_core::store`]
//! ports and Redis behind [`paygate_core::cache`].
//!
//! All monetary transactions take `SELECT … FOR UPDATE` on the merchant
//! wallet row; see the locking contract on the traits.

/// Postgres [`Store`](paygate_core::store::Store) implementation.
pub mod pg;
/// Redis [`Cache`](paygate_core::cache::Cache) implementation.
pub mod redis_cache;

pub use pg::PgStore;
pub use redis_cache::RedisCache;
