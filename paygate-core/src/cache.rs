//! Cross-process counters with TTL.
//!
//! Daily turnover counters and the sequential-rotation pointer live in an
//! external in-memory store (Redis in production) because they're shared
//! by every worker process. All writes are idempotent or last-writer-wins
//! by design; a lost counter increment only loosens a daily cap until the
//! key expires.

use std::time::Duration;

use async_trait::async_trait;
use paygate_common::error::PayResult;
use rust_decimal::Decimal;

/// TTL applied to daily counters and rotation pointers.
pub const DAY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[async_trait]
pub trait Cache: Send + Sync + 'static {
    /// `INCRBYFLOAT`-style decimal add; returns the post-increment value.
    /// Sets `ttl` when the key is created.
    async fn incr_decimal(
        &self,
        key: &str,
        by: Decimal,
        ttl: Duration,
    ) -> PayResult<Decimal>;

    async fn get_decimal(&self, key: &str) -> PayResult<Option<Decimal>>;

    async fn get_i64(&self, key: &str) -> PayResult<Option<i64>>;

    async fn set_i64(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
    ) -> PayResult<()>;
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mem {
    //! In-memory [`Cache`] for tests. TTLs are honored against a coarse
    //! `Instant` clock.

    use std::{
        collections::HashMap,
        sync::Mutex,
        time::Instant,
    };

    use super::*;

    #[derive(Default)]
    pub struct MemCache {
        entries: Mutex<HashMap<String, (String, Option<Instant>)>>,
    }

    impl MemCache {
        pub fn new() -> Self {
            Self::default()
        }

        fn live(
            entries: &mut HashMap<String, (String, Option<Instant>)>,
            key: &str,
        ) -> Option<String> {
            match entries.get(key) {
                Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                    entries.remove(key);
                    None
                }
                Some((value, _)) => Some(value.clone()),
                None => None,
            }
        }
    }

    #[async_trait]
    impl Cache for MemCache {
        async fn incr_decimal(
            &self,
            key: &str,
            by: Decimal,
            ttl: Duration,
        ) -> PayResult<Decimal> {
            let mut entries = self.entries.lock().expect("poisoned");
            let current = Self::live(&mut entries, key)
                .and_then(|v| v.parse::<Decimal>().ok())
                .unwrap_or_default();
            let next = current + by;
            entries.insert(
                key.to_owned(),
                (next.to_string(), Some(Instant::now() + ttl)),
            );
            Ok(next)
        }

        async fn get_decimal(&self, key: &str) -> PayResult<Option<Decimal>> {
            let mut entries = self.entries.lock().expect("poisoned");
            Ok(Self::live(&mut entries, key)
                .and_then(|v| v.parse::<Decimal>().ok()))
        }

        async fn get_i64(&self, key: &str) -> PayResult<Option<i64>> {
            let mut entries = self.entries.lock().expect("poisoned");
            Ok(Self::live(&mut entries, key)
                .and_then(|v| v.parse::<i64>().ok()))
        }

        async fn set_i64(
            &self,
            key: &str,
            value: i64,
            ttl: Duration,
        ) -> PayResult<()> {
            let mut entries = self.entries.lock().expect("poisoned");
            entries.insert(
                key.to_owned(),
                (value.to_string(), Some(Instant::now() + ttl)),
            );
            Ok(())
        }
    }
}
