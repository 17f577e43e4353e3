//! The explicit context value engines carry instead of globals.
//!
//! Handles to the store, cache, queue, driver registry, configuration,
//! and the platform's signing identity travel together in one [`Ctx`].
//! Request handlers and workers receive an `Arc<Ctx>`; nothing reaches
//! for ambient state.

use std::sync::Arc;

use paygate_common::config::Config;
use paygate_crypto::PlatformSigner;

use crate::{cache::Cache, driver::DriverRegistry, queue::JobQueue, store::Store};

pub struct Ctx {
    pub store: Arc<dyn Store>,
    pub cache: Arc<dyn Cache>,
    pub queue: Arc<dyn JobQueue>,
    pub drivers: DriverRegistry,
    pub config: Config,
    /// Platform RSA identity; signs outgoing notifications.
    pub signer: PlatformSigner,
    /// Shared HTTP client for notification delivery.
    pub http: reqwest::Client,
}

#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    //! A fully in-memory [`Ctx`] for engine and API tests.

    use std::sync::OnceLock;

    use paygate_common::enums::FeeBearer;

    use super::*;
    use crate::{
        cache::mem::MemCache,
        driver::mock::MockDriver,
        queue::recording::RecordingQueue,
        store::mem::MemStore,
    };

    /// Handles to every fake behind a test [`Ctx`].
    pub struct TestCtx {
        pub ctx: Arc<Ctx>,
        pub store: MemStore,
        pub cache: Arc<MemCache>,
        pub queue: Arc<RecordingQueue>,
        pub driver: Arc<MockDriver>,
    }

    /// RSA keygen is expensive; share one platform identity per process.
    fn test_signer() -> PlatformSigner {
        static SIGNER: OnceLock<PlatformSigner> = OnceLock::new();
        SIGNER
            .get_or_init(|| {
                let mut rng = rand::thread_rng();
                let (private_b64, _public) =
                    paygate_crypto::generate_rsa_keypair(&mut rng, 1024)
                        .expect("keygen");
                PlatformSigner::from_b64_der(&private_b64).expect("load key")
            })
            .clone()
    }

    pub fn test_config() -> Config {
        Config {
            database_url: String::new(),
            redis_url: String::new(),
            listen_addr: ([127, 0, 0, 1], 0).into(),
            public_url: "http://127.0.0.1:0".to_owned(),
            timezone: chrono_tz::Asia::Shanghai,
            platform_rsa_key_b64: String::new(),
            platform_aes_key: [7u8; 32],
            ip_order_limit: 0,
            account_order_limit: 0,
            refund_fee_bearer: FeeBearer::Merchant,
            site_name: "paygate-test".to_owned(),
            notify_timeout: std::time::Duration::from_secs(2),
            driver_timeout: std::time::Duration::from_secs(2),
        }
    }

    pub fn test_ctx() -> TestCtx {
        test_ctx_with_config(test_config())
    }

    pub fn test_ctx_with_config(config: Config) -> TestCtx {
        let store = MemStore::new();
        let cache = Arc::new(MemCache::new());
        let queue = Arc::new(RecordingQueue::new());
        let driver = Arc::new(MockDriver::new());

        let mut drivers = DriverRegistry::new();
        drivers.register(driver.clone());

        let ctx = Arc::new(Ctx {
            store: Arc::new(store.clone()),
            cache: cache.clone(),
            queue: queue.clone(),
            drivers,
            config,
            signer: test_signer(),
            http: reqwest::Client::new(),
        });

        TestCtx { ctx, store, cache, queue, driver }
    }
}
