//! The delayed job queue.
//!
//! Settlement and merchant notification both run detached from the
//! request that caused them. Jobs go through the [`JobQueue`] port; the
//! production implementation is in-process: each enqueue spawns a timer
//! task that feeds a ready channel drained by [`run_worker`]. Queue jobs
//! are cancelable only between attempts; a running attempt runs to
//! completion.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use paygate_common::{error::PayResult, ids::TradeNo};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::{ctx::Ctx, notify::NotifyDispatcher, order::OrderEngine};

/// A unit of deferred work.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Job {
    /// Move a paid order's funds from unavailable to available.
    SettleOrder { trade_no: TradeNo },
    /// Deliver (or retry) the merchant notification for an order.
    NotifyMerchant { trade_no: TradeNo },
}

#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    async fn enqueue(&self, job: Job, delay: Duration) -> PayResult<()>;
}

/// Sender half of the in-process queue.
pub struct DelayedJobQueue {
    tx: mpsc::UnboundedSender<(Job, Duration)>,
}

/// Receiver half, consumed by [`run_worker`].
pub struct JobReceiver {
    rx: mpsc::UnboundedReceiver<(Job, Duration)>,
}

impl DelayedJobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, JobReceiver { rx })
    }
}

#[async_trait]
impl JobQueue for DelayedJobQueue {
    async fn enqueue(&self, job: Job, delay: Duration) -> PayResult<()> {
        self.tx.send((job, delay)).map_err(|_| {
            paygate_common::Error::internal(anyhow::anyhow!(
                "job queue receiver is gone"
            ))
        })
    }
}

/// Drain jobs until shutdown. Failed jobs are logged and dropped here;
/// each engine owns its retry policy (notification retries re-enqueue
/// themselves, settlement failures flip `settle_state` to FAILED for
/// admin-driven retry).
pub async fn run_worker(
    ctx: Arc<Ctx>,
    receiver: JobReceiver,
    mut shutdown: watch::Receiver<bool>,
) {
    let JobReceiver { mut rx } = receiver;
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<Job>();
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some((job, delay)) => {
                    let ready_tx = ready_tx.clone();
                    tokio::spawn(async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        // Worker gone means we're shutting down.
                        let _ = ready_tx.send(job);
                    });
                }
                None => break,
            },
            Some(job) = ready_rx.recv() => {
                handle_job(&ctx, job).await;
            }
            _ = shutdown.changed() => break,
        }
    }
    info!("job worker stopped");
}

async fn handle_job(ctx: &Arc<Ctx>, job: Job) {
    let result = match &job {
        Job::SettleOrder { trade_no } =>
            OrderEngine::new(ctx.clone()).settle(trade_no).await,
        Job::NotifyMerchant { trade_no } =>
            NotifyDispatcher::new(ctx.clone()).dispatch(trade_no).await,
    };
    if let Err(err) = result {
        warn!(?job, %err, "queue job failed");
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod recording {
    //! A [`JobQueue`] that records enqueues for assertions and can be
    //! told to fail.

    use std::sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[derive(Default)]
    pub struct RecordingQueue {
        jobs: Mutex<Vec<(Job, Duration)>>,
        fail: AtomicBool,
    }

    impl RecordingQueue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_fail(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }

        pub fn take(&self) -> Vec<(Job, Duration)> {
            std::mem::take(&mut *self.jobs.lock().expect("poisoned"))
        }
    }

    #[async_trait]
    impl JobQueue for RecordingQueue {
        async fn enqueue(&self, job: Job, delay: Duration) -> PayResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(paygate_common::Error::internal(anyhow::anyhow!(
                    "queue unavailable"
                )));
            }
            self.jobs.lock().expect("poisoned").push((job, delay));
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use paygate_common::{Amount, enums::SettleCycle};

    use super::*;
    use crate::{
        ctx::testing::test_ctx,
        order::{NewOrder, NewOrderBuyer, OrderEngine, PaidUpdate},
        testutil,
    };

    /// Settle job flowing through the real worker end to end.
    #[tokio::test]
    async fn worker_executes_settlement_jobs() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        let mut ch = testutil::channel(10);
        ch.settle_cycle = SettleCycle::D1;
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(100, 10, 1)).await;

        let engine = OrderEngine::new(t.ctx.clone());
        let created = engine
            .create(
                &merchant,
                NewOrder {
                    out_trade_no: "WRK-1".to_owned(),
                    payment_type: paygate_common::enums::PaymentType::Alipay,
                    channel_code: None,
                    subject: "worker order".to_owned(),
                    total_amount: Amount::from_cents(10_000),
                    notify_url: None,
                    return_url: None,
                    attach: None,
                    sign_type: paygate_common::enums::SignType::Sha3,
                    buyer: NewOrderBuyer::default(),
                    device_fingerprint: None,
                },
            )
            .await
            .unwrap();
        engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), false)
            .await
            .unwrap();

        // Funds parked in unavailable; feed the settle job through a
        // real worker with zero delay.
        let (queue, receiver) = DelayedJobQueue::new();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let worker =
            tokio::spawn(run_worker(t.ctx.clone(), receiver, shutdown_rx));

        queue
            .enqueue(
                Job::SettleOrder { trade_no: created.order.trade_no.clone() },
                Duration::ZERO,
            )
            .await
            .unwrap();

        // Give the worker a beat to run the job.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
        assert_eq!(wallet.unavailable, Amount::ZERO);

        shutdown_tx.send(true).unwrap();
        worker.await.unwrap();
    }
}
