//! Refund validation and execution.
//!
//! A refund debits the merchant's available balance, optionally restitutes
//! a prorated share of the fee, inserts the refund row, and advances the
//! order state -- all in one transaction. Auto refunds additionally call
//! the upstream driver *inside* that transaction: if the upstream refuses,
//! nothing at all happened here.

use std::sync::Arc;

use chrono::Datelike;
use paygate_common::{
    Amount, Error,
    amount::round_money,
    enums::{
        RefundInitiateType, RefundStatus, SettleState, TradeState,
        WalletChangeType,
    },
    error::PayResult,
    ids::{RefundId, TradeNo},
    time::now,
};
use rust_decimal::Decimal;
use tracing::instrument;

use crate::{
    ctx::Ctx,
    ledger,
    models::{Order, OrderRefund},
    store::StoreTxn,
};

/// Scale used for the fee proration ratio before the final money
/// rounding.
const PRORATION_SCALE: u32 = 8;

/// A request to refund part or all of an order.
#[derive(Clone, Debug)]
pub struct NewRefund {
    pub trade_no: TradeNo,
    pub amount: Amount,
    pub initiate_type: RefundInitiateType,
    /// Auto refunds call the upstream driver; manual ones assume the
    /// money moved out of band.
    pub auto: bool,
    /// Restitute the prorated fee to the merchant.
    pub fee_bearer: bool,
    /// Merchant idempotency key.
    pub out_biz_no: Option<String>,
    pub reason: Option<String>,
}

pub struct RefundEngine {
    ctx: Arc<Ctx>,
}

impl RefundEngine {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Execute a refund.
    ///
    /// Idempotent on `(merchant_id, out_biz_no)`: an exact replay returns
    /// the existing row, a mismatched one conflicts.
    #[instrument(skip_all, name = "(refund)", fields(trade_no = %req.trade_no))]
    pub async fn handle(&self, req: NewRefund) -> PayResult<OrderRefund> {
        if req.amount.is_zero() {
            return Err(Error::invalid_request(
                "refund amount must be positive",
            ));
        }

        let pre = self
            .ctx
            .store
            .order(&req.trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        if let Some(out_biz_no) = req.out_biz_no.as_deref() {
            if let Some(existing) = self
                .ctx
                .store
                .refund_by_out_biz_no(pre.merchant_id, out_biz_no)
                .await?
            {
                if existing.trade_no == req.trade_no
                    && existing.amount == req.amount
                {
                    return Ok(existing);
                }
                return Err(Error::conflict(
                    "out_biz_no reused with different parameters",
                ));
            }
        }

        // Resolve driver material up front; the store's connection is
        // busy once the transaction below is open.
        let upstream = if req.auto {
            let account = self
                .ctx
                .store
                .channel_account(pre.payment_channel_account_id)
                .await?
                .ok_or_else(|| {
                    Error::not_found("payment account not found")
                })?;
            let channel = self
                .ctx
                .store
                .channel(account.channel_id)
                .await?
                .ok_or_else(|| {
                    Error::not_found("payment channel not found")
                })?;
            let driver = self.ctx.drivers.get(&channel.gateway)?;
            Some((account, channel, driver))
        } else {
            None
        };

        let mut txn = self.ctx.store.begin().await?;
        txn.wallet_for_update(pre.merchant_id).await?;
        let mut order = txn
            .order_for_update(&req.trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        if !matches!(
            order.trade_state,
            TradeState::Success | TradeState::Refund
        ) {
            return Err(Error::conflict(format!(
                "order in state {} is not refundable",
                order.trade_state
            )));
        }
        if order.settle_state == SettleState::Processing {
            return Err(Error::conflict(
                "order funds are still settling",
            ));
        }

        let refunded: Decimal = txn
            .refunds_for_order(&req.trade_no)
            .await?
            .iter()
            .filter(|r| r.status.counts_toward_refunded())
            .map(|r| r.amount.get())
            .sum();
        let remaining = order.buyer_pay_amount.get() - refunded;
        if req.amount.get() > remaining {
            return Err(Error::invalid_request(
                "refund exceeds the remaining refundable amount",
            ));
        }

        ledger::change_available(
            txn.as_mut(),
            order.merchant_id,
            -req.amount.get(),
            WalletChangeType::OrderRefund,
            Some(order.trade_no.clone()),
            req.reason.clone(),
            false,
        )
        .await?;

        let refund_fee = if req.fee_bearer && !order.fee_amount.is_zero() {
            let fee = prorated_fee(&order, req.amount);
            if !fee.is_zero() {
                ledger::change_available(
                    txn.as_mut(),
                    order.merchant_id,
                    fee.get(),
                    WalletChangeType::RefundFee,
                    Some(order.trade_no.clone()),
                    Some("fee restitution".to_owned()),
                    false,
                )
                .await?;
            }
            fee
        } else {
            Amount::ZERO
        };

        let mut refund = OrderRefund {
            id: RefundId::generate(&mut rand::thread_rng(), now().year()),
            trade_no: order.trade_no.clone(),
            merchant_id: order.merchant_id,
            initiate_type: req.initiate_type,
            refund_type: req.auto,
            amount: req.amount,
            refund_fee_amount: refund_fee,
            fee_bearer: req.fee_bearer,
            out_biz_no: req.out_biz_no,
            api_refund_no: None,
            reason: req.reason,
            status: RefundStatus::Completed,
            create_time: now(),
        };

        if let Some((account, channel, driver)) = upstream {
            let api_trade_no =
                order.api_trade_no.as_deref().ok_or_else(|| {
                    Error::invalid_request(
                        "order has no upstream trade id; auto refund \
                         impossible",
                    )
                })?;
            tracing::debug!(%api_trade_no, gateway = %channel.gateway,
                "calling upstream refund");
            // Inside the transaction on purpose: an upstream refusal
            // aborts the wallet debit and the refund row together.
            let response =
                driver.refund(&order, &account, &refund).await?;
            refund.api_refund_no = response.api_refund_no;
        }

        insert_refund_with_retry(txn.as_mut(), &mut refund).await?;

        let new_refunded = refunded + req.amount.get();
        order.trade_state = if new_refunded >= order.buyer_pay_amount.get()
        {
            TradeState::Finished
        } else {
            TradeState::Refund
        };
        txn.update_order(&order).await?;
        txn.commit().await?;

        Ok(refund)
    }
}

/// `fee × (amount / total)`, ratio at scale 8, result rounded half-even
/// to money scale and clamped to the original fee.
fn prorated_fee(order: &Order, amount: Amount) -> Amount {
    let ratio = (amount.get() / order.total_amount.get())
        .round_dp(PRORATION_SCALE);
    let raw = order.fee_amount.get() * ratio;
    Amount::from_decimal_round(round_money(raw))
        .unwrap_or(Amount::ZERO)
        .min(order.fee_amount)
}

/// Refund ids collide about as often as trade numbers; retry a few times.
async fn insert_refund_with_retry(
    txn: &mut dyn StoreTxn,
    refund: &mut OrderRefund,
) -> PayResult<()> {
    for attempt in 0..3 {
        match txn.insert_refund(refund).await {
            Ok(()) => return Ok(()),
            Err(err)
                if err.kind == paygate_common::ErrorKind::Conflict
                    && refund.out_biz_no.is_none()
                    && attempt < 2 =>
            {
                refund.id =
                    RefundId::generate(&mut rand::thread_rng(), now().year());
            }
            Err(err) => return Err(err),
        }
    }
    unreachable!("loop returns on success or error")
}

#[cfg(test)]
mod test {
    use paygate_common::{ErrorKind, enums::PaymentType, enums::SignType};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{
        ctx::testing::{TestCtx, test_ctx},
        models::Merchant,
        order::{NewOrder, NewOrderBuyer, OrderEngine, PaidUpdate},
        testutil,
    };

    async fn paid_order(t: &TestCtx, merchant: &Merchant) -> Order {
        let engine = OrderEngine::new(t.ctx.clone());
        let created = engine
            .create(
                merchant,
                NewOrder {
                    out_trade_no: "REFUND-ORD".to_owned(),
                    payment_type: PaymentType::Alipay,
                    channel_code: None,
                    subject: "foo".to_owned(),
                    total_amount: Amount::from_cents(10_000),
                    notify_url: None,
                    return_url: None,
                    attach: None,
                    sign_type: SignType::Sha3,
                    buyer: NewOrderBuyer::default(),
                    device_fingerprint: None,
                },
            )
            .await
            .unwrap();
        engine
            .mark_paid(
                &created.order.trade_no,
                PaidUpdate {
                    api_trade_no: Some("UP-1".to_owned()),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap()
    }

    async fn setup() -> (TestCtx, Merchant, Order) {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        testutil::seed_channel_with_account(&t).await;
        let order = paid_order(&t, &merchant).await;
        (t, merchant, order)
    }

    fn refund_req(order: &Order, cents: u64) -> NewRefund {
        NewRefund {
            trade_no: order.trade_no.clone(),
            amount: Amount::from_cents(cents),
            initiate_type: RefundInitiateType::Api,
            auto: false,
            fee_bearer: false,
            out_biz_no: None,
            reason: None,
        }
    }

    #[tokio::test]
    async fn full_refund_with_fee_restitution_nets_to_zero() {
        let (t, merchant, order) = setup().await;
        // Instant settlement credited 97.50.
        let engine = RefundEngine::new(t.ctx.clone());

        let refund = engine
            .handle(NewRefund {
                fee_bearer: true,
                ..refund_req(&order, 10_000)
            })
            .await
            .unwrap();
        assert_eq!(refund.refund_fee_amount, Amount::from_cents(250));

        // 97.50 - 100.00 + 2.50 == 0.
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::ZERO);

        let order = t
            .ctx
            .store
            .order(&order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.trade_state, TradeState::Finished);
    }

    #[tokio::test]
    async fn partial_refunds_accumulate_to_finished() {
        let (t, _merchant, order) = setup().await;
        let engine = RefundEngine::new(t.ctx.clone());

        engine.handle(refund_req(&order, 4_000)).await.unwrap();
        let state = t
            .ctx
            .store
            .order(&order.trade_no)
            .await
            .unwrap()
            .unwrap()
            .trade_state;
        assert_eq!(state, TradeState::Refund);

        engine.handle(refund_req(&order, 6_000)).await.unwrap();
        let state = t
            .ctx
            .store
            .order(&order.trade_no)
            .await
            .unwrap()
            .unwrap()
            .trade_state;
        assert_eq!(state, TradeState::Finished);

        // One cent over the (now zero) remainder fails.
        let err = engine.handle(refund_req(&order, 1)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn refund_rejects_overdraw_of_remaining() {
        let (t, _merchant, order) = setup().await;
        let engine = RefundEngine::new(t.ctx.clone());
        engine.handle(refund_req(&order, 9_000)).await.unwrap();

        let err =
            engine.handle(refund_req(&order, 1_001)).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn out_biz_no_is_idempotent() {
        let (t, _merchant, order) = setup().await;
        let engine = RefundEngine::new(t.ctx.clone());

        let mut req = refund_req(&order, 4_000);
        req.out_biz_no = Some("RB-1".to_owned());
        let first = engine.handle(req.clone()).await.unwrap();
        let second = engine.handle(req.clone()).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(t.store.all_refunds().await.len(), 1);

        // Only one debit happened.
        let refunds: Decimal = t
            .store
            .all_wallet_records()
            .await
            .iter()
            .filter(|r| {
                r.change_type == WalletChangeType::OrderRefund
            })
            .map(|r| r.delta_available)
            .sum();
        assert_eq!(refunds, dec!(-40.00));

        // Same key, different amount: conflict.
        req.amount = Amount::from_cents(5_000);
        let err = engine.handle(req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn auto_refund_calls_driver_and_stores_upstream_id() {
        let (t, _merchant, order) = setup().await;
        let engine = RefundEngine::new(t.ctx.clone());

        let mut req = refund_req(&order, 4_000);
        req.auto = true;
        let refund = engine.handle(req).await.unwrap();
        assert_eq!(refund.api_refund_no.as_deref(), Some("UP-REFUND-1"));
        assert_eq!(t.driver.refund_calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn upstream_refusal_rolls_everything_back() {
        let (t, merchant, order) = setup().await;
        let engine = RefundEngine::new(t.ctx.clone());
        t.driver.set_refund_result(Err(Error::gateway_error(
            "upstream said no",
        )));

        let mut req = refund_req(&order, 4_000);
        req.auto = true;
        let err = engine.handle(req).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::GatewayError);

        // No refund row, no wallet movement, order state unchanged.
        assert!(t.store.all_refunds().await.is_empty());
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
        let state = t
            .ctx
            .store
            .order(&order.trade_no)
            .await
            .unwrap()
            .unwrap()
            .trade_state;
        assert_eq!(state, TradeState::Success);
    }

    #[tokio::test]
    async fn settling_order_is_not_refundable() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        let mut ch = testutil::channel(10);
        ch.settle_cycle = paygate_common::enums::SettleCycle::D1;
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(100, 10, 1)).await;
        let order = paid_order(&t, &merchant).await;
        assert_eq!(order.settle_state, SettleState::Processing);

        let err = RefundEngine::new(t.ctx.clone())
            .handle(refund_req(&order, 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn wait_pay_order_is_not_refundable() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        testutil::seed_channel_with_account(&t).await;
        let created = OrderEngine::new(t.ctx.clone())
            .create(
                &merchant,
                NewOrder {
                    out_trade_no: "UNPAID".to_owned(),
                    payment_type: PaymentType::Alipay,
                    channel_code: None,
                    subject: "foo".to_owned(),
                    total_amount: Amount::from_cents(1_000),
                    notify_url: None,
                    return_url: None,
                    attach: None,
                    sign_type: SignType::Sha3,
                    buyer: NewOrderBuyer::default(),
                    device_fingerprint: None,
                },
            )
            .await
            .unwrap();

        let err = RefundEngine::new(t.ctx.clone())
            .handle(refund_req(&created.order, 100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[test]
    fn proration_rounds_half_even_and_clamps() {
        let (order, _) = testutil::paid_order_with_ip(
            paygate_common::ids::MerchantId(1),
            "X",
            "1.2.3.4",
        );
        // fee 2.50 on 100.00; refunding 33.33 restitutes
        // 2.50 * 0.33330000 = 0.833250 → 0.83.
        assert_eq!(
            prorated_fee(&order, Amount::from_cents(3_333)),
            Amount::from_cents(83)
        );
        // Full refund restitutes the whole fee, never more.
        assert_eq!(
            prorated_fee(&order, Amount::from_cents(10_000)),
            Amount::from_cents(250)
        );
    }
}
