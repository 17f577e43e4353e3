//! Order lifecycle: creation, payment, close, settlement.
//!
//! Creation is idempotent on `(merchant_id, out_trade_no)` within a
//! 7-day window; payment confirmation tolerates duplicate upstream
//! callbacks by refusing to re-apply anything once the order has left
//! `WAIT_PAY`. All monetary mutations ride the wallet row lock through
//! [`crate::ledger`].

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use paygate_common::{
    Amount, Error, Rate,
    enums::{
        NotifyState, PaymentType, SettleState, SignType, TradeState,
        WalletChangeType,
    },
    error::PayResult,
    ids::TradeNo,
    time::now,
};
use tracing::{instrument, warn};

use crate::{
    ctx::Ctx,
    driver::BuyerPatch,
    ledger,
    models::{
        Merchant, Order, OrderBuyer, PaymentChannel, PaymentChannelAccount,
    },
    queue::Job,
    risk::RiskEngine,
    selector::ChannelSelector,
    settle::{SettleAction, settle_action},
};

/// How many trade-number candidates to try before giving up on the
/// astronomically unlikely collision streak.
const TRADE_NO_ATTEMPTS: u32 = 5;

/// The idempotency window for `(merchant_id, out_trade_no)`.
const DUPLICATE_WINDOW_DAYS: i64 = 7;

/// Longest accepted merchant order id.
const OUT_TRADE_NO_MAX_LEN: usize = 64;

/// A merchant's request to create an order.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub out_trade_no: String,
    pub payment_type: PaymentType,
    /// Pin selection to one channel code.
    pub channel_code: Option<String>,
    pub subject: String,
    pub total_amount: Amount,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    pub attach: Option<String>,
    pub sign_type: SignType,
    pub buyer: NewOrderBuyer,
    pub device_fingerprint: Option<String>,
}

/// Buyer context captured at creation time.
#[derive(Clone, Debug, Default)]
pub struct NewOrderBuyer {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub buyer_open_id: Option<String>,
    pub mobile: Option<String>,
    pub real_name: Option<String>,
    pub cert_no: Option<String>,
    pub cert_type: Option<paygate_common::enums::CertType>,
    pub min_age: Option<u8>,
}

/// A successful creation (or idempotent replay).
#[derive(Clone, Debug)]
pub struct CreatedOrder {
    pub order: Order,
    pub buyer: OrderBuyer,
    pub channel: PaymentChannel,
    pub account: PaymentChannelAccount,
    /// `true` when an existing order was returned unchanged.
    pub reused: bool,
}

/// What a verified upstream callback asserts about a payment.
#[derive(Clone, Debug, Default)]
pub struct PaidUpdate {
    pub api_trade_no: Option<String>,
    pub bill_trade_no: Option<String>,
    pub mch_trade_no: Option<String>,
    pub payment_time: Option<DateTime<Utc>>,
    /// Honored only when the upstream explicitly reports it.
    pub buyer_pay_amount: Option<Amount>,
    pub buyer: BuyerPatch,
}

/// Computed fee breakdown of an order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fees {
    pub fee: Amount,
    pub cost: Amount,
    pub receipt: Amount,
    /// `fee - cost`; negative when a channel is sold below cost.
    pub profit: rust_decimal::Decimal,
}

/// Fee formula: `fee = total * rate + fixed_fee`, clamped to
/// `[min_fee, max_fee]` and never above `total` itself.
pub fn compute_fees(
    total: Amount,
    rate: Rate,
    channel: &PaymentChannel,
) -> Fees {
    let raw_fee = total.get() * rate.get() + channel.fixed_fee.get();
    let mut fee = Amount::from_decimal_round(raw_fee)
        .unwrap_or(Amount::MAX)
        .max(channel.min_fee);
    if let Some(max_fee) = channel.max_fee {
        fee = fee.min(max_fee);
    }
    fee = fee.min(total);

    let raw_cost = total.get() * channel.costs.get() + channel.fixed_costs.get();
    let cost = Amount::from_decimal_round(raw_cost).unwrap_or(Amount::MAX);

    Fees {
        fee,
        cost,
        receipt: total.saturating_sub(fee),
        profit: fee.get() - cost.get(),
    }
}

/// Rate priority: merchant override (account-level, then channel-level),
/// then the account's own rate when it doesn't inherit, then the channel
/// rate.
pub fn effective_rate(
    merchant: &Merchant,
    channel: &PaymentChannel,
    account: &PaymentChannelAccount,
) -> Rate {
    if let Some(rate) = merchant.rate_override(channel.id, account.id) {
        return rate;
    }
    if !account.inherit_config {
        return account.rate;
    }
    channel.rate
}

pub struct OrderEngine {
    ctx: Arc<Ctx>,
}

impl OrderEngine {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Create an order (or return the identical existing one).
    #[instrument(skip_all, name = "(order-create)", fields(out_trade_no = %req.out_trade_no))]
    pub async fn create(
        &self,
        merchant: &Merchant,
        req: NewOrder,
    ) -> PayResult<CreatedOrder> {
        if !merchant.is_active() {
            return Err(Error::unauthorized("merchant is disabled"));
        }
        if req.total_amount.is_zero() {
            return Err(Error::invalid_request(
                "total_amount must be positive",
            ));
        }
        if req.subject.trim().is_empty() {
            return Err(Error::invalid_request("subject must not be empty"));
        }
        if req.out_trade_no.is_empty()
            || req.out_trade_no.len() > OUT_TRADE_NO_MAX_LEN
        {
            return Err(Error::invalid_request("malformed out_trade_no"));
        }

        let buyer_template = OrderBuyer {
            ip: req.buyer.ip.clone(),
            user_agent: req.buyer.user_agent.clone(),
            user_id: req.buyer.user_id.clone(),
            buyer_open_id: req.buyer.buyer_open_id.clone(),
            mobile: req.buyer.mobile.clone(),
            real_name: req.buyer.real_name.clone(),
            cert_no: req.buyer.cert_no.clone(),
            cert_type: req.buyer.cert_type,
            min_age: req.buyer.min_age,
            // Placeholder until the order row exists.
            ..OrderBuyer::empty(TradeNo::generate(
                &mut rand::thread_rng(),
                now(),
                self.ctx.config.timezone,
            ))
        };

        RiskEngine::new(self.ctx.clone())
            .create_order_check(
                merchant,
                &buyer_template,
                req.device_fingerprint.as_deref(),
            )
            .await?;

        if let Some(existing) = self.find_duplicate(merchant, &req).await? {
            return Ok(existing);
        }

        let selection = ChannelSelector::new(self.ctx.clone())
            .select(
                req.payment_type,
                req.channel_code.as_deref(),
                Some(req.total_amount),
                Some(merchant),
            )
            .await?;
        let channel = selection.channel;
        let account = selection.account;

        let rate = effective_rate(merchant, &channel, &account);
        let fees = compute_fees(req.total_amount, rate, &channel);
        let buyer_pay_amount = if merchant.buyer_pay_fee {
            req.total_amount + fees.fee
        } else {
            req.total_amount
        };

        let create_time = now();
        let mut order = Order {
            trade_no: buyer_template.trade_no.clone(),
            out_trade_no: req.out_trade_no,
            merchant_id: merchant.id,
            payment_type: channel.payment_type,
            payment_channel_account_id: account.id,
            subject: req.subject,
            total_amount: req.total_amount,
            buyer_pay_amount,
            receipt_amount: fees.receipt,
            fee_amount: fees.fee,
            profit_amount: fees.profit,
            notify_url: req.notify_url,
            return_url: req.return_url,
            attach: req.attach,
            settle_cycle: channel.settle_cycle,
            sign_type: req.sign_type,
            trade_state: TradeState::WaitPay,
            settle_state: SettleState::Pending,
            notify_state: NotifyState::Waiting,
            notify_retry_count: 0,
            notify_next_retry_time: None,
            create_time,
            payment_time: None,
            close_time: None,
            api_trade_no: None,
            bill_trade_no: None,
            mch_trade_no: None,
        };
        let mut buyer = buyer_template;

        // Unique trade numbers are enforced by the primary key; collide
        // and retry with a fresh candidate.
        let mut attempts = 0;
        loop {
            attempts += 1;
            let mut txn = self.ctx.store.begin().await?;
            // Serializes order creation per merchant, per lock order.
            txn.wallet_for_update(merchant.id).await?;
            match txn.insert_order(&order).await {
                Ok(()) => {
                    buyer.trade_no = order.trade_no.clone();
                    txn.insert_order_buyer(&buyer).await?;
                    txn.commit().await?;
                    break;
                }
                Err(err)
                    if err.kind == paygate_common::ErrorKind::Conflict
                        && attempts < TRADE_NO_ATTEMPTS =>
                {
                    txn.rollback().await?;
                    order.trade_no = TradeNo::generate(
                        &mut rand::thread_rng(),
                        now(),
                        self.ctx.config.timezone,
                    );
                }
                Err(err) => return Err(err),
            }
        }

        ChannelSelector::new(self.ctx.clone())
            .record_usage(channel.id, account.id, order.total_amount)
            .await?;

        Ok(CreatedOrder { order, buyer, channel, account, reused: false })
    }

    /// The 7-day idempotency lookup. Returns the existing order when the
    /// replay is identical; errors when it conflicts.
    async fn find_duplicate(
        &self,
        merchant: &Merchant,
        req: &NewOrder,
    ) -> PayResult<Option<CreatedOrder>> {
        let since = now() - ChronoDuration::days(DUPLICATE_WINDOW_DAYS);
        let Some(existing) = self
            .ctx
            .store
            .recent_order_by_out_trade_no(
                merchant.id,
                &req.out_trade_no,
                since,
            )
            .await?
        else {
            return Ok(None);
        };

        match existing.trade_state {
            TradeState::Success
            | TradeState::Finished
            | TradeState::Frozen =>
                return Err(Error::conflict("order is already paid")),
            TradeState::Closed =>
                return Err(Error::conflict("order is closed")),
            TradeState::WaitPay | TradeState::Refund => {}
        }

        let identical = existing.subject == req.subject
            && existing.total_amount == req.total_amount
            && existing.notify_url == req.notify_url
            && existing.return_url == req.return_url
            && existing.attach == req.attach;
        if !identical {
            return Err(Error::conflict(
                "out_trade_no reused with different parameters",
            ));
        }

        let buyer = self
            .ctx
            .store
            .order_buyer(&existing.trade_no)
            .await?
            .unwrap_or_else(|| OrderBuyer::empty(existing.trade_no.clone()));
        let account = self
            .ctx
            .store
            .channel_account(existing.payment_channel_account_id)
            .await?
            .ok_or_else(|| Error::not_found("payment account not found"))?;
        let channel = self
            .ctx
            .store
            .channel(account.channel_id)
            .await?
            .ok_or_else(|| Error::not_found("payment channel not found"))?;

        Ok(Some(CreatedOrder {
            order: existing,
            buyer,
            channel,
            account,
            reused: true,
        }))
    }

    /// Confirm payment from a verified upstream callback.
    ///
    /// Duplicate confirmations return the order untouched. Funds land per
    /// the settle cycle: instantly into available, or into unavailable
    /// with an `order-settle` job scheduled by the calendar.
    #[instrument(skip_all, name = "(order-mark-paid)", fields(trade_no = %trade_no))]
    pub async fn mark_paid(
        &self,
        trade_no: &TradeNo,
        update: PaidUpdate,
        notify_async: bool,
    ) -> PayResult<Order> {
        let pre = self
            .ctx
            .store
            .order(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        let mut txn = self.ctx.store.begin().await?;
        txn.wallet_for_update(pre.merchant_id).await?;
        let mut order = txn
            .order_for_update(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        match order.trade_state {
            TradeState::WaitPay => {}
            TradeState::Closed => {
                return Err(Error::conflict(
                    "order is closed and cannot be paid",
                ));
            }
            // Duplicate upstream callback: nothing to re-apply.
            _ => {
                txn.rollback().await?;
                return Ok(order);
            }
        }

        order.trade_state = TradeState::Success;
        order.payment_time = Some(update.payment_time.unwrap_or_else(now));
        if update.api_trade_no.is_some() {
            order.api_trade_no = update.api_trade_no;
        }
        if update.bill_trade_no.is_some() {
            order.bill_trade_no = update.bill_trade_no;
        }
        if update.mch_trade_no.is_some() {
            order.mch_trade_no = update.mch_trade_no;
        }
        if let Some(amount) = update.buyer_pay_amount {
            order.buyer_pay_amount = amount;
        }

        if let Some(mut buyer) = txn.order_buyer(trade_no).await? {
            patch_buyer(&mut buyer, &update.buyer);
            txn.update_order_buyer(&buyer).await?;
        }

        let paid_at = order.payment_time.expect("just set");
        let action = settle_action(
            order.settle_cycle,
            paid_at,
            self.ctx.config.timezone,
        );
        let mut enqueue_delay = None;
        match action {
            SettleAction::CreditNow => {
                order.settle_state = SettleState::Completed;
                ledger::change_available(
                    txn.as_mut(),
                    order.merchant_id,
                    order.receipt_amount.get(),
                    WalletChangeType::OrderReceipt,
                    Some(order.trade_no.clone()),
                    Some("instant settlement".to_owned()),
                    false,
                )
                .await?;
            }
            SettleAction::Swallow => {
                order.settle_state = SettleState::Processing;
                ledger::change_unavailable(
                    txn.as_mut(),
                    order.merchant_id,
                    order.receipt_amount.get(),
                    WalletChangeType::OrderSettle,
                    Some(order.trade_no.clone()),
                    None,
                    false,
                )
                .await?;
            }
            SettleAction::Enqueue(delay) => {
                order.settle_state = SettleState::Processing;
                ledger::change_unavailable(
                    txn.as_mut(),
                    order.merchant_id,
                    order.receipt_amount.get(),
                    WalletChangeType::OrderSettle,
                    Some(order.trade_no.clone()),
                    None,
                    false,
                )
                .await?;
                enqueue_delay = Some(delay);
            }
        }

        txn.update_order(&order).await?;
        txn.commit().await?;

        if let Some(delay) = enqueue_delay {
            let job = Job::SettleOrder { trade_no: order.trade_no.clone() };
            if let Err(err) = self.ctx.queue.enqueue(job, delay).await {
                warn!(%err, trade_no = %order.trade_no,
                    "failed to enqueue settlement");
                self.mark_settle_failed(&order.trade_no).await?;
                order.settle_state = SettleState::Failed;
            }
        }

        if notify_async && order.notify_url.is_some() {
            let job =
                Job::NotifyMerchant { trade_no: order.trade_no.clone() };
            if let Err(err) =
                self.ctx.queue.enqueue(job, std::time::Duration::ZERO).await
            {
                // Notification failures never fail the payment.
                warn!(%err, trade_no = %order.trade_no,
                    "failed to enqueue notification");
            }
        }

        Ok(order)
    }

    /// Move a settling order's funds from unavailable to available.
    /// Idempotent: anything not in `PROCESSING` is left alone.
    #[instrument(skip_all, name = "(order-settle)", fields(trade_no = %trade_no))]
    pub async fn settle(&self, trade_no: &TradeNo) -> PayResult<()> {
        let pre = self
            .ctx
            .store
            .order(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        let mut txn = self.ctx.store.begin().await?;
        txn.wallet_for_update(pre.merchant_id).await?;
        let mut order = txn
            .order_for_update(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        if order.settle_state != SettleState::Processing {
            txn.rollback().await?;
            return Ok(());
        }

        let moved = ledger::change_available(
            txn.as_mut(),
            order.merchant_id,
            order.receipt_amount.get(),
            WalletChangeType::OrderSettle,
            Some(order.trade_no.clone()),
            Some("settlement".to_owned()),
            true,
        )
        .await;
        match moved {
            Ok(_) => {
                order.settle_state = SettleState::Completed;
                txn.update_order(&order).await?;
                txn.commit().await?;
                Ok(())
            }
            Err(err) => {
                txn.rollback().await?;
                self.mark_settle_failed(trade_no).await?;
                Err(err)
            }
        }
    }

    /// Admin retry of a failed settlement: `FAILED → PROCESSING` plus a
    /// fresh zero-delay settle job.
    pub async fn retry_settlement(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Order> {
        let pre = self
            .ctx
            .store
            .order(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        let mut txn = self.ctx.store.begin().await?;
        txn.wallet_for_update(pre.merchant_id).await?;
        let mut order = txn
            .order_for_update(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;
        if !order.settle_state.can_transition(SettleState::Processing) {
            return Err(Error::conflict(format!(
                "settlement in state {} cannot be retried",
                order.settle_state
            )));
        }
        order.settle_state = SettleState::Processing;
        txn.update_order(&order).await?;
        txn.commit().await?;

        self.ctx
            .queue
            .enqueue(
                Job::SettleOrder { trade_no: trade_no.clone() },
                std::time::Duration::ZERO,
            )
            .await?;
        Ok(order)
    }

    async fn mark_settle_failed(&self, trade_no: &TradeNo) -> PayResult<()> {
        let pre = self
            .ctx
            .store
            .order(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;
        let mut txn = self.ctx.store.begin().await?;
        txn.wallet_for_update(pre.merchant_id).await?;
        if let Some(mut order) = txn.order_for_update(trade_no).await? {
            order.settle_state = SettleState::Failed;
            txn.update_order(&order).await?;
        }
        txn.commit().await?;
        Ok(())
    }

    /// `WAIT_PAY → CLOSED`; any other state is a conflict.
    #[instrument(skip_all, name = "(order-close)", fields(trade_no = %trade_no))]
    pub async fn close(&self, trade_no: &TradeNo) -> PayResult<Order> {
        let mut txn = self.ctx.store.begin().await?;
        let mut order = txn
            .order_for_update(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;

        if !order.trade_state.can_transition(TradeState::Closed) {
            return Err(Error::conflict(format!(
                "cannot close an order in state {}",
                order.trade_state
            )));
        }
        order.trade_state = TradeState::Closed;
        order.close_time = Some(now());
        txn.update_order(&order).await?;
        txn.commit().await?;
        Ok(order)
    }

    /// Admin override: force any `trade_state`, bypassing the lifecycle
    /// graph. The caller owns the consequences.
    pub async fn admin_set_trade_state(
        &self,
        trade_no: &TradeNo,
        to: TradeState,
    ) -> PayResult<Order> {
        let mut txn = self.ctx.store.begin().await?;
        let mut order = txn
            .order_for_update(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;
        order.trade_state = to;
        if to == TradeState::Closed && order.close_time.is_none() {
            order.close_time = Some(now());
        }
        txn.update_order(&order).await?;
        txn.commit().await?;
        Ok(order)
    }
}

/// Apply the whitelisted buyer fields an upstream may enrich.
fn patch_buyer(buyer: &mut OrderBuyer, patch: &BuyerPatch) {
    if patch.ip.is_some() {
        buyer.ip = patch.ip.clone();
    }
    if patch.user_agent.is_some() {
        buyer.user_agent = patch.user_agent.clone();
    }
    if patch.user_id.is_some() {
        buyer.user_id = patch.user_id.clone();
    }
    if patch.buyer_open_id.is_some() {
        buyer.buyer_open_id = patch.buyer_open_id.clone();
    }
    if patch.mobile.is_some() {
        buyer.mobile = patch.mobile.clone();
    }
}

#[cfg(test)]
mod test {
    use paygate_common::{ErrorKind, enums::SettleCycle, ids::MerchantId};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{
        ctx::testing::{TestCtx, test_ctx},
        testutil,
    };

    fn new_order(out_trade_no: &str, cents: u64) -> NewOrder {
        NewOrder {
            out_trade_no: out_trade_no.to_owned(),
            payment_type: PaymentType::Alipay,
            channel_code: None,
            subject: "foo".to_owned(),
            total_amount: Amount::from_cents(cents),
            notify_url: Some("https://merchant.example/notify".to_owned()),
            return_url: None,
            attach: None,
            sign_type: SignType::Sha3,
            buyer: NewOrderBuyer {
                ip: Some("198.51.100.1".to_owned()),
                ..Default::default()
            },
            device_fingerprint: None,
        }
    }

    async fn setup() -> (TestCtx, Merchant) {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        testutil::seed_channel_with_account(&t).await;
        (t, merchant)
    }

    #[test]
    fn fee_formula_reference_numbers() {
        // total 100.00, rate 2.40% + 0.10, costs 1.00% + 0.00:
        // fee 2.50, cost 1.00, receipt 97.50, profit 1.50.
        let channel = testutil::channel(10);
        let fees = compute_fees(
            Amount::from_cents(10_000),
            channel.rate,
            &channel,
        );
        assert_eq!(fees.fee, Amount::from_cents(250));
        assert_eq!(fees.cost, Amount::from_cents(100));
        assert_eq!(fees.receipt, Amount::from_cents(9_750));
        assert_eq!(fees.profit, dec!(1.50));
    }

    #[test]
    fn fee_clamps() {
        let mut channel = testutil::channel(10);
        channel.min_fee = Amount::from_cents(500);
        let fees =
            compute_fees(Amount::from_cents(10_000), channel.rate, &channel);
        assert_eq!(fees.fee, Amount::from_cents(500));

        channel.min_fee = Amount::ZERO;
        channel.max_fee = Some(Amount::from_cents(100));
        let fees =
            compute_fees(Amount::from_cents(10_000), channel.rate, &channel);
        assert_eq!(fees.fee, Amount::from_cents(100));

        // Fee never exceeds the order amount itself.
        channel.max_fee = None;
        channel.fixed_fee = Amount::from_cents(10_000);
        let fees =
            compute_fees(Amount::from_cents(100), channel.rate, &channel);
        assert_eq!(fees.fee, Amount::from_cents(100));
        assert_eq!(fees.receipt, Amount::ZERO);
    }

    #[test]
    fn rate_priority_ladder() {
        let channel = testutil::channel(10);
        let mut account = testutil::account(100, 10, 1);
        let mut merchant = testutil::merchant(1);

        // Channel rate by default.
        assert_eq!(
            effective_rate(&merchant, &channel, &account),
            channel.rate
        );

        // Account rate when it doesn't inherit.
        account.inherit_config = false;
        account.rate = Rate::try_from_decimal(dec!(0.0300)).unwrap();
        assert_eq!(
            effective_rate(&merchant, &channel, &account),
            account.rate
        );

        // Merchant whitelist override beats both.
        merchant.channel_whitelist =
            vec![crate::models::ChannelWhitelistEntry {
                channel_id: channel.id,
                rate: Some(Rate::try_from_decimal(dec!(0.0100)).unwrap()),
                use_all_accounts: true,
                accounts: Vec::new(),
            }];
        assert_eq!(
            effective_rate(&merchant, &channel, &account),
            Rate::try_from_decimal(dec!(0.0100)).unwrap()
        );
    }

    #[tokio::test]
    async fn create_is_idempotent_and_conflicts_on_mismatch() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());

        let first = engine
            .create(&merchant, new_order("ORD-001", 10_000))
            .await
            .unwrap();
        assert!(!first.reused);
        assert_eq!(first.order.fee_amount, Amount::from_cents(250));
        assert_eq!(first.order.receipt_amount, Amount::from_cents(9_750));

        // Identical replay returns the same trade_no.
        let second = engine
            .create(&merchant, new_order("ORD-001", 10_000))
            .await
            .unwrap();
        assert!(second.reused);
        assert_eq!(second.order.trade_no, first.order.trade_no);

        // Changing the amount is a conflict.
        let err = engine
            .create(&merchant, new_order("ORD-001", 10_100))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn paid_duplicate_is_rejected() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());

        let created = engine
            .create(&merchant, new_order("ORD-002", 10_000))
            .await
            .unwrap();
        engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), false)
            .await
            .unwrap();

        let err = engine
            .create(&merchant, new_order("ORD-002", 10_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn instant_settlement_credits_available() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());

        let created = engine
            .create(&merchant, new_order("ORD-003", 10_000))
            .await
            .unwrap();
        let order = engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), false)
            .await
            .unwrap();
        assert_eq!(order.trade_state, TradeState::Success);
        assert_eq!(order.settle_state, SettleState::Completed);

        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
        assert_eq!(wallet.unavailable, Amount::ZERO);
        // No settle job for instant cycles.
        assert!(t.queue.take().is_empty());
    }

    #[tokio::test]
    async fn duplicate_callback_leaves_order_unchanged() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());

        let created = engine
            .create(&merchant, new_order("ORD-004", 10_000))
            .await
            .unwrap();
        let first = engine
            .mark_paid(
                &created.order.trade_no,
                PaidUpdate {
                    api_trade_no: Some("UP-1".to_owned()),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        // Replay with different upstream fields: nothing re-applies.
        let second = engine
            .mark_paid(
                &created.order.trade_no,
                PaidUpdate {
                    api_trade_no: Some("UP-2".to_owned()),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        assert_eq!(first, second);

        // And the wallet was credited exactly once.
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
    }

    #[tokio::test]
    async fn delayed_cycle_credits_unavailable_and_enqueues() {
        let (t, merchant) = setup().await;
        // Switch the channel to D1.
        let mut ch = testutil::channel(11);
        ch.code = "ALIPAYD1".to_owned();
        ch.settle_cycle = SettleCycle::D1;
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(200, 11, 1)).await;

        let engine = OrderEngine::new(t.ctx.clone());
        let mut req = new_order("ORD-005", 10_000);
        req.channel_code = Some("ALIPAYD1".to_owned());
        let created = engine.create(&merchant, req).await.unwrap();

        let order = engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), true)
            .await
            .unwrap();
        assert_eq!(order.settle_state, SettleState::Processing);

        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::ZERO);
        assert_eq!(wallet.unavailable, Amount::from_cents(9_750));

        let jobs = t.queue.take();
        assert!(jobs.iter().any(|(job, delay)| matches!(
            job,
            Job::SettleOrder { trade_no } if trade_no == &order.trade_no
        ) && *delay > std::time::Duration::ZERO));
        assert!(jobs.iter().any(|(job, _)| matches!(
            job,
            Job::NotifyMerchant { trade_no } if trade_no == &order.trade_no
        )));

        // The settle job moves the funds.
        engine.settle(&order.trade_no).await.unwrap();
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
        assert_eq!(wallet.unavailable, Amount::ZERO);

        // Settling again is a no-op.
        engine.settle(&order.trade_no).await.unwrap();
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
    }

    #[tokio::test]
    async fn enqueue_failure_marks_settlement_failed() {
        let (t, merchant) = setup().await;
        let mut ch = testutil::channel(11);
        ch.code = "ALIPAYD1".to_owned();
        ch.settle_cycle = SettleCycle::D1;
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(200, 11, 1)).await;

        let engine = OrderEngine::new(t.ctx.clone());
        let mut req = new_order("ORD-006", 10_000);
        req.channel_code = Some("ALIPAYD1".to_owned());
        let created = engine.create(&merchant, req).await.unwrap();

        t.queue.set_fail(true);
        let order = engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), false)
            .await
            .unwrap();
        assert_eq!(order.settle_state, SettleState::Failed);

        // Funds stay parked in unavailable for the admin retry.
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.unavailable, Amount::from_cents(9_750));

        // The admin retry re-enters PROCESSING and schedules the move.
        t.queue.set_fail(false);
        let order =
            engine.retry_settlement(&order.trade_no).await.unwrap();
        assert_eq!(order.settle_state, SettleState::Processing);
        assert_eq!(t.queue.take().len(), 1);
        engine.settle(&order.trade_no).await.unwrap();
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.available, Amount::from_cents(9_750));
        assert_eq!(wallet.unavailable, Amount::ZERO);
    }

    #[tokio::test]
    async fn buyer_pay_fee_merchant_charges_buyer() {
        let (t, mut merchant) = setup().await;
        merchant.buyer_pay_fee = true;
        let engine = OrderEngine::new(t.ctx.clone());

        let created = engine
            .create(&merchant, new_order("ORD-007", 10_000))
            .await
            .unwrap();
        assert_eq!(
            created.order.buyer_pay_amount,
            Amount::from_cents(10_250)
        );
    }

    #[tokio::test]
    async fn close_only_from_wait_pay() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());

        let created = engine
            .create(&merchant, new_order("ORD-008", 10_000))
            .await
            .unwrap();
        let closed = engine.close(&created.order.trade_no).await.unwrap();
        assert_eq!(closed.trade_state, TradeState::Closed);
        assert!(closed.close_time.is_some());

        let err = engine.close(&created.order.trade_no).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);

        // A closed out_trade_no can't be replayed either.
        let err = engine
            .create(&merchant, new_order("ORD-008", 10_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn callback_buyer_patch_is_whitelisted() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());

        let mut req = new_order("ORD-009", 10_000);
        req.buyer.real_name = Some("original name".to_owned());
        let created = engine.create(&merchant, req).await.unwrap();

        engine
            .mark_paid(
                &created.order.trade_no,
                PaidUpdate {
                    buyer: BuyerPatch {
                        buyer_open_id: Some("open-1".to_owned()),
                        mobile: Some("13900000000".to_owned()),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();

        let buyer = t
            .ctx
            .store
            .order_buyer(&created.order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(buyer.buyer_open_id.as_deref(), Some("open-1"));
        assert_eq!(buyer.mobile.as_deref(), Some("13900000000"));
        // Non-whitelisted fields survive untouched.
        assert_eq!(buyer.real_name.as_deref(), Some("original name"));
        // Whitelisted-but-absent fields keep their request values.
        assert_eq!(buyer.ip.as_deref(), Some("198.51.100.1"));
    }

    #[tokio::test]
    async fn disabled_merchant_cannot_create() {
        let (t, mut merchant) = setup().await;
        merchant.status = false;
        let err = OrderEngine::new(t.ctx.clone())
            .create(&merchant, new_order("ORD-010", 10_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn test_swallow_parks_funds_forever() {
        let (t, merchant) = setup().await;
        let mut ch = testutil::channel(11);
        ch.code = "SWALLOW".to_owned();
        ch.settle_cycle = SettleCycle::TestSwallow;
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(200, 11, 1)).await;

        let engine = OrderEngine::new(t.ctx.clone());
        let mut req = new_order("ORD-011", 10_000);
        req.channel_code = Some("SWALLOW".to_owned());
        let created = engine.create(&merchant, req).await.unwrap();
        let order = engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), false)
            .await
            .unwrap();

        assert_eq!(order.settle_state, SettleState::Processing);
        // No settle job was scheduled.
        assert!(
            !t.queue
                .take()
                .iter()
                .any(|(job, _)| matches!(job, Job::SettleOrder { .. }))
        );
        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert_eq!(wallet.unavailable, Amount::from_cents(9_750));
    }

    #[tokio::test]
    async fn wallet_never_negative_after_engine_ops() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());
        let created = engine
            .create(&merchant, new_order("ORD-012", 10_000))
            .await
            .unwrap();
        engine
            .mark_paid(&created.order.trade_no, PaidUpdate::default(), false)
            .await
            .unwrap();

        let wallet = t.ctx.store.wallet(merchant.id).await.unwrap().unwrap();
        assert!(wallet.available >= Amount::ZERO);
        assert!(wallet.unavailable >= Amount::ZERO);
        assert!(wallet.prepaid >= Amount::ZERO);

        // Invariant 3 over every record written so far.
        for r in t.store.all_wallet_records().await {
            assert_eq!(
                r.new_available.get() - r.old_available.get(),
                r.delta_available
            );
            assert_eq!(
                r.new_unavailable.get() - r.old_unavailable.get(),
                r.delta_unavailable
            );
        }
    }

    #[tokio::test]
    async fn admin_override_bypasses_graph() {
        let (t, merchant) = setup().await;
        let engine = OrderEngine::new(t.ctx.clone());
        let created = engine
            .create(&merchant, new_order("ORD-013", 10_000))
            .await
            .unwrap();

        // WAIT_PAY → FROZEN is not a normal transition.
        assert!(
            !TradeState::WaitPay.can_transition(TradeState::Frozen)
        );
        let order = engine
            .admin_set_trade_state(&created.order.trade_no, TradeState::Frozen)
            .await
            .unwrap();
        assert_eq!(order.trade_state, TradeState::Frozen);
    }

    #[tokio::test]
    async fn risk_block_short_circuits_creation() {
        let (t, merchant) = setup().await;
        t.store
            .seed_blacklist(crate::models::Blacklist {
                id: 0,
                entity_type:
                    paygate_common::enums::BlacklistEntityType::IpAddress,
                entity_value: "198.51.100.1".to_owned(),
                entity_hash: paygate_crypto::entity_hash(
                    paygate_common::enums::BlacklistEntityType::IpAddress,
                    "198.51.100.1",
                ),
                reason: "fraud".to_owned(),
                origin:
                    paygate_common::enums::BlacklistOrigin::ManualReview,
                expired_at: None,
                created_at: now(),
            })
            .await;

        let err = OrderEngine::new(t.ctx.clone())
            .create(&merchant, new_order("ORD-014", 10_000))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RiskBlocked);
        // Nothing was persisted.
        assert!(
            t.ctx
                .store
                .recent_order_by_out_trade_no(
                    MerchantId(1),
                    "ORD-014",
                    now() - ChronoDuration::days(1),
                )
                .await
                .unwrap()
                .is_none()
        );
    }
}
