//! Persistence ports.
//!
//! Engines program against [`Store`] (pool-level reads and single-row
//! writes) and [`StoreTxn`] (everything that must commit or roll back as
//! one unit). The production implementation lives in `paygate-store`
//! (Postgres); an in-memory implementation for tests lives in
//! [`mem`].
//!
//! Locking contract: [`StoreTxn::wallet_for_update`] takes the row lock
//! that serializes all monetary work for a merchant. Lock order within a
//! transaction is wallet → order → child rows, never the reverse, and no
//! transaction may lock two merchants' wallets.

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use paygate_common::{
    Amount,
    enums::{PaymentType, TradeState},
    error::PayResult,
    ids::{AccountId, ChannelId, MerchantId, MerchantNumber, RefundId, TradeNo, WithdrawalId},
};

use crate::models::{
    Blacklist, Merchant, MerchantEncryption, MerchantWallet,
    MerchantWalletPrepaidRecord, MerchantWalletRecord,
    MerchantWithdrawalRecord, Order, OrderBuyer, OrderNotification,
    OrderRefund, PaymentChannel, PaymentChannelAccount, RiskLog,
};

/// In-memory implementation for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mem;

/// Identifiers that tie orders to one buyer across merchants.
#[derive(Clone, Debug, Default)]
pub struct BuyerIdentifiers {
    pub user_id: Option<String>,
    pub buyer_open_id: Option<String>,
    pub mobile: Option<String>,
    pub cert_no: Option<String>,
}

impl BuyerIdentifiers {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.buyer_open_id.is_none()
            && self.mobile.is_none()
            && self.cert_no.is_none()
    }
}

/// Pool-level reads and single-row writes.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Open a transaction. Dropping the returned [`StoreTxn`] without
    /// committing rolls everything back.
    async fn begin(&self) -> PayResult<Box<dyn StoreTxn>>;

    // --- Merchants --- //

    async fn merchant(&self, id: MerchantId) -> PayResult<Option<Merchant>>;

    async fn merchant_by_number(
        &self,
        number: &MerchantNumber,
    ) -> PayResult<Option<Merchant>>;

    async fn merchant_encryption(
        &self,
        id: MerchantId,
    ) -> PayResult<Option<MerchantEncryption>>;

    /// Store a freshly rotated RSA public key (headerless Base64 DER).
    async fn update_merchant_rsa_public_key(
        &self,
        id: MerchantId,
        public_key: Option<String>,
    ) -> PayResult<()>;

    async fn wallet(
        &self,
        id: MerchantId,
    ) -> PayResult<Option<MerchantWallet>>;

    async fn wallet_records(
        &self,
        id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWalletRecord>>;

    async fn prepaid_records(
        &self,
        id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWalletPrepaidRecord>>;

    // --- Orders --- //

    async fn order(&self, trade_no: &TradeNo) -> PayResult<Option<Order>>;

    async fn order_buyer(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<OrderBuyer>>;

    /// Most recent order with this `(merchant_id, out_trade_no)` created
    /// at or after `since`.
    async fn recent_order_by_out_trade_no(
        &self,
        merchant_id: MerchantId,
        out_trade_no: &str,
        since: DateTime<Utc>,
    ) -> PayResult<Option<Order>>;

    // --- Channels --- //

    /// Enabled channels serving `payment_type`, optionally pinned to a
    /// code, ordered by id.
    async fn channels_for_selection(
        &self,
        payment_type: PaymentType,
        code: Option<&str>,
    ) -> PayResult<Vec<PaymentChannel>>;

    async fn channel(&self, id: ChannelId)
        -> PayResult<Option<PaymentChannel>>;

    async fn channel_account(
        &self,
        id: AccountId,
    ) -> PayResult<Option<PaymentChannelAccount>>;

    /// Selectable accounts of a channel, with per-account amount and time
    /// windows applied for accounts that don't inherit channel config.
    /// Ordered by id.
    async fn eligible_accounts(
        &self,
        channel_id: ChannelId,
        amount: Option<Amount>,
        at_local: NaiveTime,
    ) -> PayResult<Vec<PaymentChannelAccount>>;

    // --- Risk --- //

    async fn blacklist_by_hash(
        &self,
        entity_hash: &str,
    ) -> PayResult<Option<Blacklist>>;

    async fn insert_risk_log(&self, log: RiskLog) -> PayResult<()>;

    /// Orders created at or after `since` whose buyer record carries this
    /// IP.
    async fn count_orders_by_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> PayResult<u64>;

    /// Orders created at or after `since` whose buyer record matches
    /// `user_id` or `buyer_open_id`.
    async fn count_orders_by_account_since(
        &self,
        user_id: Option<&str>,
        buyer_open_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> PayResult<u64>;

    /// Trade states of every order attributable to the buyer by any
    /// matching identifier.
    async fn buyer_order_states(
        &self,
        idents: &BuyerIdentifiers,
    ) -> PayResult<Vec<TradeState>>;

    // --- Refunds --- //

    async fn refund(&self, id: &RefundId) -> PayResult<Option<OrderRefund>>;

    async fn refund_by_out_biz_no(
        &self,
        merchant_id: MerchantId,
        out_biz_no: &str,
    ) -> PayResult<Option<OrderRefund>>;

    async fn refunds_for_order(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Vec<OrderRefund>>;

    // --- Withdrawals --- //

    async fn withdrawal(
        &self,
        id: WithdrawalId,
    ) -> PayResult<Option<MerchantWithdrawalRecord>>;

    async fn withdrawals_for_merchant(
        &self,
        merchant_id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWithdrawalRecord>>;

    // --- Notifications --- //

    async fn insert_notification(
        &self,
        row: OrderNotification,
    ) -> PayResult<()>;

    /// Flip the notification bookkeeping on an order without touching
    /// anything else.
    async fn update_order_notify(
        &self,
        trade_no: &TradeNo,
        state: paygate_common::enums::NotifyState,
        retry_count: u32,
        next_retry: Option<DateTime<Utc>>,
    ) -> PayResult<()>;
}

/// Operations that must commit or roll back as one unit.
///
/// Methods named `*_for_update` acquire `SELECT … FOR UPDATE` row locks.
#[async_trait]
pub trait StoreTxn: Send {
    // --- Wallet --- //

    /// Lock and read the merchant's wallet row. This is the serialization
    /// point for all monetary work on a merchant.
    async fn wallet_for_update(
        &mut self,
        merchant_id: MerchantId,
    ) -> PayResult<MerchantWallet>;

    async fn update_wallet(&mut self, wallet: &MerchantWallet)
        -> PayResult<()>;

    async fn insert_wallet_record(
        &mut self,
        record: MerchantWalletRecord,
    ) -> PayResult<()>;

    async fn insert_prepaid_record(
        &mut self,
        record: MerchantWalletPrepaidRecord,
    ) -> PayResult<()>;

    // --- Orders --- //

    async fn order_for_update(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<Order>>;

    /// Fails `CONFLICT` when the trade number collides; callers
    /// regenerate and retry.
    async fn insert_order(&mut self, order: &Order) -> PayResult<()>;

    async fn update_order(&mut self, order: &Order) -> PayResult<()>;

    async fn insert_order_buyer(
        &mut self,
        buyer: &OrderBuyer,
    ) -> PayResult<()>;

    async fn order_buyer(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<OrderBuyer>>;

    async fn update_order_buyer(
        &mut self,
        buyer: &OrderBuyer,
    ) -> PayResult<()>;

    // --- Refunds --- //

    async fn refunds_for_order(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Vec<OrderRefund>>;

    /// Fails `CONFLICT` on a duplicate id or duplicate
    /// `(merchant_id, out_biz_no)`.
    async fn insert_refund(&mut self, refund: &OrderRefund) -> PayResult<()>;

    async fn update_refund(&mut self, refund: &OrderRefund) -> PayResult<()>;

    // --- Withdrawals --- //

    async fn insert_withdrawal(
        &mut self,
        record: &MerchantWithdrawalRecord,
    ) -> PayResult<WithdrawalId>;

    async fn withdrawal_for_update(
        &mut self,
        id: WithdrawalId,
    ) -> PayResult<Option<MerchantWithdrawalRecord>>;

    async fn update_withdrawal(
        &mut self,
        record: &MerchantWithdrawalRecord,
    ) -> PayResult<()>;

    // --- Completion --- //

    async fn commit(self: Box<Self>) -> PayResult<()>;

    async fn rollback(self: Box<Self>) -> PayResult<()>;
}
