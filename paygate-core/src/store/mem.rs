//! In-memory [`Store`] for tests.
//!
//! A single tokio mutex guards the whole state, so "transactions" are
//! trivially serializable: [`MemTxn`] holds the guard for its lifetime
//! and restores a snapshot on rollback or drop-without-commit. Row-lock
//! semantics (`wallet_for_update` serializing a merchant's monetary work)
//! hold by construction.

use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use paygate_common::{
    Amount, Error,
    enums::{NotifyState, PaymentType, TradeState},
    error::PayResult,
    ids::{AccountId, ChannelId, MerchantId, MerchantNumber, RefundId, TradeNo, WithdrawalId},
    time::within_window,
};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{
    models::{
        Blacklist, Merchant, MerchantEncryption, MerchantWallet,
        MerchantWalletPrepaidRecord, MerchantWalletRecord,
        MerchantWithdrawalRecord, Order, OrderBuyer, OrderNotification,
        OrderRefund, PaymentChannel, PaymentChannelAccount, RiskLog,
    },
    store::{BuyerIdentifiers, Store, StoreTxn},
};

#[derive(Clone, Default)]
struct MemState {
    merchants: HashMap<i64, Merchant>,
    encryptions: HashMap<i64, MerchantEncryption>,
    wallets: HashMap<i64, MerchantWallet>,
    wallet_records: Vec<MerchantWalletRecord>,
    prepaid_records: Vec<MerchantWalletPrepaidRecord>,
    orders: HashMap<String, Order>,
    buyers: HashMap<String, OrderBuyer>,
    refunds: Vec<OrderRefund>,
    notifications: Vec<OrderNotification>,
    withdrawals: HashMap<i64, MerchantWithdrawalRecord>,
    channels: Vec<PaymentChannel>,
    accounts: Vec<PaymentChannelAccount>,
    blacklist: Vec<Blacklist>,
    risk_logs: Vec<RiskLog>,
    next_id: i64,
}

impl MemState {
    fn assign_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn account_matches(
        account: &PaymentChannelAccount,
        amount: Option<Amount>,
        at_local: NaiveTime,
    ) -> bool {
        if !account.is_selectable() {
            return false;
        }
        if account.inherit_config {
            return true;
        }
        if let Some(amount) = amount {
            if let Some(min) = account.min_amount {
                if amount < min {
                    return false;
                }
            }
            if let Some(max) = account.max_amount {
                if amount > max {
                    return false;
                }
            }
        }
        within_window(at_local, account.earliest_time, account.latest_time)
    }
}

/// Shared-state in-memory store.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Seeding (test fixtures; not part of the Store contract) --- //

    /// Insert a merchant along with an empty wallet and its encryption
    /// settings.
    pub async fn seed_merchant(
        &self,
        merchant: Merchant,
        encryption: MerchantEncryption,
    ) {
        let mut s = self.state.lock().await;
        s.wallets
            .entry(merchant.id.0)
            .or_insert_with(|| MerchantWallet::empty(merchant.id));
        s.encryptions.insert(merchant.id.0, encryption);
        s.merchants.insert(merchant.id.0, merchant);
    }

    pub async fn seed_wallet(&self, wallet: MerchantWallet) {
        let mut s = self.state.lock().await;
        s.wallets.insert(wallet.merchant_id.0, wallet);
    }

    pub async fn seed_channel(&self, channel: PaymentChannel) {
        let mut s = self.state.lock().await;
        s.channels.push(channel);
        s.channels.sort_by_key(|c| c.id.0);
    }

    pub async fn seed_account(&self, account: PaymentChannelAccount) {
        let mut s = self.state.lock().await;
        s.accounts.push(account);
        s.accounts.sort_by_key(|a| a.id.0);
    }

    pub async fn seed_blacklist(&self, mut entry: Blacklist) {
        let mut s = self.state.lock().await;
        entry.id = s.assign_id();
        s.blacklist.push(entry);
    }

    pub async fn remove_blacklist(&self, entity_hash: &str) {
        let mut s = self.state.lock().await;
        s.blacklist.retain(|b| b.entity_hash != entity_hash);
    }

    pub async fn seed_order(&self, order: Order, buyer: OrderBuyer) {
        let mut s = self.state.lock().await;
        s.buyers.insert(order.trade_no.as_str().to_owned(), buyer);
        s.orders.insert(order.trade_no.as_str().to_owned(), order);
    }

    // --- Snapshots (test assertions) --- //

    pub async fn all_risk_logs(&self) -> Vec<RiskLog> {
        self.state.lock().await.risk_logs.clone()
    }

    pub async fn all_wallet_records(&self) -> Vec<MerchantWalletRecord> {
        self.state.lock().await.wallet_records.clone()
    }

    pub async fn all_prepaid_records(
        &self,
    ) -> Vec<MerchantWalletPrepaidRecord> {
        self.state.lock().await.prepaid_records.clone()
    }

    pub async fn all_notifications(&self) -> Vec<OrderNotification> {
        self.state.lock().await.notifications.clone()
    }

    pub async fn all_refunds(&self) -> Vec<OrderRefund> {
        self.state.lock().await.refunds.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> PayResult<Box<dyn StoreTxn>> {
        let guard = self.state.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(Box::new(MemTxn { snapshot: Some(snapshot), committed: false, guard }))
    }

    async fn merchant(&self, id: MerchantId) -> PayResult<Option<Merchant>> {
        Ok(self.state.lock().await.merchants.get(&id.0).cloned())
    }

    async fn merchant_by_number(
        &self,
        number: &MerchantNumber,
    ) -> PayResult<Option<Merchant>> {
        Ok(self
            .state
            .lock()
            .await
            .merchants
            .values()
            .find(|m| &m.merchant_number == number)
            .cloned())
    }

    async fn merchant_encryption(
        &self,
        id: MerchantId,
    ) -> PayResult<Option<MerchantEncryption>> {
        Ok(self.state.lock().await.encryptions.get(&id.0).cloned())
    }

    async fn update_merchant_rsa_public_key(
        &self,
        id: MerchantId,
        public_key: Option<String>,
    ) -> PayResult<()> {
        let mut s = self.state.lock().await;
        let enc = s
            .encryptions
            .get_mut(&id.0)
            .ok_or_else(|| Error::not_found("merchant encryption not found"))?;
        enc.rsa_public_key = public_key;
        Ok(())
    }

    async fn wallet(
        &self,
        id: MerchantId,
    ) -> PayResult<Option<MerchantWallet>> {
        Ok(self.state.lock().await.wallets.get(&id.0).cloned())
    }

    async fn wallet_records(
        &self,
        id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWalletRecord>> {
        let s = self.state.lock().await;
        Ok(s.wallet_records
            .iter()
            .filter(|r| r.merchant_id == id)
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn prepaid_records(
        &self,
        id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWalletPrepaidRecord>> {
        let s = self.state.lock().await;
        Ok(s.prepaid_records
            .iter()
            .filter(|r| r.merchant_id == id)
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn order(&self, trade_no: &TradeNo) -> PayResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(trade_no.as_str()).cloned())
    }

    async fn order_buyer(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<OrderBuyer>> {
        Ok(self.state.lock().await.buyers.get(trade_no.as_str()).cloned())
    }

    async fn recent_order_by_out_trade_no(
        &self,
        merchant_id: MerchantId,
        out_trade_no: &str,
        since: DateTime<Utc>,
    ) -> PayResult<Option<Order>> {
        let s = self.state.lock().await;
        Ok(s.orders
            .values()
            .filter(|o| {
                o.merchant_id == merchant_id
                    && o.out_trade_no == out_trade_no
                    && o.create_time >= since
            })
            .max_by_key(|o| o.create_time)
            .cloned())
    }

    async fn channels_for_selection(
        &self,
        payment_type: PaymentType,
        code: Option<&str>,
    ) -> PayResult<Vec<PaymentChannel>> {
        let s = self.state.lock().await;
        Ok(s.channels
            .iter()
            .filter(|c| {
                c.status
                    && c.payment_type == payment_type
                    && code.map_or(true, |code| c.code == code)
            })
            .cloned()
            .collect())
    }

    async fn channel(
        &self,
        id: ChannelId,
    ) -> PayResult<Option<PaymentChannel>> {
        let s = self.state.lock().await;
        Ok(s.channels.iter().find(|c| c.id == id).cloned())
    }

    async fn channel_account(
        &self,
        id: AccountId,
    ) -> PayResult<Option<PaymentChannelAccount>> {
        let s = self.state.lock().await;
        Ok(s.accounts.iter().find(|a| a.id == id).cloned())
    }

    async fn eligible_accounts(
        &self,
        channel_id: ChannelId,
        amount: Option<Amount>,
        at_local: NaiveTime,
    ) -> PayResult<Vec<PaymentChannelAccount>> {
        let s = self.state.lock().await;
        Ok(s.accounts
            .iter()
            .filter(|a| {
                a.channel_id == channel_id
                    && MemState::account_matches(a, amount, at_local)
            })
            .cloned()
            .collect())
    }

    async fn blacklist_by_hash(
        &self,
        entity_hash: &str,
    ) -> PayResult<Option<Blacklist>> {
        let s = self.state.lock().await;
        Ok(s.blacklist
            .iter()
            .find(|b| b.entity_hash == entity_hash)
            .cloned())
    }

    async fn insert_risk_log(&self, mut log: RiskLog) -> PayResult<()> {
        let mut s = self.state.lock().await;
        log.id = s.assign_id();
        s.risk_logs.push(log);
        Ok(())
    }

    async fn count_orders_by_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> PayResult<u64> {
        let s = self.state.lock().await;
        Ok(s.buyers
            .values()
            .filter(|b| b.ip.as_deref() == Some(ip))
            .filter(|b| {
                s.orders
                    .get(b.trade_no.as_str())
                    .is_some_and(|o| o.create_time >= since)
            })
            .count() as u64)
    }

    async fn count_orders_by_account_since(
        &self,
        user_id: Option<&str>,
        buyer_open_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> PayResult<u64> {
        let s = self.state.lock().await;
        Ok(s.buyers
            .values()
            .filter(|b| {
                (user_id.is_some() && b.user_id.as_deref() == user_id)
                    || (buyer_open_id.is_some()
                        && b.buyer_open_id.as_deref() == buyer_open_id)
            })
            .filter(|b| {
                s.orders
                    .get(b.trade_no.as_str())
                    .is_some_and(|o| o.create_time >= since)
            })
            .count() as u64)
    }

    async fn buyer_order_states(
        &self,
        idents: &BuyerIdentifiers,
    ) -> PayResult<Vec<TradeState>> {
        if idents.is_empty() {
            return Ok(Vec::new());
        }
        let s = self.state.lock().await;
        Ok(s.buyers
            .values()
            .filter(|b| {
                let matches = |a: &Option<String>, b: &Option<String>| {
                    a.is_some() && a == b
                };
                matches(&idents.user_id, &b.user_id)
                    || matches(&idents.buyer_open_id, &b.buyer_open_id)
                    || matches(&idents.mobile, &b.mobile)
                    || matches(&idents.cert_no, &b.cert_no)
            })
            .filter_map(|b| s.orders.get(b.trade_no.as_str()))
            .map(|o| o.trade_state)
            .collect())
    }

    async fn refund(&self, id: &RefundId) -> PayResult<Option<OrderRefund>> {
        let s = self.state.lock().await;
        Ok(s.refunds.iter().find(|r| &r.id == id).cloned())
    }

    async fn refund_by_out_biz_no(
        &self,
        merchant_id: MerchantId,
        out_biz_no: &str,
    ) -> PayResult<Option<OrderRefund>> {
        let s = self.state.lock().await;
        Ok(s.refunds
            .iter()
            .find(|r| {
                r.merchant_id == merchant_id
                    && r.out_biz_no.as_deref() == Some(out_biz_no)
            })
            .cloned())
    }

    async fn refunds_for_order(
        &self,
        trade_no: &TradeNo,
    ) -> PayResult<Vec<OrderRefund>> {
        let s = self.state.lock().await;
        Ok(s.refunds
            .iter()
            .filter(|r| &r.trade_no == trade_no)
            .cloned()
            .collect())
    }

    async fn withdrawal(
        &self,
        id: WithdrawalId,
    ) -> PayResult<Option<MerchantWithdrawalRecord>> {
        Ok(self.state.lock().await.withdrawals.get(&id.0).cloned())
    }

    async fn withdrawals_for_merchant(
        &self,
        merchant_id: MerchantId,
        limit: u32,
        offset: u32,
    ) -> PayResult<Vec<MerchantWithdrawalRecord>> {
        let s = self.state.lock().await;
        let mut rows: Vec<_> = s
            .withdrawals
            .values()
            .filter(|w| w.merchant_id == merchant_id)
            .cloned()
            .collect();
        rows.sort_by_key(|w| std::cmp::Reverse(w.id.0));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn insert_notification(
        &self,
        row: OrderNotification,
    ) -> PayResult<()> {
        self.state.lock().await.notifications.push(row);
        Ok(())
    }

    async fn update_order_notify(
        &self,
        trade_no: &TradeNo,
        state: NotifyState,
        retry_count: u32,
        next_retry: Option<DateTime<Utc>>,
    ) -> PayResult<()> {
        let mut s = self.state.lock().await;
        let order = s
            .orders
            .get_mut(trade_no.as_str())
            .ok_or_else(|| Error::not_found("order not found"))?;
        order.notify_state = state;
        order.notify_retry_count = retry_count;
        order.notify_next_retry_time = next_retry;
        Ok(())
    }
}

/// One "transaction" over the whole [`MemState`].
pub struct MemTxn {
    snapshot: Option<MemState>,
    committed: bool,
    guard: OwnedMutexGuard<MemState>,
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if !self.committed {
            if let Some(snapshot) = self.snapshot.take() {
                *self.guard = snapshot;
            }
        }
    }
}

#[async_trait]
impl StoreTxn for MemTxn {
    async fn wallet_for_update(
        &mut self,
        merchant_id: MerchantId,
    ) -> PayResult<MerchantWallet> {
        self.guard
            .wallets
            .get(&merchant_id.0)
            .cloned()
            .ok_or_else(|| Error::not_found("merchant wallet not found"))
    }

    async fn update_wallet(
        &mut self,
        wallet: &MerchantWallet,
    ) -> PayResult<()> {
        self.guard
            .wallets
            .insert(wallet.merchant_id.0, wallet.clone());
        Ok(())
    }

    async fn insert_wallet_record(
        &mut self,
        mut record: MerchantWalletRecord,
    ) -> PayResult<()> {
        record.id = self.guard.assign_id();
        self.guard.wallet_records.push(record);
        Ok(())
    }

    async fn insert_prepaid_record(
        &mut self,
        mut record: MerchantWalletPrepaidRecord,
    ) -> PayResult<()> {
        record.id = self.guard.assign_id();
        self.guard.prepaid_records.push(record);
        Ok(())
    }

    async fn order_for_update(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<Order>> {
        Ok(self.guard.orders.get(trade_no.as_str()).cloned())
    }

    async fn insert_order(&mut self, order: &Order) -> PayResult<()> {
        let key = order.trade_no.as_str().to_owned();
        if self.guard.orders.contains_key(&key) {
            return Err(Error::conflict("trade_no collision"));
        }
        self.guard.orders.insert(key, order.clone());
        Ok(())
    }

    async fn update_order(&mut self, order: &Order) -> PayResult<()> {
        self.guard
            .orders
            .insert(order.trade_no.as_str().to_owned(), order.clone());
        Ok(())
    }

    async fn insert_order_buyer(
        &mut self,
        buyer: &OrderBuyer,
    ) -> PayResult<()> {
        self.guard
            .buyers
            .insert(buyer.trade_no.as_str().to_owned(), buyer.clone());
        Ok(())
    }

    async fn order_buyer(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Option<OrderBuyer>> {
        Ok(self.guard.buyers.get(trade_no.as_str()).cloned())
    }

    async fn update_order_buyer(
        &mut self,
        buyer: &OrderBuyer,
    ) -> PayResult<()> {
        self.guard
            .buyers
            .insert(buyer.trade_no.as_str().to_owned(), buyer.clone());
        Ok(())
    }

    async fn refunds_for_order(
        &mut self,
        trade_no: &TradeNo,
    ) -> PayResult<Vec<OrderRefund>> {
        Ok(self
            .guard
            .refunds
            .iter()
            .filter(|r| &r.trade_no == trade_no)
            .cloned()
            .collect())
    }

    async fn insert_refund(&mut self, refund: &OrderRefund) -> PayResult<()> {
        if self.guard.refunds.iter().any(|r| r.id == refund.id) {
            return Err(Error::conflict("refund id collision"));
        }
        if let Some(out_biz_no) = &refund.out_biz_no {
            let dup = self.guard.refunds.iter().any(|r| {
                r.merchant_id == refund.merchant_id
                    && r.out_biz_no.as_deref() == Some(out_biz_no)
            });
            if dup {
                return Err(Error::conflict("duplicate out_biz_no"));
            }
        }
        self.guard.refunds.push(refund.clone());
        Ok(())
    }

    async fn update_refund(&mut self, refund: &OrderRefund) -> PayResult<()> {
        let slot = self
            .guard
            .refunds
            .iter_mut()
            .find(|r| r.id == refund.id)
            .ok_or_else(|| Error::not_found("refund not found"))?;
        *slot = refund.clone();
        Ok(())
    }

    async fn insert_withdrawal(
        &mut self,
        record: &MerchantWithdrawalRecord,
    ) -> PayResult<WithdrawalId> {
        let id = WithdrawalId(self.guard.assign_id());
        let mut record = record.clone();
        record.id = id;
        self.guard.withdrawals.insert(id.0, record);
        Ok(id)
    }

    async fn withdrawal_for_update(
        &mut self,
        id: WithdrawalId,
    ) -> PayResult<Option<MerchantWithdrawalRecord>> {
        Ok(self.guard.withdrawals.get(&id.0).cloned())
    }

    async fn update_withdrawal(
        &mut self,
        record: &MerchantWithdrawalRecord,
    ) -> PayResult<()> {
        self.guard.withdrawals.insert(record.id.0, record.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> PayResult<()> {
        self.committed = true;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> PayResult<()> {
        // Drop impl restores the snapshot.
        Ok(())
    }
}
