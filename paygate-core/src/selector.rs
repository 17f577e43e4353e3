//! Channel / sub-account eligibility and rotation.
//!
//! The selector walks enabled channels for the requested payment type,
//! drops channels whose amount window or trading window doesn't fit,
//! enforces daily turnover caps from the shared counter store, applies
//! the merchant whitelist, and finally picks one sub-account per the
//! channel's rotation strategy. Counters are only *read* here; the bump
//! happens after the order row is persisted, via [`record_usage`].
//!
//! [`record_usage`]: ChannelSelector::record_usage

use std::sync::Arc;

use paygate_common::{
    Amount, Error,
    enums::{PaymentType, RollMode},
    error::PayResult,
    ids::{AccountId, ChannelId},
    time::{date_key, local_time, now, within_window},
};
use rand::{Rng, seq::SliceRandom};
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use crate::{
    cache::DAY_TTL,
    ctx::Ctx,
    models::{Merchant, PaymentChannel, PaymentChannelAccount},
};

/// Key of the channel-level daily turnover counter.
fn channel_counter_key(id: ChannelId, date: &str) -> String {
    format!("PaymentDailyLimit:channel:{id}:{date}")
}

/// Key of the account-level daily turnover counter.
fn account_counter_key(id: AccountId, date: &str) -> String {
    format!("PaymentDailyLimit:account:{id}:{date}")
}

/// Key of the sequential-rotation pointer: holds the last-used account id.
fn rotation_key(channel_id: ChannelId) -> String {
    format!("PaymentChannelAccountSort:{channel_id}")
}

/// A successful selection.
#[derive(Clone, Debug)]
pub struct Selection {
    pub channel: PaymentChannel,
    pub account: PaymentChannelAccount,
}

pub struct ChannelSelector {
    ctx: Arc<Ctx>,
}

impl ChannelSelector {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Pick a channel and sub-account for the request.
    ///
    /// - `code` pins the search to one channel code.
    /// - A channel at its daily cap fails the whole selection with
    ///   `RISK_BLOCKED` rather than falling through to the next channel.
    /// - Exhausting every account of every candidate channel yields
    ///   `NO_AVAILABLE_ACCOUNT`; no candidate channel at all yields
    ///   `NO_AVAILABLE_CHANNEL`.
    #[instrument(skip_all, name = "(channel-select)")]
    pub async fn select(
        &self,
        payment_type: PaymentType,
        code: Option<&str>,
        amount: Option<Amount>,
        merchant: Option<&Merchant>,
    ) -> PayResult<Selection> {
        let channels = self
            .ctx
            .store
            .channels_for_selection(payment_type, code)
            .await?;
        if channels.is_empty() {
            return Err(Error::new(
                paygate_common::ErrorKind::NoAvailableChannel,
                "no channel serves this payment type",
            ));
        }

        let at = now();
        let tz = self.ctx.config.timezone;
        let local = local_time(tz, at);
        let date = date_key(tz, at);

        let mut saw_candidate = false;
        for channel in channels {
            if let Some(merchant) = merchant {
                if !merchant.allows_channel(channel.id) {
                    continue;
                }
            }
            if !self.channel_fits(&channel, amount, local, &date).await? {
                continue;
            }
            saw_candidate = true;

            let mut accounts = self
                .ctx
                .store
                .eligible_accounts(channel.id, amount, local)
                .await?;
            accounts = self
                .filter_account_limits(accounts, amount, &date)
                .await?;
            if let Some(merchant) = merchant {
                accounts.retain(|a| {
                    merchant.allows_account(channel.id, a.id)
                });
            }
            if accounts.is_empty() {
                debug!(channel = %channel.code, "no eligible account");
                continue;
            }

            let account = self.pick(&channel, accounts).await?;
            return Ok(Selection { channel, account });
        }

        if saw_candidate {
            Err(Error::new(
                paygate_common::ErrorKind::NoAvailableAccount,
                "all payment accounts are exhausted",
            ))
        } else {
            Err(Error::new(
                paygate_common::ErrorKind::NoAvailableChannel,
                "no available payment channel",
            ))
        }
    }

    /// Channel-level amount window, trading window, and daily cap.
    async fn channel_fits(
        &self,
        channel: &PaymentChannel,
        amount: Option<Amount>,
        local: chrono::NaiveTime,
        date: &str,
    ) -> PayResult<bool> {
        if let Some(amount) = amount {
            if let Some(min) = channel.min_amount {
                if amount < min {
                    return Ok(false);
                }
            }
            if let Some(max) = channel.max_amount {
                if amount > max {
                    return Ok(false);
                }
            }
        }
        if !within_window(local, channel.earliest_time, channel.latest_time) {
            return Ok(false);
        }
        if let (Some(limit), Some(amount)) = (channel.daily_limit, amount) {
            let used = self
                .ctx
                .cache
                .get_decimal(&channel_counter_key(channel.id, date))
                .await?
                .unwrap_or(Decimal::ZERO);
            if used + amount.get() > limit.get() {
                // Cap exhaustion is a risk decision, not a soft skip.
                return Err(Error::risk_blocked(
                    "payment channel daily limit reached",
                ));
            }
        }
        Ok(true)
    }

    /// In-memory filter of account daily caps against the counter store.
    async fn filter_account_limits(
        &self,
        accounts: Vec<PaymentChannelAccount>,
        amount: Option<Amount>,
        date: &str,
    ) -> PayResult<Vec<PaymentChannelAccount>> {
        let Some(amount) = amount else { return Ok(accounts) };
        let mut kept = Vec::with_capacity(accounts.len());
        for account in accounts {
            match account.daily_limit {
                Some(limit) => {
                    let used = self
                        .ctx
                        .cache
                        .get_decimal(&account_counter_key(account.id, date))
                        .await?
                        .unwrap_or(Decimal::ZERO);
                    if used + amount.get() <= limit.get() {
                        kept.push(account);
                    }
                }
                None => kept.push(account),
            }
        }
        Ok(kept)
    }

    /// Apply the channel's rotation strategy to a non-empty, id-ordered
    /// account list.
    async fn pick(
        &self,
        channel: &PaymentChannel,
        accounts: Vec<PaymentChannelAccount>,
    ) -> PayResult<PaymentChannelAccount> {
        match channel.roll_mode {
            RollMode::First => Ok(accounts
                .into_iter()
                .next()
                .expect("pick called with accounts")),
            RollMode::Random => {
                let mut rng = rand::thread_rng();
                Ok(accounts
                    .choose(&mut rng)
                    .expect("pick called with accounts")
                    .clone())
            }
            RollMode::Weighted => {
                let total: u64 = accounts
                    .iter()
                    .map(|a| u64::from(a.roll_weight))
                    .sum();
                if total == 0 {
                    // All weights zero: fall back to sequential.
                    return self.pick_sequential(channel, accounts).await;
                }
                let mut roll =
                    rand::thread_rng().gen_range(0..total);
                for account in &accounts {
                    let weight = u64::from(account.roll_weight);
                    if roll < weight {
                        return Ok(account.clone());
                    }
                    roll -= weight;
                }
                Ok(accounts.last().expect("non-empty").clone())
            }
            RollMode::Sequential =>
                self.pick_sequential(channel, accounts).await,
        }
    }

    /// Round-robin off the shared pointer: pick the account immediately
    /// following the last-used id, wrapping around, then advance the
    /// pointer.
    async fn pick_sequential(
        &self,
        channel: &PaymentChannel,
        accounts: Vec<PaymentChannelAccount>,
    ) -> PayResult<PaymentChannelAccount> {
        let key = rotation_key(channel.id);
        let last = self.ctx.cache.get_i64(&key).await?.unwrap_or(0);
        let picked = accounts
            .iter()
            .find(|a| a.id.0 > last)
            .unwrap_or(&accounts[0])
            .clone();
        self.ctx.cache.set_i64(&key, picked.id.0, DAY_TTL).await?;
        Ok(picked)
    }

    /// Bump the daily turnover counters after the order row is persisted.
    pub async fn record_usage(
        &self,
        channel_id: ChannelId,
        account_id: AccountId,
        amount: Amount,
    ) -> PayResult<()> {
        let date = date_key(self.ctx.config.timezone, now());
        self.ctx
            .cache
            .incr_decimal(
                &channel_counter_key(channel_id, &date),
                amount.get(),
                DAY_TTL,
            )
            .await?;
        self.ctx
            .cache
            .incr_decimal(
                &account_counter_key(account_id, &date),
                amount.get(),
                DAY_TTL,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use paygate_common::ErrorKind;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{
        cache::Cache,
        ctx::testing::test_ctx,
        models::{ChannelWhitelistEntry, WhitelistAccount},
        testutil,
    };

    #[tokio::test]
    async fn no_channel_for_payment_type() {
        let t = test_ctx();
        let err = ChannelSelector::new(t.ctx.clone())
            .select(PaymentType::PayPal, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAvailableChannel);
    }

    #[tokio::test]
    async fn sequential_rotation_cycles_in_id_order() {
        let t = test_ctx();
        let mut ch = testutil::channel(10);
        ch.roll_mode = RollMode::Sequential;
        t.store.seed_channel(ch).await;
        for id in [3, 5, 7] {
            t.store.seed_account(testutil::account(id, 10, 1)).await;
        }
        // Pointer starts at account 3's id, as if it was used last.
        t.cache
            .set_i64(&rotation_key(ChannelId(10)), 3, DAY_TTL)
            .await
            .unwrap();

        let selector = ChannelSelector::new(t.ctx.clone());
        let mut picks = Vec::new();
        for _ in 0..5 {
            let s = selector
                .select(PaymentType::Alipay, None, None, None)
                .await
                .unwrap();
            picks.push(s.account.id.0);
        }
        assert_eq!(picks, vec![5, 7, 3, 5, 7]);
    }

    #[tokio::test]
    async fn first_mode_picks_lowest_id() {
        let t = test_ctx();
        let mut ch = testutil::channel(10);
        ch.roll_mode = RollMode::First;
        t.store.seed_channel(ch).await;
        for id in [9, 4, 6] {
            t.store.seed_account(testutil::account(id, 10, 1)).await;
        }
        let s = ChannelSelector::new(t.ctx.clone())
            .select(PaymentType::Alipay, None, None, None)
            .await
            .unwrap();
        assert_eq!(s.account.id.0, 4);
    }

    #[tokio::test]
    async fn weighted_mode_excludes_zero_weights() {
        let t = test_ctx();
        let mut ch = testutil::channel(10);
        ch.roll_mode = RollMode::Weighted;
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(1, 10, 0)).await;
        t.store.seed_account(testutil::account(2, 10, 5)).await;

        let selector = ChannelSelector::new(t.ctx.clone());
        for _ in 0..10 {
            let s = selector
                .select(PaymentType::Alipay, None, None, None)
                .await
                .unwrap();
            assert_eq!(s.account.id.0, 2);
        }
    }

    #[tokio::test]
    async fn amount_window_skips_channel() {
        let t = test_ctx();
        let mut ch = testutil::channel(10);
        ch.min_amount = Some(Amount::from_cents(5_000));
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(1, 10, 1)).await;

        let err = ChannelSelector::new(t.ctx.clone())
            .select(
                PaymentType::Alipay,
                None,
                Some(Amount::from_cents(100)),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAvailableChannel);
    }

    #[tokio::test]
    async fn channel_daily_cap_propagates_risk_block() {
        let t = test_ctx();
        let mut ch = testutil::channel(10);
        ch.daily_limit = Some(Amount::from_cents(10_000));
        t.store.seed_channel(ch).await;
        t.store.seed_account(testutil::account(1, 10, 1)).await;

        let selector = ChannelSelector::new(t.ctx.clone());
        // Record 95.00 of turnover today.
        selector
            .record_usage(
                ChannelId(10),
                AccountId(1),
                Amount::from_cents(9_500),
            )
            .await
            .unwrap();

        // 6.00 more would exceed the 100.00 cap.
        let err = selector
            .select(
                PaymentType::Alipay,
                None,
                Some(Amount::from_cents(600)),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RiskBlocked);

        // 5.00 exactly fills it.
        selector
            .select(
                PaymentType::Alipay,
                None,
                Some(Amount::from_cents(500)),
                None,
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn account_daily_cap_drops_account() {
        let t = test_ctx();
        t.store.seed_channel(testutil::channel(10)).await;
        let mut a1 = testutil::account(1, 10, 1);
        a1.daily_limit = Some(Amount::from_cents(1_000));
        t.store.seed_account(a1).await;
        t.store.seed_account(testutil::account(2, 10, 1)).await;

        let selector = ChannelSelector::new(t.ctx.clone());
        selector
            .record_usage(ChannelId(10), AccountId(1), Amount::from_cents(900))
            .await
            .unwrap();

        // 2.00 busts account 1's cap; account 2 takes the traffic.
        let s = selector
            .select(
                PaymentType::Alipay,
                None,
                Some(Amount::from_cents(200)),
                None,
            )
            .await
            .unwrap();
        assert_eq!(s.account.id.0, 2);
    }

    #[tokio::test]
    async fn merchant_whitelist_restricts_accounts() {
        let t = test_ctx();
        t.store.seed_channel(testutil::channel(10)).await;
        t.store.seed_account(testutil::account(1, 10, 1)).await;
        t.store.seed_account(testutil::account(2, 10, 1)).await;

        let mut merchant = testutil::merchant(1);
        merchant.channel_whitelist = vec![ChannelWhitelistEntry {
            channel_id: ChannelId(10),
            rate: None,
            use_all_accounts: false,
            accounts: vec![WhitelistAccount {
                account_id: AccountId(2),
                rate: None,
            }],
        }];

        let selector = ChannelSelector::new(t.ctx.clone());
        for _ in 0..5 {
            let s = selector
                .select(PaymentType::Alipay, None, None, Some(&merchant))
                .await
                .unwrap();
            assert_eq!(s.account.id.0, 2);
        }

        // A whitelist pointing at another channel leaves nothing.
        merchant.channel_whitelist[0].channel_id = ChannelId(99);
        let err = selector
            .select(PaymentType::Alipay, None, None, Some(&merchant))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAvailableChannel);
    }

    #[tokio::test]
    async fn maintenance_accounts_are_invisible() {
        let t = test_ctx();
        t.store.seed_channel(testutil::channel(10)).await;
        let mut a = testutil::account(1, 10, 1);
        a.maintenance = true;
        t.store.seed_account(a).await;

        let err = ChannelSelector::new(t.ctx.clone())
            .select(PaymentType::Alipay, None, None, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NoAvailableAccount);
    }

    #[tokio::test]
    async fn code_pin_restricts_channels() {
        let t = test_ctx();
        t.store.seed_channel(testutil::channel(10)).await;
        t.store.seed_channel(testutil::channel(11)).await;
        t.store.seed_account(testutil::account(1, 10, 1)).await;
        t.store.seed_account(testutil::account(2, 11, 1)).await;

        let s = ChannelSelector::new(t.ctx.clone())
            .select(PaymentType::Alipay, Some("ALIPAY11"), None, None)
            .await
            .unwrap();
        assert_eq!(s.channel.id.0, 11);
        assert_eq!(s.account.id.0, 2);
    }

    #[tokio::test]
    async fn usage_counters_accumulate_decimal() {
        let t = test_ctx();
        let selector = ChannelSelector::new(t.ctx.clone());
        selector
            .record_usage(ChannelId(1), AccountId(2), Amount::from_cents(150))
            .await
            .unwrap();
        selector
            .record_usage(ChannelId(1), AccountId(2), Amount::from_cents(25))
            .await
            .unwrap();

        let date = date_key(t.ctx.config.timezone, now());
        let used = t
            .cache
            .get_decimal(&channel_counter_key(ChannelId(1), &date))
            .await
            .unwrap();
        assert_eq!(used, Some(dec!(1.75)));
    }
}
