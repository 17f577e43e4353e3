//! Pre-order risk checks and buyer behavior summaries.
//!
//! Checks short-circuit on the first hit; every hit appends a
//! [`RiskLog`] row before the order attempt is rejected. Daily caps count
//! buyer records since local midnight in the platform timezone.

use std::sync::Arc;

use paygate_common::{
    Error,
    enums::{BlacklistEntityType, CertType, RiskLogType},
    error::PayResult,
    time::{local_midnight, now},
};
use paygate_crypto::entity_hash;
use rust_decimal::{Decimal, prelude::FromPrimitive};
use tracing::instrument;

use crate::{
    ctx::Ctx,
    models::{BehaviorSummary, Merchant, OrderBuyer, RiskLog},
    store::BuyerIdentifiers,
};

pub struct RiskEngine {
    ctx: Arc<Ctx>,
}

impl RiskEngine {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// Gate an order creation. `Ok(())` means clear; a
    /// `RISK_BLOCKED` error carries the user-facing reason.
    #[instrument(skip_all, name = "(create-order-check)")]
    pub async fn create_order_check(
        &self,
        merchant: &Merchant,
        buyer: &OrderBuyer,
        device_fingerprint: Option<&str>,
    ) -> PayResult<()> {
        if !merchant.risk_status {
            return Ok(());
        }

        // Blacklists, cheapest identifiers first.
        if let Some(ip) = buyer.ip.as_deref() {
            self.check_blacklist(
                merchant,
                BlacklistEntityType::IpAddress,
                ip,
                "payment IP is blocked",
            )
            .await?;
        }
        for user_ident in [buyer.user_id.as_deref(), buyer.buyer_open_id.as_deref()]
            .into_iter()
            .flatten()
        {
            self.check_blacklist(
                merchant,
                BlacklistEntityType::UserId,
                user_ident,
                "buyer account is blocked",
            )
            .await?;
        }
        if let Some(mobile) = buyer.mobile.as_deref() {
            self.check_blacklist(
                merchant,
                BlacklistEntityType::Mobile,
                mobile,
                "buyer mobile is blocked",
            )
            .await?;
        }
        if buyer.cert_type == Some(CertType::IdentityCard) {
            if let Some(cert_no) = buyer.cert_no.as_deref() {
                self.check_blacklist(
                    merchant,
                    BlacklistEntityType::IdCard,
                    cert_no,
                    "buyer identity document is blocked",
                )
                .await?;
            }
        }
        if let Some(fingerprint) = device_fingerprint {
            self.check_blacklist(
                merchant,
                BlacklistEntityType::DeviceFingerprint,
                fingerprint,
                "buyer device is blocked",
            )
            .await?;
        }

        // Daily caps, counted since today 00:00 local.
        let midnight = local_midnight(self.ctx.config.timezone, now());
        let ip_limit = self.ctx.config.ip_order_limit;
        if ip_limit > 0 {
            if let Some(ip) = buyer.ip.as_deref() {
                let count = self
                    .ctx
                    .store
                    .count_orders_by_ip_since(ip, midnight)
                    .await?;
                if count >= u64::from(ip_limit) {
                    return self
                        .block(
                            merchant,
                            format!("IP {ip} reached the daily order cap"),
                            "daily payment limit reached for today",
                        )
                        .await;
                }
            }
        }
        let account_limit = self.ctx.config.account_order_limit;
        if account_limit > 0
            && (buyer.user_id.is_some() || buyer.buyer_open_id.is_some())
        {
            let count = self
                .ctx
                .store
                .count_orders_by_account_since(
                    buyer.user_id.as_deref(),
                    buyer.buyer_open_id.as_deref(),
                    midnight,
                )
                .await?;
            if count >= u64::from(account_limit) {
                return self
                    .block(
                        merchant,
                        "buyer account reached the daily order cap"
                            .to_owned(),
                        "daily payment limit reached for today",
                    )
                    .await;
            }
        }

        Ok(())
    }

    async fn check_blacklist(
        &self,
        merchant: &Merchant,
        entity_type: BlacklistEntityType,
        value: &str,
        user_message: &'static str,
    ) -> PayResult<()> {
        let hash = entity_hash(entity_type, value);
        let hit = self.ctx.store.blacklist_by_hash(&hash).await?;
        match hit {
            Some(entry) if entry.is_active(now()) => {
                self.block(
                    merchant,
                    format!(
                        "blacklist hit: {entity_type} {value} ({})",
                        entry.reason
                    ),
                    user_message,
                )
                .await
            }
            _ => Ok(()),
        }
    }

    async fn block(
        &self,
        merchant: &Merchant,
        content: String,
        user_message: &'static str,
    ) -> PayResult<()> {
        self.ctx
            .store
            .insert_risk_log(RiskLog {
                id: 0,
                merchant_id: merchant.id,
                log_type: RiskLogType::Blacklist,
                content,
                created_at: now(),
            })
            .await?;
        Err(Error::risk_blocked(user_message))
    }

    /// Aggregate a buyer's history across merchants for risk display.
    pub async fn behavior_summary(
        &self,
        idents: &BuyerIdentifiers,
    ) -> PayResult<BehaviorSummary> {
        let states = self.ctx.store.buyer_order_states(idents).await?;
        let total_orders = states.len() as u64;
        let paid_orders =
            states.iter().filter(|s| s.is_paid()).count() as u64;
        let success_rate = if total_orders == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from_u64(paid_orders).unwrap_or_default()
                / Decimal::from_u64(total_orders).unwrap_or_default())
            .round_dp(4)
        };

        let mut blacklisted = false;
        let candidates = [
            (BlacklistEntityType::UserId, idents.user_id.as_deref()),
            (BlacklistEntityType::UserId, idents.buyer_open_id.as_deref()),
            (BlacklistEntityType::Mobile, idents.mobile.as_deref()),
            (BlacklistEntityType::IdCard, idents.cert_no.as_deref()),
        ];
        for (entity_type, value) in candidates {
            let Some(value) = value else { continue };
            let hash = entity_hash(entity_type, value);
            if let Some(entry) =
                self.ctx.store.blacklist_by_hash(&hash).await?
            {
                if entry.is_active(now()) {
                    blacklisted = true;
                    break;
                }
            }
        }

        Ok(BehaviorSummary {
            total_orders,
            paid_orders,
            success_rate,
            blacklisted,
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;
    use paygate_common::{
        ErrorKind,
        enums::{BlacklistOrigin, TradeState},
    };
    use rust_decimal_macros::dec;

    use super::*;
    use crate::{
        ctx::testing::{TestCtx, test_config, test_ctx, test_ctx_with_config},
        models::Blacklist,
        testutil,
    };

    fn blacklist_entry(
        entity_type: BlacklistEntityType,
        value: &str,
        expired_at: Option<chrono::DateTime<Utc>>,
    ) -> Blacklist {
        Blacklist {
            id: 0,
            entity_type,
            entity_value: value.to_owned(),
            entity_hash: entity_hash(entity_type, value),
            reason: "test".to_owned(),
            origin: BlacklistOrigin::ManualReview,
            expired_at,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn blacklisted_ip_blocks_and_logs() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        t.store
            .seed_blacklist(blacklist_entry(
                BlacklistEntityType::IpAddress,
                "203.0.113.9",
                None,
            ))
            .await;

        let mut buyer = testutil::buyer_with_ip("203.0.113.9");
        let engine = RiskEngine::new(t.ctx.clone());
        let err = engine
            .create_order_check(&merchant, &buyer, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RiskBlocked);
        assert_eq!(t.store.all_risk_logs().await.len(), 1);

        // A different IP passes.
        buyer.ip = Some("198.51.100.1".to_owned());
        engine
            .create_order_check(&merchant, &buyer, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_entries_do_not_block() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        t.store
            .seed_blacklist(blacklist_entry(
                BlacklistEntityType::IpAddress,
                "203.0.113.9",
                Some(Utc::now() - chrono::Duration::hours(1)),
            ))
            .await;

        let buyer = testutil::buyer_with_ip("203.0.113.9");
        RiskEngine::new(t.ctx.clone())
            .create_order_check(&merchant, &buyer, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn device_fingerprint_blocks() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;
        t.store
            .seed_blacklist(blacklist_entry(
                BlacklistEntityType::DeviceFingerprint,
                "fp-123",
                None,
            ))
            .await;

        let buyer = testutil::buyer_with_ip("198.51.100.1");
        let err = RiskEngine::new(t.ctx.clone())
            .create_order_check(&merchant, &buyer, Some("fp-123"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RiskBlocked);
    }

    #[tokio::test]
    async fn risk_exempt_merchant_skips_checks() {
        let t = test_ctx();
        let mut merchant = testutil::seed_default_merchant(&t).await;
        merchant.risk_status = false;
        t.store
            .seed_blacklist(blacklist_entry(
                BlacklistEntityType::IpAddress,
                "203.0.113.9",
                None,
            ))
            .await;

        let buyer = testutil::buyer_with_ip("203.0.113.9");
        RiskEngine::new(t.ctx.clone())
            .create_order_check(&merchant, &buyer, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ip_daily_cap_blocks_fourth_order() {
        let mut config = test_config();
        config.ip_order_limit = 3;
        let t: TestCtx = test_ctx_with_config(config);
        let merchant = testutil::seed_default_merchant(&t).await;

        // Three orders from the same IP today.
        for i in 0..3 {
            let (order, buyer) = testutil::paid_order_with_ip(
                merchant.id,
                &format!("ORD-{i}"),
                "203.0.113.9",
            );
            t.store.seed_order(order, buyer).await;
        }

        let buyer = testutil::buyer_with_ip("203.0.113.9");
        let engine = RiskEngine::new(t.ctx.clone());
        let err = engine
            .create_order_check(&merchant, &buyer, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::RiskBlocked);

        // Another IP is unaffected.
        let buyer = testutil::buyer_with_ip("198.51.100.7");
        engine
            .create_order_check(&merchant, &buyer, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn behavior_summary_counts_paid_orders() {
        let t = test_ctx();
        let merchant = testutil::seed_default_merchant(&t).await;

        for (i, state) in [
            TradeState::Success,
            TradeState::WaitPay,
            TradeState::Finished,
            TradeState::Closed,
        ]
        .into_iter()
        .enumerate()
        {
            let (mut order, mut buyer) = testutil::paid_order_with_ip(
                merchant.id,
                &format!("ORD-{i}"),
                "203.0.113.9",
            );
            order.trade_state = state;
            buyer.user_id = Some("buyer-1".to_owned());
            t.store.seed_order(order, buyer).await;
        }

        let summary = RiskEngine::new(t.ctx.clone())
            .behavior_summary(&BuyerIdentifiers {
                user_id: Some("buyer-1".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(summary.total_orders, 4);
        assert_eq!(summary.paid_orders, 2);
        assert_eq!(summary.success_rate, dec!(0.5000));
        assert!(!summary.blacklisted);
    }

    #[tokio::test]
    async fn empty_identifiers_mean_empty_summary() {
        let t = test_ctx();
        let summary = RiskEngine::new(t.ctx.clone())
            .behavior_summary(&BuyerIdentifiers::default())
            .await
            .unwrap();
        assert_eq!(summary.total_orders, 0);
        assert_eq!(summary.success_rate, Decimal::ZERO);
    }
}
