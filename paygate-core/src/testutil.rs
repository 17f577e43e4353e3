//! Shared fixtures for engine tests.

use std::collections::BTreeSet;

use chrono::Utc;
use paygate_common::{
    Amount, Rate,
    enums::{
        EncryptionMode, NotifyState, PaymentType, RollMode, SettleCycle,
        SettleState, SignType, TradeState,
    },
    ids::{AccountId, ChannelId, MerchantId, MerchantNumber, TradeNo},
};
use rust_decimal_macros::dec;

use crate::{
    ctx::testing::TestCtx,
    models::{
        Merchant, MerchantEncryption, Order, OrderBuyer, PaymentChannel,
        PaymentChannelAccount,
    },
};

pub fn merchant(id: i64) -> Merchant {
    Merchant {
        id: MerchantId(id),
        merchant_number: MerchantNumber::generate(
            &mut rand::thread_rng(),
            2026,
        ),
        email: format!("m{id}@example.com"),
        mobile: "13800000000".to_owned(),
        status: true,
        risk_status: true,
        buyer_pay_fee: false,
        competence: BTreeSet::new(),
        channel_whitelist: Vec::new(),
        password_salt: String::new(),
        password_hash: String::new(),
        deleted_at: None,
    }
}

pub fn encryption(merchant_id: MerchantId) -> MerchantEncryption {
    MerchantEncryption {
        merchant_id,
        mode: EncryptionMode::Open,
        hash_key: vec![1u8; 32],
        aes_key: None,
        rsa_public_key: None,
    }
}

/// Seed merchant id 1 with an empty wallet and open encryption mode.
pub async fn seed_default_merchant(t: &TestCtx) -> Merchant {
    let m = merchant(1);
    t.store.seed_merchant(m.clone(), encryption(m.id)).await;
    m
}

pub fn fresh_trade_no() -> TradeNo {
    TradeNo::generate(
        &mut rand::thread_rng(),
        Utc::now(),
        chrono_tz::Asia::Shanghai,
    )
}

pub fn buyer_with_ip(ip: &str) -> OrderBuyer {
    OrderBuyer {
        ip: Some(ip.to_owned()),
        user_agent: Some("test-agent".to_owned()),
        ..OrderBuyer::empty(fresh_trade_no())
    }
}

/// A paid order + buyer pair for seeding history.
pub fn paid_order_with_ip(
    merchant_id: MerchantId,
    out_trade_no: &str,
    ip: &str,
) -> (Order, OrderBuyer) {
    let trade_no = fresh_trade_no();
    let order = Order {
        trade_no: trade_no.clone(),
        out_trade_no: out_trade_no.to_owned(),
        merchant_id,
        payment_type: PaymentType::Alipay,
        payment_channel_account_id: AccountId(100),
        subject: "test order".to_owned(),
        total_amount: Amount::from_cents(10_000),
        buyer_pay_amount: Amount::from_cents(10_000),
        receipt_amount: Amount::from_cents(9_750),
        fee_amount: Amount::from_cents(250),
        profit_amount: dec!(1.50),
        notify_url: None,
        return_url: None,
        attach: None,
        settle_cycle: SettleCycle::Instant,
        sign_type: SignType::Sha3,
        trade_state: TradeState::Success,
        settle_state: SettleState::Completed,
        notify_state: NotifyState::Waiting,
        notify_retry_count: 0,
        notify_next_retry_time: None,
        create_time: Utc::now(),
        payment_time: Some(Utc::now()),
        close_time: None,
        api_trade_no: Some("UP-1".to_owned()),
        bill_trade_no: None,
        mch_trade_no: None,
    };
    let buyer = OrderBuyer {
        ip: Some(ip.to_owned()),
        ..OrderBuyer::empty(trade_no)
    };
    (order, buyer)
}

/// The S2 reference channel: rate 2.40% + 0.10 fixed, costs 1.00%,
/// instant settlement, sequential rotation, served by the mock driver.
pub fn channel(id: i64) -> PaymentChannel {
    PaymentChannel {
        id: ChannelId(id),
        code: format!("ALIPAY{id}"),
        name: format!("alipay channel {id}"),
        payment_type: PaymentType::Alipay,
        gateway: "mock".to_owned(),
        costs: Rate::try_from_decimal(dec!(0.0100)).unwrap(),
        fixed_costs: Amount::ZERO,
        rate: Rate::try_from_decimal(dec!(0.0240)).unwrap(),
        fixed_fee: Amount::from_cents(10),
        min_fee: Amount::ZERO,
        max_fee: None,
        min_amount: None,
        max_amount: None,
        daily_limit: None,
        earliest_time: None,
        latest_time: None,
        roll_mode: RollMode::Sequential,
        settle_cycle: SettleCycle::Instant,
        status: true,
        diy_order_subject: None,
    }
}

pub fn account(id: i64, channel_id: i64, roll_weight: u32) -> PaymentChannelAccount {
    PaymentChannelAccount {
        id: AccountId(id),
        channel_id: ChannelId(channel_id),
        name: format!("account {id}"),
        inherit_config: true,
        roll_weight,
        rate: Rate::ZERO,
        min_amount: None,
        max_amount: None,
        daily_limit: None,
        earliest_time: None,
        latest_time: None,
        config: serde_json::Map::new(),
        status: true,
        maintenance: false,
        diy_order_subject: None,
    }
}

/// Seed one channel with one account and return both.
pub async fn seed_channel_with_account(
    t: &TestCtx,
) -> (PaymentChannel, PaymentChannelAccount) {
    let ch = channel(10);
    let acct = account(100, 10, 1);
    t.store.seed_channel(ch.clone()).await;
    t.store.seed_account(acct.clone()).await;
    (ch, acct)
}
