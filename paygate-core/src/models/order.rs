//! Order, buyer, refund, and notification models.

use chrono::{DateTime, Utc};
use paygate_common::{
    Amount,
    enums::{
        CertType, NotifyState, PaymentType, RefundInitiateType, RefundStatus,
        SettleCycle, SettleState, SignType, TradeState,
    },
    ids::{AccountId, MerchantId, RefundId, TradeNo},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A payment order. Once `trade_state` reaches a paid state the monetary
/// fields are immutable.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub trade_no: TradeNo,
    /// The merchant's own order id; idempotency key within 7 days.
    pub out_trade_no: String,
    pub merchant_id: MerchantId,
    pub payment_type: PaymentType,
    pub payment_channel_account_id: AccountId,
    pub subject: String,
    pub total_amount: Amount,
    /// What the buyer actually pays: `total + fee` if the merchant passes
    /// the fee on, else `total`.
    pub buyer_pay_amount: Amount,
    /// What the merchant receives: `max(0, total - fee)`.
    pub receipt_amount: Amount,
    pub fee_amount: Amount,
    /// `fee - cost`; may be negative and is recorded as-is.
    pub profit_amount: Decimal,
    pub notify_url: Option<String>,
    pub return_url: Option<String>,
    /// Opaque merchant data echoed back in notifications.
    pub attach: Option<String>,
    pub settle_cycle: SettleCycle,
    pub sign_type: SignType,
    pub trade_state: TradeState,
    pub settle_state: SettleState,
    pub notify_state: NotifyState,
    pub notify_retry_count: u32,
    pub notify_next_retry_time: Option<DateTime<Utc>>,
    pub create_time: DateTime<Utc>,
    pub payment_time: Option<DateTime<Utc>>,
    pub close_time: Option<DateTime<Utc>>,
    /// Upstream gateway's trade id.
    pub api_trade_no: Option<String>,
    /// Upstream's bill / funds-flow id.
    pub bill_trade_no: Option<String>,
    /// Upstream's merchant-side id.
    pub mch_trade_no: Option<String>,
}

/// Buyer sidecar, one per order. Created with the order from request
/// context; enriched on payment confirmation when the upstream returns
/// richer buyer info.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderBuyer {
    pub trade_no: TradeNo,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub buyer_open_id: Option<String>,
    pub mobile: Option<String>,
    pub real_name: Option<String>,
    pub cert_no: Option<String>,
    pub cert_type: Option<CertType>,
    pub min_age: Option<u8>,
}

impl OrderBuyer {
    pub fn empty(trade_no: TradeNo) -> Self {
        Self {
            trade_no,
            ip: None,
            user_agent: None,
            user_id: None,
            buyer_open_id: None,
            mobile: None,
            real_name: None,
            cert_no: None,
            cert_type: None,
            min_age: None,
        }
    }
}

/// One refund attempt against an order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderRefund {
    pub id: RefundId,
    pub trade_no: TradeNo,
    pub merchant_id: MerchantId,
    pub initiate_type: RefundInitiateType,
    /// `true` = auto (driver called), `false` = manual.
    pub refund_type: bool,
    pub amount: Amount,
    /// Fee restituted to the merchant alongside this refund.
    pub refund_fee_amount: Amount,
    /// `true` when the platform bore the fee restitution.
    pub fee_bearer: bool,
    /// Merchant idempotency key; `(merchant_id, out_biz_no)` unique.
    pub out_biz_no: Option<String>,
    /// Upstream refund id, present after a successful driver call.
    pub api_refund_no: Option<String>,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub create_time: DateTime<Utc>,
}

/// One merchant-notification delivery attempt. Append-only.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct OrderNotification {
    pub id: String,
    pub trade_no: TradeNo,
    /// Whether this attempt was accepted by the merchant.
    pub status: bool,
    pub request_duration_ms: i64,
    pub response: Option<String>,
    pub created_at: DateTime<Utc>,
}
