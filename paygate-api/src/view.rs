//! Response projections.
//!
//! Domain rows carry typed values; the wire carries strings with their
//! declared scales and formats. Derived text lives here, never on the
//! domain types.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use paygate_common::time::{format_admin, format_api};
use paygate_core::models::{
    BehaviorSummary, MerchantWallet, MerchantWalletPrepaidRecord,
    MerchantWalletRecord, MerchantWithdrawalRecord, Order, OrderRefund,
};
use serde_json::{Map, Value, json};

fn put(map: &mut Map<String, Value>, key: &str, value: impl Into<Value>) {
    map.insert(key.to_owned(), value.into());
}

fn put_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        map.insert(key.to_owned(), Value::String(value.to_owned()));
    }
}

fn time_fmt(api: bool, tz: Tz, at: DateTime<Utc>) -> String {
    if api { format_api(tz, at) } else { format_admin(tz, at) }
}

/// Project an order. `api` selects RFC 3339 times (merchant surface)
/// over `yyyy-MM-dd HH:mm:ss` (admin surface).
pub fn order_view(order: &Order, tz: Tz, api: bool) -> Value {
    let mut map = Map::new();
    put(&mut map, "trade_no", order.trade_no.to_string());
    put(&mut map, "out_trade_no", order.out_trade_no.clone());
    put(&mut map, "payment_type", order.payment_type.to_string());
    put(&mut map, "subject", order.subject.clone());
    put(&mut map, "total_amount", order.total_amount.to_string());
    put(&mut map, "buyer_pay_amount", order.buyer_pay_amount.to_string());
    put(&mut map, "receipt_amount", order.receipt_amount.to_string());
    put(&mut map, "fee_amount", order.fee_amount.to_string());
    put(&mut map, "trade_state", order.trade_state.to_string());
    put(&mut map, "settle_state", order.settle_state.to_string());
    put(&mut map, "notify_state", order.notify_state.to_string());
    put_opt(&mut map, "attach", order.attach.as_deref());
    put(&mut map, "create_time", time_fmt(api, tz, order.create_time));
    if let Some(at) = order.payment_time {
        put(&mut map, "payment_time", time_fmt(api, tz, at));
    }
    if let Some(at) = order.close_time {
        put(&mut map, "close_time", time_fmt(api, tz, at));
    }
    put_opt(&mut map, "api_trade_no", order.api_trade_no.as_deref());
    put_opt(&mut map, "bill_trade_no", order.bill_trade_no.as_deref());
    Value::Object(map)
}

pub fn refund_view(refund: &OrderRefund, tz: Tz, api: bool) -> Value {
    let mut map = Map::new();
    put(&mut map, "refund_id", refund.id.to_string());
    put(&mut map, "trade_no", refund.trade_no.to_string());
    put(&mut map, "amount", refund.amount.to_string());
    put(
        &mut map,
        "refund_fee_amount",
        refund.refund_fee_amount.to_string(),
    );
    put(&mut map, "status", refund.status.to_string());
    put(&mut map, "initiate_type", refund.initiate_type.to_string());
    put_opt(&mut map, "out_biz_no", refund.out_biz_no.as_deref());
    put_opt(&mut map, "api_refund_no", refund.api_refund_no.as_deref());
    put_opt(&mut map, "reason", refund.reason.as_deref());
    put(&mut map, "create_time", time_fmt(api, tz, refund.create_time));
    Value::Object(map)
}

pub fn wallet_view(wallet: &MerchantWallet) -> Value {
    json!({
        "merchant_id": wallet.merchant_id,
        "available": wallet.available.to_string(),
        "unavailable": wallet.unavailable.to_string(),
        "prepaid": wallet.prepaid.to_string(),
        "margin": wallet.margin.to_string(),
    })
}

pub fn wallet_record_view(r: &MerchantWalletRecord, tz: Tz) -> Value {
    json!({
        "id": r.id,
        "change_type": r.change_type.to_string(),
        "old_available": r.old_available.to_string(),
        "delta_available": r.delta_available.to_string(),
        "new_available": r.new_available.to_string(),
        "old_unavailable": r.old_unavailable.to_string(),
        "delta_unavailable": r.delta_unavailable.to_string(),
        "new_unavailable": r.new_unavailable.to_string(),
        "trade_no": r.trade_no.as_ref().map(|t| t.to_string()),
        "remark": r.remark,
        "created_at": format_admin(tz, r.created_at),
    })
}

pub fn prepaid_record_view(
    r: &MerchantWalletPrepaidRecord,
    tz: Tz,
) -> Value {
    json!({
        "id": r.id,
        "old_prepaid": r.old_prepaid.to_string(),
        "delta_prepaid": r.delta_prepaid.to_string(),
        "new_prepaid": r.new_prepaid.to_string(),
        "remark": r.remark,
        "created_at": format_admin(tz, r.created_at),
    })
}

pub fn withdrawal_view(w: &MerchantWithdrawalRecord, tz: Tz) -> Value {
    json!({
        "id": w.id,
        "merchant_id": w.merchant_id,
        "amount": w.amount.to_string(),
        "prepaid_deducted": w.prepaid_deducted.to_string(),
        "received_amount": w.received_amount.to_string(),
        "fee": w.fee.to_string(),
        "fee_type": w.fee_type,
        "status": w.status.to_string(),
        "reject_reason": w.reject_reason,
        "payee_info": w.payee_info,
        "create_time": format_admin(tz, w.create_time),
    })
}

pub fn behavior_view(summary: &BehaviorSummary) -> Value {
    json!({
        "total_orders": summary.total_orders,
        "paid_orders": summary.paid_orders,
        "success_rate": summary.success_rate.to_string(),
        "blacklisted": summary.blacklisted,
    })
}
