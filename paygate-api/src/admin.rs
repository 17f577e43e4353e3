//! Operator endpoints.
//!
//! Admin requests arrive as one `payload` form field: an
//! XChaCha20-Poly1305 sealed JSON object under the platform key (session
//! and role handling live in front of this service and are not its
//! concern). Responses use the same `{code, message, data}` envelope as
//! the merchant surface, with admin-format timestamps.

use axum::{Form, extract::State};
use paygate_common::{
    Error,
    enums::{RefundInitiateType, TradeState, WithdrawalStatus},
    error::PayResult,
    ids::{MerchantId, TradeNo, WithdrawalId},
};
use paygate_core::{
    notify::NotifyDispatcher,
    order::OrderEngine,
    refund::{NewRefund, RefundEngine},
    risk::RiskEngine,
    store::BuyerIdentifiers,
    withdrawal::WithdrawalEngine,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::json;

use crate::{
    envelope::{Envelope, respond},
    server::{ApiState, PayloadForm},
    view,
};

/// Open and parse a sealed admin payload.
fn open<T: DeserializeOwned>(state: &ApiState, payload: &str) -> PayResult<T> {
    let plain = state.codec.open(payload)?;
    serde_json::from_slice(&plain)
        .map_err(|_| Error::invalid_request("malformed admin payload"))
}

fn parse_trade_no(raw: String) -> PayResult<TradeNo> {
    TradeNo::try_from(raw)
        .map_err(|_| Error::invalid_request("malformed trade_no"))
}

// --- Orders --- //

#[derive(Deserialize)]
struct TradeNoReq {
    trade_no: String,
}

pub async fn close_order(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: TradeNoReq = open(&state, &form.payload)?;
            let order = OrderEngine::new(state.ctx.clone())
                .close(&parse_trade_no(req.trade_no)?)
                .await?;
            Ok(Envelope::ok(view::order_view(
                &order,
                state.ctx.config.timezone,
                false,
            )))
        }
        .await,
    )
}

#[derive(Deserialize)]
struct SetStateReq {
    trade_no: String,
    trade_state: TradeState,
}

pub async fn set_trade_state(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: SetStateReq = open(&state, &form.payload)?;
            let order = OrderEngine::new(state.ctx.clone())
                .admin_set_trade_state(
                    &parse_trade_no(req.trade_no)?,
                    req.trade_state,
                )
                .await?;
            Ok(Envelope::ok(view::order_view(
                &order,
                state.ctx.config.timezone,
                false,
            )))
        }
        .await,
    )
}

pub async fn retry_settlement(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: TradeNoReq = open(&state, &form.payload)?;
            let order = OrderEngine::new(state.ctx.clone())
                .retry_settlement(&parse_trade_no(req.trade_no)?)
                .await?;
            Ok(Envelope::ok(view::order_view(
                &order,
                state.ctx.config.timezone,
                false,
            )))
        }
        .await,
    )
}

// --- Refunds --- //

#[derive(Deserialize)]
struct AdminRefundReq {
    trade_no: String,
    amount: paygate_common::Amount,
    #[serde(default)]
    auto: bool,
    #[serde(default)]
    fee_bearer: bool,
    reason: Option<String>,
}

pub async fn refund(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: AdminRefundReq = open(&state, &form.payload)?;
            let refund = RefundEngine::new(state.ctx.clone())
                .handle(NewRefund {
                    trade_no: parse_trade_no(req.trade_no)?,
                    amount: req.amount,
                    initiate_type: RefundInitiateType::Admin,
                    auto: req.auto,
                    fee_bearer: req.fee_bearer,
                    out_biz_no: None,
                    reason: req.reason,
                })
                .await?;
            Ok(Envelope::ok(view::refund_view(
                &refund,
                state.ctx.config.timezone,
                false,
            )))
        }
        .await,
    )
}

// --- Withdrawals --- //

#[derive(Deserialize)]
struct SettleAccountReq {
    merchant_id: i64,
    #[serde(default)]
    payee_info: serde_json::Value,
}

pub async fn settle_account(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: SettleAccountReq = open(&state, &form.payload)?;
            let record = WithdrawalEngine::new(state.ctx.clone())
                .settle_account(MerchantId(req.merchant_id), req.payee_info)
                .await?;
            let tz = state.ctx.config.timezone;
            Ok(Envelope::ok(json!({
                "withdrawal": record.map(|r| view::withdrawal_view(&r, tz)),
            })))
        }
        .await,
    )
}

#[derive(Deserialize)]
struct ApplyWithdrawalReq {
    merchant_id: i64,
    amount: paygate_common::Amount,
    #[serde(default)]
    payee_info: serde_json::Value,
}

pub async fn apply_withdrawal(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: ApplyWithdrawalReq = open(&state, &form.payload)?;
            let record = WithdrawalEngine::new(state.ctx.clone())
                .apply_withdrawal(
                    MerchantId(req.merchant_id),
                    req.payee_info,
                    req.amount,
                )
                .await?;
            Ok(Envelope::ok(view::withdrawal_view(
                &record,
                state.ctx.config.timezone,
            )))
        }
        .await,
    )
}

#[derive(Deserialize)]
struct WithdrawalStatusReq {
    id: i64,
    status: WithdrawalStatus,
    reason: Option<String>,
}

pub async fn withdrawal_status(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: WithdrawalStatusReq = open(&state, &form.payload)?;
            let record = WithdrawalEngine::new(state.ctx.clone())
                .change_status(
                    WithdrawalId(req.id),
                    req.status,
                    req.reason,
                )
                .await?;
            Ok(Envelope::ok(view::withdrawal_view(
                &record,
                state.ctx.config.timezone,
            )))
        }
        .await,
    )
}

#[derive(Deserialize)]
struct MerchantPageReq {
    merchant_id: i64,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

fn default_limit() -> u32 {
    20
}

pub async fn list_withdrawals(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: MerchantPageReq = open(&state, &form.payload)?;
            let rows = state
                .ctx
                .store
                .withdrawals_for_merchant(
                    MerchantId(req.merchant_id),
                    req.limit,
                    req.offset,
                )
                .await?;
            let tz = state.ctx.config.timezone;
            let rows: Vec<_> =
                rows.iter().map(|r| view::withdrawal_view(r, tz)).collect();
            Ok(Envelope::ok(rows))
        }
        .await,
    )
}

// --- Wallet views --- //

#[derive(Deserialize)]
struct MerchantIdReq {
    merchant_id: i64,
}

pub async fn wallet(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: MerchantIdReq = open(&state, &form.payload)?;
            let wallet = state
                .ctx
                .store
                .wallet(MerchantId(req.merchant_id))
                .await?
                .ok_or_else(|| Error::not_found("wallet not found"))?;
            Ok(Envelope::ok(view::wallet_view(&wallet)))
        }
        .await,
    )
}

pub async fn wallet_records(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: MerchantPageReq = open(&state, &form.payload)?;
            let rows = state
                .ctx
                .store
                .wallet_records(
                    MerchantId(req.merchant_id),
                    req.limit,
                    req.offset,
                )
                .await?;
            let tz = state.ctx.config.timezone;
            let rows: Vec<_> = rows
                .iter()
                .map(|r| view::wallet_record_view(r, tz))
                .collect();
            Ok(Envelope::ok(rows))
        }
        .await,
    )
}

pub async fn prepaid_records(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: MerchantPageReq = open(&state, &form.payload)?;
            let rows = state
                .ctx
                .store
                .prepaid_records(
                    MerchantId(req.merchant_id),
                    req.limit,
                    req.offset,
                )
                .await?;
            let tz = state.ctx.config.timezone;
            let rows: Vec<_> = rows
                .iter()
                .map(|r| view::prepaid_record_view(r, tz))
                .collect();
            Ok(Envelope::ok(rows))
        }
        .await,
    )
}

// --- Notifications --- //

pub async fn replay_notification(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: TradeNoReq = open(&state, &form.payload)?;
            NotifyDispatcher::new(state.ctx.clone())
                .replay(&parse_trade_no(req.trade_no)?)
                .await?;
            Ok(Envelope::ok_empty())
        }
        .await,
    )
}

// --- Merchant keys --- //

pub async fn rotate_rsa_key(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: MerchantIdReq = open(&state, &form.payload)?;
            let merchant_id = MerchantId(req.merchant_id);
            state
                .ctx
                .store
                .merchant(merchant_id)
                .await?
                .ok_or_else(|| Error::not_found("merchant not found"))?;

            let (private_b64, public_b64) =
                paygate_crypto::generate_rsa_keypair(
                    &mut rand::thread_rng(),
                    2048,
                )
                .map_err(Error::internal)?;
            state
                .ctx
                .store
                .update_merchant_rsa_public_key(
                    merchant_id,
                    Some(public_b64.clone()),
                )
                .await?;

            // The private half is returned exactly once and never stored.
            Ok(Envelope::ok(json!({
                "public_key": public_b64,
                "private_key": private_b64,
            })))
        }
        .await,
    )
}

// --- Risk --- //

#[derive(Deserialize)]
struct BehaviorReq {
    user_id: Option<String>,
    buyer_open_id: Option<String>,
    mobile: Option<String>,
    cert_no: Option<String>,
}

pub async fn buyer_behavior(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(
        async {
            let req: BehaviorReq = open(&state, &form.payload)?;
            let summary = RiskEngine::new(state.ctx.clone())
                .behavior_summary(&BuyerIdentifiers {
                    user_id: req.user_id,
                    buyer_open_id: req.buyer_open_id,
                    mobile: req.mobile,
                    cert_no: req.cert_no,
                })
                .await?;
            Ok(Envelope::ok(view::behavior_view(&summary)))
        }
        .await,
    )
}
