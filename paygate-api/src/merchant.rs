//! Signed merchant endpoints.

use std::str::FromStr;

use axum::{
    Form,
    extract::State,
    http::HeaderMap,
};
use chrono::TimeZone;
use paygate_common::{
    Amount, Error,
    enums::{CertType, FeeBearer, PaymentType, RefundInitiateType, TradeState},
    error::PayResult,
    ids::{RefundId, TradeNo},
};
use paygate_core::{
    driver::SubmitResponse,
    order::{NewOrder, NewOrderBuyer, OrderEngine},
    refund::{NewRefund, RefundEngine},
};
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};

use crate::{
    auth::verify_merchant_payload,
    envelope::{Envelope, respond},
    server::{ApiState, PayloadForm},
    view,
};

// --- biz_content field helpers --- //

fn biz_str(biz: &Map<String, Value>, key: &str) -> PayResult<String> {
    biz_str_opt(biz, key)?
        .ok_or_else(|| Error::invalid_request(format!("missing field {key}")))
}

fn biz_str_opt(
    biz: &Map<String, Value>,
    key: &str,
) -> PayResult<Option<String>> {
    match biz.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) =>
            Err(Error::invalid_request(format!("field {key} must be a string"))),
    }
}

fn biz_amount(biz: &Map<String, Value>, key: &str) -> PayResult<Amount> {
    let raw = match biz.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ =>
            return Err(Error::invalid_request(format!(
                "missing field {key}"
            ))),
    };
    let decimal = Decimal::from_str(&raw).map_err(|_| {
        Error::invalid_request(format!("field {key} is not a decimal"))
    })?;
    Amount::try_from_decimal(decimal).map_err(|err| {
        Error::invalid_request(format!("field {key}: {err}"))
    })
}

fn biz_bool(biz: &Map<String, Value>, key: &str) -> PayResult<Option<bool>> {
    match biz.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) =>
            Err(Error::invalid_request(format!("field {key} must be a bool"))),
    }
}

fn client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty());
    forwarded.or_else(|| {
        headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    })
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn submit_view(submit: &SubmitResponse) -> Value {
    match submit {
        SubmitResponse::Redirect { url } =>
            json!({"type": "redirect", "url": url}),
        SubmitResponse::Html { content } =>
            json!({"type": "html", "page": content}),
        SubmitResponse::Json { data } =>
            json!({"type": "json", "data": data}),
        SubmitResponse::Page { url } =>
            json!({"type": "page", "url": url}),
    }
}

// --- POST /api/order/create --- //

pub async fn create_order(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(create_order_inner(&state, &headers, &form.payload).await)
}

async fn create_order_inner(
    state: &ApiState,
    headers: &HeaderMap,
    payload: &str,
) -> PayResult<Envelope> {
    let req = verify_merchant_payload(state, payload).await?;
    let biz = &req.biz;

    let payment_type_raw = biz_str(biz, "payment_type")?;
    let payment_type = PaymentType::from_str(&payment_type_raw)
        .map_err(|_| Error::invalid_request("unknown payment_type"))?;
    let cert_type = biz_str_opt(biz, "cert_type")?
        .map(|raw| {
            CertType::from_str(&raw)
                .map_err(|_| Error::invalid_request("unknown cert_type"))
        })
        .transpose()?;
    let min_age = match biz.get("min_age") {
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| Error::invalid_request("invalid min_age"))?,
        _ => None,
    };

    let new_order = NewOrder {
        out_trade_no: biz_str(biz, "out_trade_no")?,
        payment_type,
        channel_code: biz_str_opt(biz, "channel_code")?,
        subject: biz_str(biz, "subject")?,
        total_amount: biz_amount(biz, "total_amount")?,
        notify_url: biz_str_opt(biz, "notify_url")?,
        return_url: biz_str_opt(biz, "return_url")?,
        attach: biz_str_opt(biz, "attach")?,
        sign_type: req.sign_type,
        buyer: NewOrderBuyer {
            ip: client_ip(headers),
            user_agent: user_agent(headers),
            user_id: biz_str_opt(biz, "user_id")?,
            buyer_open_id: biz_str_opt(biz, "buyer_open_id")?,
            mobile: biz_str_opt(biz, "mobile")?,
            real_name: biz_str_opt(biz, "real_name")?,
            cert_no: biz_str_opt(biz, "cert_no")?,
            cert_type,
            min_age,
        },
        device_fingerprint: biz_str_opt(biz, "device_fingerprint")?,
    };

    let created = OrderEngine::new(state.ctx.clone())
        .create(&req.merchant, new_order)
        .await?;

    let tz = state.ctx.config.timezone;
    let mut data = view::order_view(&created.order, tz, true);

    // A pending order gets (re-)submitted upstream so the caller always
    // has something to show the buyer.
    if created.order.trade_state == TradeState::WaitPay {
        let driver = state.ctx.drivers.get(&created.channel.gateway)?;
        let subject = created
            .account
            .diy_order_subject
            .as_deref()
            .or(created.channel.diy_order_subject.as_deref())
            .unwrap_or(&created.order.subject);
        let notify_url = format!(
            "{}/notify/{}",
            state.ctx.config.public_url.trim_end_matches('/'),
            created.channel.gateway,
        );
        let submit = driver
            .submit(paygate_core::driver::SubmitRequest {
                order: &created.order,
                account: &created.account,
                buyer: &created.buyer,
                subject,
                return_url: created.order.return_url.as_deref(),
                notify_url: &notify_url,
            })
            .await?;
        data.as_object_mut()
            .expect("order_view is an object")
            .insert("payment".to_owned(), submit_view(&submit));
    }

    Ok(Envelope::ok(data))
}

// --- POST /api/order/query --- //

pub async fn query_order(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(query_order_inner(&state, &form.payload).await)
}

async fn query_order_inner(
    state: &ApiState,
    payload: &str,
) -> PayResult<Envelope> {
    let req = verify_merchant_payload(state, payload).await?;

    let order = if let Some(raw) = biz_str_opt(&req.biz, "trade_no")? {
        let trade_no = TradeNo::try_from(raw)
            .map_err(|_| Error::invalid_request("malformed trade_no"))?;
        state.ctx.store.order(&trade_no).await?
    } else {
        let out_trade_no = biz_str(&req.biz, "out_trade_no")?;
        let epoch = chrono::Utc.timestamp_opt(0, 0).single()
            .expect("epoch is valid");
        state
            .ctx
            .store
            .recent_order_by_out_trade_no(
                req.merchant.id,
                &out_trade_no,
                epoch,
            )
            .await?
    };
    let order = order
        .filter(|o| o.merchant_id == req.merchant.id)
        .ok_or_else(|| Error::not_found("order not found"))?;

    Ok(Envelope::ok(view::order_view(
        &order,
        state.ctx.config.timezone,
        true,
    )))
}

// --- POST /api/refund/create --- //

pub async fn create_refund(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(create_refund_inner(&state, &form.payload).await)
}

async fn create_refund_inner(
    state: &ApiState,
    payload: &str,
) -> PayResult<Envelope> {
    let req = verify_merchant_payload(state, payload).await?;
    let biz = &req.biz;

    let trade_no = TradeNo::try_from(biz_str(biz, "trade_no")?)
        .map_err(|_| Error::invalid_request("malformed trade_no"))?;
    let order = state
        .ctx
        .store
        .order(&trade_no)
        .await?
        .filter(|o| o.merchant_id == req.merchant.id)
        .ok_or_else(|| Error::not_found("order not found"))?;

    let fee_bearer = biz_bool(biz, "fee_bearer")?.unwrap_or(
        state.ctx.config.refund_fee_bearer == FeeBearer::Platform,
    );
    let auto = biz_bool(biz, "auto")?.unwrap_or(true);

    let refund = RefundEngine::new(state.ctx.clone())
        .handle(NewRefund {
            trade_no: order.trade_no,
            amount: biz_amount(biz, "amount")?,
            initiate_type: RefundInitiateType::Api,
            auto,
            fee_bearer,
            out_biz_no: biz_str_opt(biz, "out_biz_no")?,
            reason: biz_str_opt(biz, "reason")?,
        })
        .await?;

    Ok(Envelope::ok(view::refund_view(
        &refund,
        state.ctx.config.timezone,
        true,
    )))
}

// --- POST /api/refund/query --- //

pub async fn query_refund(
    State(state): State<ApiState>,
    Form(form): Form<PayloadForm>,
) -> Envelope {
    respond(query_refund_inner(&state, &form.payload).await)
}

async fn query_refund_inner(
    state: &ApiState,
    payload: &str,
) -> PayResult<Envelope> {
    let req = verify_merchant_payload(state, payload).await?;

    let refund = if let Some(out_biz_no) =
        biz_str_opt(&req.biz, "out_biz_no")?
    {
        state
            .ctx
            .store
            .refund_by_out_biz_no(req.merchant.id, &out_biz_no)
            .await?
    } else {
        let id = RefundId::try_from(biz_str(&req.biz, "refund_id")?)
            .map_err(|_| Error::invalid_request("malformed refund_id"))?;
        state.ctx.store.refund(&id).await?
    };
    let refund = refund
        .filter(|r| r.merchant_id == req.merchant.id)
        .ok_or_else(|| Error::not_found("refund not found"))?;

    Ok(Envelope::ok(view::refund_view(
        &refund,
        state.ctx.config.timezone,
        true,
    )))
}
