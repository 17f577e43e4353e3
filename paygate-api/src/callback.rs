//! Upstream webhook route.
//!
//! `POST /notify/{gateway}` receives each upstream's asynchronous
//! payment confirmation. Unlike the merchant/admin surfaces this route
//! speaks HTTP status: verification failures and processing errors
//! return non-2xx so the upstream retries, and a success returns the
//! driver's expected acknowledgement body.

use axum::{
    extract::{Path, RawQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use paygate_common::{Error, error::PayResult};
use paygate_core::order::{OrderEngine, PaidUpdate};
use serde_json::{Map, Value};
use tracing::{info, instrument, warn};

use crate::server::ApiState;

/// Parse the callback parameters from the query string and/or the
/// form-encoded body into one map. Upstreams differ on where they put
/// things; drivers see the union.
fn callback_params(
    query: Option<&str>,
    body: &str,
) -> Map<String, Value> {
    let mut params = Map::new();
    for raw in [query.unwrap_or(""), body] {
        if raw.is_empty() {
            continue;
        }
        if let Ok(pairs) =
            serde_urlencoded::from_str::<Vec<(String, String)>>(raw)
        {
            for (k, v) in pairs {
                params.insert(k, Value::String(v));
            }
        }
    }
    params
}

#[instrument(skip_all, name = "(upstream-notify)", fields(gateway = %gateway))]
pub async fn upstream_notify(
    State(state): State<ApiState>,
    Path(gateway): Path<String>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    match handle(&state, &gateway, query.as_deref(), &body).await {
        Ok(ack) => (StatusCode::OK, ack).into_response(),
        Err(err) => {
            warn!(%err, "upstream callback rejected");
            (err.kind.http_status(), err.msg.into_owned()).into_response()
        }
    }
}

async fn handle(
    state: &ApiState,
    gateway: &str,
    query: Option<&str>,
    body: &str,
) -> PayResult<&'static str> {
    let driver = state.ctx.drivers.get(gateway)?;
    let params = callback_params(query, body);

    let trade_no = driver.extract_trade_no(&params)?;
    let order = state
        .ctx
        .store
        .order(&trade_no)
        .await?
        .ok_or_else(|| Error::not_found("order not found"))?;
    let account = state
        .ctx
        .store
        .channel_account(order.payment_channel_account_id)
        .await?
        .ok_or_else(|| Error::not_found("payment account not found"))?;

    let verification = driver.verify(&params, &account).await?;

    let update = PaidUpdate {
        api_trade_no: verification.api_trade_no,
        bill_trade_no: verification.bill_trade_no,
        mch_trade_no: verification.mch_trade_no,
        payment_time: verification.payment_time,
        buyer_pay_amount: verification.buyer_pay_amount,
        buyer: verification.buyer,
    };

    // Errors here propagate into a non-2xx on purpose: the upstream
    // retries until we've durably recorded the payment.
    OrderEngine::new(state.ctx.clone())
        .mark_paid(&trade_no, update, true)
        .await?;

    info!(%trade_no, "payment confirmed");
    Ok(driver.ack_body())
}
