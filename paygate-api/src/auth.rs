//! Merchant payload verification.
//!
//! A merchant request is one form field, `payload`, holding JSON:
//!
//! ```json
//! {
//!   "merchant_number": "M2026…",
//!   "sign_type": "sha3",
//!   "timestamp": "2026-08-01T12:00:00+08:00",
//!   "biz_content": "{\"out_trade_no\":\"ORD-1\", …}",
//!   "sign": "…"
//! }
//! ```
//!
//! The signature covers the canonicalized top-level map (minus `sign`).
//! `biz_content` is itself a JSON string so its bytes are covered by the
//! signature verbatim; it is parsed only after verification.

use std::str::FromStr;

use paygate_common::{
    Error,
    enums::SignType,
    error::PayResult,
    ids::MerchantNumber,
};
use paygate_crypto::{MerchantVerifier, load_rsa_public_key_b64};
use serde_json::{Map, Value};

use crate::server::ApiState;

/// A verified merchant request.
pub struct VerifiedRequest {
    pub merchant: paygate_core::models::Merchant,
    pub sign_type: SignType,
    /// The parsed `biz_content` object.
    pub biz: Map<String, Value>,
}

fn str_field<'a>(
    params: &'a Map<String, Value>,
    key: &str,
) -> PayResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            Error::invalid_request(format!("missing field {key}"))
        })
}

/// Verify a merchant `payload` and hand back the caller + biz content.
pub async fn verify_merchant_payload(
    state: &ApiState,
    payload: &str,
) -> PayResult<VerifiedRequest> {
    let params: Map<String, Value> = serde_json::from_str(payload)
        .map_err(|_| Error::invalid_request("payload is not JSON"))?;

    let number = str_field(&params, "merchant_number")?;
    let number = MerchantNumber::try_from(number.to_owned())
        .map_err(|_| Error::invalid_request("malformed merchant_number"))?;
    let sign_type_raw = str_field(&params, "sign_type")?;
    let sign_type = SignType::from_str(sign_type_raw)
        .map_err(|_| Error::invalid_request("unknown sign_type"))?;
    let sign = str_field(&params, "sign")?;

    let merchant = state
        .ctx
        .store
        .merchant_by_number(&number)
        .await?
        .ok_or_else(|| Error::not_found("merchant not found"))?;
    if !merchant.is_active() {
        return Err(Error::unauthorized("merchant is disabled"));
    }
    let encryption = state
        .ctx
        .store
        .merchant_encryption(merchant.id)
        .await?
        .ok_or_else(|| Error::unauthorized("merchant has no signing keys"))?;

    let rsa_public = match encryption.rsa_public_key.as_deref() {
        Some(b64) => Some(load_rsa_public_key_b64(b64).map_err(|_| {
            Error::internal(anyhow::anyhow!(
                "stored RSA public key is unreadable"
            ))
        })?),
        None => None,
    };
    let verifier = MerchantVerifier {
        mode: encryption.mode,
        hash_key: encryption.hash_key.clone(),
        rsa_public,
    };
    paygate_crypto::verify(&params, sign, sign_type, &verifier)?;

    let biz = match params.get("biz_content") {
        Some(Value::String(raw)) => serde_json::from_str(raw)
            .map_err(|_| Error::invalid_request("biz_content is not JSON"))?,
        Some(Value::Object(map)) => map.clone(),
        _ =>
            return Err(Error::invalid_request("missing field biz_content")),
    };

    Ok(VerifiedRequest { merchant, sign_type, biz })
}
