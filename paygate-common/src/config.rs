//! Environment-derived service configuration.
//!
//! All contextual data travels explicitly; there is no global config
//! facade. The binary loads a [`Config`] once at startup (after an
//! optional `.env` via dotenvy) and hands it to whoever needs it.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, bail};
use base64::Engine;
use chrono_tz::Tz;

use crate::enums::FeeBearer;

/// Key material and limits the platform is configured with.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub listen_addr: SocketAddr,
    /// Externally reachable base URL; webhook callback URLs handed to
    /// upstream gateways are composed from it.
    pub public_url: String,
    /// IANA timezone all day-boundary math is evaluated in.
    pub timezone: Tz,
    /// Platform RSA private key: Base64 DER (PKCS#8), no PEM headers.
    pub platform_rsa_key_b64: String,
    /// Platform symmetric key for the admin payload codec; exactly 32 bytes.
    pub platform_aes_key: [u8; 32],
    /// Max orders per buyer IP per local day; 0 disables the cap.
    pub ip_order_limit: u32,
    /// Max orders per buyer account per local day; 0 disables the cap.
    pub account_order_limit: u32,
    /// Default fee bearer for refunds when the caller doesn't specify.
    pub refund_fee_bearer: FeeBearer,
    pub site_name: String,
    /// Per-attempt timeout for merchant notification POSTs.
    pub notify_timeout: Duration,
    /// Overall deadline for upstream driver HTTP calls.
    pub driver_timeout: Duration,
}

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("missing env var {key}"))
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional(key) {
        Some(raw) =>
            raw.parse().with_context(|| format!("invalid value for {key}")),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let timezone = optional("TIMEZONE")
            .unwrap_or_else(|| "Asia/Shanghai".to_owned());
        let timezone = Tz::from_str(&timezone)
            .ok()
            .with_context(|| format!("unknown TIMEZONE: {timezone}"))?;

        let aes_b64 = required("PLATFORM_AES_KEY")?;
        let aes_bytes = base64::engine::general_purpose::STANDARD
            .decode(&aes_b64)
            .context("PLATFORM_AES_KEY is not valid Base64")?;
        let platform_aes_key: [u8; 32] = aes_bytes
            .try_into()
            .map_err(|v: Vec<u8>| {
                anyhow::anyhow!("PLATFORM_AES_KEY must be 32 bytes, got {}", v.len())
            })?;

        let refund_fee_bearer =
            match optional("REFUND_FEE_BEARER").as_deref() {
                None | Some("merchant") => FeeBearer::Merchant,
                Some("platform") => FeeBearer::Platform,
                Some(other) => bail!("invalid REFUND_FEE_BEARER: {other}"),
            };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            redis_url: required("REDIS_URL")?,
            listen_addr: parse_or(
                "LISTEN_ADDR",
                SocketAddr::from(([127, 0, 0, 1], 8080)),
            )?,
            public_url: optional("PUBLIC_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080".to_owned()),
            timezone,
            platform_rsa_key_b64: required("PLATFORM_RSA_KEY")?,
            platform_aes_key,
            ip_order_limit: parse_or("IP_ORDER_LIMIT", 0u32)?,
            account_order_limit: parse_or("ACCOUNT_ORDER_LIMIT", 0u32)?,
            refund_fee_bearer,
            site_name: optional("SITE_NAME")
                .unwrap_or_else(|| "paygate".to_owned()),
            notify_timeout: Duration::from_secs(parse_or(
                "NOTIFY_TIMEOUT_SECS",
                10u64,
            )?),
            driver_timeout: Duration::from_secs(parse_or(
                "DRIVER_TIMEOUT_SECS",
                15u64,
            )?),
        })
    }
}
