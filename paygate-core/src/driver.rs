//! The upstream gateway driver interface.
//!
//! Every upstream provider is a pluggable driver behind this trait; the
//! core never sees a gateway wire format. Drivers are looked up by the
//! channel's `gateway` key. Driver HTTP calls carry the configured overall
//! deadline and happen outside DB transactions, with one deliberate
//! exception: the refund call runs inside the refund transaction so a
//! failed upstream refund aborts the whole thing.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paygate_common::{
    Amount, Error,
    error::PayResult,
    ids::TradeNo,
};
use serde_json::{Map, Value};

use crate::models::{Order, OrderBuyer, OrderRefund, PaymentChannelAccount};

/// What a driver needs to start a payment upstream.
pub struct SubmitRequest<'a> {
    pub order: &'a Order,
    pub account: &'a PaymentChannelAccount,
    pub buyer: &'a OrderBuyer,
    /// Subject after any channel / account `diy_order_subject` override.
    pub subject: &'a str,
    pub return_url: Option<&'a str>,
    pub notify_url: &'a str,
}

/// How the buyer continues the payment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubmitResponse {
    /// Redirect the buyer's browser.
    Redirect { url: String },
    /// Render this HTML directly.
    Html { content: String },
    /// Structured data for the merchant's own cashier (e.g. a QR payload).
    Json { data: Value },
    /// A hosted cashier page.
    Page { url: String },
}

/// A successful upstream refund.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefundResponse {
    pub api_refund_no: Option<String>,
}

/// Whitelisted buyer fields an upstream may enrich on callback.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BuyerPatch {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub user_id: Option<String>,
    pub buyer_open_id: Option<String>,
    pub mobile: Option<String>,
}

/// The result of verifying an upstream async callback.
#[derive(Clone, Debug, Default)]
pub struct CallbackVerification {
    pub trade_no: Option<TradeNo>,
    pub api_trade_no: Option<String>,
    pub bill_trade_no: Option<String>,
    pub mch_trade_no: Option<String>,
    pub payment_time: Option<DateTime<Utc>>,
    /// Only honored when the upstream explicitly reports what the buyer
    /// paid; the pre-payment value is otherwise authoritative.
    pub buyer_pay_amount: Option<Amount>,
    pub buyer: BuyerPatch,
}

#[async_trait]
pub trait PaymentDriver: Send + Sync + 'static {
    /// Registry key, matching `PaymentChannel::gateway`.
    fn gateway(&self) -> &'static str;

    /// Pull our trade number out of a raw callback, before any
    /// authenticity check -- the webhook route needs it to locate the
    /// order whose account credentials verify the rest.
    fn extract_trade_no(
        &self,
        params: &Map<String, Value>,
    ) -> PayResult<TradeNo>;

    /// The body this upstream expects as a callback acknowledgement.
    fn ack_body(&self) -> &'static str {
        "success"
    }

    async fn submit(&self, req: SubmitRequest<'_>)
        -> PayResult<SubmitResponse>;

    async fn refund(
        &self,
        order: &Order,
        account: &PaymentChannelAccount,
        refund: &OrderRefund,
    ) -> PayResult<RefundResponse>;

    /// Verify an upstream callback's authenticity and extract what it
    /// asserts. A verification failure is `GATEWAY_ERROR`; the webhook
    /// route turns it into a non-2xx so the upstream retries.
    async fn verify(
        &self,
        params: &Map<String, Value>,
        account: &PaymentChannelAccount,
    ) -> PayResult<CallbackVerification>;
}

/// Driver lookup by gateway key.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<&'static str, Arc<dyn PaymentDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn PaymentDriver>) {
        self.drivers.insert(driver.gateway(), driver);
    }

    pub fn get(&self, gateway: &str) -> PayResult<Arc<dyn PaymentDriver>> {
        self.drivers.get(gateway).cloned().ok_or_else(|| {
            Error::gateway_error(format!("no driver for gateway {gateway}"))
        })
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    //! A scripted driver for tests: returns canned responses and records
    //! every call.

    use std::sync::Mutex;

    use super::*;

    pub struct MockDriver {
        pub submit_response: SubmitResponse,
        /// `Ok` refunds yield this `api_refund_no`; `Err` simulates an
        /// upstream refund rejection.
        pub refund_result: Mutex<PayResult<RefundResponse>>,
        pub verification: Mutex<CallbackVerification>,
        pub refund_calls: Mutex<Vec<OrderRefund>>,
        pub submit_calls: Mutex<Vec<TradeNo>>,
    }

    impl MockDriver {
        pub fn new() -> Self {
            Self {
                submit_response: SubmitResponse::Redirect {
                    url: "https://upstream.example/cashier".to_owned(),
                },
                refund_result: Mutex::new(Ok(RefundResponse {
                    api_refund_no: Some("UP-REFUND-1".to_owned()),
                })),
                verification: Mutex::new(CallbackVerification::default()),
                refund_calls: Mutex::new(Vec::new()),
                submit_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn set_refund_result(&self, result: PayResult<RefundResponse>) {
            *self.refund_result.lock().expect("poisoned") = result;
        }

        pub fn set_verification(&self, v: CallbackVerification) {
            *self.verification.lock().expect("poisoned") = v;
        }
    }

    impl Default for MockDriver {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl PaymentDriver for MockDriver {
        fn gateway(&self) -> &'static str {
            "mock"
        }

        fn extract_trade_no(
            &self,
            params: &Map<String, Value>,
        ) -> PayResult<TradeNo> {
            let raw = params
                .get("trade_no")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    Error::gateway_error("callback missing trade_no")
                })?;
            TradeNo::try_from(raw.to_owned())
                .map_err(|_| Error::gateway_error("malformed trade_no"))
        }

        async fn submit(
            &self,
            req: SubmitRequest<'_>,
        ) -> PayResult<SubmitResponse> {
            self.submit_calls
                .lock()
                .expect("poisoned")
                .push(req.order.trade_no.clone());
            Ok(self.submit_response.clone())
        }

        async fn refund(
            &self,
            _order: &Order,
            _account: &PaymentChannelAccount,
            refund: &OrderRefund,
        ) -> PayResult<RefundResponse> {
            self.refund_calls
                .lock()
                .expect("poisoned")
                .push(refund.clone());
            self.refund_result.lock().expect("poisoned").clone()
        }

        async fn verify(
            &self,
            _params: &Map<String, Value>,
            _account: &PaymentChannelAccount,
        ) -> PayResult<CallbackVerification> {
            Ok(self.verification.lock().expect("poisoned").clone())
        }
    }
}
