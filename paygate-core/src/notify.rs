//! Merchant notification dispatch.
//!
//! Each successful payment owes the merchant one signed asynchronous
//! callback. Delivery is detached from the payment flow: a failed POST
//! never fails anything upstream, it just schedules itself again with
//! exponential backoff and flips the order's `notify_state` when it
//! finally lands (or runs out of retries).

use std::{sync::Arc, time::Duration};

use paygate_common::{
    Error,
    enums::NotifyState,
    error::PayResult,
    ids::TradeNo,
    time::{format_api, now},
};
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::{ctx::Ctx, models::{Order, OrderNotification}, queue::Job};

/// Retries after the initial attempt.
const MAX_RETRIES: u32 = 8;

/// Backoff base; retry n waits `2^min(n, 8)` of these.
const RETRY_UNIT: Duration = Duration::from_secs(60);

/// Keep stored response bodies to a sane size.
const RESPONSE_SNIPPET_LEN: usize = 2048;

pub struct NotifyDispatcher {
    ctx: Arc<Ctx>,
}

impl NotifyDispatcher {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        Self { ctx }
    }

    /// The notification parameter map, signed `rsa2` by the platform.
    /// Merchants verify it against the platform public key.
    pub fn notify_params(&self, order: &Order) -> Map<String, Value> {
        let tz = self.ctx.config.timezone;
        let mut params = Map::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_owned(), Value::String(v));
        };

        put("trade_no", order.trade_no.to_string());
        put("out_trade_no", order.out_trade_no.clone());
        if let Some(bill) = &order.bill_trade_no {
            put("bill_trade_no", bill.clone());
        }
        put("total_amount", order.total_amount.to_string());
        put("buyer_pay_amount", order.buyer_pay_amount.to_string());
        put("receipt_amount", order.receipt_amount.to_string());
        if let Some(attach) = &order.attach {
            put("attach", attach.clone());
        }
        put("trade_state", order.trade_state.to_string());
        put("create_time", format_api(tz, order.create_time));
        if let Some(paid) = order.payment_time {
            put("payment_time", format_api(tz, paid));
        }
        put("timestamp", format_api(tz, now()));
        put("sign_type", "rsa2".to_owned());

        let signed = self.ctx.signer.sign(&params);
        params.insert("sign".to_owned(), Value::String(signed.signature));
        params
    }

    /// Compose the synchronous return URL: the same signed params as a
    /// query string appended to the merchant's `return_url`.
    pub fn compose_return_url(&self, order: &Order) -> Option<String> {
        let base = order.return_url.as_deref()?;
        let params = self.notify_params(order);
        let query = serde_urlencoded::to_string(form_fields(&params))
            .expect("string pairs always serialize");
        let joiner = if base.contains('?') { '&' } else { '?' };
        Some(format!("{base}{joiner}{query}"))
    }

    /// Deliver one attempt and handle the bookkeeping.
    #[instrument(skip_all, name = "(notify)", fields(trade_no = %trade_no))]
    pub async fn dispatch(&self, trade_no: &TradeNo) -> PayResult<()> {
        let order = self
            .ctx
            .store
            .order(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;
        let Some(notify_url) = order.notify_url.clone() else {
            return Ok(());
        };
        if order.notify_state == NotifyState::Success {
            return Ok(());
        }
        if !order.trade_state.is_paid() {
            debug!("order not paid; skipping notification");
            return Ok(());
        }

        let params = self.notify_params(&order);
        let form = form_fields(&params);

        let started = std::time::Instant::now();
        let result = self
            .ctx
            .http
            .post(&notify_url)
            .timeout(self.ctx.config.notify_timeout)
            .form(&form)
            .send()
            .await;
        let elapsed = started.elapsed();

        let (accepted, response) = match result {
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                let accepted = status == reqwest::StatusCode::OK
                    && body.trim().eq_ignore_ascii_case("success");
                (accepted, snippet(&body))
            }
            Err(err) => (false, format!("request error: {err}")),
        };

        self.ctx
            .store
            .insert_notification(OrderNotification {
                id: uuid::Uuid::new_v4().to_string(),
                trade_no: trade_no.clone(),
                status: accepted,
                request_duration_ms: elapsed.as_millis() as i64,
                response: Some(response),
                created_at: now(),
            })
            .await?;

        if accepted {
            self.ctx
                .store
                .update_order_notify(
                    trade_no,
                    NotifyState::Success,
                    order.notify_retry_count,
                    None,
                )
                .await?;
            return Ok(());
        }

        let attempts = order.notify_retry_count;
        if attempts >= MAX_RETRIES {
            self.ctx
                .store
                .update_order_notify(
                    trade_no,
                    NotifyState::Failed,
                    attempts,
                    None,
                )
                .await?;
            warn!("merchant notification exhausted its retries");
            return Ok(());
        }

        let delay = RETRY_UNIT * 2u32.pow(attempts.min(8));
        let next_retry = now()
            + chrono::Duration::from_std(delay)
                .expect("bounded backoff fits");
        self.ctx
            .store
            .update_order_notify(
                trade_no,
                NotifyState::Waiting,
                attempts + 1,
                Some(next_retry),
            )
            .await?;
        if let Err(err) = self
            .ctx
            .queue
            .enqueue(Job::NotifyMerchant { trade_no: trade_no.clone() }, delay)
            .await
        {
            // Leave the row in WAITING; the admin replay path can pick
            // it up.
            warn!(%err, "failed to schedule notification retry");
        }
        Ok(())
    }

    /// Admin replay: schedule a fresh delivery attempt regardless of the
    /// current `notify_state`; the retry counter is preserved.
    pub async fn replay(&self, trade_no: &TradeNo) -> PayResult<()> {
        let order = self
            .ctx
            .store
            .order(trade_no)
            .await?
            .ok_or_else(|| Error::not_found("order not found"))?;
        if order.notify_url.is_none() {
            return Err(Error::invalid_request(
                "order has no notify_url",
            ));
        }
        self.ctx
            .store
            .update_order_notify(
                trade_no,
                NotifyState::Waiting,
                order.notify_retry_count,
                None,
            )
            .await?;
        self.ctx
            .queue
            .enqueue(
                Job::NotifyMerchant { trade_no: trade_no.clone() },
                Duration::ZERO,
            )
            .await
    }
}

/// Flatten a signed parameter map into form pairs.
fn form_fields(params: &Map<String, Value>) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), rendered)
        })
        .collect()
}

fn snippet(body: &str) -> String {
    if body.len() <= RESPONSE_SNIPPET_LEN {
        body.to_owned()
    } else {
        let mut end = RESPONSE_SNIPPET_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_owned()
    }
}

#[cfg(test)]
mod test {
    use std::{
        collections::HashMap,
        sync::{Arc as StdArc, Mutex},
    };

    use axum::{Form, Router, extract::State, routing::post};
    use paygate_common::enums::{EncryptionMode, SignType};
    use paygate_crypto::MerchantVerifier;

    use super::*;
    use crate::{
        ctx::testing::{TestCtx, test_ctx},
        testutil,
    };

    type Captured = StdArc<Mutex<Vec<HashMap<String, String>>>>;

    /// Serve a merchant callback endpoint returning `reply`, capturing
    /// every form body it sees.
    async fn merchant_endpoint(reply: &'static str) -> (String, Captured) {
        let captured: Captured = StdArc::new(Mutex::new(Vec::new()));
        let state = captured.clone();

        async fn handler(
            State((captured, reply)): State<(Captured, &'static str)>,
            Form(body): Form<HashMap<String, String>>,
        ) -> &'static str {
            captured.lock().expect("poisoned").push(body);
            reply
        }

        let app = Router::new()
            .route("/notify", post(handler))
            .with_state((state, reply));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        (format!("http://{addr}/notify"), captured)
    }

    async fn seed_paid_order(t: &TestCtx, notify_url: &str) -> TradeNo {
        let (mut order, buyer) = testutil::paid_order_with_ip(
            paygate_common::ids::MerchantId(1),
            "NOTIFY-ORD",
            "198.51.100.1",
        );
        order.notify_url = Some(notify_url.to_owned());
        let trade_no = order.trade_no.clone();
        t.store.seed_order(order, buyer).await;
        trade_no
    }

    #[tokio::test]
    async fn successful_delivery_flips_state_and_signs() {
        let t = test_ctx();
        let (url, captured) = merchant_endpoint("success").await;
        let trade_no = seed_paid_order(&t, &url).await;

        NotifyDispatcher::new(t.ctx.clone())
            .dispatch(&trade_no)
            .await
            .unwrap();

        let order = t.ctx.store.order(&trade_no).await.unwrap().unwrap();
        assert_eq!(order.notify_state, NotifyState::Success);
        assert_eq!(order.notify_retry_count, 0);

        let rows = t.store.all_notifications().await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].status);

        // The delivered body verifies against the platform public key.
        let bodies = captured.lock().unwrap();
        let body = &bodies[0];
        assert_eq!(body["trade_state"], "SUCCESS");
        assert_eq!(body["total_amount"], "100.00");
        let mut params = Map::new();
        for (k, v) in body.iter() {
            if k != "sign" {
                params.insert(k.clone(), Value::String(v.clone()));
            }
        }
        let verifier = MerchantVerifier {
            mode: EncryptionMode::OnlyRsa2,
            hash_key: Vec::new(),
            rsa_public: Some(t.ctx.signer.public_key()),
        };
        paygate_crypto::verify(
            &params,
            &body["sign"],
            SignType::Rsa2,
            &verifier,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn case_insensitive_success_body() {
        let t = test_ctx();
        let (url, _) = merchant_endpoint("SUCCESS").await;
        let trade_no = seed_paid_order(&t, &url).await;

        NotifyDispatcher::new(t.ctx.clone())
            .dispatch(&trade_no)
            .await
            .unwrap();
        let order = t.ctx.store.order(&trade_no).await.unwrap().unwrap();
        assert_eq!(order.notify_state, NotifyState::Success);
    }

    #[tokio::test]
    async fn rejection_schedules_backoff_retry() {
        let t = test_ctx();
        let (url, _) = merchant_endpoint("nope").await;
        let trade_no = seed_paid_order(&t, &url).await;

        NotifyDispatcher::new(t.ctx.clone())
            .dispatch(&trade_no)
            .await
            .unwrap();

        let order = t.ctx.store.order(&trade_no).await.unwrap().unwrap();
        assert_eq!(order.notify_state, NotifyState::Waiting);
        assert_eq!(order.notify_retry_count, 1);
        assert!(order.notify_next_retry_time.is_some());

        let jobs = t.queue.take();
        assert_eq!(jobs.len(), 1);
        // First retry waits 2^0 minutes.
        assert_eq!(jobs[0].1, Duration::from_secs(60));

        let rows = t.store.all_notifications().await;
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].status);
    }

    #[tokio::test]
    async fn retries_exhaust_into_failed() {
        let t = test_ctx();
        let (url, _) = merchant_endpoint("nope").await;
        let trade_no = seed_paid_order(&t, &url).await;
        t.ctx
            .store
            .update_order_notify(
                &trade_no,
                NotifyState::Waiting,
                MAX_RETRIES,
                None,
            )
            .await
            .unwrap();

        NotifyDispatcher::new(t.ctx.clone())
            .dispatch(&trade_no)
            .await
            .unwrap();

        let order = t.ctx.store.order(&trade_no).await.unwrap().unwrap();
        assert_eq!(order.notify_state, NotifyState::Failed);
        assert!(t.queue.take().is_empty());
    }

    #[tokio::test]
    async fn already_acknowledged_is_a_noop() {
        let t = test_ctx();
        let (url, captured) = merchant_endpoint("success").await;
        let trade_no = seed_paid_order(&t, &url).await;
        t.ctx
            .store
            .update_order_notify(&trade_no, NotifyState::Success, 0, None)
            .await
            .unwrap();

        NotifyDispatcher::new(t.ctx.clone())
            .dispatch(&trade_no)
            .await
            .unwrap();
        assert!(captured.lock().unwrap().is_empty());
        assert!(t.store.all_notifications().await.is_empty());
    }

    #[tokio::test]
    async fn unreachable_merchant_counts_as_failure() {
        let t = test_ctx();
        // Nothing listens on this port.
        let trade_no =
            seed_paid_order(&t, "http://127.0.0.1:9/notify").await;

        NotifyDispatcher::new(t.ctx.clone())
            .dispatch(&trade_no)
            .await
            .unwrap();
        let order = t.ctx.store.order(&trade_no).await.unwrap().unwrap();
        assert_eq!(order.notify_state, NotifyState::Waiting);
        assert_eq!(order.notify_retry_count, 1);
    }

    #[tokio::test]
    async fn replay_reschedules_regardless_of_state() {
        let t = test_ctx();
        let (url, _) = merchant_endpoint("success").await;
        let trade_no = seed_paid_order(&t, &url).await;
        t.ctx
            .store
            .update_order_notify(&trade_no, NotifyState::Failed, 5, None)
            .await
            .unwrap();

        NotifyDispatcher::new(t.ctx.clone())
            .replay(&trade_no)
            .await
            .unwrap();
        let order = t.ctx.store.order(&trade_no).await.unwrap().unwrap();
        assert_eq!(order.notify_state, NotifyState::Waiting);
        assert_eq!(order.notify_retry_count, 5);
        assert_eq!(t.queue.take().len(), 1);
    }

    #[tokio::test]
    async fn return_url_composition_honors_existing_query() {
        let t = test_ctx();
        let (mut order, _) = testutil::paid_order_with_ip(
            paygate_common::ids::MerchantId(1),
            "RET-ORD",
            "198.51.100.1",
        );
        let dispatcher = NotifyDispatcher::new(t.ctx.clone());

        order.return_url = Some("https://shop.example/done".to_owned());
        let url = dispatcher.compose_return_url(&order).unwrap();
        assert!(url.starts_with("https://shop.example/done?"));
        assert!(url.contains("trade_no="));
        assert!(url.contains("sign="));

        order.return_url =
            Some("https://shop.example/done?lang=en".to_owned());
        let url = dispatcher.compose_return_url(&order).unwrap();
        assert!(url.starts_with("https://shop.example/done?lang=en&"));

        order.return_url = None;
        assert!(dispatcher.compose_return_url(&order).is_none());
    }
}
