//! End-to-end tests over the HTTP surface: signed merchant requests,
//! sealed admin requests, and upstream webhooks against a fully
//! in-memory backend.

use paygate_api::{ApiState, router};
use paygate_common::{
    Amount,
    enums::SignType,
    ids::MerchantId,
};
use paygate_core::{
    ctx::testing::{TestCtx, test_ctx},
    models::MerchantWallet,
    testutil,
};
use paygate_crypto::{PayloadCodec, digest_sign};
use serde_json::{Map, Value, json};

struct Harness {
    t: TestCtx,
    base: String,
    client: reqwest::Client,
}

async fn harness() -> Harness {
    paygate_logger::init_for_testing();
    let t = test_ctx();
    testutil::seed_default_merchant(&t).await;
    testutil::seed_channel_with_account(&t).await;

    let state = ApiState::new(t.ctx.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.expect("serve");
    });

    Harness { t, base, client: reqwest::Client::new() }
}

/// Sign a merchant payload the way a real merchant SDK would.
fn signed_payload(biz: Value) -> String {
    let merchant_number = "M2026ABCDEFGHJKL";
    let mut params = Map::new();
    params.insert(
        "merchant_number".to_owned(),
        Value::String(merchant_number.to_owned()),
    );
    params.insert("sign_type".to_owned(), Value::String("sha3".to_owned()));
    params.insert(
        "biz_content".to_owned(),
        Value::String(biz.to_string()),
    );
    let signed =
        digest_sign(&params, SignType::Sha3, &[1u8; 32]).expect("sign");
    params.insert("sign".to_owned(), Value::String(signed.signature));
    serde_json::to_string(&params).expect("json")
}

fn sealed_payload(t: &TestCtx, body: Value) -> String {
    let codec = PayloadCodec::new(&t.ctx.config.platform_aes_key);
    codec
        .seal(&mut rand::thread_rng(), body.to_string().as_bytes())
        .expect("seal")
}

async fn post_form(
    h: &Harness,
    path: &str,
    payload: String,
) -> Value {
    let resp = h
        .client
        .post(format!("{}{}", h.base, path))
        .form(&[("payload", payload)])
        .send()
        .await
        .expect("request");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.json().await.expect("json envelope")
}

#[tokio::test]
async fn signed_order_create_roundtrip() {
    let h = harness().await;
    seed_fixture_merchant_number(&h).await;

    let body = post_form(
        &h,
        "/api/order/create",
        signed_payload(json!({
            "out_trade_no": "E2E-001",
            "payment_type": "Alipay",
            "subject": "e2e order",
            "total_amount": "100.00",
            "notify_url": "https://merchant.example/notify",
        })),
    )
    .await;

    assert_eq!(body["code"], 0, "body: {body}");
    let data = &body["data"];
    assert!(data["trade_no"].as_str().unwrap().starts_with('P'));
    assert_eq!(data["total_amount"], "100.00");
    assert_eq!(data["fee_amount"], "2.50");
    assert_eq!(data["trade_state"], "WAIT_PAY");
    assert_eq!(data["payment"]["type"], "redirect");

    // Identical replay returns the same trade_no.
    let replay = post_form(
        &h,
        "/api/order/create",
        signed_payload(json!({
            "out_trade_no": "E2E-001",
            "payment_type": "Alipay",
            "subject": "e2e order",
            "total_amount": "100.00",
            "notify_url": "https://merchant.example/notify",
        })),
    )
    .await;
    assert_eq!(replay["data"]["trade_no"], data["trade_no"]);
}

/// The seeded merchant's number is random; re-point it at the constant
/// the payload helper signs for.
async fn seed_fixture_merchant_number(h: &Harness) {
    let mut merchant = testutil::merchant(1);
    merchant.merchant_number =
        paygate_common::ids::MerchantNumber::try_from(
            "M2026ABCDEFGHJKL".to_owned(),
        )
        .expect("fixture number");
    h.t.store
        .seed_merchant(merchant, testutil::encryption(MerchantId(1)))
        .await;
}

#[tokio::test]
async fn tampered_signature_is_unauthorized() {
    let h = harness().await;
    seed_fixture_merchant_number(&h).await;

    let mut payload: Map<String, Value> = serde_json::from_str(
        &signed_payload(json!({
            "out_trade_no": "E2E-002",
            "payment_type": "Alipay",
            "subject": "tampered",
            "total_amount": "100.00",
        })),
    )
    .unwrap();
    // Swap the biz content after signing.
    payload.insert(
        "biz_content".to_owned(),
        Value::String(
            json!({
                "out_trade_no": "E2E-002",
                "payment_type": "Alipay",
                "subject": "tampered",
                "total_amount": "999.00",
            })
            .to_string(),
        ),
    );
    let body = post_form(
        &h,
        "/api/order/create",
        serde_json::to_string(&payload).unwrap(),
    )
    .await;
    assert_eq!(body["code"], 1002);
}

#[tokio::test]
async fn webhook_marks_paid_and_acks() {
    let h = harness().await;
    seed_fixture_merchant_number(&h).await;

    let created = post_form(
        &h,
        "/api/order/create",
        signed_payload(json!({
            "out_trade_no": "E2E-003",
            "payment_type": "Alipay",
            "subject": "webhook order",
            "total_amount": "100.00",
        })),
    )
    .await;
    let trade_no = created["data"]["trade_no"].as_str().unwrap().to_owned();

    let resp = h
        .client
        .post(format!("{}/notify/mock", h.base))
        .form(&[("trade_no", trade_no.as_str()), ("state", "paid")])
        .send()
        .await
        .expect("webhook");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "success");

    // Instant settlement credited the wallet.
    let wallet =
        h.t.ctx.store.wallet(MerchantId(1)).await.unwrap().unwrap();
    assert_eq!(wallet.available, Amount::from_cents(9_750));

    // Query reflects the new state.
    let queried = post_form(
        &h,
        "/api/order/query",
        signed_payload(json!({"trade_no": trade_no})),
    )
    .await;
    assert_eq!(queried["data"]["trade_state"], "SUCCESS");

    // A duplicate webhook still acks without double-crediting.
    let resp = h
        .client
        .post(format!("{}/notify/mock", h.base))
        .form(&[("trade_no", trade_no.as_str())])
        .send()
        .await
        .expect("webhook");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let wallet =
        h.t.ctx.store.wallet(MerchantId(1)).await.unwrap().unwrap();
    assert_eq!(wallet.available, Amount::from_cents(9_750));
}

#[tokio::test]
async fn webhook_unknown_order_is_retryable() {
    let h = harness().await;
    let resp = h
        .client
        .post(format!("{}/notify/mock", h.base))
        .form(&[("trade_no", "P260801120000000000AAAAA")])
        .send()
        .await
        .expect("webhook");
    assert!(!resp.status().is_success());
}

#[tokio::test]
async fn sealed_admin_withdrawal_flow() {
    let h = harness().await;
    h.t.store
        .seed_wallet(MerchantWallet {
            merchant_id: MerchantId(1),
            available: Amount::from_cents(20_000),
            unavailable: Amount::ZERO,
            prepaid: Amount::from_cents(5_000),
            margin: Amount::ZERO,
        })
        .await;

    let body = post_form(
        &h,
        "/admin/settle-account",
        sealed_payload(&h.t, json!({"merchant_id": 1})),
    )
    .await;
    assert_eq!(body["code"], 0, "body: {body}");
    let withdrawal = &body["data"]["withdrawal"];
    assert_eq!(withdrawal["amount"], "200.00");
    assert_eq!(withdrawal["prepaid_deducted"], "50.00");
    assert_eq!(withdrawal["received_amount"], "150.00");
    let id = withdrawal["id"].as_i64().unwrap();

    // Reject it; the funds come back.
    let body = post_form(
        &h,
        "/admin/withdrawal/status",
        sealed_payload(
            &h.t,
            json!({"id": id, "status": "FAILED", "reason": "bank error"}),
        ),
    )
    .await;
    assert_eq!(body["code"], 0, "body: {body}");

    let wallet =
        h.t.ctx.store.wallet(MerchantId(1)).await.unwrap().unwrap();
    assert_eq!(wallet.available, Amount::from_cents(20_000));
    assert_eq!(wallet.prepaid, Amount::from_cents(5_000));
}

#[tokio::test]
async fn garbage_admin_payload_is_invalid_request() {
    let h = harness().await;
    let body = post_form(
        &h,
        "/admin/wallet",
        "not-a-sealed-payload".to_owned(),
    )
    .await;
    assert_eq!(body["code"], 1001);
}
