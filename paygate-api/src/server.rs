//! Router assembly and serving.

use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::post};
use paygate_core::Ctx;
use paygate_crypto::PayloadCodec;
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{admin, callback, merchant};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Arc<Ctx>,
    /// Seals / opens admin payloads with the platform key.
    pub codec: Arc<PayloadCodec>,
}

impl ApiState {
    pub fn new(ctx: Arc<Ctx>) -> Self {
        let codec =
            Arc::new(PayloadCodec::new(&ctx.config.platform_aes_key));
        Self { ctx, codec }
    }
}

/// The one form every merchant / admin endpoint accepts.
#[derive(Deserialize)]
pub struct PayloadForm {
    pub payload: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        // Signed merchant surface.
        .route("/api/order/create", post(merchant::create_order))
        .route("/api/order/query", post(merchant::query_order))
        .route("/api/refund/create", post(merchant::create_refund))
        .route("/api/refund/query", post(merchant::query_refund))
        // Sealed admin surface.
        .route("/admin/order/close", post(admin::close_order))
        .route("/admin/order/state", post(admin::set_trade_state))
        .route(
            "/admin/order/settle-retry",
            post(admin::retry_settlement),
        )
        .route("/admin/refund", post(admin::refund))
        .route("/admin/settle-account", post(admin::settle_account))
        .route("/admin/withdrawal/apply", post(admin::apply_withdrawal))
        .route("/admin/withdrawal/status", post(admin::withdrawal_status))
        .route("/admin/withdrawal/list", post(admin::list_withdrawals))
        .route("/admin/wallet", post(admin::wallet))
        .route("/admin/wallet/records", post(admin::wallet_records))
        .route(
            "/admin/wallet/prepaid-records",
            post(admin::prepaid_records),
        )
        .route("/admin/notify/replay", post(admin::replay_notification))
        .route("/admin/merchant/rsa", post(admin::rotate_rsa_key))
        .route("/admin/buyer/behavior", post(admin::buyer_behavior))
        // Upstream webhooks.
        .route("/notify/{gateway}", post(callback::upstream_notify))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until the shutdown channel flips.
pub async fn serve(
    state: ApiState,
    listener: tokio::net::TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr().context("listener address")?;
    info!(%addr, "api server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
        .context("api server crashed")
}
