//! The HTTP surface of the paygate platform.
//!
//! Three families of routes share one router:
//!
//! - `/api/*` -- signed merchant endpoints. The body is a form with one
//!   `payload` field: JSON carrying `merchant_number`, `sign_type`,
//!   `biz_content`, and `sign`, verified per the merchant's encryption
//!   mode. Responses are always HTTP 200 with a `{code, message, data}`
//!   envelope.
//! - `/admin/*` -- operator endpoints. The `payload` field is an
//!   XChaCha20-Poly1305 sealed JSON object under the platform key. Same
//!   envelope.
//! - `/notify/{gateway}` -- upstream webhooks. These speak each
//!   upstream's dialect: the driver verifies authenticity, and failures
//!   return non-2xx so the upstream retries.

/// Operator endpoints.
pub mod admin;
/// Merchant payload verification.
pub mod auth;
/// Upstream webhook route.
pub mod callback;
/// The `{code, message, data}` envelope.
pub mod envelope;
/// Signed merchant endpoints.
pub mod merchant;
/// Router assembly and serving.
pub mod server;
/// Response projections.
pub mod view;

pub use server::{ApiState, router, serve};
