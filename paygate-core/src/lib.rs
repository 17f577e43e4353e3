//! The transactional core of the paygate platform.
//!
//! This crate holds the domain models and every engine that mutates them:
//! risk checks, the wallet ledger, channel selection, the order lifecycle,
//! refunds, withdrawals, and merchant notifications. Persistence and
//! cross-process counters are reached through the [`store::Store`] and
//! [`cache::Cache`] traits so the engines can be exercised end-to-end
//! against in-memory implementations.
//!
//! The rough request path:
//!
//! ```text
//! signature verify → RiskEngine → ChannelSelector
//!     → OrderEngine::create (txn: wallet + order + buyer)
//!     → PaymentDriver::submit → response
//!
//! upstream callback → PaymentDriver::verify
//!     → OrderEngine::mark_paid (txn: order + wallet + settle enqueue)
//!     → NotifyDispatcher
//! ```

/// Cross-process counters with TTL (daily caps, rotation pointers).
pub mod cache;
/// The explicit context value engines carry instead of globals.
pub mod ctx;
/// The upstream gateway driver interface and registry.
pub mod driver;
/// Row-locked wallet mutations and their append-only records.
pub mod ledger;
/// Domain models.
pub mod models;
/// Merchant notification dispatch.
pub mod notify;
/// Order lifecycle: creation, payment, close, settlement.
pub mod order;
/// The delayed job queue.
pub mod queue;
/// Refund validation and execution.
pub mod refund;
/// Pre-order risk checks and buyer behavior summaries.
pub mod risk;
/// Channel / sub-account eligibility and rotation.
pub mod selector;
/// The settle-date calendar.
pub mod settle;
/// Persistence ports.
pub mod store;
/// Shared fixtures for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod testutil;
/// Clear-account and merchant withdrawals.
pub mod withdrawal;

pub use ctx::Ctx;
