//! Blacklist, risk log, and behavior summary models.

use chrono::{DateTime, Utc};
use paygate_common::{
    enums::{BlacklistEntityType, BlacklistOrigin, RiskLogType},
    ids::MerchantId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A blocked entity. Looked up by `entity_hash`; unique by it.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Blacklist {
    pub id: i64,
    pub entity_type: BlacklistEntityType,
    pub entity_value: String,
    /// `hex(SHA3-224(type ‖ value))`; the lookup key.
    pub entity_hash: String,
    pub reason: String,
    pub origin: BlacklistOrigin,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Blacklist {
    /// Entries without `expired_at` never expire.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expired_at.map_or(true, |exp| exp > now)
    }
}

/// Append-only record of a risk decision.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RiskLog {
    pub id: i64,
    pub merchant_id: MerchantId,
    pub log_type: RiskLogType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Buyer behavior aggregate for risk display.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BehaviorSummary {
    /// Distinct orders attributable to this buyer.
    pub total_orders: u64,
    /// Orders in a paid state (SUCCESS / REFUND / FINISHED / FROZEN).
    pub paid_orders: u64,
    /// `paid / total`, scale 4; zero when there are no orders.
    pub success_rate: Decimal,
    pub blacklisted: bool,
}
