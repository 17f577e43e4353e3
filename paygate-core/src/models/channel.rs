//! Payment channel and sub-account models.

use chrono::NaiveTime;
use paygate_common::{
    Amount, Rate,
    enums::{PaymentType, RollMode, SettleCycle},
    ids::{AccountId, ChannelId},
};
use serde::{Deserialize, Serialize};

/// A configured upstream payment provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentChannel {
    pub id: ChannelId,
    /// Upper-alnum code, unique; merchants may pin a channel by code.
    pub code: String,
    pub name: String,
    pub payment_type: PaymentType,
    /// Driver key resolved against the registry.
    pub gateway: String,
    /// What the upstream charges us.
    pub costs: Rate,
    pub fixed_costs: Amount,
    /// What we charge the merchant (default; see rate priority).
    pub rate: Rate,
    pub fixed_fee: Amount,
    pub min_fee: Amount,
    pub max_fee: Option<Amount>,
    pub min_amount: Option<Amount>,
    pub max_amount: Option<Amount>,
    /// Max turnover per local day across all sub-accounts.
    pub daily_limit: Option<Amount>,
    /// `HH:MM` trading window; `None` bounds are open.
    pub earliest_time: Option<NaiveTime>,
    pub latest_time: Option<NaiveTime>,
    pub roll_mode: RollMode,
    pub settle_cycle: SettleCycle,
    pub status: bool,
    /// Overrides the merchant-provided order subject upstream.
    pub diy_order_subject: Option<String>,
}

/// One set of upstream credentials under a channel; the selection target.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PaymentChannelAccount {
    pub id: AccountId,
    pub channel_id: ChannelId,
    pub name: String,
    /// When `true`, amount limits and rate come from the channel.
    pub inherit_config: bool,
    /// Roulette weight for `RollMode::Weighted`; 0 excludes the account.
    pub roll_weight: u32,
    pub rate: Rate,
    pub min_amount: Option<Amount>,
    pub max_amount: Option<Amount>,
    pub daily_limit: Option<Amount>,
    pub earliest_time: Option<NaiveTime>,
    pub latest_time: Option<NaiveTime>,
    /// Driver-specific credentials.
    pub config: serde_json::Map<String, serde_json::Value>,
    pub status: bool,
    pub maintenance: bool,
    pub diy_order_subject: Option<String>,
}

impl PaymentChannelAccount {
    pub fn is_selectable(&self) -> bool {
        self.status && !self.maintenance
    }
}
