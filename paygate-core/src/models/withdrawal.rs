//! Withdrawal record model.

use chrono::{DateTime, Utc};
use paygate_common::{
    Amount,
    enums::WithdrawalStatus,
    ids::{MerchantId, WithdrawalId},
};
use serde::{Deserialize, Serialize};

/// One withdrawal (or admin clear-account) of merchant funds.
///
/// Invariant: `amount = prepaid_deducted + received_amount +
/// (fee_type ? 0 : fee)` -- when `fee_type` is set the platform bears the
/// fee, otherwise it comes out of the withdrawn amount.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerchantWithdrawalRecord {
    pub id: WithdrawalId,
    pub merchant_id: MerchantId,
    /// Payee bank / account details as structured JSON.
    pub payee_info: serde_json::Value,
    /// Total debited from the available balance.
    pub amount: Amount,
    /// Portion offset against the platform's prepaid advance.
    pub prepaid_deducted: Amount,
    /// Portion actually paid out to the merchant.
    pub received_amount: Amount,
    pub fee: Amount,
    /// `true` = platform bears the fee.
    pub fee_type: bool,
    pub status: WithdrawalStatus,
    pub reject_reason: Option<String>,
    pub create_time: DateTime<Utc>,
}
