//! Closed enums for every wire and status enumeration.
//!
//! Wire strings are part of the external contract; each enum either derives
//! exact serde renames or carries explicit `#[serde(rename = "..")]`
//! attributes. Integer-backed enums (`SettleCycle`, `RollMode`,
//! `RiskLogType`) expose `from_i16`/`as_i16` for the store layer.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

// --- PaymentType --- //

/// Upstream payment method requested by the buyer. Exact strings on the
/// wire; `None` means "unchosen" (cashier page picks later).
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
pub enum PaymentType {
    Alipay,
    WechatPay,
    Bank,
    UnionPay,
    QQWallet,
    JDPay,
    PayPal,
    None,
}

// --- TradeState --- //

/// Order lifecycle state.
///
/// ```text
/// WAIT_PAY → SUCCESS, CLOSED
/// SUCCESS  → REFUND (partial), FINISHED (full refund / terminal), FROZEN
/// REFUND   → REFUND, FINISHED
/// FROZEN   → SUCCESS, FINISHED
/// CLOSED   → (terminal)
/// FINISHED → (terminal)
/// ```
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeState {
    WaitPay,
    Success,
    Refund,
    Finished,
    Frozen,
    Closed,
}

impl TradeState {
    /// Whether a normal (non-admin-override) transition `self → to` is
    /// allowed by the lifecycle graph.
    pub fn can_transition(self, to: TradeState) -> bool {
        use TradeState::*;
        matches!(
            (self, to),
            (WaitPay, Success)
                | (WaitPay, Closed)
                | (Success, Refund)
                | (Success, Finished)
                | (Success, Frozen)
                | (Refund, Refund)
                | (Refund, Finished)
                | (Frozen, Success)
                | (Frozen, Finished)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TradeState::Closed | TradeState::Finished)
    }

    /// States in which the buyer's money has been captured.
    pub fn is_paid(self) -> bool {
        matches!(
            self,
            TradeState::Success
                | TradeState::Refund
                | TradeState::Finished
                | TradeState::Frozen
        )
    }
}

// --- SettleState --- //

/// `PENDING → PROCESSING → {COMPLETED, FAILED}`; `FAILED` may be retried
/// back into `PROCESSING`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SettleState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SettleState {
    pub fn can_transition(self, to: SettleState) -> bool {
        use SettleState::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing)
        )
    }
}

// --- NotifyState --- //

/// `WAITING → {SUCCESS, FAILED}`.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum NotifyState {
    Waiting,
    Success,
    Failed,
}

// --- SettleCycle --- //

/// When a paid order's funds move from unavailable to available.
/// `D` = natural days, `T` = business days.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum SettleCycle {
    Instant,
    D0,
    D1,
    D2,
    T0,
    T1,
    T2,
    D3,
    D7,
    D14,
    D30,
    T3,
    T7,
    T14,
    T30,
    /// Funds are captured but never settled; for test channels.
    TestSwallow,
}

/// How to schedule settlement for a cycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SettleSchedule {
    /// Credit the available balance right away.
    Immediate,
    /// Credit unavailable now; move to available after the day offset.
    AfterDays { days: u32, business: bool },
    /// Credit unavailable now; never settle.
    Never,
}

impl SettleCycle {
    pub fn from_i16(v: i16) -> Option<Self> {
        use SettleCycle::*;
        Some(match v {
            0 => Instant,
            1 => D0,
            2 => D1,
            3 => D2,
            4 => T0,
            5 => T1,
            6 => T2,
            7 => D3,
            8 => D7,
            9 => D14,
            10 => D30,
            11 => T3,
            12 => T7,
            13 => T14,
            14 => T30,
            15 => TestSwallow,
            _ => return None,
        })
    }

    pub fn as_i16(self) -> i16 {
        use SettleCycle::*;
        match self {
            Instant => 0,
            D0 => 1,
            D1 => 2,
            D2 => 3,
            T0 => 4,
            T1 => 5,
            T2 => 6,
            D3 => 7,
            D7 => 8,
            D14 => 9,
            D30 => 10,
            T3 => 11,
            T7 => 12,
            T14 => 13,
            T30 => 14,
            TestSwallow => 15,
        }
    }

    pub fn schedule(self) -> SettleSchedule {
        use SettleCycle::*;
        match self {
            Instant => SettleSchedule::Immediate,
            D0 => SettleSchedule::AfterDays { days: 0, business: false },
            D1 => SettleSchedule::AfterDays { days: 1, business: false },
            D2 => SettleSchedule::AfterDays { days: 2, business: false },
            D3 => SettleSchedule::AfterDays { days: 3, business: false },
            D7 => SettleSchedule::AfterDays { days: 7, business: false },
            D14 => SettleSchedule::AfterDays { days: 14, business: false },
            D30 => SettleSchedule::AfterDays { days: 30, business: false },
            T0 => SettleSchedule::AfterDays { days: 0, business: true },
            T1 => SettleSchedule::AfterDays { days: 1, business: true },
            T2 => SettleSchedule::AfterDays { days: 2, business: true },
            T3 => SettleSchedule::AfterDays { days: 3, business: true },
            T7 => SettleSchedule::AfterDays { days: 7, business: true },
            T14 => SettleSchedule::AfterDays { days: 14, business: true },
            T30 => SettleSchedule::AfterDays { days: 30, business: true },
            TestSwallow => SettleSchedule::Never,
        }
    }
}

// --- Refunds --- //

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Rejected,
    Canceled,
}

impl RefundStatus {
    /// Whether this refund's amount counts toward the order's refunded sum.
    pub fn counts_toward_refunded(self) -> bool {
        !matches!(
            self,
            RefundStatus::Failed
                | RefundStatus::Rejected
                | RefundStatus::Canceled
        )
    }
}

/// Who initiated a refund.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RefundInitiateType {
    Admin,
    Api,
    Merchant,
    System,
}

// --- Withdrawals --- //

/// ```text
/// PENDING    → PROCESSING, REJECTED, CANCELED
/// PROCESSING → COMPLETED, FAILED, CANCELED
/// ```
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Rejected,
    Canceled,
}

impl WithdrawalStatus {
    pub fn can_transition(self, to: WithdrawalStatus) -> bool {
        use WithdrawalStatus::*;
        matches!(
            (self, to),
            (Pending, Processing)
                | (Pending, Rejected)
                | (Pending, Canceled)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Canceled)
        )
    }

    /// Transitions into these states put the money back in the wallet.
    pub fn refunds_wallet(self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Rejected
                | WithdrawalStatus::Canceled
                | WithdrawalStatus::Failed
        )
    }
}

// --- Buyer certificates --- //

/// Kind of identity document attached to a buyer.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CertType {
    IdentityCard,
    Passport,
    HkMacaoPass,
    TaiwanPass,
    ResidencePermit,
    Other,
}

// --- Risk --- //

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BlacklistEntityType {
    UserId,
    BankCard,
    IdCard,
    Mobile,
    IpAddress,
    DeviceFingerprint,
}

#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BlacklistOrigin {
    ManualReview,
    AutoDetection,
    ThirdParty,
    SystemAlert,
    MerchantReport,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RiskLogType {
    Blacklist,
    SubjectKeyword,
    OrderSuccessRate,
}

impl RiskLogType {
    pub fn from_i16(v: i16) -> Option<Self> {
        Some(match v {
            0 => RiskLogType::Blacklist,
            1 => RiskLogType::SubjectKeyword,
            2 => RiskLogType::OrderSuccessRate,
            _ => return None,
        })
    }

    pub fn as_i16(self) -> i16 {
        match self {
            RiskLogType::Blacklist => 0,
            RiskLogType::SubjectKeyword => 1,
            RiskLogType::OrderSuccessRate => 2,
        }
    }
}

// --- Wallet ledger --- //

/// Category recorded on every wallet movement.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum WalletChangeType {
    /// Instant settlement straight into available.
    OrderReceipt,
    /// Delayed settlement: unavailable in, then unavailable → available.
    OrderSettle,
    OrderRefund,
    /// Fee restitution credited back on refund.
    RefundFee,
    Withdrawal,
    /// Wallet credit when a withdrawal is rejected / canceled / failed.
    WithdrawalRefund,
    /// Admin clear-account flow.
    SettleAccount,
    Adjust,
}

// --- Signing --- //

/// Request signature algorithm.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SignType {
    Xxh,
    Sha3,
    Sm3,
    Rsa2,
}

/// Per-merchant signing policy.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EncryptionMode {
    Open,
    OnlyXxh,
    OnlySha3,
    OnlySm3,
    OnlyRsa2,
}

impl EncryptionMode {
    /// Whether a request signed with `sign_type` is acceptable under this
    /// mode. `open` accepts any supported type; `only_*` rejects others.
    pub fn allows(self, sign_type: SignType) -> bool {
        match self {
            EncryptionMode::Open => true,
            EncryptionMode::OnlyXxh => sign_type == SignType::Xxh,
            EncryptionMode::OnlySha3 => sign_type == SignType::Sha3,
            EncryptionMode::OnlySm3 => sign_type == SignType::Sm3,
            EncryptionMode::OnlyRsa2 => sign_type == SignType::Rsa2,
        }
    }
}

// --- Rotation --- //

/// Sub-account selection strategy of a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RollMode {
    Sequential,
    Random,
    Weighted,
    First,
}

impl RollMode {
    pub fn from_i16(v: i16) -> Option<Self> {
        Some(match v {
            0 => RollMode::Sequential,
            1 => RollMode::Random,
            2 => RollMode::Weighted,
            3 => RollMode::First,
            _ => return None,
        })
    }

    pub fn as_i16(self) -> i16 {
        match self {
            RollMode::Sequential => 0,
            RollMode::Random => 1,
            RollMode::Weighted => 2,
            RollMode::First => 3,
        }
    }
}

// --- Fee bearer --- //

/// Who eats the fee when a refund restores it.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, Display,
    AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FeeBearer {
    Merchant,
    Platform,
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn payment_type_wire_strings() {
        assert_eq!(PaymentType::WechatPay.to_string(), "WechatPay");
        assert_eq!(PaymentType::QQWallet.to_string(), "QQWallet");
        assert_eq!(PaymentType::from_str("PayPal").unwrap(), PaymentType::PayPal);
        assert_eq!(PaymentType::from_str("None").unwrap(), PaymentType::None);
        assert!(PaymentType::from_str("Stripe").is_err());
    }

    #[test]
    fn trade_state_graph() {
        use TradeState::*;
        assert!(WaitPay.can_transition(Success));
        assert!(WaitPay.can_transition(Closed));
        assert!(!WaitPay.can_transition(Refund));
        assert!(Success.can_transition(Frozen));
        assert!(Refund.can_transition(Refund));
        assert!(Frozen.can_transition(Success));
        assert!(!Closed.can_transition(Success));
        assert!(!Finished.can_transition(Refund));
    }

    #[test]
    fn settle_cycle_roundtrip() {
        for v in 0..=15i16 {
            let cycle = SettleCycle::from_i16(v).unwrap();
            assert_eq!(cycle.as_i16(), v);
        }
        assert!(SettleCycle::from_i16(16).is_none());
        assert_eq!(
            SettleCycle::T7.schedule(),
            SettleSchedule::AfterDays { days: 7, business: true }
        );
        assert_eq!(SettleCycle::TestSwallow.schedule(), SettleSchedule::Never);
    }

    #[test]
    fn withdrawal_status_graph() {
        use WithdrawalStatus::*;
        assert!(Pending.can_transition(Processing));
        assert!(Pending.can_transition(Rejected));
        assert!(!Pending.can_transition(Completed));
        assert!(Processing.can_transition(Failed));
        assert!(!Completed.can_transition(Canceled));
    }

    #[test]
    fn encryption_mode_policy() {
        assert!(EncryptionMode::Open.allows(SignType::Sm3));
        assert!(EncryptionMode::OnlyRsa2.allows(SignType::Rsa2));
        assert!(!EncryptionMode::OnlyRsa2.allows(SignType::Xxh));
    }

    #[test]
    fn trade_state_wire_strings() {
        assert_eq!(TradeState::WaitPay.to_string(), "WAIT_PAY");
        assert_eq!(
            serde_json::to_string(&TradeState::Success).unwrap(),
            "\"SUCCESS\""
        );
    }
}
