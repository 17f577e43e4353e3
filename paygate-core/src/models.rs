//! Domain models.
//!
//! These are plain data carriers: no active-record behavior, no derived
//! display text (that belongs to view mappers at the API edge). Engines
//! construct and mutate them inside store transactions.

/// Channels and their sub-accounts.
pub mod channel;
/// Merchants, wallets, ledger records, encryption settings.
pub mod merchant;
/// Orders, buyers, refunds, notifications.
pub mod order;
/// Blacklist entries, risk logs, behavior summaries.
pub mod risk;
/// Withdrawal records.
pub mod withdrawal;

pub use channel::{PaymentChannel, PaymentChannelAccount};
pub use merchant::{
    ChannelWhitelistEntry, Merchant, MerchantEncryption, MerchantWallet,
    MerchantWalletPrepaidRecord, MerchantWalletRecord, WhitelistAccount,
};
pub use order::{Order, OrderBuyer, OrderNotification, OrderRefund};
pub use risk::{BehaviorSummary, Blacklist, RiskLog};
pub use withdrawal::MerchantWithdrawalRecord;
