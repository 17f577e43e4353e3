//! Merchant, wallet, and encryption models.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use paygate_common::{
    Amount, Rate,
    enums::{EncryptionMode, WalletChangeType},
    ids::{AccountId, ChannelId, MerchantId, MerchantNumber, TradeNo},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A tenant of the platform.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: MerchantId,
    pub merchant_number: MerchantNumber,
    pub email: String,
    pub mobile: String,
    /// Disabled merchants cannot create orders.
    pub status: bool,
    /// `false` exempts the merchant from risk checks.
    pub risk_status: bool,
    /// If set, the buyer covers the fee on top of the order amount.
    pub buyer_pay_fee: bool,
    /// Feature grants, e.g. `"api_refund"`, `"withdrawal"`.
    pub competence: BTreeSet<String>,
    /// When non-empty, restricts which channels/accounts may serve this
    /// merchant (and optionally overrides rates).
    pub channel_whitelist: Vec<ChannelWhitelistEntry>,
    pub password_salt: String,
    pub password_hash: String,
    /// Soft-delete tombstone; history is preserved.
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChannelWhitelistEntry {
    pub channel_id: ChannelId,
    /// Merchant-specific fee rate for the whole channel.
    pub rate: Option<Rate>,
    /// When `false`, only the listed accounts may serve this merchant.
    pub use_all_accounts: bool,
    pub accounts: Vec<WhitelistAccount>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WhitelistAccount {
    pub account_id: AccountId,
    /// Merchant-specific fee rate for this one account.
    pub rate: Option<Rate>,
}

impl Merchant {
    pub fn is_active(&self) -> bool {
        self.status && self.deleted_at.is_none()
    }

    fn whitelist_entry(
        &self,
        channel_id: ChannelId,
    ) -> Option<&ChannelWhitelistEntry> {
        self.channel_whitelist
            .iter()
            .find(|e| e.channel_id == channel_id)
    }

    /// Whether the merchant may use this channel at all. An empty
    /// whitelist means every channel is allowed.
    pub fn allows_channel(&self, channel_id: ChannelId) -> bool {
        self.channel_whitelist.is_empty()
            || self.whitelist_entry(channel_id).is_some()
    }

    /// Whether the merchant may use this specific sub-account.
    pub fn allows_account(
        &self,
        channel_id: ChannelId,
        account_id: AccountId,
    ) -> bool {
        match self.whitelist_entry(channel_id) {
            None => self.channel_whitelist.is_empty(),
            Some(entry) =>
                entry.use_all_accounts
                    || entry
                        .accounts
                        .iter()
                        .any(|a| a.account_id == account_id),
        }
    }

    /// Merchant-specific rate override: account-level beats channel-level.
    pub fn rate_override(
        &self,
        channel_id: ChannelId,
        account_id: AccountId,
    ) -> Option<Rate> {
        let entry = self.whitelist_entry(channel_id)?;
        entry
            .accounts
            .iter()
            .find(|a| a.account_id == account_id)
            .and_then(|a| a.rate)
            .or(entry.rate)
    }
}

/// One wallet per merchant. Mutated only inside ledger operations under a
/// row lock; every field representing a resource stays non-negative.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerchantWallet {
    pub merchant_id: MerchantId,
    /// Freely withdrawable funds.
    pub available: Amount,
    /// Settling-in-flight funds.
    pub unavailable: Amount,
    /// Platform-advanced funds, offset against future settlements.
    pub prepaid: Amount,
    /// Deposit retained against refund risk.
    pub margin: Amount,
}

impl MerchantWallet {
    pub fn empty(merchant_id: MerchantId) -> Self {
        Self {
            merchant_id,
            available: Amount::ZERO,
            unavailable: Amount::ZERO,
            prepaid: Amount::ZERO,
            margin: Amount::ZERO,
        }
    }
}

/// Append-only change log for `(available, unavailable)`.
/// `new_* = old_* + delta_*` holds for every committed row.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerchantWalletRecord {
    pub id: i64,
    pub merchant_id: MerchantId,
    pub change_type: WalletChangeType,
    pub old_available: Amount,
    pub delta_available: Decimal,
    pub new_available: Amount,
    pub old_unavailable: Amount,
    pub delta_unavailable: Decimal,
    pub new_unavailable: Amount,
    pub trade_no: Option<TradeNo>,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Append-only change log for `prepaid`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerchantWalletPrepaidRecord {
    pub id: i64,
    pub merchant_id: MerchantId,
    pub old_prepaid: Amount,
    pub delta_prepaid: Decimal,
    pub new_prepaid: Amount,
    pub remark: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-merchant signing material. Generated at merchant creation; the RSA
/// private half is returned once at rotation time and never stored.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MerchantEncryption {
    pub merchant_id: MerchantId,
    pub mode: EncryptionMode,
    /// 32-byte shared key for the keyed-digest sign types.
    pub hash_key: Vec<u8>,
    /// Optional 32-byte AES key for sealed merchant payloads.
    pub aes_key: Option<Vec<u8>>,
    /// Merchant's RSA public key: headerless Base64 DER.
    pub rsa_public_key: Option<String>,
}

#[cfg(test)]
mod test {
    use rust_decimal_macros::dec;

    use super::*;

    fn merchant_with_whitelist() -> Merchant {
        Merchant {
            id: MerchantId(1),
            merchant_number: MerchantNumber::try_from(
                "M2026ABCDEFGHJKL".to_owned(),
            )
            .unwrap(),
            email: "m@example.com".to_owned(),
            mobile: "13800000000".to_owned(),
            status: true,
            risk_status: true,
            buyer_pay_fee: false,
            competence: BTreeSet::new(),
            channel_whitelist: vec![ChannelWhitelistEntry {
                channel_id: ChannelId(10),
                rate: Some(Rate::try_from_decimal(dec!(0.0200)).unwrap()),
                use_all_accounts: false,
                accounts: vec![WhitelistAccount {
                    account_id: AccountId(100),
                    rate: Some(Rate::try_from_decimal(dec!(0.0180)).unwrap()),
                }],
            }],
            password_salt: String::new(),
            password_hash: String::new(),
            deleted_at: None,
        }
    }

    #[test]
    fn whitelist_gates_channels_and_accounts() {
        let m = merchant_with_whitelist();
        assert!(m.allows_channel(ChannelId(10)));
        assert!(!m.allows_channel(ChannelId(11)));
        assert!(m.allows_account(ChannelId(10), AccountId(100)));
        assert!(!m.allows_account(ChannelId(10), AccountId(101)));
    }

    #[test]
    fn account_rate_beats_channel_rate() {
        let m = merchant_with_whitelist();
        assert_eq!(
            m.rate_override(ChannelId(10), AccountId(100)),
            Some(Rate::try_from_decimal(dec!(0.0180)).unwrap()),
        );
        assert_eq!(
            m.rate_override(ChannelId(10), AccountId(999)),
            Some(Rate::try_from_decimal(dec!(0.0200)).unwrap()),
        );
        assert_eq!(m.rate_override(ChannelId(11), AccountId(100)), None);
    }

    #[test]
    fn empty_whitelist_allows_everything() {
        let mut m = merchant_with_whitelist();
        m.channel_whitelist.clear();
        assert!(m.allows_channel(ChannelId(42)));
        assert!(m.allows_account(ChannelId(42), AccountId(4242)));
    }
}
