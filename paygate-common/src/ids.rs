//! Identifier newtypes and their generators.
//!
//! String identifiers carry a fixed documented shape:
//!
//! - merchant number: `M` + 4-digit year + 11 chars of `[A-Z0-9]` (16 total)
//! - trade number: `P` + `yymmddHHMMSS` + 6 digits (micros) + 5 chars `[A-Z]`
//!   (24 total)
//! - refund id: `R` + 2-digit year + 13 chars of `[A-Z0-9]` (16 total)
//!
//! Generators only produce *candidates*; global uniqueness is enforced by
//! the store's unique index with retry-on-collision at the call site.

use std::fmt::{self, Display};

use chrono::{DateTime, Datelike, Timelike};
use chrono_tz::Tz;
use rand::Rng;
use serde::{Deserialize, Serialize};

const UPPER_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const UPPER_ALPHA: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

fn random_chars(rng: &mut impl Rng, alphabet: &[u8], n: usize) -> String {
    (0..n)
        .map(|_| alphabet[rng.gen_range(0..alphabet.len())] as char)
        .collect()
}

/// Database primary key of a merchant row.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct MerchantId(pub i64);

impl Display for MerchantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Database primary key of a payment channel row.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ChannelId(pub i64);

impl Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Database primary key of a payment channel sub-account row.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Database primary key of a withdrawal record row.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct WithdrawalId(pub i64);

impl Display for WithdrawalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

// --- MerchantNumber --- //

/// A merchant's public number: `M` + year-4 + 11 upper-alnum chars.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct MerchantNumber(String);

impl MerchantNumber {
    pub const LEN: usize = 16;

    /// Generate a candidate merchant number for the given year.
    pub fn generate(rng: &mut impl Rng, year: i32) -> Self {
        Self(format!("M{year:04}{}", random_chars(rng, UPPER_ALNUM, 11)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for MerchantNumber {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = s.as_bytes();
        let ok = bytes.len() == Self::LEN
            && bytes[0] == b'M'
            && bytes[1..5].iter().all(u8::is_ascii_digit)
            && bytes[5..]
                .iter()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if ok {
            Ok(Self(s))
        } else {
            Err(format!("malformed merchant number: {s}"))
        }
    }
}

impl From<MerchantNumber> for String {
    fn from(n: MerchantNumber) -> Self {
        n.0
    }
}

impl Display for MerchantNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- TradeNo --- //

/// A platform trade number: `P` + `yymmddHHMMSS` + 6-digit micros + 5
/// uppercase letters = 24 chars. The timestamp part is rendered in the
/// platform timezone so trade numbers sort roughly by creation time.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct TradeNo(String);

impl TradeNo {
    pub const LEN: usize = 24;

    /// Generate a candidate trade number at the given instant.
    pub fn generate(
        rng: &mut impl Rng,
        at: DateTime<chrono::Utc>,
        tz: Tz,
    ) -> Self {
        let local = at.with_timezone(&tz);
        let micros = local.timestamp_subsec_micros();
        Self(format!(
            "P{:02}{:02}{:02}{:02}{:02}{:02}{micros:06}{}",
            local.year() % 100,
            local.month(),
            local.day(),
            local.hour(),
            local.minute(),
            local.second(),
            random_chars(rng, UPPER_ALPHA, 5),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TradeNo {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = s.as_bytes();
        let ok = bytes.len() == Self::LEN
            && bytes[0] == b'P'
            && bytes[1..19].iter().all(u8::is_ascii_digit)
            && bytes[19..].iter().all(u8::is_ascii_uppercase);
        if ok {
            Ok(Self(s))
        } else {
            Err(format!("malformed trade number: {s}"))
        }
    }
}

impl From<TradeNo> for String {
    fn from(n: TradeNo) -> Self {
        n.0
    }
}

impl Display for TradeNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- RefundId --- //

/// A refund record id: `R` + 2-digit year + 13 upper-alnum chars = 16.
#[derive(
    Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct RefundId(String);

impl RefundId {
    pub const LEN: usize = 16;

    pub fn generate(rng: &mut impl Rng, year: i32) -> Self {
        Self(format!(
            "R{:02}{}",
            year % 100,
            random_chars(rng, UPPER_ALNUM, 13)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RefundId {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = s.as_bytes();
        let ok = bytes.len() == Self::LEN
            && bytes[0] == b'R'
            && bytes[1..3].iter().all(u8::is_ascii_digit)
            && bytes[3..]
                .iter()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit());
        if ok {
            Ok(Self(s))
        } else {
            Err(format!("malformed refund id: {s}"))
        }
    }
}

impl From<RefundId> for String {
    fn from(n: RefundId) -> Self {
        n.0
    }
}

impl Display for RefundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn generated_ids_parse_back() {
        let mut rng = rand::thread_rng();
        let now = chrono::Utc
            .with_ymd_and_hms(2026, 8, 1, 12, 34, 56)
            .unwrap();

        for _ in 0..100 {
            let m = MerchantNumber::generate(&mut rng, 2026);
            assert_eq!(m.as_str().len(), MerchantNumber::LEN);
            MerchantNumber::try_from(m.as_str().to_owned()).unwrap();

            let t = TradeNo::generate(&mut rng, now, chrono_tz::Asia::Shanghai);
            assert_eq!(t.as_str().len(), TradeNo::LEN);
            TradeNo::try_from(t.as_str().to_owned()).unwrap();

            let r = RefundId::generate(&mut rng, 2026);
            assert_eq!(r.as_str().len(), RefundId::LEN);
            RefundId::try_from(r.as_str().to_owned()).unwrap();
        }
    }

    #[test]
    fn trade_no_embeds_local_time() {
        let mut rng = rand::thread_rng();
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 31, 23, 0, 0).unwrap();
        // 23:00 UTC on Jan 31 is 07:00 Feb 1 in Shanghai.
        let t = TradeNo::generate(&mut rng, now, chrono_tz::Asia::Shanghai);
        assert!(t.as_str().starts_with("P260201070000"));
    }

    #[test]
    fn rejects_malformed() {
        assert!(MerchantNumber::try_from("M2026short".to_owned()).is_err());
        assert!(TradeNo::try_from("X".repeat(24)).is_err());
        assert!(RefundId::try_from("R26lowercase12345".to_owned()).is_err());
    }
}
