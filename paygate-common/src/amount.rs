//! Monetary newtypes which maintain some useful internal invariants.
//!
//! All monetary values flow through the system as fixed-point decimals,
//! never as binary floats. [`Amount`] is a non-negative decimal at scale 2
//! (fen/cents); [`Rate`] is a non-negative fraction at scale 4 (so a user
//! entered "1.5%" is stored as `0.0150`).
//!
//! Signed quantities -- wallet deltas, profit that may go negative -- are
//! deliberately *not* wrapped: they travel as plain [`Decimal`]s and are
//! re-validated when they land back in an [`Amount`] via
//! [`Amount::checked_add_signed`].
//!
//! ### Parsing [`Amount`]s
//!
//! If an [`Amount`] needs to be parsed from a user-provided [`String`], use
//! `Decimal::from_str`, then call [`Amount::try_from_decimal`], which
//! rejects negatives and sub-cent precision.
//!
//! ```
//! # use paygate_common::amount::Amount;
//! # use rust_decimal::Decimal;
//! # use std::str::FromStr;
//! let dec = Decimal::from_str("100.00").expect("Not a number");
//! let amount = Amount::try_from_decimal(dec).expect("Invalid amount");
//! assert_eq!(amount.to_string(), "100.00");
//! ```

use std::{
    fmt::{self, Display},
    ops::{Add, Sub},
};

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Deserializer, Serialize};

/// Scale of all stored monetary values.
pub const MONEY_SCALE: u32 = 2;
/// Scale of all stored rates / percentages-as-fractions.
pub const RATE_SCALE: u32 = 4;

/// Errors that can occur when constructing an [`Amount`] or [`Rate`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("amount is negative")]
    Negative,
    #[error("amount is too large")]
    TooLarge,
    #[error("amount has more than 2 decimal places")]
    Precision,
    #[error("rate has more than 4 decimal places")]
    RatePrecision,
}

/// A monetary amount, internally a non-negative [`Decimal`] at scale 2.
///
/// - The contained value is non-negative.
/// - The contained value is no greater than [`Amount::MAX`].
/// - The contained value always carries exactly two fractional digits, so
///   [`Display`] and serde output render e.g. `"97.50"`, never `"97.5"`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct Amount(Decimal);

impl Amount {
    /// An [`Amount`] of zero.
    pub const ZERO: Self = Self(dec!(0.00));

    /// The largest representable [`Amount`]. Far beyond any plausible order
    /// or balance; exists so arithmetic overflow is a typed error rather
    /// than a panic deep inside [`Decimal`].
    pub const MAX: Self = Self(dec!(99_999_999_999_999.99));

    // --- Constructors --- //

    /// Construct an [`Amount`] from a [`Decimal`], rejecting negatives,
    /// out-of-range values, and sub-cent precision. This is the constructor
    /// for *externally supplied* values (merchant request fields).
    pub fn try_from_decimal(value: Decimal) -> Result<Self, Error> {
        if value.round_dp(MONEY_SCALE) != value {
            return Err(Error::Precision);
        }
        Self::try_from_inner(value)
    }

    /// Construct an [`Amount`] from a *computed* [`Decimal`] (a fee, a
    /// prorated restitution), rounding to scale 2 with banker's rounding
    /// (round-half-even).
    pub fn from_decimal_round(value: Decimal) -> Result<Self, Error> {
        Self::try_from_inner(round_money(value))
    }

    /// Construct from an integer cent count. Mostly useful in tests.
    pub fn from_cents(cents: u64) -> Self {
        Self::try_from_inner(Decimal::from(cents) / dec!(100))
            .expect("u64 cents always fits")
    }

    // --- Getters --- //

    /// Returns the contained [`Decimal`] at scale 2.
    #[inline]
    pub fn get(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    // --- Checked arithmetic --- //

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_add(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        let inner = self.0.checked_sub(rhs.0)?;
        Self::try_from_inner(inner).ok()
    }

    /// Apply a signed delta, failing if the result would go negative.
    /// This is the wallet-ledger workhorse: `new = old + delta`.
    pub fn checked_add_signed(self, delta: Decimal) -> Option<Self> {
        let inner = self.0.checked_add(round_money(delta))?;
        Self::try_from_inner(inner).ok()
    }

    /// `max(0, self - rhs)`.
    pub fn saturating_sub(self, rhs: Self) -> Self {
        self.checked_sub(rhs).unwrap_or(Self::ZERO)
    }

    pub fn min(self, rhs: Self) -> Self {
        if self.0 <= rhs.0 { self } else { rhs }
    }

    pub fn max(self, rhs: Self) -> Self {
        if self.0 >= rhs.0 { self } else { rhs }
    }

    /// Checks all internal invariants, returning [`Self`] if all were OK.
    /// Also normalizes the scale so the value always prints with two
    /// fractional digits.
    fn try_from_inner(inner: Decimal) -> Result<Self, Error> {
        if inner.is_sign_negative() && !inner.is_zero() {
            Err(Error::Negative)
        } else if inner > Self::MAX.0 {
            Err(Error::TooLarge)
        } else {
            let mut normalized = inner;
            normalized.rescale(MONEY_SCALE);
            Ok(Self(normalized))
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner: Decimal = Deserialize::deserialize(deserializer)?;
        Self::try_from_decimal(inner).map_err(serde::de::Error::custom)
    }
}

impl Display for Amount {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Decimal::fmt(&self.0, f)
    }
}

// Panicking ops; for code paths where non-negativity was already checked.
impl Add for Amount {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 + rhs.0).expect("Overflowed")
    }
}

impl Sub for Amount {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self::try_from_inner(self.0 - rhs.0).expect("Underflowed")
    }
}

/// Round a computed decimal to money scale with round-half-even.
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointNearestEven)
}

// --- Rate --- //

/// A fee or cost rate, internally a non-negative [`Decimal`] fraction at
/// scale 4. `1.5%` is stored as `0.0150`; callers converting user-entered
/// percentages divide by 100 *before* constructing a [`Rate`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
pub struct Rate(Decimal);

impl Rate {
    pub const ZERO: Self = Self(dec!(0.0000));

    pub fn try_from_decimal(value: Decimal) -> Result<Self, Error> {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(Error::Negative);
        }
        if value.round_dp(RATE_SCALE) != value {
            return Err(Error::RatePrecision);
        }
        let mut normalized = value;
        normalized.rescale(RATE_SCALE);
        Ok(Self(normalized))
    }

    #[inline]
    pub fn get(&self) -> Decimal {
        self.0
    }

    /// `amount * rate`, rounded to money scale with round-half-even.
    pub fn apply(&self, amount: Amount) -> Amount {
        Amount::from_decimal_round(amount.get() * self.0)
            .expect("rate * amount fits: rate is bounded by its scale")
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let inner: Decimal = Deserialize::deserialize(deserializer)?;
        Self::try_from_decimal(inner).map_err(serde::de::Error::custom)
    }
}

impl Display for Rate {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Decimal::fmt(&self.0, f)
    }
}

// --- Tests and test infra --- //

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{Arbitrary, any},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for Amount {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            any::<u64>().prop_map(Amount::from_cents).boxed()
        }
    }
}
