//! 18-decimal fixed-point amounts and the arithmetic helpers every ratio
//! computation goes through. All divisions truncate toward zero.

use candid::CandidType;
use ethnum::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

/// 1.0 in 18-decimal fixed point.
pub const DECIMAL_PRECISION: u128 = 1_000_000_000_000_000_000;

/// Scale of nominal collateral ratios. Larger than [`DECIMAL_PRECISION`] so
/// that troves with small debts still order correctly.
pub const NICR_PRECISION: u128 = 100_000_000_000_000_000_000;

/// Exponent cap for [`dec_pow`]: one thousand years in minutes.
pub const MAX_DEC_POW_EXPONENT: u64 = 525_600_000;

/// Nominal collateral ratio, `coll * NICR_PRECISION / debt`.
pub type Nicr = u128;

macro_rules! fixed_point_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            CandidType, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(u128);

        impl $name {
            pub const ZERO: Self = Self(0);
            pub const MAX: Self = Self(u128::MAX);

            /// Wraps a raw 18-decimal value.
            pub const fn new(raw: u128) -> Self {
                Self(raw)
            }

            /// `units` whole tokens.
            pub const fn from_units(units: u128) -> Self {
                Self(units * DECIMAL_PRECISION)
            }

            pub const fn raw(self) -> u128 {
                self.0
            }

            pub const fn is_zero(self) -> bool {
                self.0 == 0
            }

            pub fn to_f64(self) -> f64 {
                self.0 as f64 / DECIMAL_PRECISION as f64
            }

            pub fn checked_sub(self, other: Self) -> Option<Self> {
                self.0.checked_sub(other.0).map(Self)
            }

            pub fn saturating_sub(self, other: Self) -> Self {
                Self(self.0.saturating_sub(other.0))
            }

            /// `self * numerator / denominator`, truncated.
            pub fn mul_div(self, numerator: u128, denominator: u128) -> Self {
                Self(mul_div(self.0, numerator, denominator))
            }
        }

        impl Add for $name {
            type Output = Self;

            fn add(self, other: Self) -> Self {
                match self.0.checked_add(other.0) {
                    Some(sum) => Self(sum),
                    None => panic!("bug: {} overflow: {} + {}", stringify!($name), self, other),
                }
            }
        }

        impl Sub for $name {
            type Output = Self;

            fn sub(self, other: Self) -> Self {
                match self.0.checked_sub(other.0) {
                    Some(diff) => Self(diff),
                    None => panic!("bug: {} underflow: {} - {}", stringify!($name), self, other),
                }
            }
        }

        impl AddAssign for $name {
            fn add_assign(&mut self, other: Self) {
                *self = *self + other;
            }
        }

        impl SubAssign for $name {
            fn sub_assign(&mut self, other: Self) {
                *self = *self - other;
            }
        }

        impl Sum for $name {
            fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
                iter.fold(Self::ZERO, |acc, x| acc + x)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let int = self.0 / DECIMAL_PRECISION;
                let frac = self.0 % DECIMAL_PRECISION;
                if frac == 0 {
                    write!(f, "{}", int)
                } else {
                    let digits = format!("{:018}", frac);
                    write!(f, "{}.{}", int, digits.trim_end_matches('0'))
                }
            }
        }
    };
}

fixed_point_type!(
    /// Stablecoin amount.
    KUSD
);
fixed_point_type!(
    /// Collateral amount.
    COLL
);
fixed_point_type!(
    /// Dimensionless ratio; `Ratio::ONE` is 100%.
    Ratio
);
fixed_point_type!(
    /// Collateral price in KUSD per unit of collateral.
    UsdColl
);

impl Ratio {
    pub const ONE: Ratio = Ratio(DECIMAL_PRECISION);
}

impl Mul<UsdColl> for COLL {
    type Output = KUSD;

    fn mul(self, price: UsdColl) -> KUSD {
        KUSD(mul_div(self.0, price.0, DECIMAL_PRECISION))
    }
}

impl Div<UsdColl> for KUSD {
    type Output = COLL;

    fn div(self, price: UsdColl) -> COLL {
        COLL(mul_div(self.0, DECIMAL_PRECISION, price.0))
    }
}

impl Mul<Ratio> for KUSD {
    type Output = KUSD;

    fn mul(self, rate: Ratio) -> KUSD {
        KUSD(mul_div(self.0, rate.0, DECIMAL_PRECISION))
    }
}

impl Mul<Ratio> for COLL {
    type Output = COLL;

    fn mul(self, rate: Ratio) -> COLL {
        COLL(mul_div(self.0, rate.0, DECIMAL_PRECISION))
    }
}

impl Div<KUSD> for KUSD {
    type Output = Ratio;

    fn div(self, other: KUSD) -> Ratio {
        Ratio(mul_div(self.0, DECIMAL_PRECISION, other.0))
    }
}

impl Div<COLL> for COLL {
    type Output = Ratio;

    fn div(self, other: COLL) -> Ratio {
        Ratio(mul_div(self.0, DECIMAL_PRECISION, other.0))
    }
}

impl Mul<Ratio> for Ratio {
    type Output = Ratio;

    fn mul(self, other: Ratio) -> Ratio {
        Ratio(mul_div(self.0, other.0, DECIMAL_PRECISION))
    }
}

/// Narrows a 256-bit intermediate back to 128 bits.
pub fn narrow(value: U256) -> u128 {
    let (high, low) = value.into_words();
    if high != 0 {
        panic!("bug: fixed-point result {} does not fit in 128 bits", value);
    }
    low
}

/// `a * b / denominator` with a 256-bit intermediate, truncated.
pub fn mul_div(a: u128, b: u128, denominator: u128) -> u128 {
    if denominator == 0 {
        panic!("bug: mul_div({}, {}, 0)", a, b);
    }
    narrow(U256::from(a) * U256::from(b) / U256::from(denominator))
}

/// Fixed-point product rounded half up, unlike every other helper here,
/// which truncates. Only used by [`dec_pow`], whose repeated squaring would
/// otherwise drift downward.
pub(crate) fn dec_mul(x: u128, y: u128) -> u128 {
    let prod = U256::from(x) * U256::from(y) + U256::from(DECIMAL_PRECISION / 2);
    narrow(prod / U256::from(DECIMAL_PRECISION))
}

/// `base ^ n` in 18-decimal fixed point by exponentiation by squaring.
/// The exponent is capped at [`MAX_DEC_POW_EXPONENT`]; for bases below one
/// the result is indistinguishable from zero long before that.
pub fn dec_pow(base: u128, n: u64) -> u128 {
    let mut n = n.min(MAX_DEC_POW_EXPONENT);
    if n == 0 {
        return DECIMAL_PRECISION;
    }

    let mut y = DECIMAL_PRECISION;
    let mut x = base;
    while n > 1 {
        if n % 2 == 0 {
            x = dec_mul(x, x);
            n /= 2;
        } else {
            y = dec_mul(x, y);
            x = dec_mul(x, x);
            n = (n - 1) / 2;
        }
    }
    dec_mul(x, y)
}

/// Collateral ratio at `price`. A trove without debt has an infinite ratio,
/// represented by `Ratio::MAX`.
pub fn compute_collateral_ratio(coll: COLL, debt: KUSD, price: UsdColl) -> Ratio {
    if debt.is_zero() {
        return Ratio::MAX;
    }
    let (high, low) = (U256::from(coll.0) * U256::from(price.0) / U256::from(debt.0)).into_words();
    if high != 0 {
        return Ratio::MAX;
    }
    Ratio(low)
}

/// Price-independent ratio used to order the trove list.
pub fn compute_nominal_cr(coll: COLL, debt: KUSD) -> Nicr {
    if debt.is_zero() {
        return Nicr::MAX;
    }
    let (high, low) = (U256::from(coll.0) * U256::from(NICR_PRECISION) / U256::from(debt.0)).into_words();
    if high != 0 {
        return Nicr::MAX;
    }
    low
}
