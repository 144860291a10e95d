/*
 * Exact Rational Pass Arithmetic
 *
 * Stride scheduling advances each entrant's pass by total_share / percent.
 * Those strides are rarely integers, so passes are kept as reduced
 * fractions instead of floats. Values are non-negative; all intermediate
 * products are computed in u128 and reduced before being narrowed back.
 */

use core::cmp::Ordering;

use crate::error::{SchedError, SchedResult};

/// Non-negative reduced fraction
///
/// Invariant: `den > 0` and `gcd(num, den) == 1`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Fraction {
    num: u64,
    den: u64,
}

fn gcd(mut a: u128, mut b: u128) -> u128 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Reduce `n / d` to lowest terms
///
/// # Returns
/// `(n / g, d / g)` with `g = gcd(n, d)`, or `DivisionByZero` if `d == 0`.
pub fn reduce(n: u64, d: u64) -> SchedResult<(u64, u64)> {
    if d == 0 {
        return Err(SchedError::DivisionByZero);
    }
    let g = gcd(n as u128, d as u128) as u64;
    Ok((n / g, d / g))
}

/// Narrow a wide numerator/denominator pair back into a Fraction
fn narrow(n: u128, d: u128) -> SchedResult<Fraction> {
    let g = gcd(n, d);
    let (n, d) = (n / g, d / g);
    match (u64::try_from(n), u64::try_from(d)) {
        (Ok(num), Ok(den)) => Ok(Fraction { num, den }),
        _ => Err(SchedError::PassOverflow),
    }
}

impl Fraction {
    /// Canonical zero, `0/1`
    pub const ZERO: Fraction = Fraction { num: 0, den: 1 };

    /// Build a reduced fraction
    pub fn new(n: u64, d: u64) -> SchedResult<Self> {
        let (num, den) = reduce(n, d)?;
        Ok(Self { num, den })
    }

    /// Whole number `n/1`
    pub const fn from_integer(n: u64) -> Self {
        Self { num: n, den: 1 }
    }

    pub fn numerator(&self) -> u64 {
        self.num
    }

    pub fn denominator(&self) -> u64 {
        self.den
    }

    /// Least common denominator and both numerators scaled to it
    fn common(self, other: Fraction) -> (u128, u128, u128) {
        let (d1, d2) = (self.den as u128, other.den as u128);
        let lcm = d1 / gcd(d1, d2) * d2;
        (
            self.num as u128 * (lcm / d1),
            other.num as u128 * (lcm / d2),
            lcm,
        )
    }

    /// `self + other`
    ///
    /// # Returns
    /// The reduced sum, or `PassOverflow` if it does not fit in 64 bits.
    pub fn checked_add(self, other: Fraction) -> SchedResult<Self> {
        let (a, b, lcm) = self.common(other);
        narrow(a + b, lcm)
    }

    /// `self - other`
    ///
    /// # Returns
    /// The reduced difference, or `NegativeFraction` if `other > self`.
    pub fn checked_sub(self, other: Fraction) -> SchedResult<Self> {
        let (a, b, lcm) = self.common(other);
        if b > a {
            return Err(SchedError::NegativeFraction);
        }
        narrow(a - b, lcm)
    }

    /// Strict comparison by cross-multiplication
    pub fn less_than(self, other: Fraction) -> bool {
        (self.num as u128) * (other.den as u128) < (other.num as u128) * (self.den as u128)
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Ord for Fraction {
    fn cmp(&self, other: &Self) -> Ordering {
        let lhs = (self.num as u128) * (other.den as u128);
        let rhs = (other.num as u128) * (self.den as u128);
        lhs.cmp(&rhs)
    }
}

impl PartialOrd for Fraction {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl core::fmt::Display for Fraction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}
