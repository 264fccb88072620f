//! Integer interval lattice used for quantifier domain inference.

use std::fmt;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, Zero};

/// An integer extended with infinities, used as an interval endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Endpoint {
    NegInf,
    Fin(BigInt),
    PosInf,
}

impl Endpoint {
    #[must_use]
    pub fn fin(i: i64) -> Self {
        Self::Fin(BigInt::from(i))
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        matches!(self, Self::Fin(_))
    }

    fn add(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Fin(a), Self::Fin(b)) => Self::Fin(a + b),
            (Self::NegInf, Self::PosInf) | (Self::PosInf, Self::NegInf) => {
                panic!("Endpoint::add: opposite infinities")
            }
            (Self::NegInf, _) | (_, Self::NegInf) => Self::NegInf,
            (Self::PosInf, _) | (_, Self::PosInf) => Self::PosInf,
        }
    }

    fn neg(&self) -> Self {
        match self {
            Self::NegInf => Self::PosInf,
            Self::PosInf => Self::NegInf,
            Self::Fin(a) => Self::Fin(-a),
        }
    }

    /// Multiplication with the convention `0 * ±inf == 0`, which is the safe
    /// choice when endpoints stand for limits of finite products.
    fn mul(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Fin(a), Self::Fin(b)) => Self::Fin(a * b),
            (Self::Fin(a), inf) | (inf, Self::Fin(a)) => {
                if a.is_zero() {
                    Self::Fin(BigInt::from(0))
                } else if (a.is_positive()) == (*inf == Self::PosInf) {
                    Self::PosInf
                } else {
                    Self::NegInf
                }
            }
            (Self::PosInf, Self::PosInf) | (Self::NegInf, Self::NegInf) => Self::PosInf,
            _ => Self::NegInf,
        }
    }
}

impl PartialOrd for Endpoint {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Endpoint {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self, other) {
            (Self::NegInf, Self::NegInf) | (Self::PosInf, Self::PosInf) => Ordering::Equal,
            (Self::NegInf, _) | (_, Self::PosInf) => Ordering::Less,
            (_, Self::NegInf) | (Self::PosInf, _) => Ordering::Greater,
            (Self::Fin(a), Self::Fin(b)) => a.cmp(b),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NegInf => write!(f, "-inf"),
            Self::PosInf => write!(f, "inf"),
            Self::Fin(a) => write!(f, "{a}"),
        }
    }
}

fn floor_div(a: &BigInt, b: &BigInt) -> BigInt {
    a.div_floor(b)
}

fn ceil_div(a: &BigInt, b: &BigInt) -> BigInt {
    -(-a).div_floor(b)
}

/// A closed integer interval with possibly infinite endpoints.
///
/// An interval with `lower > upper` is bottom (the empty set); [`Interval::BOTTOM`]
/// is the canonical representative produced by the lattice operations.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Interval {
    pub lower: Endpoint,
    pub upper: Endpoint,
}

impl Interval {
    /// The full integer line.
    pub const TOP: Self = Self {
        lower: Endpoint::NegInf,
        upper: Endpoint::PosInf,
    };

    /// The empty interval.
    pub const BOTTOM: Self = Self {
        lower: Endpoint::PosInf,
        upper: Endpoint::NegInf,
    };

    #[must_use]
    pub fn new(lower: Endpoint, upper: Endpoint) -> Self {
        Self { lower, upper }
    }

    #[must_use]
    pub fn singleton(value: BigInt) -> Self {
        Self {
            lower: Endpoint::Fin(value.clone()),
            upper: Endpoint::Fin(value),
        }
    }

    #[must_use]
    pub fn bounded(lower: i64, upper: i64) -> Self {
        Self {
            lower: Endpoint::fin(lower),
            upper: Endpoint::fin(upper),
        }
    }

    #[must_use]
    pub fn at_least(lower: BigInt) -> Self {
        Self {
            lower: Endpoint::Fin(lower),
            upper: Endpoint::PosInf,
        }
    }

    #[must_use]
    pub fn at_most(upper: BigInt) -> Self {
        Self {
            lower: Endpoint::NegInf,
            upper: Endpoint::Fin(upper),
        }
    }

    #[must_use]
    pub fn is_bottom(&self) -> bool {
        self.lower > self.upper
    }

    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.is_bottom() || (self.lower.is_finite() && self.upper.is_finite())
    }

    /// Number of integers in the interval; `None` when infinite.
    #[must_use]
    pub fn size(&self) -> Option<BigInt> {
        if self.is_bottom() {
            return Some(BigInt::from(0));
        }
        match (&self.lower, &self.upper) {
            (Endpoint::Fin(lo), Endpoint::Fin(hi)) => Some(hi - lo + 1),
            _ => None,
        }
    }

    /// Greatest lower bound: intersection.
    #[must_use]
    pub fn meet(&self, other: &Self) -> Self {
        let result = Self {
            lower: self.lower.clone().max(other.lower.clone()),
            upper: self.upper.clone().min(other.upper.clone()),
        };
        if result.is_bottom() { Self::BOTTOM } else { result }
    }

    /// Least upper bound: the convex hull of the union.
    #[must_use]
    pub fn join(&self, other: &Self) -> Self {
        if self.is_bottom() {
            return other.clone();
        }
        if other.is_bottom() {
            return self.clone();
        }
        Self {
            lower: self.lower.clone().min(other.lower.clone()),
            upper: self.upper.clone().max(other.upper.clone()),
        }
    }

    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        if self.is_bottom() || other.is_bottom() {
            return Self::BOTTOM;
        }
        Self {
            lower: self.lower.add(&other.lower),
            upper: self.upper.add(&other.upper),
        }
    }

    #[must_use]
    pub fn negate(&self) -> Self {
        if self.is_bottom() {
            return Self::BOTTOM;
        }
        Self {
            lower: self.upper.neg(),
            upper: self.lower.neg(),
        }
    }

    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        self.add(&other.negate())
    }

    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        if self.is_bottom() || other.is_bottom() {
            return Self::BOTTOM;
        }
        let candidates = [
            self.lower.mul(&other.lower),
            self.lower.mul(&other.upper),
            self.upper.mul(&other.lower),
            self.upper.mul(&other.upper),
        ];
        Self {
            lower: candidates.iter().min().cloned().expect("nonempty"),
            upper: candidates.iter().max().cloned().expect("nonempty"),
        }
    }

    /// Quotient hull `self / divisor` with outward integer rounding, used to
    /// solve `a*x + b <= 0` for `x`. Returns top when the divisor straddles
    /// zero.
    #[must_use]
    pub fn div_outward(&self, divisor: &Self) -> Self {
        if self.is_bottom() || divisor.is_bottom() {
            return Self::BOTTOM;
        }
        let zero = Endpoint::Fin(BigInt::from(0));
        if divisor.lower <= zero && divisor.upper >= zero {
            return Self::TOP;
        }
        let mut lower: Option<Endpoint> = None;
        let mut upper: Option<Endpoint> = None;
        for n in [&self.lower, &self.upper] {
            for d in [&divisor.lower, &divisor.upper] {
                let (lo_candidate, hi_candidate) = endpoint_div(n, d);
                lower = Some(match lower {
                    None => lo_candidate.clone(),
                    Some(cur) => cur.min(lo_candidate.clone()),
                });
                upper = Some(match upper {
                    None => hi_candidate,
                    Some(cur) => cur.max(hi_candidate),
                });
            }
        }
        Self {
            lower: lower.expect("nonempty"),
            upper: upper.expect("nonempty"),
        }
    }

    /// Iterates the values of a finite interval in increasing order.
    pub fn iter_values(&self) -> impl Iterator<Item = BigInt> + use<> {
        let (start, end) = match (&self.lower, &self.upper) {
            _ if self.is_bottom() => (BigInt::from(0), BigInt::from(-1)),
            (Endpoint::Fin(lo), Endpoint::Fin(hi)) => (lo.clone(), hi.clone()),
            _ => panic!("Interval::iter_values: interval is not finite"),
        };
        let mut cur = start;
        std::iter::from_fn(move || {
            if cur > end {
                None
            } else {
                let next = cur.clone();
                cur += 1;
                Some(next)
            }
        })
    }
}

/// Rounded quotient of two endpoints as a `(floor, ceil)` pair.
fn endpoint_div(n: &Endpoint, d: &Endpoint) -> (Endpoint, Endpoint) {
    match (n, d) {
        (Endpoint::Fin(a), Endpoint::Fin(b)) => (Endpoint::Fin(floor_div(a, b)), Endpoint::Fin(ceil_div(a, b))),
        // finite / infinite tends to zero
        (Endpoint::Fin(_), _) => (Endpoint::Fin(BigInt::from(0)), Endpoint::Fin(BigInt::from(0))),
        (Endpoint::PosInf, d) => {
            let positive = matches!(d, Endpoint::Fin(b) if b.is_positive()) || *d == Endpoint::PosInf;
            if positive {
                (Endpoint::PosInf, Endpoint::PosInf)
            } else {
                (Endpoint::NegInf, Endpoint::NegInf)
            }
        }
        (Endpoint::NegInf, d) => {
            let positive = matches!(d, Endpoint::Fin(b) if b.is_positive()) || *d == Endpoint::PosInf;
            if positive {
                (Endpoint::NegInf, Endpoint::NegInf)
            } else {
                (Endpoint::PosInf, Endpoint::PosInf)
            }
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_bottom() {
            write!(f, "[]")
        } else {
            write!(f, "[{lower}, {upper}]", lower = self.lower, upper = self.upper)
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn meet_and_join_are_lattice_operations() {
        let a = Interval::bounded(0, 10);
        let b = Interval::bounded(5, 20);
        assert_eq!(a.meet(&b), Interval::bounded(5, 10));
        assert_eq!(a.join(&b), Interval::bounded(0, 20));
        assert_eq!(a.meet(&Interval::TOP), a);
        assert_eq!(a.join(&Interval::BOTTOM), a);
    }

    #[test]
    fn disjoint_meet_is_bottom() {
        let a = Interval::bounded(0, 1);
        let b = Interval::bounded(5, 6);
        assert!(a.meet(&b).is_bottom());
        assert_eq!(a.meet(&b).size(), Some(BigInt::from(0)));
    }

    #[test]
    fn arithmetic_on_finite_intervals() {
        let a = Interval::bounded(1, 2);
        let b = Interval::bounded(-3, 5);
        assert_eq!(a.add(&b), Interval::bounded(-2, 7));
        assert_eq!(a.sub(&b), Interval::bounded(-4, 5));
        assert_eq!(a.mul(&b), Interval::bounded(-6, 10));
        assert_eq!(a.negate(), Interval::bounded(-2, -1));
    }

    #[test]
    fn multiplication_with_infinities() {
        let pos = Interval::new(Endpoint::fin(1), Endpoint::PosInf);
        let neg = Interval::bounded(-2, -1);
        let result = pos.mul(&neg);
        assert_eq!(result.lower, Endpoint::NegInf);
        assert_eq!(result.upper, Endpoint::fin(-1));
    }

    #[test]
    fn division_by_positive_divisor() {
        // [4, 9] / [2, 2] = [2, 5] after outward rounding
        let n = Interval::bounded(4, 9);
        let d = Interval::bounded(2, 2);
        assert_eq!(n.div_outward(&d), Interval::bounded(2, 5));
    }

    #[test]
    fn division_by_interval_straddling_zero_is_top() {
        let n = Interval::bounded(4, 9);
        let d = Interval::bounded(-1, 1);
        assert_eq!(n.div_outward(&d), Interval::TOP);
    }

    #[test]
    fn division_by_negative_divisor_flips_sign() {
        // [2, 6] / [-2, -2] = [-3, -1]
        let n = Interval::bounded(2, 6);
        let d = Interval::bounded(-2, -2);
        assert_eq!(n.div_outward(&d), Interval::bounded(-3, -1));
    }

    #[test]
    fn size_and_values() {
        let a = Interval::bounded(0, 2);
        assert_eq!(a.size(), Some(BigInt::from(3)));
        let values: Vec<BigInt> = a.iter_values().collect();
        assert_eq!(values, vec![BigInt::from(0), BigInt::from(1), BigInt::from(2)]);
        assert_eq!(Interval::TOP.size(), None);
    }

    #[test]
    fn meet_never_enlarges() {
        let env = Interval::bounded(-5, 5);
        let refined = env.meet(&Interval::at_most(BigInt::from(2)));
        assert!(refined.size() <= env.size());
        assert_eq!(refined, Interval::bounded(-5, 2));
    }
}
