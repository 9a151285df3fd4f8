//! Interval algebra over ordered values, with possibly-unbounded ends.
//!
//! Slot and association ranges are `[lower, upper)` over [`Timestamp`]s; the algebra itself is
//! generic and honors any combination of inclusive/exclusive ends.

use std::{cmp::Ordering, fmt, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RangeParseError;

pub type Timestamp = DateTime<Utc>;
pub type UtcRange = Range<Timestamp>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Lower,
    Upper,
}

/// One end of a range. `None` is unbounded and sorts before (lower side) or after (upper side)
/// every concrete value; two unbounded ends of the same side are equal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Bound<T> {
    side: Side,
    value: Option<T>,
}

impl<T> Bound<T> {
    pub const fn lower(value: Option<T>) -> Self {
        Self {
            side: Side::Lower,
            value,
        }
    }

    pub const fn upper(value: Option<T>) -> Self {
        Self {
            side: Side::Upper,
            value,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    pub fn is_unbounded(&self) -> bool {
        self.value.is_none()
    }
}

impl<T: Copy> Bound<T> {
    pub fn get(&self) -> Option<T> {
        self.value
    }
}

impl<T: Ord> Bound<T> {
    /// Compares this bound against a concrete value.
    pub fn cmp_value(&self, value: &T) -> Ordering {
        match (&self.value, self.side) {
            (Some(v), _) => v.cmp(value),
            (None, Side::Lower) => Ordering::Less,
            (None, Side::Upper) => Ordering::Greater,
        }
    }
}

impl<T: Ord> Ord for Bound<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.value, &other.value) {
            (Some(a), Some(b)) => a.cmp(b),
            (None, Some(b)) => self.cmp_value(b),
            (Some(a), None) => other.cmp_value(a).reverse(),
            (None, None) => match (self.side, other.side) {
                (Side::Lower, Side::Upper) => Ordering::Less,
                (Side::Upper, Side::Lower) => Ordering::Greater,
                _ => Ordering::Equal,
            },
        }
    }
}

impl<T: Ord> PartialOrd for Bound<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> PartialEq for Bound<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for Bound<T> {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
struct Span<T> {
    lower: Option<T>,
    upper: Option<T>,
    lower_inclusive: bool,
    upper_inclusive: bool,
}

/// Immutable interval. Constructors normalize degenerate input to the empty range and drop
/// inclusivity on unbounded ends, so structural equality is range equality.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range<T> {
    span: Option<Span<T>>,
}

impl<T> Range<T> {
    pub const fn empty() -> Self {
        Self { span: None }
    }

    pub const fn full() -> Self {
        Self {
            span: Some(Span {
                lower: None,
                upper: None,
                lower_inclusive: false,
                upper_inclusive: false,
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.span.is_none()
    }

    pub fn lower_inclusive(&self) -> bool {
        self.span.as_ref().is_some_and(|s| s.lower_inclusive)
    }

    pub fn upper_inclusive(&self) -> bool {
        self.span.as_ref().is_some_and(|s| s.upper_inclusive)
    }
}

impl<T: Ord + Copy> Range<T> {
    /// `[lower, upper)` with `None` meaning unbounded.
    pub fn new(lower: Option<T>, upper: Option<T>) -> Self {
        Self::with_inclusivity(lower, upper, true, false)
    }

    pub fn between(lower: T, upper: T) -> Self {
        Self::new(Some(lower), Some(upper))
    }

    pub fn from_lower(lower: T) -> Self {
        Self::new(Some(lower), None)
    }

    pub fn point(value: T) -> Self {
        Self::with_inclusivity(Some(value), Some(value), true, true)
    }

    pub fn with_inclusivity(
        lower: Option<T>,
        upper: Option<T>,
        lower_inclusive: bool,
        upper_inclusive: bool,
    ) -> Self {
        let lower_inclusive = lower_inclusive && lower.is_some();
        let upper_inclusive = upper_inclusive && upper.is_some();
        if let (Some(l), Some(u)) = (lower, upper) {
            if u < l || (l == u && !(lower_inclusive && upper_inclusive)) {
                return Self::empty();
            }
        }
        Self {
            span: Some(Span {
                lower,
                upper,
                lower_inclusive,
                upper_inclusive,
            }),
        }
    }

    /// Lower end. The empty range reports an unbounded end; check [`Range::is_empty`] first.
    pub fn lower(&self) -> Bound<T> {
        Bound::lower(self.span.and_then(|s| s.lower))
    }

    pub fn upper(&self) -> Bound<T> {
        Bound::upper(self.span.and_then(|s| s.upper))
    }

    pub fn lower_value(&self) -> Option<T> {
        self.span.and_then(|s| s.lower)
    }

    pub fn upper_value(&self) -> Option<T> {
        self.span.and_then(|s| s.upper)
    }

    pub fn is_point(&self) -> bool {
        matches!(self.span, Some(Span { lower: Some(l), upper: Some(u), .. }) if l == u)
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        let (Some(a), Some(b)) = (self.span, other.span) else {
            return false;
        };
        starts_before_end(a.lower, a.lower_inclusive, b.upper, b.upper_inclusive)
            && starts_before_end(b.lower, b.lower_inclusive, a.upper, a.upper_inclusive)
    }

    /// True when `other` lies entirely inside `self`. Every range contains the empty range.
    pub fn contains(&self, other: &Self) -> bool {
        let Some(b) = other.span else {
            return true;
        };
        let Some(a) = self.span else {
            return false;
        };
        lower_covers(a.lower, a.lower_inclusive, b.lower, b.lower_inclusive)
            && upper_covers(a.upper, a.upper_inclusive, b.upper, b.upper_inclusive)
    }

    pub fn contains_value(&self, value: T) -> bool {
        self.contains(&Self::point(value))
    }

    /// Common part of both ranges; empty when they are disjoint.
    pub fn intersect(&self, other: &Self) -> Self {
        if !self.overlaps(other) {
            return Self::empty();
        }
        let (Some(a), Some(b)) = (self.span, other.span) else {
            return Self::empty();
        };
        let (lower, lower_inclusive) =
            if lower_covers(a.lower, a.lower_inclusive, b.lower, b.lower_inclusive) {
                (b.lower, b.lower_inclusive)
            } else {
                (a.lower, a.lower_inclusive)
            };
        let (upper, upper_inclusive) =
            if upper_covers(a.upper, a.upper_inclusive, b.upper, b.upper_inclusive) {
                (b.upper, b.upper_inclusive)
            } else {
                (a.upper, a.upper_inclusive)
            };
        Self::with_inclusivity(lower, upper, lower_inclusive, upper_inclusive)
    }

    /// Smallest range covering both, or `None` when a gap separates them.
    pub fn union(&self, other: &Self) -> Option<Self> {
        let Some(a) = self.span else {
            return Some(*other);
        };
        let Some(b) = other.span else {
            return Some(*self);
        };
        if !self.overlaps(other) && !self.is_adjacent_to(other) {
            return None;
        }
        let (lower, lower_inclusive) =
            if lower_covers(a.lower, a.lower_inclusive, b.lower, b.lower_inclusive) {
                (a.lower, a.lower_inclusive)
            } else {
                (b.lower, b.lower_inclusive)
            };
        let (upper, upper_inclusive) =
            if upper_covers(a.upper, a.upper_inclusive, b.upper, b.upper_inclusive) {
                (a.upper, a.upper_inclusive)
            } else {
                (b.upper, b.upper_inclusive)
            };
        Some(Self::with_inclusivity(
            lower,
            upper,
            lower_inclusive,
            upper_inclusive,
        ))
    }

    /// The ranges touch at one value that exactly one of them includes.
    pub fn is_adjacent_to(&self, other: &Self) -> bool {
        let (Some(a), Some(b)) = (self.span, other.span) else {
            return false;
        };
        touches(a.upper, a.upper_inclusive, b.lower, b.lower_inclusive)
            || touches(b.upper, b.upper_inclusive, a.lower, a.lower_inclusive)
    }

    pub fn is_strictly_left_of(&self, other: &Self) -> bool {
        let (Some(a), Some(b)) = (self.span, other.span) else {
            return false;
        };
        match (a.upper, b.lower) {
            (Some(u), Some(l)) => u < l || (u == l && !(a.upper_inclusive && b.lower_inclusive)),
            _ => false,
        }
    }

    pub fn is_strictly_right_of(&self, other: &Self) -> bool {
        other.is_strictly_left_of(self)
    }

    /// Same range with the lower end replaced; may become empty.
    pub fn with_lower(&self, lower: Option<T>, inclusive: bool) -> Self {
        Self::with_inclusivity(lower, self.upper_value(), inclusive, self.upper_inclusive())
    }

    pub fn with_upper(&self, upper: Option<T>, inclusive: bool) -> Self {
        Self::with_inclusivity(self.lower_value(), upper, self.lower_inclusive(), inclusive)
    }
}

impl Range<Timestamp> {
    /// `None` when either end is unbounded.
    pub fn duration(&self) -> Option<TimeDelta> {
        match self.span {
            None => Some(TimeDelta::zero()),
            Some(Span {
                lower: Some(l),
                upper: Some(u),
                ..
            }) => Some(u - l),
            Some(_) => None,
        }
    }
}

fn starts_before_end<T: Ord>(
    lower: Option<T>,
    lower_inclusive: bool,
    upper: Option<T>,
    upper_inclusive: bool,
) -> bool {
    match (lower, upper) {
        (Some(l), Some(u)) => l < u || (l == u && lower_inclusive && upper_inclusive),
        _ => true,
    }
}

fn lower_covers<T: Ord>(a: Option<T>, a_inclusive: bool, b: Option<T>, b_inclusive: bool) -> bool {
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a < b || (a == b && (a_inclusive || !b_inclusive)),
    }
}

fn upper_covers<T: Ord>(a: Option<T>, a_inclusive: bool, b: Option<T>, b_inclusive: bool) -> bool {
    match (a, b) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(a), Some(b)) => a > b || (a == b && (a_inclusive || !b_inclusive)),
    }
}

fn touches<T: Ord>(upper: Option<T>, upper_inclusive: bool, lower: Option<T>, lower_inclusive: bool) -> bool {
    match (upper, lower) {
        (Some(u), Some(l)) => u == l && upper_inclusive != lower_inclusive,
        _ => false,
    }
}

/// Empty range first, then by lower end (inclusive before exclusive), then by upper end.
impl<T: Ord + Copy> Ord for Range<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.span, other.span) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => self
                .lower()
                .cmp(&other.lower())
                .then_with(|| b.lower_inclusive.cmp(&a.lower_inclusive))
                .then_with(|| self.upper().cmp(&other.upper()))
                .then_with(|| a.upper_inclusive.cmp(&b.upper_inclusive)),
        }
    }
}

impl<T: Ord + Copy> PartialOrd for Range<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: fmt::Display> fmt::Display for Range<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(span) = &self.span else {
            return f.write_str("empty");
        };
        f.write_str(if span.lower_inclusive { "[" } else { "(" })?;
        if let Some(lower) = &span.lower {
            write!(f, "{lower}")?;
        }
        f.write_str(",")?;
        if let Some(upper) = &span.upper {
            write!(f, "{upper}")?;
        }
        f.write_str(if span.upper_inclusive { "]" } else { ")" })
    }
}

impl<T> FromStr for Range<T>
where
    T: FromStr + Ord + Copy,
{
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.eq_ignore_ascii_case("empty") {
            return Ok(Self::empty());
        }
        let lower_inclusive = match text.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(RangeParseError::Syntax(text.to_string())),
        };
        let upper_inclusive = match text.chars().last() {
            Some(']') if text.len() > 1 => true,
            Some(')') if text.len() > 1 => false,
            _ => return Err(RangeParseError::Syntax(text.to_string())),
        };
        let inner = &text[1..text.len() - 1];
        let Some((lower, upper)) = inner.split_once(',') else {
            return Err(RangeParseError::Syntax(text.to_string()));
        };
        let lower = parse_end::<T>(lower)?;
        let upper = parse_end::<T>(upper)?;
        Ok(Self::with_inclusivity(
            lower,
            upper,
            lower_inclusive,
            upper_inclusive,
        ))
    }
}

fn parse_end<T: FromStr>(raw: &str) -> Result<Option<T>, RangeParseError> {
    let raw = raw.trim();
    if raw.is_empty() || matches!(raw, "-oo" | "+oo" | "-infinity" | "infinity") {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| RangeParseError::Value {
            value: raw.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lower: Option<i64>, upper: Option<i64>) -> Range<i64> {
        Range::new(lower, upper)
    }

    #[test]
    fn construction_normalizes_degenerate_ranges() {
        assert!(Range::between(4, 4).is_empty());
        assert!(Range::between(5, 1).is_empty());
        assert!(!Range::point(4).is_empty());
        assert!(Range::with_inclusivity(Some(4), Some(4), false, true).is_empty());
        let unbounded = Range::<i64>::with_inclusivity(None, Some(3), true, true);
        assert!(!unbounded.lower_inclusive());
        assert!(unbounded.upper_inclusive());
        assert_eq!(Range::<i64>::empty(), Range::between(7, 7));
    }

    #[test]
    fn unbounded_bounds_compare_outside_values() {
        let low = Bound::<i64>::lower(None);
        let high = Bound::<i64>::upper(None);
        assert!(low < Bound::lower(Some(i64::MIN)));
        assert!(high > Bound::upper(Some(i64::MAX)));
        assert_eq!(low, Bound::lower(None));
        assert_eq!(high, Bound::upper(None));
        assert_ne!(low, high);
        assert_eq!(Bound::lower(Some(3)), Bound::upper(Some(3)));
    }

    #[test]
    fn overlap_respects_inclusivity() {
        assert!(r(Some(1), Some(5)).overlaps(&r(Some(4), Some(8))));
        assert!(!r(Some(1), Some(5)).overlaps(&r(Some(5), Some(8))));
        assert!(Range::point(5).overlaps(&r(Some(5), Some(8))));
        assert!(!Range::point(5).overlaps(&r(Some(1), Some(5))));
        assert!(r(None, None).overlaps(&r(Some(1), Some(2))));
        assert!(!r(None, Some(1)).overlaps(&r(Some(1), None)));
        assert!(!Range::<i64>::empty().overlaps(&r(None, None)));
    }

    #[test]
    fn contains_handles_unbounded_and_empty() {
        let outer = r(Some(1), None);
        assert!(outer.contains(&r(Some(1), Some(10))));
        assert!(outer.contains(&r(Some(3), None)));
        assert!(!outer.contains(&r(Some(0), Some(3))));
        assert!(!r(Some(1), Some(5)).contains(&r(Some(1), None)));
        assert!(r(Some(1), Some(5)).contains(&Range::empty()));
        assert!(!Range::<i64>::empty().contains(&Range::point(3)));
        assert!(r(Some(1), Some(5)).contains_value(1));
        assert!(!r(Some(1), Some(5)).contains_value(5));
        assert!(!Range::with_inclusivity(Some(1), Some(5), true, false).contains(&Range::with_inclusivity(Some(1), Some(5), true, true)));
    }

    #[test]
    fn intersect_picks_tightest_ends() {
        assert_eq!(
            r(Some(1), Some(5)).intersect(&r(Some(3), Some(8))),
            r(Some(3), Some(5))
        );
        assert_eq!(r(None, None).intersect(&r(Some(2), None)), r(Some(2), None));
        assert!(r(Some(1), Some(3)).intersect(&r(Some(3), Some(8))).is_empty());
        let open = Range::with_inclusivity(Some(1), Some(5), false, true);
        assert_eq!(
            open.intersect(&r(Some(1), Some(3))),
            Range::with_inclusivity(Some(1), Some(3), false, false)
        );
    }

    #[test]
    fn adjacency_and_union() {
        let left = r(Some(1), Some(5));
        let right = r(Some(5), Some(9));
        assert!(left.is_adjacent_to(&right));
        assert!(right.is_adjacent_to(&left));
        assert_eq!(left.union(&right), Some(r(Some(1), Some(9))));
        assert!(!Range::point(5).is_adjacent_to(&right));
        assert!(r(Some(1), Some(4)).union(&right).is_none());
        assert_eq!(left.union(&Range::empty()), Some(left));
    }

    #[test]
    fn strict_sides() {
        let left = r(Some(1), Some(5));
        let right = r(Some(5), Some(9));
        assert!(left.is_strictly_left_of(&right));
        assert!(right.is_strictly_right_of(&left));
        assert!(!r(Some(1), Some(6)).is_strictly_left_of(&right));
        assert!(!r(None, None).is_strictly_left_of(&right));
    }

    #[test]
    fn ordering_by_lower_then_upper() {
        let mut ranges = vec![
            r(Some(5), Some(9)),
            r(None, Some(2)),
            r(Some(1), None),
            r(Some(1), Some(3)),
            Range::empty(),
        ];
        ranges.sort();
        assert_eq!(
            ranges,
            vec![
                Range::empty(),
                r(None, Some(2)),
                r(Some(1), Some(3)),
                r(Some(1), None),
                r(Some(5), Some(9)),
            ]
        );
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(r(Some(1), Some(4)).to_string(), "[1,4)");
        assert_eq!(r(None, None).to_string(), "(,)");
        assert_eq!(Range::<i64>::empty().to_string(), "empty");
        assert_eq!("(1,4]".parse::<Range<i64>>().unwrap(), Range::with_inclusivity(Some(1), Some(4), false, true));
        assert_eq!("[,7)".parse::<Range<i64>>().unwrap(), r(None, Some(7)));
        assert!("[4,4)".parse::<Range<i64>>().unwrap().is_empty());
        assert!("1,4".parse::<Range<i64>>().is_err());
        assert!("[a,4)".parse::<Range<i64>>().is_err());

        let parsed: UtcRange = "[2024-01-01T00:00:00Z,2024-01-02T00:00:00Z)".parse().unwrap();
        assert_eq!(parsed.duration(), Some(TimeDelta::days(1)));
        let open: UtcRange = "[2024-01-01T00:00:00Z,)".parse().unwrap();
        assert_eq!(open.duration(), None);
    }
}
