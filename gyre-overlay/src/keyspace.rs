//! The circular key space.
//!
//! Keys are opaque strings under plain byte order; the ring wraps around
//! after the largest key. Everything here is pure logic: the interval test
//! used by routing and responsibility checks, circular sorting for
//! closest-preceding lookups, and half-open range arithmetic for the range
//! query engine.

use crate::id::Key;
use serde::{Deserialize, Serialize};

/// True iff walking clockwise from `from` to `to`, `val` lies inside the
/// interval delimited by the inclusivity flags.
///
/// Degenerate case `from == to`: the interval is the full ring when the
/// inclusivities differ, and contains only keys equal to `from` when they
/// agree.
pub fn is_ordered(from: &Key, from_inc: bool, val: &Key, to: &Key, to_inc: bool) -> bool {
    if from == to {
        if from_inc == to_inc {
            return val == from;
        }
        return true;
    }
    let after_from = if from_inc { val >= from } else { val > from };
    let before_to = if to_inc { val <= to } else { val < to };
    if from < to {
        after_from && before_to
    } else {
        // Interval wraps past the largest key.
        after_from || before_to
    }
}

/// How [`circular_sort`] treats keys equal to the pivot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PivotMode {
    /// First element is the smallest key strictly greater than the pivot.
    Exclusive,
    /// A key equal to the pivot sorts first.
    Inclusive,
}

/// Sort keys into clockwise order starting just after `pivot`.
///
/// The result is ascending order rotated so that the first element is the
/// smallest key greater than the pivot (or equal, with
/// [`PivotMode::Inclusive`]).
pub fn circular_sort<T, F>(pivot: &Key, items: &mut Vec<T>, mode: PivotMode, key_of: F)
where
    F: Fn(&T) -> Key,
{
    items.sort_by(|a, b| key_of(a).cmp(&key_of(b)));
    let split = items
        .iter()
        .position(|item| {
            let k = key_of(item);
            match mode {
                PivotMode::Exclusive => k > *pivot,
                PivotMode::Inclusive => k >= *pivot,
            }
        })
        .unwrap_or(items.len());
    items.rotate_left(split);
}

/// A half-open range `[from, to)` on the ring.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub from: Key,
    pub to: Key,
}

impl KeyRange {
    pub fn new(from: Key, to: Key) -> Self {
        KeyRange { from, to }
    }

    /// Half-open containment. `from == to` denotes the full ring.
    pub fn contains(&self, key: &Key) -> bool {
        is_ordered(&self.from, true, key, &self.to, false)
    }

    /// Whether two half-open ranges share any key.
    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.contains(&other.from) || other.contains(&self.from)
    }

    /// Subtract `covered` from this range, producing the 0–2 leftover
    /// pieces. Respects wrap-around.
    pub fn subtract(&self, covered: &KeyRange) -> Vec<KeyRange> {
        if !self.overlaps(covered) {
            return vec![self.clone()];
        }
        let mut out = Vec::new();
        // Piece before the covered span.
        if covered.from != self.from && self.contains(&covered.from) {
            out.push(KeyRange::new(self.from.clone(), covered.from.clone()));
        }
        // Piece after the covered span.
        if covered.to != self.to && self.contains(&covered.to) {
            out.push(KeyRange::new(covered.to.clone(), self.to.clone()));
        }
        out
    }
}

impl std::fmt::Display for KeyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.from, self.to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> Key {
        Key::from(s)
    }

    #[test]
    fn ordered_plain_interval() {
        assert!(is_ordered(&k("10"), true, &k("15"), &k("20"), false));
        assert!(is_ordered(&k("10"), true, &k("10"), &k("20"), false));
        assert!(!is_ordered(&k("10"), false, &k("10"), &k("20"), false));
        assert!(!is_ordered(&k("10"), true, &k("20"), &k("20"), false));
        assert!(is_ordered(&k("10"), true, &k("20"), &k("20"), true));
    }

    #[test]
    fn ordered_wrapping_interval() {
        // [90, 10) wraps past the top of the space.
        assert!(is_ordered(&k("90"), true, &k("95"), &k("10"), false));
        assert!(is_ordered(&k("90"), true, &k("05"), &k("10"), false));
        assert!(!is_ordered(&k("90"), true, &k("50"), &k("10"), false));
    }

    #[test]
    fn ordered_degenerate() {
        // Differing inclusivities: full ring.
        assert!(is_ordered(&k("10"), true, &k("55"), &k("10"), false));
        assert!(is_ordered(&k("10"), false, &k("55"), &k("10"), true));
        // Agreeing inclusivities: only the key itself.
        assert!(is_ordered(&k("10"), true, &k("10"), &k("10"), true));
        assert!(!is_ordered(&k("10"), true, &k("55"), &k("10"), true));
    }

    #[test]
    fn circular_sort_rotates_past_pivot() {
        let mut keys = vec![k("00"), k("04"), k("02"), k("06")];
        circular_sort(&k("03"), &mut keys, PivotMode::Exclusive, |x| x.clone());
        assert_eq!(keys, vec![k("04"), k("06"), k("00"), k("02")]);

        let mut keys = vec![k("00"), k("04"), k("02"), k("06")];
        circular_sort(&k("04"), &mut keys, PivotMode::Inclusive, |x| x.clone());
        assert_eq!(keys, vec![k("04"), k("06"), k("00"), k("02")]);

        let mut keys = vec![k("00"), k("04"), k("02"), k("06")];
        circular_sort(&k("04"), &mut keys, PivotMode::Exclusive, |x| x.clone());
        assert_eq!(keys, vec![k("06"), k("00"), k("02"), k("04")]);
    }

    #[test]
    fn range_contains_half_open() {
        let r = KeyRange::new(k("2"), k("5"));
        assert!(r.contains(&k("2")));
        assert!(r.contains(&k("4")));
        assert!(!r.contains(&k("5")));

        let wrap = KeyRange::new(k("8"), k("2"));
        assert!(wrap.contains(&k("9")));
        assert!(wrap.contains(&k("1")));
        assert!(!wrap.contains(&k("2")));
        assert!(!wrap.contains(&k("5")));
    }

    #[test]
    fn range_subtract_middle() {
        let r = KeyRange::new(k("2"), k("8"));
        let got = r.subtract(&KeyRange::new(k("4"), k("6")));
        assert_eq!(
            got,
            vec![KeyRange::new(k("2"), k("4")), KeyRange::new(k("6"), k("8"))]
        );
    }

    #[test]
    fn range_subtract_edges_and_disjoint() {
        let r = KeyRange::new(k("2"), k("8"));
        assert_eq!(r.subtract(&r.clone()), Vec::<KeyRange>::new());
        assert_eq!(
            r.subtract(&KeyRange::new(k("2"), k("5"))),
            vec![KeyRange::new(k("5"), k("8"))]
        );
        assert_eq!(
            r.subtract(&KeyRange::new(k("5"), k("8"))),
            vec![KeyRange::new(k("2"), k("5"))]
        );
        assert_eq!(r.subtract(&KeyRange::new(k("8"), k("9"))), vec![r.clone()]);
    }

    #[test]
    fn range_subtract_wrapping() {
        let r = KeyRange::new(k("8"), k("2"));
        let got = r.subtract(&KeyRange::new(k("9"), k("1")));
        assert_eq!(
            got,
            vec![KeyRange::new(k("8"), k("9")), KeyRange::new(k("1"), k("2"))]
        );
    }
}
