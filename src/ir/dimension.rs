//! Interval dimensions.
//!
//! A [`Dimension`] is either a static length or an interval `[min, max]`
//! where an absent `max` means unbounded. Arithmetic is interval
//! arithmetic over non-negative lengths; division always floors.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimension {
    min: i64,
    max: Option<i64>,
}

impl Dimension {
    pub fn fixed(length: i64) -> Self {
        let length = length.max(0);
        Self {
            min: length,
            max: Some(length),
        }
    }

    /// Fully unknown dimension.
    pub fn dynamic() -> Self {
        Self { min: 0, max: None }
    }

    pub fn bounded(min: i64, max: i64) -> Self {
        let min = min.max(0);
        Self {
            min,
            max: Some(max.max(min)),
        }
    }

    pub fn at_least(min: i64) -> Self {
        Self {
            min: min.max(0),
            max: None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.max == Some(self.min)
    }

    pub fn is_dynamic(&self) -> bool {
        !self.is_static()
    }

    pub fn get_length(&self) -> Option<i64> {
        if self.is_static() {
            Some(self.min)
        } else {
            None
        }
    }

    pub fn min_length(&self) -> i64 {
        self.min
    }

    /// Upper bound, `None` when unbounded.
    pub fn max_length(&self) -> Option<i64> {
        self.max
    }

    /// Intervals intersect.
    pub fn compatible(&self, other: &Dimension) -> bool {
        self.merge(other).is_some()
    }

    /// Intersection of both intervals.
    pub fn merge(&self, other: &Dimension) -> Option<Dimension> {
        let min = self.min.max(other.min);
        let max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) | (None, Some(a)) => Some(a),
            (None, None) => None,
        };
        match max {
            Some(m) if m < min => None,
            _ => Some(Dimension { min, max }),
        }
    }

    /// NumPy broadcast of two dimensions.
    pub fn broadcast_merge(&self, other: &Dimension) -> Option<Dimension> {
        if self.get_length() == Some(1) {
            return Some(*other);
        }
        if other.get_length() == Some(1) {
            return Some(*self);
        }
        if self.is_static() && other.is_static() {
            return self.merge(other);
        }
        // One side may still resolve to 1 at run time; keep the wider bound.
        if self.is_dynamic() && other.is_dynamic() {
            let max = match (self.max, other.max) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
            return Some(Dimension {
                min: self.min.max(other.min),
                max,
            });
        }
        let (fixed, _) = if self.is_static() {
            (self, other)
        } else {
            (other, self)
        };
        Some(*fixed)
    }

    /// Floor division by a positive integer constant.
    pub fn floor_div(&self, divisor: i64) -> Dimension {
        if divisor <= 0 {
            return Dimension::dynamic();
        }
        Dimension {
            min: self.min.div_euclid(divisor),
            max: self.max.map(|m| m.div_euclid(divisor)),
        }
    }

    /// Subtraction, clamped at zero.
    pub fn saturating_sub(&self, other: &Dimension) -> Dimension {
        let min = match other.max {
            Some(om) => (self.min - om).max(0),
            None => 0,
        };
        let max = self.max.map(|m| (m - other.min).max(0));
        Dimension { min, max }
    }

    pub fn add(&self, other: &Dimension) -> Dimension {
        Dimension {
            min: self.min + other.min,
            max: match (self.max, other.max) {
                (Some(a), Some(b)) => Some(a + b),
                _ => None,
            },
        }
    }

    pub fn add_scalar(&self, value: i64) -> Dimension {
        Dimension {
            min: (self.min + value).max(0),
            max: self.max.map(|m| (m + value).max(0)),
        }
    }

    pub fn mul_scalar(&self, value: i64) -> Dimension {
        let value = value.max(0);
        Dimension {
            min: self.min * value,
            max: self.max.map(|m| m * value),
        }
    }

    pub fn mul(&self, other: &Dimension) -> Dimension {
        Dimension {
            min: self.min * other.min,
            max: match (self.max, other.max) {
                (Some(a), Some(b)) => Some(a * b),
                _ => None,
            },
        }
    }

    /// True when the static length equals `value`.
    pub fn is(&self, value: i64) -> bool {
        self.get_length() == Some(value)
    }
}

impl From<i64> for Dimension {
    fn from(v: i64) -> Self {
        if v < 0 {
            Dimension::dynamic()
        } else {
            Dimension::fixed(v)
        }
    }
}

impl From<usize> for Dimension {
    fn from(v: usize) -> Self {
        Dimension::fixed(v as i64)
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (min, Some(max)) if min == max => write!(f, "{}", min),
            (0, None) => write!(f, "?"),
            (min, None) => write!(f, "{}..", min),
            (min, Some(max)) => write!(f, "{}..{}", min, max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_div_on_interval() {
        let d = Dimension::bounded(7, 19).floor_div(4);
        assert_eq!(d.min_length(), 1);
        assert_eq!(d.max_length(), Some(4));
    }

    #[test]
    fn test_saturating_sub_never_negative() {
        let d = Dimension::bounded(2, 20).saturating_sub(&Dimension::fixed(4));
        assert_eq!(d.min_length(), 0);
        assert_eq!(d.max_length(), Some(16));
    }

    #[test]
    fn test_merge_disjoint_fails() {
        assert!(Dimension::fixed(3).merge(&Dimension::fixed(4)).is_none());
        assert_eq!(
            Dimension::bounded(2, 8).merge(&Dimension::at_least(5)),
            Some(Dimension::bounded(5, 8))
        );
    }

    #[test]
    fn test_broadcast_merge_rules() {
        let one = Dimension::fixed(1);
        let four = Dimension::fixed(4);
        assert_eq!(one.broadcast_merge(&four), Some(four));
        assert_eq!(four.broadcast_merge(&one), Some(four));
        assert!(four.broadcast_merge(&Dimension::fixed(3)).is_none());
        assert_eq!(four.broadcast_merge(&Dimension::dynamic()), Some(four));
    }

    #[test]
    fn test_display() {
        assert_eq!(Dimension::fixed(4).to_string(), "4");
        assert_eq!(Dimension::dynamic().to_string(), "?");
        assert_eq!(Dimension::bounded(1, 8).to_string(), "1..8");
    }
}
