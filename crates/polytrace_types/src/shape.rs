use serde::{Deserialize, Serialize};
use std::fmt;

/// A shape whose rank and individual dimensions may be unknown.
///
/// `None` in a dimension slot is a wildcard matching any size. A shape with
/// `dims == None` has unknown rank and matches every shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorShape {
    dims: Option<Vec<Option<usize>>>,
}

impl TensorShape {
    pub fn new(dims: Vec<Option<usize>>) -> Self {
        Self { dims: Some(dims) }
    }

    pub fn unknown() -> Self {
        Self { dims: None }
    }

    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    pub fn fully_defined(dims: &[usize]) -> Self {
        Self::new(dims.iter().copied().map(Some).collect())
    }

    /// A shape of the given rank where every dimension is a wildcard.
    pub fn unknown_dims(rank: usize) -> Self {
        Self::new(vec![None; rank])
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    pub fn dims(&self) -> Option<&[Option<usize>]> {
        self.dims.as_deref()
    }

    pub fn dim(&self, index: usize) -> Option<usize> {
        self.dims.as_ref().and_then(|d| d.get(index).copied().flatten())
    }

    pub fn is_fully_defined(&self) -> bool {
        self.dims
            .as_ref()
            .is_some_and(|dims| dims.iter().all(Option::is_some))
    }

    /// Whether a value of shape `concrete` could be fed where this shape is declared.
    pub fn is_compatible_with(&self, concrete: &[usize]) -> bool {
        match &self.dims {
            None => true,
            Some(dims) => {
                dims.len() == concrete.len()
                    && dims
                        .iter()
                        .zip(concrete)
                        .all(|(want, got)| want.is_none_or(|w| w == *got))
            }
        }
    }

    /// `self` is a subtype of `other` when every value matching `self` also matches `other`.
    pub fn is_subtype_of(&self, other: &TensorShape) -> bool {
        match (&self.dims, &other.dims) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(mine), Some(theirs)) => {
                mine.len() == theirs.len()
                    && mine
                        .iter()
                        .zip(theirs)
                        .all(|(m, t)| t.is_none() || m == t)
            }
        }
    }

    /// Widens two shapes of equal rank by turning every disagreeing dimension
    /// into a wildcard. Returns `None` when the ranks differ.
    pub fn most_specific_common_supertype(&self, other: &TensorShape) -> Option<TensorShape> {
        match (&self.dims, &other.dims) {
            (None, _) | (_, None) => Some(TensorShape::unknown()),
            (Some(a), Some(b)) if a.len() == b.len() => Some(TensorShape::new(
                a.iter()
                    .zip(b)
                    .map(|(x, y)| if x == y { *x } else { None })
                    .collect(),
            )),
            _ => None,
        }
    }

    /// The same rank with all sizes forgotten.
    pub fn erased(&self) -> TensorShape {
        match &self.dims {
            None => TensorShape::unknown(),
            Some(dims) => TensorShape::unknown_dims(dims.len()),
        }
    }
}

impl From<Vec<usize>> for TensorShape {
    fn from(dims: Vec<usize>) -> Self {
        TensorShape::fully_defined(&dims)
    }
}

impl From<&[usize]> for TensorShape {
    fn from(dims: &[usize]) -> Self {
        TensorShape::fully_defined(dims)
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(dims) = &self.dims else {
            return f.write_str("<unknown>");
        };
        f.write_str("(")?;
        for (i, dim) in dims.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match dim {
                Some(size) => write!(f, "{size}")?,
                None => f.write_str("None")?,
            }
        }
        if dims.len() == 1 {
            f.write_str(",")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_tuple_notation() {
        assert_eq!(TensorShape::scalar().to_string(), "()");
        assert_eq!(TensorShape::fully_defined(&[3]).to_string(), "(3,)");
        assert_eq!(TensorShape::new(vec![None, Some(2)]).to_string(), "(None, 2)");
        assert_eq!(TensorShape::unknown().to_string(), "<unknown>");
    }

    #[test]
    fn supertype_wildcards_differing_dims() {
        let a = TensorShape::fully_defined(&[1, 2]);
        let b = TensorShape::fully_defined(&[3, 2]);
        let sup = a.most_specific_common_supertype(&b).unwrap();
        assert_eq!(sup, TensorShape::new(vec![None, Some(2)]));
        assert!(a.is_subtype_of(&sup));
        assert!(b.is_subtype_of(&sup));
        assert!(!sup.is_subtype_of(&a));
    }

    #[test]
    fn rank_mismatch_has_no_supertype() {
        let a = TensorShape::fully_defined(&[1]);
        let b = TensorShape::fully_defined(&[1, 1]);
        assert!(a.most_specific_common_supertype(&b).is_none());
        assert!(!a.is_subtype_of(&b));
    }

    #[test]
    fn compatibility_respects_wildcards() {
        let s = TensorShape::new(vec![None, Some(3)]);
        assert!(s.is_compatible_with(&[7, 3]));
        assert!(!s.is_compatible_with(&[7, 4]));
        assert!(!s.is_compatible_with(&[3]));
        assert!(TensorShape::unknown().is_compatible_with(&[1, 2, 3]));
    }
}
