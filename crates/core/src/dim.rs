use std::fmt;

use crate::fixed_dim::{FixedDimension, FixedDimensions};

/// A dimension of a graph-level value. Either known or named by a symbol.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum Dimension {
    Fixed(FixedDimension),
    Dynamic(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Dimensions(pub Vec<Dimension>);

impl fmt::Debug for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => write!(f, "{d}"),
            Self::Dynamic(s) => write!(f, "{s}"),
        }
    }
}

impl Dimensions {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Dimension] {
        self.0.as_slice()
    }

    pub fn is_fixed(&self) -> bool {
        self.0.iter().all(|d| matches!(d, Dimension::Fixed(_)))
    }

    pub fn as_fixed_dims(&self) -> Option<FixedDimensions> {
        self.0
            .iter()
            .map(|d| match d {
                Dimension::Fixed(d) => Some(*d),
                Dimension::Dynamic(_) => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(FixedDimensions)
    }
}

impl From<Vec<Dimension>> for Dimensions {
    fn from(v: Vec<Dimension>) -> Dimensions {
        Dimensions(v)
    }
}

impl From<FixedDimensions> for Dimensions {
    fn from(dims: FixedDimensions) -> Self {
        Dimensions(dims.0.into_iter().map(Dimension::Fixed).collect())
    }
}

#[test]
fn fixed_roundtrip() {
    let dims: Dimensions = FixedDimensions(vec![1, 3]).into();
    assert!(dims.is_fixed());
    assert_eq!(dims.as_fixed_dims(), Some(FixedDimensions(vec![1, 3])));

    let dims = Dimensions(vec![Dimension::Dynamic("batch".into()), Dimension::Fixed(3)]);
    assert!(!dims.is_fixed());
    assert_eq!(dims.as_fixed_dims(), None);
}
