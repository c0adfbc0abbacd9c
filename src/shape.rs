use crate::helpers::size_of_dims;
use ndarray::{IxDyn, ShapeBuilder};
use std::fmt;

#[macro_export]
macro_rules! shape {
    ($($s:expr),* $(,)?) => {
        $crate::shape::Shape::from(vec![ $($s),*])
    };
}

/// Row-major dimensions of a dense tensor.
#[derive(Default, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.dims)
    }
}

impl Shape {
    /// Element count, saturating on overflow.
    pub fn prod(&self) -> usize {
        size_of_dims(&self.dims)
    }

    /// Element strides of a contiguous row-major layout.
    pub fn strides(&self) -> Vec<usize> {
        let mut strides = vec![1; self.dims.len()];
        for i in (0..self.dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Dimensions reordered so that output dim `i` is input dim `perm[i]`.
    pub fn permute(&self, perm: &[usize]) -> Shape {
        assert_eq!(perm.len(), self.dims.len(), "Permutation rank mismatch");
        Shape {
            dims: perm.iter().map(|&p| self.dims[p]).collect(),
        }
    }

    pub(crate) fn ix(&self) -> ndarray::Shape<IxDyn> {
        self.dims.as_slice().into_shape()
    }
}

impl From<Vec<usize>> for Shape {
    fn from(value: Vec<usize>) -> Self {
        Self { dims: value }
    }
}

impl From<&[usize]> for Shape {
    fn from(value: &[usize]) -> Self {
        Self {
            dims: value.to_vec(),
        }
    }
}
