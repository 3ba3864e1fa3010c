use crate::DreError;
use bincode::{Decode, Encode};
use ndarray::{Array, ArrayD, Dimension, IxDyn};

/// Row-major array as it is laid out inside an archive entry.
#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub struct StoredArray<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T: Clone> StoredArray<T> {
    pub fn from_array<D: Dimension>(array: &Array<T, D>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().cloned().collect(),
        }
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn into_dyn(self) -> Result<ArrayD<T>, DreError> {
        let expected: usize = self.shape.iter().product();
        if expected != self.data.len() {
            return Err(DreError::Archive(format!(
                "array of shape {:?} needs {} values, found {}",
                self.shape,
                expected,
                self.data.len()
            )));
        }
        Ok(ArrayD::from_shape_vec(IxDyn(&self.shape), self.data)?)
    }

    pub fn into_array<D: Dimension>(self) -> Result<Array<T, D>, DreError> {
        let ndim = self.ndim();
        self.into_dyn()?.into_dimensionality::<D>().map_err(|_| {
            DreError::Archive(format!(
                "expected a {}-D array, found {}-D",
                D::NDIM.unwrap_or(0),
                ndim
            ))
        })
    }
}
