use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::shape::Shape;

/// Output metadata of a layer: everything known about its value before any
/// value exists.
///
/// `feature_shape` excludes the batch axis (and the time axis outside the
/// loop). Sparse outputs are `I32` label tensors with `sparse_dim` classes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub feature_shape: Shape,
    pub dtype: DType,
    #[serde(default)]
    pub sparse_dim: Option<usize>,
    /// Beam width when the value lives in a search beam.
    #[serde(default)]
    pub beam_size: Option<usize>,
}

impl TensorMeta {
    /// Dense real-valued features of the given shape.
    pub fn dense(feature_shape: impl Into<Shape>) -> Self {
        TensorMeta {
            feature_shape: feature_shape.into(),
            dtype: DType::F32,
            sparse_dim: None,
            beam_size: None,
        }
    }

    /// Scalar class labels in `0..classes`.
    pub fn sparse(classes: usize) -> Self {
        TensorMeta {
            feature_shape: Shape::from(()),
            dtype: DType::I32,
            sparse_dim: Some(classes),
            beam_size: None,
        }
    }

    /// A scalar boolean flag per batch entry.
    pub fn flag() -> Self {
        TensorMeta {
            feature_shape: Shape::from(()),
            dtype: DType::Bool,
            sparse_dim: None,
            beam_size: None,
        }
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_beam(mut self, beam_size: Option<usize>) -> Self {
        self.beam_size = beam_size;
        self
    }

    /// Feature dimension: number of classes for sparse values, otherwise the
    /// last feature axis (1 for scalars).
    pub fn dim(&self) -> usize {
        match self.sparse_dim {
            Some(d) => d,
            None => self.feature_shape.last().unwrap_or(1),
        }
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse_dim.is_some()
    }

    /// Full value shape for `lead` leading axes (batch, or time and batch).
    pub fn value_shape(&self, lead: &[usize]) -> Shape {
        self.feature_shape.prepend(lead)
    }
}

impl fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.dtype, self.feature_shape)?;
        if let Some(d) = self.sparse_dim {
            write!(f, " sparse({})", d)?;
        }
        if let Some(k) = self.beam_size {
            write!(f, " beam({})", k)?;
        }
        Ok(())
    }
}
