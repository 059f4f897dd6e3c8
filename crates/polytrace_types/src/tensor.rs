use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::dtype::DType;
use crate::shape::TensorShape;
use crate::spec::{CompositeSpec, TensorSpec};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TensorError {
    #[error("shape {shape:?} needs {expected} elements, got {got}")]
    ElementCount {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },
    #[error("cannot combine tensors of shapes {left:?} and {right:?}")]
    Broadcast { left: Vec<usize>, right: Vec<usize> },
    #[error("{type_name} expects {expected} components, got {got}")]
    ComponentCount {
        type_name: String,
        expected: usize,
        got: usize,
    },
    #[error("component {index} of {type_name} should be {expected}, got {got}")]
    ComponentSpec {
        type_name: String,
        index: usize,
        expected: String,
        got: String,
    },
}

/// Dense, immutable tensor. Elements are stored as `f64` and normalized to the dtype.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: DType,
    shape: Vec<usize>,
    data: Arc<[f64]>,
}

impl Tensor {
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<f64>) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape,
                expected,
                got: data.len(),
            });
        }
        let data: Vec<f64> = data.into_iter().map(|v| dtype.normalize(v)).collect();
        Ok(Self {
            dtype,
            shape,
            data: data.into(),
        })
    }

    pub fn scalar(dtype: DType, value: f64) -> Self {
        Self {
            dtype,
            shape: Vec::new(),
            data: vec![dtype.normalize(value)].into(),
        }
    }

    pub fn from_vec(dtype: DType, values: Vec<f64>) -> Self {
        let shape = vec![values.len()];
        let data: Vec<f64> = values.into_iter().map(|v| dtype.normalize(v)).collect();
        Self {
            dtype,
            shape,
            data: data.into(),
        }
    }

    pub fn zeros(dtype: DType, shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            dtype,
            shape,
            data: vec![0.0; len].into(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype, TensorShape::fully_defined(&self.shape))
    }

    pub fn scalar_value(&self) -> Option<f64> {
        (self.data.len() == 1).then(|| self.data[0])
    }

    pub fn cast(&self, dtype: DType) -> Tensor {
        self.map_as(dtype, |v| v)
    }

    pub fn map(&self, f: impl Fn(f64) -> f64) -> Tensor {
        self.map_as(self.dtype, f)
    }

    fn map_as(&self, dtype: DType, f: impl Fn(f64) -> f64) -> Tensor {
        let data: Vec<f64> = self.data.iter().map(|v| dtype.normalize(f(*v))).collect();
        Tensor {
            dtype,
            shape: self.shape.clone(),
            data: data.into(),
        }
    }

    /// Elementwise combination; a single-element side is broadcast.
    pub fn zip_with(
        &self,
        other: &Tensor,
        f: impl Fn(f64, f64) -> f64,
    ) -> Result<Tensor, TensorError> {
        let (shape, data): (Vec<usize>, Vec<f64>) = if self.shape == other.shape {
            (
                self.shape.clone(),
                self.data
                    .iter()
                    .zip(other.data.iter())
                    .map(|(a, b)| f(*a, *b))
                    .collect(),
            )
        } else if other.data.len() == 1 {
            let b = other.data[0];
            (
                self.shape.clone(),
                self.data.iter().map(|a| f(*a, b)).collect(),
            )
        } else if self.data.len() == 1 {
            let a = self.data[0];
            (
                other.shape.clone(),
                other.data.iter().map(|b| f(a, *b)).collect(),
            )
        } else {
            return Err(TensorError::Broadcast {
                left: self.shape.clone(),
                right: other.shape.clone(),
            });
        };
        let dtype = self.dtype;
        let data: Vec<f64> = data.into_iter().map(|v| dtype.normalize(v)).collect();
        Ok(Tensor {
            dtype,
            shape,
            data: data.into(),
        })
    }

    pub fn add(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn mul(&self, other: &Tensor) -> Result<Tensor, TensorError> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn sum(&self) -> Tensor {
        Tensor::scalar(self.dtype, self.data.iter().sum())
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = TensorShape::fully_defined(&self.shape);
        f.write_str("Tensor(")?;
        if self.shape.is_empty() {
            write!(f, "{}", self.data[0])?;
        } else {
            write!(f, "{:?}", &self.data[..])?;
        }
        write!(f, ", shape={}, dtype={})", shape, self.dtype)
    }
}

/// A value represented by several dense component tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    spec: CompositeSpec,
    components: Vec<Tensor>,
}

impl Composite {
    /// Builds a composite after checking each component against the spec.
    pub fn new(spec: CompositeSpec, components: Vec<Tensor>) -> Result<Self, TensorError> {
        if spec.components.len() != components.len() {
            return Err(TensorError::ComponentCount {
                type_name: spec.type_name.clone(),
                expected: spec.components.len(),
                got: components.len(),
            });
        }
        for (index, (want, got)) in spec.components.iter().zip(&components).enumerate() {
            if !want.accepts(got.dtype(), got.shape()) {
                return Err(TensorError::ComponentSpec {
                    type_name: spec.type_name.clone(),
                    index,
                    expected: want.to_string(),
                    got: got.spec().to_string(),
                });
            }
        }
        let spec = refine_row_count(spec, &components);
        Ok(Self { spec, components })
    }

    /// Two-level ragged tensor built from its rows.
    pub fn ragged(dtype: DType, rows: Vec<Vec<f64>>) -> Self {
        let mut splits = vec![0.0];
        let mut values = Vec::new();
        for row in &rows {
            values.extend_from_slice(row);
            splits.push(values.len() as f64);
        }
        let spec = CompositeSpec::ragged(dtype, TensorShape::new(vec![Some(rows.len()), None]));
        Self {
            spec,
            components: vec![
                Tensor::from_vec(dtype, values),
                Tensor::from_vec(DType::Int64, splits),
            ],
        }
    }

    /// Three-level ragged tensor.
    pub fn ragged_nested(dtype: DType, rows: Vec<Vec<Vec<f64>>>) -> Self {
        let mut outer = vec![0.0];
        let mut inner = vec![0.0];
        let mut values = Vec::new();
        let mut inner_rows = 0usize;
        for row in &rows {
            for sub in row {
                values.extend_from_slice(sub);
                inner.push(values.len() as f64);
                inner_rows += 1;
            }
            outer.push(inner_rows as f64);
        }
        let spec = CompositeSpec::ragged(
            dtype,
            TensorShape::new(vec![Some(rows.len()), None, None]),
        );
        Self {
            spec,
            components: vec![
                Tensor::from_vec(dtype, values),
                Tensor::from_vec(DType::Int64, outer),
                Tensor::from_vec(DType::Int64, inner),
            ],
        }
    }

    pub fn spec(&self) -> &CompositeSpec {
        &self.spec
    }

    pub fn components(&self) -> &[Tensor] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Tensor> {
        self.components
    }

    /// Rows of a two-level ragged tensor.
    pub fn ragged_rows(&self) -> Option<Vec<Vec<f64>>> {
        if !self.spec.is_ragged() || self.components.len() != 2 {
            return None;
        }
        let values = self.components[0].data();
        let splits = self.components[1].data();
        Some(
            splits
                .windows(2)
                .map(|w| values[w[0] as usize..w[1] as usize].to_vec())
                .collect(),
        )
    }
}

fn refine_row_count(mut spec: CompositeSpec, components: &[Tensor]) -> CompositeSpec {
    if !spec.is_ragged() || components.len() < 2 {
        return spec;
    }
    let rows = components[1].len().saturating_sub(1);
    if let Some(dims) = spec.shape.dims() {
        let mut dims = dims.to_vec();
        if let Some(first) = dims.first_mut() {
            *first = Some(rows);
        }
        spec = CompositeSpec::ragged(spec.dtype, TensorShape::new(dims));
    }
    spec
}

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ragged_rows() {
            Some(rows) => write!(f, "{}({:?})", self.spec.type_name, rows),
            None => write!(f, "{}(shape={})", self.spec.type_name, self.spec.shape),
        }
    }
}
