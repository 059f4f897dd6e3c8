use serde::{Deserialize, Serialize};
use std::fmt;

use crate::dtype::DType;
use crate::shape::TensorShape;

pub const RAGGED_TYPE_NAME: &str = "RaggedTensor";

/// Declared element type and shape of a single dense tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: DType,
    pub shape: TensorShape,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TensorSpec {
    pub fn new(dtype: DType, shape: impl Into<TensorShape>) -> Self {
        Self {
            dtype,
            shape: shape.into(),
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Name is a calling-convention hint and plays no part in dispatch.
    pub fn unnamed(&self) -> Self {
        Self {
            dtype: self.dtype,
            shape: self.shape.clone(),
            name: None,
        }
    }

    pub fn accepts(&self, dtype: DType, shape: &[usize]) -> bool {
        self.dtype == dtype && self.shape.is_compatible_with(shape)
    }

    pub fn is_subtype_of(&self, other: &TensorSpec) -> bool {
        self.dtype == other.dtype && self.shape.is_subtype_of(&other.shape)
    }

    pub fn most_specific_common_supertype(&self, other: &TensorSpec) -> Option<TensorSpec> {
        if self.dtype != other.dtype {
            return None;
        }
        let shape = self.shape.most_specific_common_supertype(&other.shape)?;
        Some(TensorSpec::new(self.dtype, shape))
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Tensor, shape={}", self.dtype, self.shape)
    }
}

/// Declared type of a value made of several tensors (for example a ragged tensor).
///
/// Only the declared shape and component specs take part in equality; the actual
/// number of stored values is deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeSpec {
    pub type_name: String,
    pub dtype: DType,
    pub shape: TensorShape,
    pub components: Vec<TensorSpec>,
}

impl CompositeSpec {
    pub fn new(
        type_name: impl Into<String>,
        dtype: DType,
        shape: TensorShape,
        components: Vec<TensorSpec>,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            dtype,
            shape,
            components,
        }
    }

    /// Spec of a ragged tensor with the given logical shape.
    ///
    /// Components are the flat values followed by one row-splits vector per
    /// ragged dimension. The outer row-splits length is known when the row
    /// count is.
    pub fn ragged(dtype: DType, shape: TensorShape) -> Self {
        let rank = shape.rank().unwrap_or(2).max(2);
        let mut components = vec![TensorSpec::new(dtype, TensorShape::new(vec![None]))];
        let outer = shape.dim(0).map(|rows| rows + 1);
        components.push(TensorSpec::new(DType::Int64, TensorShape::new(vec![outer])));
        for _ in 2..rank {
            components.push(TensorSpec::new(DType::Int64, TensorShape::new(vec![None])));
        }
        Self::new(RAGGED_TYPE_NAME, dtype, shape, components)
    }

    pub fn is_ragged(&self) -> bool {
        self.type_name == RAGGED_TYPE_NAME
    }

    pub fn is_subtype_of(&self, other: &CompositeSpec) -> bool {
        self.type_name == other.type_name
            && self.dtype == other.dtype
            && self.shape.is_subtype_of(&other.shape)
            && self.components.len() == other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a.is_subtype_of(b))
    }

    pub fn most_specific_common_supertype(&self, other: &CompositeSpec) -> Option<CompositeSpec> {
        if self.type_name != other.type_name
            || self.dtype != other.dtype
            || self.components.len() != other.components.len()
        {
            return None;
        }
        let shape = self.shape.most_specific_common_supertype(&other.shape)?;
        let components = self
            .components
            .iter()
            .zip(&other.components)
            .map(|(a, b)| a.most_specific_common_supertype(b))
            .collect::<Option<Vec<_>>>()?;
        Some(CompositeSpec::new(
            self.type_name.clone(),
            self.dtype,
            shape,
            components,
        ))
    }
}

impl fmt::Display for CompositeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Spec(shape={}, dtype={})",
            self.type_name, self.shape, self.dtype
        )
    }
}

/// Type descriptor of an array-like leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSpec {
    Tensor(TensorSpec),
    Composite(CompositeSpec),
}

impl TypeSpec {
    pub fn tensor(dtype: DType, shape: impl Into<TensorShape>) -> Self {
        TypeSpec::Tensor(TensorSpec::new(dtype, shape))
    }

    pub fn ragged(dtype: DType, shape: TensorShape) -> Self {
        TypeSpec::Composite(CompositeSpec::ragged(dtype, shape))
    }

    pub fn dtype(&self) -> DType {
        match self {
            TypeSpec::Tensor(t) => t.dtype,
            TypeSpec::Composite(c) => c.dtype,
        }
    }

    pub fn shape(&self) -> &TensorShape {
        match self {
            TypeSpec::Tensor(t) => &t.shape,
            TypeSpec::Composite(c) => &c.shape,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            TypeSpec::Tensor(t) => t.name.as_deref(),
            TypeSpec::Composite(_) => None,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, TypeSpec::Composite(_))
    }

    pub fn unnamed(&self) -> TypeSpec {
        match self {
            TypeSpec::Tensor(t) => TypeSpec::Tensor(t.unnamed()),
            TypeSpec::Composite(c) => TypeSpec::Composite(c.clone()),
        }
    }

    /// Specs of the dense tensors this value is passed as when flattened.
    pub fn component_specs(&self) -> Vec<TensorSpec> {
        match self {
            TypeSpec::Tensor(t) => vec![t.clone()],
            TypeSpec::Composite(c) => c.components.clone(),
        }
    }

    pub fn flat_len(&self) -> usize {
        match self {
            TypeSpec::Tensor(_) => 1,
            TypeSpec::Composite(c) => c.components.len(),
        }
    }

    pub fn is_subtype_of(&self, other: &TypeSpec) -> bool {
        match (self, other) {
            (TypeSpec::Tensor(a), TypeSpec::Tensor(b)) => a.is_subtype_of(b),
            (TypeSpec::Composite(a), TypeSpec::Composite(b)) => a.is_subtype_of(b),
            _ => false,
        }
    }

    pub fn most_specific_common_supertype(&self, other: &TypeSpec) -> Option<TypeSpec> {
        match (self, other) {
            (TypeSpec::Tensor(a), TypeSpec::Tensor(b)) => {
                a.most_specific_common_supertype(b).map(TypeSpec::Tensor)
            }
            (TypeSpec::Composite(a), TypeSpec::Composite(b)) => {
                a.most_specific_common_supertype(b).map(TypeSpec::Composite)
            }
            _ => None,
        }
    }

    /// Spec with every dimension size forgotten but rank, dtype and kind kept.
    pub fn erased(&self) -> TypeSpec {
        match self {
            TypeSpec::Tensor(t) => TypeSpec::tensor(t.dtype, t.shape.erased()),
            TypeSpec::Composite(c) => TypeSpec::Composite(CompositeSpec::new(
                c.type_name.clone(),
                c.dtype,
                c.shape.erased(),
                c.components
                    .iter()
                    .map(|s| TensorSpec::new(s.dtype, s.shape.erased()))
                    .collect(),
            )),
        }
    }
}

impl From<TensorSpec> for TypeSpec {
    fn from(spec: TensorSpec) -> Self {
        TypeSpec::Tensor(spec)
    }
}

impl From<CompositeSpec> for TypeSpec {
    fn from(spec: CompositeSpec) -> Self {
        TypeSpec::Composite(spec)
    }
}

impl fmt::Display for TypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSpec::Tensor(t) => fmt::Display::fmt(t, f),
            TypeSpec::Composite(c) => fmt::Display::fmt(c, f),
        }
    }
}
