//! Value and type model shared by the tracing runtime.
//!
//! Leaves are literals, dense [`Tensor`]s and multi-component [`Composite`]s;
//! their declared types are described by [`TypeSpec`].

pub mod dtype;
pub mod nest;
pub mod shape;
pub mod spec;
pub mod tensor;
pub mod value;

pub use dtype::DType;
pub use shape::TensorShape;
pub use spec::{CompositeSpec, TensorSpec, TypeSpec, RAGGED_TYPE_NAME};
pub use tensor::{Composite, Tensor, TensorError};
pub use value::{kwargs, Kwargs, Placeholder, Value};
