use std::collections::BTreeMap;
use std::fmt;

use crate::spec::{CompositeSpec, TensorSpec, TypeSpec};
use crate::tensor::{Composite, Tensor};

/// Keyword arguments. Ordered by name so keys built from them are canonical.
pub type Kwargs = BTreeMap<String, Value>;

pub fn kwargs<K, I>(items: I) -> Kwargs
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    items.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Symbolic stand-in for a tensor argument while a function is being traced.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub index: usize,
    pub spec: TypeSpec,
}

/// Any argument or result crossing the dispatcher boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tensor(Tensor),
    Composite(Composite),
    Spec(TypeSpec),
    Placeholder(Placeholder),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    /// Unordered collection; cannot be keyed.
    Set(Vec<Value>),
    /// Foreign handle such as a weak reference; cannot be keyed.
    Opaque(String),
}

impl Value {
    pub fn list(items: impl IntoIterator<Item = Value>) -> Value {
        Value::List(items.into_iter().collect())
    }

    pub fn tuple(items: impl IntoIterator<Item = Value>) -> Value {
        Value::Tuple(items.into_iter().collect())
    }

    pub fn dict<K: Into<String>>(items: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Dict(items.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Tensor(_) | Value::Placeholder(_) => "Tensor",
            Value::Composite(c) => &c.spec().type_name,
            Value::Spec(TypeSpec::Tensor(_)) => "TensorSpec",
            Value::Spec(TypeSpec::Composite(_)) => "CompositeSpec",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::Opaque(name) => name,
        }
    }

    /// Short human description used in argument diagnostics, e.g. `int value 5`.
    pub fn describe(&self) -> String {
        match self {
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_) => {
                format!("{} value {}", self.type_name(), self)
            }
            Value::Tensor(t) => format!("Tensor value {t}"),
            Value::Placeholder(p) => format!("symbolic Tensor ({})", p.spec),
            Value::Composite(c) => c.spec().to_string(),
            Value::Spec(s) => s.to_string(),
            other => other.type_name().to_string(),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self,
            Value::None | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Str(_)
        )
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Value::List(_) | Value::Tuple(_) | Value::Dict(_))
    }

    /// Declared type of an array-like leaf, if this is one.
    pub fn type_spec(&self) -> Option<TypeSpec> {
        match self {
            Value::Tensor(t) => Some(TypeSpec::Tensor(t.spec())),
            Value::Composite(c) => Some(TypeSpec::Composite(c.spec().clone())),
            Value::Spec(s) => Some(s.clone()),
            Value::Placeholder(p) => Some(p.spec.clone()),
            _ => None,
        }
    }

    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_composite(&self) -> Option<&Composite> {
        match self {
            Value::Composite(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Tensor(t) => t.scalar_value(),
            _ => None,
        }
    }

    pub fn as_placeholder(&self) -> Option<&Placeholder> {
        match self {
            Value::Placeholder(p) => Some(p),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Tensor> for Value {
    fn from(v: Tensor) -> Self {
        Value::Tensor(v)
    }
}

impl From<Composite> for Value {
    fn from(v: Composite) -> Self {
        Value::Composite(v)
    }
}

impl From<TypeSpec> for Value {
    fn from(v: TypeSpec) -> Self {
        Value::Spec(v)
    }
}

impl From<TensorSpec> for Value {
    fn from(v: TensorSpec) -> Self {
        Value::Spec(TypeSpec::Tensor(v))
    }
}

impl From<CompositeSpec> for Value {
    fn from(v: CompositeSpec) -> Self {
        Value::Spec(TypeSpec::Composite(v))
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

fn write_seq(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => f.write_str("None"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "'{s}'"),
            Value::Tensor(t) => write!(f, "{t}"),
            Value::Composite(c) => write!(f, "{c}"),
            Value::Spec(s) => write!(f, "{s}"),
            Value::Placeholder(p) => write!(f, "<placeholder {}: {}>", p.index, p.spec),
            Value::List(items) => {
                f.write_str("[")?;
                write_seq(f, items)?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                write_seq(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Value::Dict(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "'{k}': {v}")?;
                }
                f.write_str("}")
            }
            Value::Set(items) => {
                f.write_str("{")?;
                write_seq(f, items)?;
                f.write_str("}")
            }
            Value::Opaque(name) => write!(f, "<{name}>"),
        }
    }
}
