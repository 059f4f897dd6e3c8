use ahash::AHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use polytrace_types::{Kwargs, TypeSpec, Value};

use crate::runtime::jit::binder::{BoundArguments, ParamKind};
use crate::runtime::jit::error::{JitError, JitResult};

/// A non-array leaf compared by value.
#[derive(Debug, Clone)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Literal {
    pub fn from_value(value: &Value) -> Option<Literal> {
        Some(match value {
            Value::None => Literal::None,
            Value::Bool(b) => Literal::Bool(*b),
            Value::Int(i) => Literal::Int(*i),
            Value::Float(f) => Literal::Float(*f),
            Value::Str(s) => Literal::Str(s.clone()),
            _ => return None,
        })
    }

    pub fn to_value(&self) -> Value {
        match self {
            Literal::None => Value::None,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::Str(s) => Value::Str(s.clone()),
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::None, Literal::None) => true,
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Str(a), Literal::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Literal {}

impl Hash for Literal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Literal::None => {}
            Literal::Bool(b) => b.hash(state),
            Literal::Int(i) => i.hash(state),
            Literal::Float(f) => f.to_bits().hash(state),
            Literal::Str(s) => s.hash(state),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_value(), f)
    }
}

/// Structural type of one argument: containers down to literal or spec leaves.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TraceType {
    Literal(Literal),
    Spec(TypeSpec),
    List(Vec<TraceType>),
    Tuple(Vec<TraceType>),
    Dict(Vec<(String, TraceType)>),
}

/// Where and what an unkeyable leaf is.
#[derive(Debug, Clone)]
pub struct Unhashable {
    pub path: String,
    pub type_name: String,
}

impl TraceType {
    pub fn from_value(value: &Value, path: &str) -> Result<TraceType, Unhashable> {
        match value {
            Value::List(items) => Ok(TraceType::List(Self::from_items(items, path)?)),
            Value::Tuple(items) => Ok(TraceType::Tuple(Self::from_items(items, path)?)),
            Value::Dict(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), Self::from_value(v, &format!("{path}['{k}']"))?)))
                .collect::<Result<_, _>>()
                .map(TraceType::Dict),
            Value::Set(_) | Value::Opaque(_) => Err(Unhashable {
                path: path.to_string(),
                type_name: value.type_name().to_string(),
            }),
            other => match (Literal::from_value(other), other.type_spec()) {
                (Some(lit), _) => Ok(TraceType::Literal(lit)),
                (None, Some(spec)) => Ok(TraceType::Spec(spec.unnamed())),
                (None, None) => Err(Unhashable {
                    path: path.to_string(),
                    type_name: other.type_name().to_string(),
                }),
            },
        }
    }

    fn from_items(items: &[Value], path: &str) -> Result<Vec<TraceType>, Unhashable> {
        items
            .iter()
            .enumerate()
            .map(|(i, v)| Self::from_value(v, &format!("{path}[{i}]")))
            .collect()
    }

    pub fn is_subtype_of(&self, other: &TraceType) -> bool {
        match (self, other) {
            (TraceType::Literal(a), TraceType::Literal(b)) => a == b,
            (TraceType::Spec(a), TraceType::Spec(b)) => a.is_subtype_of(b),
            (TraceType::List(a), TraceType::List(b)) | (TraceType::Tuple(a), TraceType::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.is_subtype_of(y))
            }
            (TraceType::Dict(a), TraceType::Dict(b)) => {
                a.len() == b.len()
                    && a
                        .iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.is_subtype_of(vb))
            }
            _ => false,
        }
    }

    /// Narrowest type both `self` and `other` are subtypes of, if one exists
    /// without changing structure, literals, dtypes or ranks.
    pub fn most_specific_common_supertype(&self, other: &TraceType) -> Option<TraceType> {
        match (self, other) {
            (TraceType::Literal(a), TraceType::Literal(b)) => {
                (a == b).then(|| TraceType::Literal(a.clone()))
            }
            (TraceType::Spec(a), TraceType::Spec(b)) => {
                a.most_specific_common_supertype(b).map(TraceType::Spec)
            }
            (TraceType::List(a), TraceType::List(b)) => {
                Self::supertype_items(a, b).map(TraceType::List)
            }
            (TraceType::Tuple(a), TraceType::Tuple(b)) => {
                Self::supertype_items(a, b).map(TraceType::Tuple)
            }
            (TraceType::Dict(a), TraceType::Dict(b)) => {
                if a.len() != b.len() {
                    return None;
                }
                a.iter()
                    .zip(b)
                    .map(|((ka, va), (kb, vb))| {
                        if ka != kb {
                            return None;
                        }
                        Some((ka.clone(), va.most_specific_common_supertype(vb)?))
                    })
                    .collect::<Option<Vec<_>>>()
                    .map(TraceType::Dict)
            }
            _ => None,
        }
    }

    fn supertype_items(a: &[TraceType], b: &[TraceType]) -> Option<Vec<TraceType>> {
        if a.len() != b.len() {
            return None;
        }
        a.iter()
            .zip(b)
            .map(|(x, y)| x.most_specific_common_supertype(y))
            .collect()
    }

    /// Relaxation class: identical for types that differ only in dimension sizes.
    pub fn erased(&self) -> TraceType {
        match self {
            TraceType::Literal(l) => TraceType::Literal(l.clone()),
            TraceType::Spec(s) => TraceType::Spec(s.erased()),
            TraceType::List(items) => TraceType::List(items.iter().map(Self::erased).collect()),
            TraceType::Tuple(items) => TraceType::Tuple(items.iter().map(Self::erased).collect()),
            TraceType::Dict(items) => TraceType::Dict(
                items
                    .iter()
                    .map(|(k, v)| (k.clone(), v.erased()))
                    .collect(),
            ),
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, TraceType::Literal(_))
    }

    /// Spec leaves in flatten order.
    pub fn specs(&self) -> Vec<&TypeSpec> {
        let mut out = Vec::new();
        self.collect_specs(&mut out);
        out
    }

    fn collect_specs<'a>(&'a self, out: &mut Vec<&'a TypeSpec>) {
        match self {
            TraceType::Literal(_) => {}
            TraceType::Spec(s) => out.push(s),
            TraceType::List(items) | TraceType::Tuple(items) => {
                for item in items {
                    item.collect_specs(out);
                }
            }
            TraceType::Dict(items) => {
                for (_, item) in items {
                    item.collect_specs(out);
                }
            }
        }
    }

    /// Short structural description used in type mismatch messages,
    /// e.g. `{'a': Tensor}` or `RaggedTensor`.
    pub fn type_summary(&self) -> String {
        match self {
            TraceType::Literal(l) => l.to_value().type_name().to_string(),
            TraceType::Spec(TypeSpec::Tensor(_)) => "Tensor".to_string(),
            TraceType::Spec(TypeSpec::Composite(c)) => c.type_name.clone(),
            TraceType::List(items) => format!("[{}]", join_summaries(items.iter())),
            TraceType::Tuple(items) => {
                let inner = join_summaries(items.iter());
                if items.len() == 1 {
                    format!("({inner},)")
                } else {
                    format!("({inner})")
                }
            }
            TraceType::Dict(items) => format!(
                "{{{}}}",
                items
                    .iter()
                    .map(|(k, v)| format!("'{k}': {}", v.type_summary()))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

fn join_summaries<'a>(items: impl Iterator<Item = &'a TraceType>) -> String {
    items
        .map(TraceType::type_summary)
        .collect::<Vec<_>>()
        .join(", ")
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceType::Literal(l) => write!(f, "{l}"),
            TraceType::Spec(s) => write!(f, "{s}"),
            TraceType::List(items) => {
                write!(f, "[{}]", join_display(items.iter()))
            }
            TraceType::Tuple(items) => {
                if items.len() == 1 {
                    write!(f, "({},)", join_display(items.iter()))
                } else {
                    write!(f, "({})", join_display(items.iter()))
                }
            }
            TraceType::Dict(items) => {
                let parts: Vec<String> = items.iter().map(|(k, v)| format!("'{k}': {v}")).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

fn join_display<'a>(items: impl Iterator<Item = &'a TraceType>) -> String {
    items.map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    pub name: String,
    pub kind: ParamKind,
    pub trace_type: TraceType,
}

/// Immutable structural descriptor of one call. Equal keys hash identically.
///
/// Besides the arguments, a key carries the current types of the function's
/// side inputs captured by reference, so a changed literal side input retraces.
#[derive(Debug, Clone)]
pub struct SignatureKey {
    entries: Vec<KeyEntry>,
    side_inputs: Vec<(String, TraceType)>,
    fingerprint: u64,
}

impl SignatureKey {
    pub fn new(entries: Vec<KeyEntry>) -> Self {
        Self::with_parts(entries, Vec::new())
    }

    fn with_parts(entries: Vec<KeyEntry>, side_inputs: Vec<(String, TraceType)>) -> Self {
        let mut hasher = AHasher::default();
        for entry in &entries {
            entry.name.hash(&mut hasher);
            entry.kind.hash(&mut hasher);
            entry.trace_type.hash(&mut hasher);
        }
        side_inputs.hash(&mut hasher);
        Self {
            fingerprint: hasher.finish(),
            entries,
            side_inputs,
        }
    }

    /// Same arguments, with `side_inputs` replacing whatever this key carried.
    pub fn with_side_inputs(&self, side_inputs: Vec<(String, TraceType)>) -> Self {
        Self::with_parts(self.entries.clone(), side_inputs)
    }

    pub fn side_inputs(&self) -> &[(String, TraceType)] {
        &self.side_inputs
    }

    pub fn from_bound(function: &str, bound: &BoundArguments) -> JitResult<Self> {
        let entries = bound
            .entries()
            .iter()
            .map(|arg| {
                TraceType::from_value(&arg.value, &arg.name)
                    .map(|trace_type| KeyEntry {
                        name: arg.name.clone(),
                        kind: arg.kind,
                        trace_type,
                    })
                    .map_err(|u| JitError::UnhashableInput {
                        function: function.to_string(),
                        path: u.path,
                        type_name: u.type_name,
                    })
            })
            .collect::<JitResult<Vec<_>>>()?;
        Ok(Self::new(entries))
    }

    pub fn entries(&self) -> &[KeyEntry] {
        &self.entries
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    pub fn is_subtype_of(&self, other: &SignatureKey) -> bool {
        self.side_inputs == other.side_inputs
            && self.entries.len() == other.entries.len()
            && self.entries.iter().zip(&other.entries).all(|(a, b)| {
                a.name == b.name && a.kind == b.kind && a.trace_type.is_subtype_of(&b.trace_type)
            })
    }

    pub fn most_specific_common_supertype(&self, other: &SignatureKey) -> Option<SignatureKey> {
        if self.entries.len() != other.entries.len() || self.side_inputs != other.side_inputs {
            return None;
        }
        self.entries
            .iter()
            .zip(&other.entries)
            .map(|(a, b)| {
                if a.name != b.name || a.kind != b.kind {
                    return None;
                }
                Some(KeyEntry {
                    name: a.name.clone(),
                    kind: a.kind,
                    trace_type: a.trace_type.most_specific_common_supertype(&b.trace_type)?,
                })
            })
            .collect::<Option<Vec<_>>>()
            .map(|entries| SignatureKey::with_parts(entries, self.side_inputs.clone()))
    }

    pub fn erased(&self) -> SignatureKey {
        SignatureKey::with_parts(
            self.entries
                .iter()
                .map(|e| KeyEntry {
                    name: e.name.clone(),
                    kind: e.kind,
                    trace_type: e.trace_type.erased(),
                })
                .collect(),
            self.side_inputs.clone(),
        )
    }

    pub fn to_string_key(&self) -> String {
        let parts = self
            .entries
            .iter()
            .map(|e| format!("{}: {}", e.name, e.trace_type))
            .collect::<Vec<_>>()
            .join(", ");
        if self.side_inputs.is_empty() {
            return format!("({parts})_{:x}", self.fingerprint);
        }
        let side = self
            .side_inputs
            .iter()
            .map(|(k, t)| format!("{k}={t}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("({parts} | {side})_{:x}", self.fingerprint)
    }
}

impl PartialEq for SignatureKey {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
            && self.entries == other.entries
            && self.side_inputs == other.side_inputs
    }
}

impl Eq for SignatureKey {}

impl Hash for SignatureKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_key())
    }
}

/// Key for a bare call: positionals are named by position, keywords by name.
pub fn make_key(args: &[Value], kwargs: &Kwargs) -> JitResult<SignatureKey> {
    let positional = args.iter().enumerate().map(|(i, v)| {
        (format!("<arg{}>", i + 1), ParamKind::PositionalOrKeyword, v)
    });
    let keyword = kwargs
        .iter()
        .map(|(k, v)| (k.clone(), ParamKind::KeywordOnly, v));
    let entries = positional
        .chain(keyword)
        .map(|(name, kind, value)| {
            TraceType::from_value(value, &name)
                .map(|trace_type| KeyEntry {
                    name: name.clone(),
                    kind,
                    trace_type,
                })
                .map_err(|u| JitError::UnhashableInput {
                    function: "<call>".to_string(),
                    path: u.path,
                    type_name: u.type_name,
                })
        })
        .collect::<JitResult<Vec<_>>>()?;
    Ok(SignatureKey::new(entries))
}
